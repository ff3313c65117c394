//! Durable map of active journeys plus the append-only completion ledger.
//!
//! Reads are served from an in-memory mirror that is updated before the
//! durable write is issued, so callers always read their own writes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{JourneyError, JourneyResult};
use crate::journey::{ExitReason, Journey};

/// Outcome of a finished journey, keyed by (distinct id, campaign id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub distinct_id: String,
    pub campaign_id: String,
    pub journey_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

impl CompletionRecord {
    pub fn for_journey(journey: &Journey) -> Self {
        Self {
            distinct_id: journey.distinct_id.clone(),
            campaign_id: journey.campaign_id.clone(),
            journey_id: journey.id,
            completed_at: journey.completed_at.unwrap_or(journey.updated_at),
            exit_reason: journey
                .exit_reason
                .clone()
                .unwrap_or(ExitReason::Completed),
        }
    }
}

/// Everything the durable layer holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub journeys: Vec<Journey>,
    #[serde(default)]
    pub ledger: Vec<CompletionRecord>,
}

#[async_trait]
pub trait JourneyBackend: Send + Sync {
    async fn load(&self) -> JourneyResult<StoreSnapshot>;

    /// Inserts or replaces an active journey.
    async fn put_journey(&self, journey: &Journey) -> JourneyResult<()>;

    /// Removes the journey and appends its completion record in one write.
    async fn complete_journey(&self, journey_id: Uuid, record: &CompletionRecord) -> JourneyResult<()>;
}

/// Backend that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    snapshot: Mutex<StoreSnapshot>,
    failures: Mutex<u32>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        *self.failures.lock() = n;
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshot.lock().clone()
    }

    fn check_failure(&self) -> JourneyResult<()> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(JourneyError::Persistence("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JourneyBackend for MemoryBackend {
    async fn load(&self) -> JourneyResult<StoreSnapshot> {
        Ok(self.snapshot.lock().clone())
    }

    async fn put_journey(&self, journey: &Journey) -> JourneyResult<()> {
        self.check_failure()?;
        let mut snapshot = self.snapshot.lock();
        upsert(&mut snapshot.journeys, journey);
        Ok(())
    }

    async fn complete_journey(&self, journey_id: Uuid, record: &CompletionRecord) -> JourneyResult<()> {
        self.check_failure()?;
        let mut snapshot = self.snapshot.lock();
        snapshot.journeys.retain(|j| j.id != journey_id);
        snapshot.ledger.push(record.clone());
        Ok(())
    }
}

/// Backend that keeps a JSON document on disk. Every write replaces the file
/// through a temporary sibling and a rename.
pub struct FileBackend {
    path: PathBuf,
    document: tokio::sync::Mutex<Option<StoreSnapshot>>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: tokio::sync::Mutex::new(None),
        }
    }

    async fn read_file(&self) -> JourneyResult<StoreSnapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(StoreSnapshot::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreSnapshot::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, snapshot: &StoreSnapshot) -> JourneyResult<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Applies `f` to the cached document and writes the result. The cache
    /// only changes once the write succeeded.
    async fn mutate<F>(&self, f: F) -> JourneyResult<()>
    where
        F: FnOnce(&mut StoreSnapshot) + Send,
    {
        let mut guard = self.document.lock().await;
        let mut next = match guard.as_ref() {
            Some(doc) => doc.clone(),
            None => self.read_file().await?,
        };
        f(&mut next);
        self.write_file(&next).await?;
        *guard = Some(next);
        Ok(())
    }
}

#[async_trait]
impl JourneyBackend for FileBackend {
    async fn load(&self) -> JourneyResult<StoreSnapshot> {
        let snapshot = self.read_file().await?;
        *self.document.lock().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn put_journey(&self, journey: &Journey) -> JourneyResult<()> {
        self.mutate(|doc| upsert(&mut doc.journeys, journey)).await
    }

    async fn complete_journey(&self, journey_id: Uuid, record: &CompletionRecord) -> JourneyResult<()> {
        let record = record.clone();
        self.mutate(move |doc| {
            doc.journeys.retain(|j| j.id != journey_id);
            doc.ledger.push(record);
        })
        .await
    }
}

fn upsert(journeys: &mut Vec<Journey>, journey: &Journey) {
    match journeys.iter_mut().find(|j| j.id == journey.id) {
        Some(existing) => *existing = journey.clone(),
        None => journeys.push(journey.clone()),
    }
}

/// How hard to try before a durable write is reported as failed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Active journeys and the completion ledger, mirrored in memory.
pub struct JourneyStore {
    backend: Arc<dyn JourneyBackend>,
    active: DashMap<Uuid, Journey>,
    ledger: RwLock<Vec<CompletionRecord>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for JourneyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyStore")
            .field("active", &self.active.len())
            .field("ledger", &self.ledger.read().len())
            .finish()
    }
}

impl JourneyStore {
    pub fn new(backend: Arc<dyn JourneyBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            active: DashMap::new(),
            ledger: RwLock::new(Vec::new()),
            retry,
        }
    }

    /// Replaces the mirror with the durable contents. Terminal journeys that
    /// were never moved to the ledger are returned for completion.
    pub async fn load(&self) -> JourneyResult<Vec<Journey>> {
        let snapshot = self.backend.load().await?;
        self.active.clear();
        let mut stranded = Vec::new();
        for journey in snapshot.journeys {
            if journey.is_terminal() {
                stranded.push(journey);
            } else {
                self.active.insert(journey.id, journey);
            }
        }
        *self.ledger.write() = snapshot.ledger;
        info!(
            active = self.active.len(),
            ledger = self.ledger.read().len(),
            "Journey store loaded"
        );
        Ok(stranded)
    }

    pub fn get(&self, id: &Uuid) -> Option<Journey> {
        self.active.get(id).map(|r| r.clone())
    }

    pub fn all_active(&self) -> Vec<Journey> {
        self.active.iter().map(|r| r.value().clone()).collect()
    }

    /// Active journeys for a user, oldest first.
    pub fn active_for(&self, distinct_id: &str) -> Vec<Journey> {
        let mut journeys: Vec<Journey> = self
            .active
            .iter()
            .filter(|r| r.value().distinct_id == distinct_id)
            .map(|r| r.value().clone())
            .collect();
        journeys.sort_by_key(|j| j.started_at);
        journeys
    }

    pub fn ledger_for(&self, distinct_id: &str, campaign_id: &str) -> Vec<CompletionRecord> {
        self.ledger
            .read()
            .iter()
            .filter(|r| r.distinct_id == distinct_id && r.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    pub fn ledger(&self) -> Vec<CompletionRecord> {
        self.ledger.read().clone()
    }

    /// Records the journey's new state. Only the serialized orchestrator
    /// calls this.
    pub async fn save(&self, journey: &Journey) -> JourneyResult<()> {
        self.active.insert(journey.id, journey.clone());
        self.with_retry("put_journey", || self.backend.put_journey(journey))
            .await
    }

    /// Moves a finished journey from the active set to the ledger. When the
    /// backend refuses the move, the terminal journey itself is written so
    /// the next `load` finds it stranded and completes it.
    pub async fn complete(&self, journey: &Journey) -> JourneyResult<CompletionRecord> {
        let record = CompletionRecord::for_journey(journey);
        self.active.remove(&journey.id);
        self.ledger.write().push(record.clone());
        let result = self
            .with_retry("complete_journey", || {
                self.backend.complete_journey(journey.id, &record)
            })
            .await;
        if let Err(e) = result {
            if let Err(fallback) = self
                .with_retry("put_journey", || self.backend.put_journey(journey))
                .await
            {
                error!(
                    journey_id = %journey.id,
                    error = %fallback,
                    "Terminal journey state could not be persisted"
                );
            }
            return Err(e);
        }
        Ok(record)
    }

    async fn with_retry<F, Fut>(&self, op: &'static str, mut f: F) -> JourneyResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = JourneyResult<()>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match f().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(op, attempt, attempts, error = %e, "Journey store write failed");
                    metrics::counter!("journey.persist_errors").increment(1);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff * attempt).await;
                    }
                }
            }
        }
        debug!(op, "Journey store retries exhausted");
        Err(JourneyError::Persistence(format!(
            "{op} failed after {attempts} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
