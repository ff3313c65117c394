//! Serialized owner of the active journey set.
//!
//! Every mutation happens on a single worker task that consumes commands from
//! a bounded channel. Node execution, goal checks, trigger conditions, and
//! profile fetches run as spawned tasks and report back through the same
//! channel, so a journey waiting on presentation never blocks the others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campaign_core::config::JourneyConfig;
use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::types::EventType;

use crate::clock::{self, Clock, SystemClock};
use crate::error::{JourneyError, JourneyResult, PortResult};
use crate::executor::{ExecutionContext, Executor, NodeExecutionResult, ResumeReason};
use crate::expression::{Envelope, ExpressionEvaluator};
use crate::goal::{GoalEvaluator, GoalOutcome};
use crate::journey::{ExitReason, Journey, JourneyStatus, Origin};
use crate::model::{Campaign, ExitPolicy, NodeKind, ReentryPolicy, Trigger, WorkflowNode};
use crate::ports::{PortAdapters, Ports, Profile};
use crate::store::{CompletionRecord, JourneyBackend, JourneyStore, RetryPolicy};

/// An analytics event reported by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEvent {
    #[serde(default = "new_event_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub distinct_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

impl TrackedEvent {
    pub fn new(
        name: impl Into<String>,
        distinct_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_event_id(),
            name: name.into(),
            distinct_id: distinct_id.into(),
            properties: Map::new(),
            timestamp,
        }
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    fn origin(&self) -> Origin {
        Origin {
            event_id: self.id.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    DidEnterBackground,
    WillEnterForeground,
    DidBecomeActive,
}

enum Command {
    Initialize {
        reply: oneshot::Sender<JourneyResult<()>>,
    },
    Start {
        campaign: Arc<Campaign>,
        distinct_id: String,
        origin: Option<Origin>,
        reply: oneshot::Sender<JourneyResult<Option<Journey>>>,
    },
    Event {
        event: TrackedEvent,
    },
    SegmentsChanged,
    RefreshProfile {
        reply: Option<oneshot::Sender<JourneyResult<()>>>,
    },
    ContentInvalidated {
        flow_id: String,
    },
    ProfileFetched {
        task_id: u64,
        result: PortResult<Profile>,
        reply: Option<oneshot::Sender<JourneyResult<()>>>,
    },
    ResumeDue,
    Lifecycle(Lifecycle),
    RetryParked {
        task_id: u64,
    },
    TimerFired {
        journey_id: Uuid,
        node_id: String,
    },
    StepFinished {
        task_id: u64,
        journey_id: Uuid,
        node_id: String,
        result: NodeExecutionResult,
    },
    GoalChecked {
        task_id: u64,
        journey_id: Uuid,
        outcome: GoalOutcome,
    },
    TriggerMatched {
        task_id: u64,
        campaign_id: String,
        distinct_id: String,
        origin: Option<Origin>,
        matched: bool,
    },
    Idle {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct WorkerHandle {
    tx: mpsc::Sender<Command>,
    join: JoinHandle<()>,
}

/// Entry point for the host application. Construct with ports and a durable
/// backend, call [`initialize`](Self::initialize), feed it events and
/// lifecycle signals, and [`shutdown`](Self::shutdown) when done.
pub struct JourneyOrchestrator {
    config: JourneyConfig,
    ports: Ports,
    store: Arc<JourneyStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for JourneyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyOrchestrator")
            .field("store", &self.store)
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

impl JourneyOrchestrator {
    pub fn new(config: JourneyConfig, ports: Ports, backend: Arc<dyn JourneyBackend>) -> Self {
        let retry = RetryPolicy {
            attempts: config.persist_retries,
            backoff: StdDuration::from_millis(config.persist_retry_backoff_ms),
        };
        Self {
            store: Arc::new(JourneyStore::new(backend, retry)),
            config,
            ports,
            clock: Arc::new(SystemClock),
            sink: noop_sink(),
            worker: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Starts the worker, loads campaigns and persisted journeys, re-arms
    /// timers, and re-drives journeys that were mid-transition.
    pub async fn initialize(&self) -> JourneyResult<()> {
        let tx = {
            let mut worker = self.worker.lock();
            if worker.is_some() {
                warn!("Journey orchestrator already initialized");
                return Ok(());
            }
            let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
            let state = Worker::new(self, tx.downgrade());
            let join = tokio::spawn(state.run(rx));
            *worker = Some(WorkerHandle {
                tx: tx.clone(),
                join,
            });
            tx
        };

        let (reply, rx) = oneshot::channel();
        let result = match tx.send(Command::Initialize { reply }).await {
            Ok(()) => rx.await.unwrap_or(Err(JourneyError::Cancelled)),
            Err(_) => Err(JourneyError::NotRunning),
        };
        if let Err(e) = &result {
            error!(error = %e, "Journey orchestrator failed to initialize");
            self.shutdown().await;
        }
        result
    }

    /// Cancels timers and in-flight work. Journeys keep their last persisted
    /// state, which is re-driven on the next `initialize`.
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };
        let (reply, rx) = oneshot::channel();
        if handle.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        drop(handle.tx);
        if let Err(e) = handle.join.await {
            warn!(error = %e, "Journey worker ended abnormally");
        }
        info!("Journey orchestrator shut down");
    }

    /// Starts a journey unless the campaign's re-entry policy or the active
    /// cap forbids it. The campaign becomes known to the orchestrator until
    /// the next profile refresh.
    pub async fn start_journey(
        &self,
        campaign: &Campaign,
        distinct_id: &str,
        origin: Option<Origin>,
    ) -> JourneyResult<Option<Journey>> {
        let campaign = Arc::new(campaign.clone());
        let distinct_id = distinct_id.to_string();
        self.request(|reply| Command::Start {
            campaign,
            distinct_id,
            origin,
            reply,
        })
        .await?
    }

    pub async fn handle_event(&self, event: TrackedEvent) -> JourneyResult<()> {
        self.send(Command::Event { event }).await
    }

    /// Active journeys for a user, oldest first. Served from the mirror.
    pub fn get_active_journeys(&self, distinct_id: &str) -> Vec<Journey> {
        self.store.active_for(distinct_id)
    }

    pub fn completion_ledger(&self, distinct_id: &str, campaign_id: &str) -> Vec<CompletionRecord> {
        self.store.ledger_for(distinct_id, campaign_id)
    }

    pub fn ledger(&self) -> Vec<CompletionRecord> {
        self.store.ledger()
    }

    pub async fn segments_changed(&self) -> JourneyResult<()> {
        self.send(Command::SegmentsChanged).await
    }

    /// Refetches the profile and replaces campaigns wholesale.
    pub async fn refresh_profile(&self) -> JourneyResult<()> {
        self.request(|reply| Command::RefreshProfile { reply: Some(reply) })
            .await?
    }

    pub async fn content_invalidated(&self, flow_id: &str) -> JourneyResult<()> {
        self.send(Command::ContentInvalidated {
            flow_id: flow_id.to_string(),
        })
        .await
    }

    /// Re-drives paused journeys whose deadline has passed.
    pub async fn resume_due(&self) -> JourneyResult<()> {
        self.send(Command::ResumeDue).await
    }

    pub async fn did_enter_background(&self) -> JourneyResult<()> {
        self.send(Command::Lifecycle(Lifecycle::DidEnterBackground))
            .await
    }

    pub async fn will_enter_foreground(&self) -> JourneyResult<()> {
        self.send(Command::Lifecycle(Lifecycle::WillEnterForeground))
            .await
    }

    pub async fn did_become_active(&self) -> JourneyResult<()> {
        self.send(Command::Lifecycle(Lifecycle::DidBecomeActive)).await
    }

    /// Resolves once no step, goal check, trigger check, profile fetch, or
    /// grace period is outstanding.
    pub async fn idle(&self) -> JourneyResult<()> {
        self.request(|reply| Command::Idle { reply }).await
    }

    fn sender(&self) -> JourneyResult<mpsc::Sender<Command>> {
        self.worker
            .lock()
            .as_ref()
            .map(|w| w.tx.clone())
            .ok_or(JourneyError::NotRunning)
    }

    async fn send(&self, command: Command) -> JourneyResult<()> {
        let tx = self.sender()?;
        tx.send(command).await.map_err(|_| JourneyError::NotRunning)
    }

    async fn request<T, F>(&self, command: F) -> JourneyResult<T>
    where
        T: Send,
        F: FnOnce(oneshot::Sender<T>) -> Command + Send,
    {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| JourneyError::Cancelled)
    }
}

struct InFlight {
    task_id: u64,
    handle: JoinHandle<()>,
}

struct Worker {
    config: JourneyConfig,
    ports: Ports,
    store: Arc<JourneyStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    executor: Arc<Executor>,
    goals: Arc<GoalEvaluator>,
    evaluator: ExpressionEvaluator,
    tx: mpsc::WeakSender<Command>,
    distinct_id: String,
    campaigns: HashMap<String, Arc<Campaign>>,
    profile_loaded: bool,
    in_flight: HashMap<Uuid, InFlight>,
    pending: HashMap<Uuid, ResumeReason>,
    tasks: HashMap<u64, JoinHandle<()>>,
    timers: HashMap<Uuid, JoinHandle<()>>,
    grace_task: Option<u64>,
    drive_steps: HashMap<Uuid, usize>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    foreground: bool,
    presentation_ready: bool,
    next_task_id: u64,
}

impl Worker {
    fn new(orchestrator: &JourneyOrchestrator, tx: mpsc::WeakSender<Command>) -> Self {
        Self {
            config: orchestrator.config.clone(),
            ports: orchestrator.ports.clone(),
            store: orchestrator.store.clone(),
            clock: orchestrator.clock.clone(),
            sink: orchestrator.sink.clone(),
            executor: Arc::new(Executor::new(orchestrator.ports.clone())),
            goals: Arc::new(GoalEvaluator::new(orchestrator.ports.clone())),
            evaluator: ExpressionEvaluator::new(),
            tx,
            distinct_id: String::new(),
            campaigns: HashMap::new(),
            profile_loaded: false,
            in_flight: HashMap::new(),
            pending: HashMap::new(),
            tasks: HashMap::new(),
            timers: HashMap::new(),
            grace_task: None,
            drive_steps: HashMap::new(),
            idle_waiters: Vec::new(),
            foreground: true,
            presentation_ready: true,
            next_task_id: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            let stop = self.handle(command).await;
            self.notify_idle();
            if stop {
                break;
            }
        }
        self.abort_all();
        debug!("Journey worker exited");
    }

    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Initialize { reply } => {
                let result = self.on_initialize().await;
                let _ = reply.send(result);
            }
            Command::Start {
                campaign,
                distinct_id,
                origin,
                reply,
            } => {
                let result = self.on_start(campaign, &distinct_id, origin).await;
                let _ = reply.send(result);
            }
            Command::Event { event } => self.on_event(event).await,
            Command::SegmentsChanged => self.on_segments_changed().await,
            Command::RefreshProfile { reply } => self.spawn_profile_fetch(reply),
            Command::ContentInvalidated { flow_id } => {
                if self.references_flow(&flow_id) {
                    info!(flow_id = %flow_id, "Referenced content changed, refreshing profile");
                    self.spawn_profile_fetch(None);
                } else {
                    debug!(flow_id = %flow_id, "Ignoring invalidation of unreferenced content");
                }
            }
            Command::ProfileFetched {
                task_id,
                result,
                reply,
            } => {
                self.tasks.remove(&task_id);
                let outcome = self.on_profile_fetched(result).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::ResumeDue => self.on_resume_due().await,
            Command::Lifecycle(signal) => self.on_lifecycle(signal).await,
            Command::RetryParked { task_id } => self.on_retry_parked(task_id).await,
            Command::TimerFired {
                journey_id,
                node_id,
            } => self.on_timer(journey_id, &node_id).await,
            Command::StepFinished {
                task_id,
                journey_id,
                node_id,
                result,
            } => {
                self.on_step_finished(task_id, journey_id, &node_id, result)
                    .await
            }
            Command::GoalChecked {
                task_id,
                journey_id,
                outcome,
            } => self.on_goal_checked(task_id, journey_id, outcome).await,
            Command::TriggerMatched {
                task_id,
                campaign_id,
                distinct_id,
                origin,
                matched,
            } => {
                self.tasks.remove(&task_id);
                if matched {
                    self.on_trigger_matched(&campaign_id, &distinct_id, origin)
                        .await;
                } else {
                    debug!(campaign_id = %campaign_id, distinct_id = %distinct_id, "Trigger condition not met");
                }
            }
            Command::Idle { reply } => self.idle_waiters.push(reply),
            Command::Shutdown { reply } => {
                self.abort_all();
                info!("Journey orchestrator stopping");
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    async fn on_initialize(&mut self) -> JourneyResult<()> {
        self.distinct_id = self.ports.identity.distinct_id();
        match self.ports.profile.fetch_profile(&self.distinct_id).await {
            Ok(profile) => self.install_campaigns(&profile),
            Err(e) => warn!(
                distinct_id = %self.distinct_id,
                error = %e,
                "Profile fetch failed, starting without campaigns"
            ),
        }

        let stranded = self.store.load().await?;
        for journey in stranded {
            info!(journey_id = %journey.id, "Recording completion of journey finished before restart");
            if let Err(e) = self.store.complete(&journey).await {
                error!(journey_id = %journey.id, error = %e, "Failed to record stranded completion");
            }
        }

        let now = self.clock.now();
        let restored = self.store.all_active();
        for journey in &restored {
            match journey.resume_at {
                Some(at) if journey.status == JourneyStatus::Paused && at > now => {
                    self.arm_timer(journey)
                }
                _ => self.drive(journey.id, ResumeReason::Restore).await,
            }
        }
        let count = restored.len();
        for journey in restored {
            self.spawn_goal_check(journey);
        }

        info!(
            distinct_id = %self.distinct_id,
            campaigns = self.campaigns.len(),
            restored = count,
            "Journey orchestrator initialized"
        );
        Ok(())
    }

    fn install_campaigns(&mut self, profile: &Profile) {
        let (campaigns, errors) = profile.parse_campaigns();
        for e in &errors {
            warn!(error = %e, "Skipping invalid campaign");
        }
        self.campaigns = campaigns
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(c)))
            .collect();
        self.profile_loaded = true;
        info!(
            campaigns = self.campaigns.len(),
            skipped = errors.len(),
            "Campaigns installed"
        );
    }

    fn spawn_profile_fetch(&mut self, reply: Option<oneshot::Sender<JourneyResult<()>>>) {
        let profile = self.ports.profile.clone();
        let distinct_id = self.distinct_id.clone();
        self.spawn_task(move |task_id| async move {
            let result = profile.fetch_profile(&distinct_id).await;
            Command::ProfileFetched {
                task_id,
                result,
                reply,
            }
        });
    }

    async fn on_profile_fetched(&mut self, result: PortResult<Profile>) -> JourneyResult<()> {
        let profile = result.map_err(|e| {
            warn!(error = %e, "Profile refresh failed, keeping current campaigns");
            JourneyError::port("profile", e)
        })?;
        self.install_campaigns(&profile);

        for journey in self.store.all_active() {
            if !self.campaigns.contains_key(&journey.campaign_id) {
                info!(
                    journey_id = %journey.id,
                    campaign_id = %journey.campaign_id,
                    "Campaign withdrawn, exiting journey"
                );
                self.finish(journey, ExitReason::CampaignUnavailable).await;
            }
        }
        Ok(())
    }

    fn references_flow(&self, flow_id: &str) -> bool {
        self.campaigns.values().any(|c| {
            c.nodes
                .iter()
                .any(|n| matches!(&n.kind, NodeKind::ShowContent { flow_id: f } if f == flow_id))
        })
    }

    async fn on_lifecycle(&mut self, signal: Lifecycle) {
        info!(?signal, "App lifecycle signal");
        match signal {
            Lifecycle::DidEnterBackground => {
                self.foreground = false;
                self.presentation_ready = false;
                self.cancel_grace();
                for (_, timer) in self.timers.drain() {
                    timer.abort();
                }
            }
            Lifecycle::WillEnterForeground => {
                self.ports.presentation.will_enter_foreground();
                self.foreground = true;
                let now = self.clock.now();
                let active = self.store.all_active();
                for journey in &active {
                    if journey.status == JourneyStatus::Paused
                        && journey.resume_at.is_some_and(|at| at > now)
                    {
                        self.arm_timer(journey);
                    }
                }
                self.on_resume_due().await;
                for journey in active {
                    self.spawn_goal_check(journey);
                }
            }
            Lifecycle::DidBecomeActive => {
                self.ports.presentation.did_become_active();
                self.foreground = true;
                self.cancel_grace();
                let grace = StdDuration::from_millis(self.config.foreground_grace_ms);
                self.grace_task = self.spawn_task(move |task_id| async move {
                    tokio::time::sleep(grace).await;
                    Command::RetryParked { task_id }
                });
            }
        }
    }

    async fn on_retry_parked(&mut self, task_id: u64) {
        self.tasks.remove(&task_id);
        if self.grace_task != Some(task_id) {
            return;
        }
        self.grace_task = None;
        if !self.foreground {
            return;
        }
        self.presentation_ready = true;
        debug!("Presentation grace period elapsed");
        self.retry_parked_presentations(None).await;
    }

    fn cancel_grace(&mut self) {
        if let Some(task_id) = self.grace_task.take() {
            if let Some(handle) = self.tasks.remove(&task_id) {
                handle.abort();
            }
        }
    }

    fn can_present(&self) -> bool {
        self.foreground && self.presentation_ready
    }

    // ─── Starting journeys ──────────────────────────────────────────────

    async fn on_start(
        &mut self,
        campaign: Arc<Campaign>,
        distinct_id: &str,
        origin: Option<Origin>,
    ) -> JourneyResult<Option<Journey>> {
        if let Err(e) = campaign.validate() {
            warn!(campaign_id = %campaign.id, error = %e, "Refusing to start invalid campaign");
            return Err(e);
        }
        self.campaigns.insert(campaign.id.clone(), campaign.clone());
        self.start_internal(campaign, distinct_id, origin).await
    }

    async fn start_internal(
        &mut self,
        campaign: Arc<Campaign>,
        distinct_id: &str,
        origin: Option<Origin>,
    ) -> JourneyResult<Option<Journey>> {
        let now = self.clock.now();
        if let Err(reason) = self.admit(&campaign, distinct_id, now) {
            debug!(campaign_id = %campaign.id, distinct_id, reason, "Journey start rejected");
            self.sink.emit(
                make_event(
                    EventType::JourneyRejected,
                    "",
                    Some(campaign.id.clone()),
                    Some(distinct_id.to_string()),
                )
                .with_detail(reason),
            );
            return Ok(None);
        }

        let journey = Journey::start(&campaign, distinct_id, origin.as_ref(), now);
        if let Err(e) = self.store.save(&journey).await {
            self.persistence_failed(journey, &e).await;
            return Err(e);
        }
        // The goal may already hold at entry.
        self.spawn_goal_check(journey.clone());

        metrics::counter!("journey.started").increment(1);
        info!(
            journey_id = %journey.id,
            campaign_id = %campaign.id,
            distinct_id,
            entry_node = %journey.current_node_id,
            "Journey started"
        );
        self.emit(EventType::JourneyEntered, &journey, &journey.current_node_id, None);
        self.drive(journey.id, ResumeReason::Start).await;
        Ok(Some(journey))
    }

    /// Re-entry and capacity gate.
    fn admit(
        &self,
        campaign: &Campaign,
        distinct_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), &'static str> {
        if !self.config.enabled {
            return Err("journeys_disabled");
        }
        let active = self.store.active_for(distinct_id);
        if active.len() >= self.config.max_active_journeys {
            return Err("active_limit");
        }
        let pair_active = active.iter().any(|j| j.campaign_id == campaign.id);

        match campaign.reentry {
            ReentryPolicy::Concurrent => Ok(()),
            _ if pair_active => Err("already_active"),
            ReentryPolicy::Once => {
                if self.store.ledger_for(distinct_id, &campaign.id).is_empty() {
                    Ok(())
                } else {
                    Err("already_completed")
                }
            }
            ReentryPolicy::EveryRematch => Ok(()),
            ReentryPolicy::Cooldown { seconds } => {
                let last = self
                    .store
                    .ledger_for(distinct_id, &campaign.id)
                    .into_iter()
                    .map(|r| r.completed_at)
                    .max();
                let Some(last) = last else {
                    return Ok(());
                };
                // A cooldown ending past the representable range never ends.
                match clock::after(last, seconds) {
                    Some(until) if until <= now => Ok(()),
                    _ => Err("cooldown"),
                }
            }
        }
    }

    // ─── Events, segments, triggers ─────────────────────────────────────

    async fn on_event(&mut self, event: TrackedEvent) {
        debug!(event = %event.name, distinct_id = %event.distinct_id, "Handling event");
        self.recheck_user(
            &event.distinct_id,
            ResumeReason::Event {
                name: event.name.clone(),
            },
        )
        .await;

        let mut matching: Vec<Arc<Campaign>> = self
            .campaigns
            .values()
            .filter(|c| c.trigger_event() == Some(event.name.as_str()))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        for campaign in matching {
            let condition = match &campaign.trigger {
                Trigger::Event { condition, .. } => condition.clone(),
                Trigger::Segment { .. } => continue,
            };
            match condition {
                Some(condition) => self.spawn_trigger_check(
                    campaign.id.clone(),
                    condition,
                    event.distinct_id.clone(),
                    event.properties.clone(),
                    Some(event.origin()),
                ),
                None => {
                    if let Err(e) = self
                        .start_internal(campaign, &event.distinct_id, Some(event.origin()))
                        .await
                    {
                        warn!(event = %event.name, error = %e, "Triggered journey failed to start");
                    }
                }
            }
        }
    }

    async fn on_segments_changed(&mut self) {
        let distinct_id = self.distinct_id.clone();
        self.recheck_user(&distinct_id, ResumeReason::SegmentChange)
            .await;

        let mut segment_triggers: Vec<(String, Envelope)> = self
            .campaigns
            .values()
            .filter_map(|c| match &c.trigger {
                Trigger::Segment { condition } => Some((c.id.clone(), condition.clone())),
                Trigger::Event { .. } => None,
            })
            .collect();
        segment_triggers.sort_by(|a, b| a.0.cmp(&b.0));

        for (campaign_id, condition) in segment_triggers {
            self.spawn_trigger_check(campaign_id, condition, distinct_id.clone(), Map::new(), None);
        }
    }

    /// Re-checks goals for the user's journeys and re-drives those waiting.
    async fn recheck_user(&mut self, distinct_id: &str, reason: ResumeReason) {
        for journey in self.store.active_for(distinct_id) {
            let waiting = matches!(self.node_kind(&journey), Some(NodeKind::WaitUntil { .. }));
            let id = journey.id;
            self.spawn_goal_check(journey);
            if waiting {
                self.drive(id, reason.clone()).await;
            }
        }
    }

    fn spawn_trigger_check(
        &mut self,
        campaign_id: String,
        condition: Envelope,
        distinct_id: String,
        properties: Map<String, Value>,
        origin: Option<Origin>,
    ) {
        let ports = self.ports.clone();
        let evaluator = self.evaluator.clone();
        let now = self.clock.now();
        self.spawn_task(move |task_id| async move {
            let matched = {
                let adapters = PortAdapters::new(&ports, &distinct_id, now)
                    .with_event_properties(&properties);
                evaluator.evaluate_bool(&condition, &adapters).await
            };
            Command::TriggerMatched {
                task_id,
                campaign_id,
                distinct_id,
                origin,
                matched,
            }
        });
    }

    async fn on_trigger_matched(&mut self, campaign_id: &str, distinct_id: &str, origin: Option<Origin>) {
        let Some(campaign) = self.campaigns.get(campaign_id).cloned() else {
            return;
        };
        if let Err(e) = self.start_internal(campaign, distinct_id, origin).await {
            warn!(campaign_id, error = %e, "Triggered journey failed to start");
        }
    }

    // ─── Goals ──────────────────────────────────────────────────────────

    fn spawn_goal_check(&mut self, journey: Journey) {
        if journey.goal_snapshot().is_none() || journey.converted_at().is_some() {
            return;
        }
        let goals = self.goals.clone();
        let now = self.clock.now();
        self.spawn_task(move |task_id| async move {
            let outcome = goals.is_goal_met(&journey, now).await;
            Command::GoalChecked {
                task_id,
                journey_id: journey.id,
                outcome,
            }
        });
    }

    async fn on_goal_checked(&mut self, task_id: u64, journey_id: Uuid, outcome: GoalOutcome) {
        self.tasks.remove(&task_id);
        let (true, Some(at)) = (outcome.met, outcome.at) else {
            return;
        };
        let Some(mut journey) = self.store.get(&journey_id) else {
            return;
        };
        if journey.is_terminal() || !journey.record_conversion(at) {
            return;
        }

        metrics::counter!("journey.goal_met").increment(1);
        info!(
            journey_id = %journey_id,
            campaign_id = %journey.campaign_id,
            converted_at = %at,
            "Journey goal met"
        );
        self.emit(EventType::JourneyGoalMet, &journey, &journey.current_node_id, None);

        match journey.exit_policy {
            ExitPolicy::OnGoalMet => self.finish(journey, ExitReason::GoalMet).await,
            ExitPolicy::Never => {
                journey.updated_at = self.clock.now();
                if let Err(e) = self.store.save(&journey).await {
                    self.persistence_failed(journey, &e).await;
                }
            }
        }
    }

    // ─── Driving ────────────────────────────────────────────────────────

    /// Schedules execution of the journey's current node. A journey that is
    /// already executing records the reason and is re-driven once it parks.
    async fn drive(&mut self, journey_id: Uuid, reason: ResumeReason) {
        if self.in_flight.contains_key(&journey_id) {
            debug!(journey_id = %journey_id, ?reason, "Journey busy, queueing resume");
            self.pending.insert(journey_id, reason);
            return;
        }
        let Some(journey) = self.store.get(&journey_id) else {
            return;
        };
        if journey.is_terminal() {
            return;
        }
        let Some(campaign) = self.campaigns.get(&journey.campaign_id).cloned() else {
            if self.profile_loaded {
                warn!(
                    journey_id = %journey_id,
                    campaign_id = %journey.campaign_id,
                    "Campaign no longer available"
                );
                self.finish(journey, ExitReason::CampaignUnavailable).await;
            } else {
                debug!(journey_id = %journey_id, "Campaigns not loaded, leaving journey parked");
            }
            return;
        };
        let Some(node) = campaign.node(&journey.current_node_id).cloned() else {
            let message = format!(
                "node {} not found in campaign {}",
                journey.current_node_id, campaign.id
            );
            self.finish(journey, ExitReason::errored(message)).await;
            return;
        };

        if reason != ResumeReason::Advance {
            self.drive_steps.remove(&journey_id);
        }
        self.cancel_timer(&journey_id);
        self.spawn_step(journey, node, reason);
    }

    fn spawn_step(&mut self, journey: Journey, node: WorkflowNode, reason: ResumeReason) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let task_id = self.next_task_id();
        let executor = self.executor.clone();
        let ctx = ExecutionContext {
            now: self.clock.now(),
            can_present: self.can_present(),
        };
        let journey_id = journey.id;
        let node_id = node.id.clone();

        let handle = tokio::spawn(async move {
            // The inner task is aborted with the JoinSet if this one is.
            let mut set = JoinSet::new();
            set.spawn(async move { executor.execute(&node, &journey, &reason, ctx).await });
            let result = match set.join_next().await {
                Some(Ok(result)) => result,
                Some(Err(e)) => NodeExecutionResult::Complete {
                    reason: ExitReason::errored(format!("node execution aborted: {e}")),
                },
                None => return,
            };
            let _ = tx
                .send(Command::StepFinished {
                    task_id,
                    journey_id,
                    node_id,
                    result,
                })
                .await;
        });
        self.in_flight.insert(journey_id, InFlight { task_id, handle });
    }

    async fn on_step_finished(
        &mut self,
        task_id: u64,
        journey_id: Uuid,
        node_id: &str,
        result: NodeExecutionResult,
    ) {
        match self.in_flight.get(&journey_id) {
            Some(flight) if flight.task_id == task_id => {
                self.in_flight.remove(&journey_id);
            }
            _ => {
                debug!(journey_id = %journey_id, node_id, "Dropping stale step result");
                return;
            }
        }
        let Some(journey) = self.store.get(&journey_id) else {
            return;
        };
        if journey.is_terminal() || journey.current_node_id != node_id {
            return;
        }

        metrics::counter!("journey.step_executed").increment(1);
        debug!(journey_id = %journey_id, node_id, ?result, "Step finished");
        let freed_surface = !matches!(result, NodeExecutionResult::Async { .. })
            && matches!(self.node_kind(&journey), Some(NodeKind::ShowContent { .. }));

        match result {
            NodeExecutionResult::Continue { next } => match next.into_iter().next() {
                Some(next) => {
                    self.advance(journey, &next, EventType::JourneyStepCompleted)
                        .await
                }
                None => self.finish(journey, ExitReason::Completed).await,
            },
            NodeExecutionResult::Skip { next: Some(next) } => {
                self.advance(journey, &next, EventType::JourneyStepSkipped)
                    .await
            }
            NodeExecutionResult::Skip { next: None } => {
                self.finish(journey, ExitReason::Completed).await
            }
            NodeExecutionResult::Async { deadline } => self.park(journey, deadline).await,
            NodeExecutionResult::Complete { reason } => self.finish(journey, reason).await,
        }

        if freed_surface && self.can_present() {
            self.retry_parked_presentations(Some(journey_id)).await;
        }
    }

    async fn advance(&mut self, mut journey: Journey, next: &str, event_type: EventType) {
        let id = journey.id;
        let steps = {
            let steps = self.drive_steps.entry(id).or_insert(0);
            *steps += 1;
            *steps
        };
        if steps > self.config.max_steps_per_drive {
            warn!(journey_id = %id, steps, "Journey exceeded step limit without suspending");
            let message = format!(
                "exceeded {} steps without suspending",
                self.config.max_steps_per_drive
            );
            self.finish(journey, ExitReason::errored(message)).await;
            return;
        }

        let from = journey.current_node_id.clone();
        if let Err(e) = journey.advance_to(next, self.clock.now()) {
            warn!(journey_id = %id, error = %e, "Cannot advance journey");
            return;
        }
        if let Err(e) = self.store.save(&journey).await {
            self.persistence_failed(journey, &e).await;
            return;
        }
        self.emit(event_type, &journey, &from, Some(next));
        self.drive(id, ResumeReason::Advance).await;
    }

    async fn park(&mut self, mut journey: Journey, deadline: Option<DateTime<Utc>>) {
        let id = journey.id;
        self.drive_steps.remove(&id);
        let changed = journey.status != JourneyStatus::Paused || journey.resume_at != deadline;
        if let Err(e) = journey.park(deadline, self.clock.now()) {
            warn!(journey_id = %id, error = %e, "Cannot park journey");
            return;
        }
        if changed {
            if let Err(e) = self.store.save(&journey).await {
                self.persistence_failed(journey, &e).await;
                return;
            }
            debug!(
                journey_id = %id,
                node_id = %journey.current_node_id,
                resume_at = ?deadline,
                "Journey parked"
            );
            self.emit(EventType::JourneyParked, &journey, &journey.current_node_id, None);
        }
        self.arm_timer(&journey);

        if let Some(reason) = self.pending.remove(&id) {
            self.drive(id, reason).await;
        }
    }

    async fn finish(&mut self, mut journey: Journey, reason: ExitReason) {
        let id = journey.id;
        if let Some(flight) = self.in_flight.remove(&id) {
            flight.handle.abort();
            if matches!(self.node_kind(&journey), Some(NodeKind::ShowContent { .. })) {
                self.ports.presentation.dismiss_current().await;
            }
        }
        self.cancel_timer(&id);
        self.pending.remove(&id);
        self.drive_steps.remove(&id);

        if let Err(e) = journey.finish(reason.clone(), self.clock.now()) {
            warn!(journey_id = %id, error = %e, "Journey already finished");
            return;
        }
        if let Err(e) = self.store.complete(&journey).await {
            error!(journey_id = %id, error = %e, "Failed to persist journey completion");
        }

        metrics::counter!("journey.completed").increment(1);
        info!(
            journey_id = %id,
            campaign_id = %journey.campaign_id,
            status = ?journey.status,
            reason = reason.label(),
            "Journey finished"
        );
        let event_type = match journey.status {
            JourneyStatus::Errored => EventType::JourneyError,
            JourneyStatus::Exited => EventType::JourneyExited,
            _ => EventType::JourneyCompleted,
        };
        self.emit(event_type, &journey, &journey.current_node_id, Some(reason.label()));
    }

    async fn persistence_failed(&mut self, journey: Journey, e: &JourneyError) {
        error!(journey_id = %journey.id, error = %e, "Journey state could not be persisted");
        self.finish(journey, ExitReason::errored(e.to_string())).await;
    }

    async fn retry_parked_presentations(&mut self, except: Option<Uuid>) {
        for journey in self.store.all_active() {
            if Some(journey.id) == except || journey.status != JourneyStatus::Paused {
                continue;
            }
            if matches!(self.node_kind(&journey), Some(NodeKind::ShowContent { .. })) {
                self.drive(journey.id, ResumeReason::Foreground).await;
            }
        }
    }

    fn node_kind(&self, journey: &Journey) -> Option<&NodeKind> {
        self.campaigns
            .get(&journey.campaign_id)?
            .node(&journey.current_node_id)
            .map(|n| &n.kind)
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    async fn on_resume_due(&mut self) {
        let now = self.clock.now();
        let can_present = self.can_present();
        for journey in self.store.all_active() {
            if journey.status != JourneyStatus::Paused {
                continue;
            }
            if journey.resume_at.is_some_and(|at| at <= now) {
                self.drive(journey.id, ResumeReason::Timer).await;
            } else if can_present
                && journey.resume_at.is_none()
                && matches!(self.node_kind(&journey), Some(NodeKind::ShowContent { .. }))
            {
                self.drive(journey.id, ResumeReason::Foreground).await;
            }
        }
    }

    /// Sleeps until the journey's absolute `resume_at`. Not armed while
    /// backgrounded; foregrounding re-arms from the stored deadline.
    fn arm_timer(&mut self, journey: &Journey) {
        let Some(at) = journey.resume_at else {
            return;
        };
        if !self.foreground {
            return;
        }
        self.cancel_timer(&journey.id);
        let wait = (at - self.clock.now()).to_std().unwrap_or_default();
        let weak = self.tx.clone();
        let journey_id = journey.id;
        let node_id = journey.current_node_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::TimerFired { journey_id, node_id }).await;
            }
        });
        self.timers.insert(journey_id, handle);
    }

    fn cancel_timer(&mut self, journey_id: &Uuid) {
        if let Some(timer) = self.timers.remove(journey_id) {
            timer.abort();
        }
    }

    async fn on_timer(&mut self, journey_id: Uuid, node_id: &str) {
        self.timers.remove(&journey_id);
        let Some(journey) = self.store.get(&journey_id) else {
            return;
        };
        if journey.status != JourneyStatus::Paused || journey.current_node_id != node_id {
            debug!(journey_id = %journey_id, node_id, "Timer fired for a journey that moved on");
            return;
        }
        match journey.resume_at {
            Some(at) if at <= self.clock.now() => self.drive(journey_id, ResumeReason::Timer).await,
            Some(_) => self.arm_timer(&journey),
            None => {}
        }
    }

    // ─── Plumbing ───────────────────────────────────────────────────────

    fn next_task_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Runs `make` on its own task and feeds the resulting command back into
    /// the worker. Returns the task id used for idle tracking.
    fn spawn_task<F, Fut>(&mut self, make: F) -> Option<u64>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Command> + Send + 'static,
    {
        let tx = self.tx.upgrade()?;
        let task_id = self.next_task_id();
        let fut = make(task_id);
        let handle = tokio::spawn(async move {
            let command = fut.await;
            let _ = tx.send(command).await;
        });
        self.tasks.insert(task_id, handle);
        Some(task_id)
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.tasks.is_empty()
    }

    fn notify_idle(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn abort_all(&mut self) {
        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.grace_task = None;
        self.pending.clear();
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn emit(&self, event_type: EventType, journey: &Journey, node_id: &str, detail: Option<&str>) {
        let mut event = make_event(
            event_type,
            journey.id.to_string(),
            Some(journey.campaign_id.clone()),
            Some(journey.distinct_id.clone()),
        )
        .with_node(node_id);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryPorts;
    use crate::store::MemoryBackend;
    use campaign_core::event_bus::{capture_sink, CaptureSink};
    use chrono::Duration;
    use serde_json::json;

    struct Harness {
        orchestrator: JourneyOrchestrator,
        ports: MemoryPorts,
        clock: Arc<ManualClock>,
        backend: Arc<MemoryBackend>,
        sink: Arc<CaptureSink>,
    }

    fn test_config() -> JourneyConfig {
        JourneyConfig {
            foreground_grace_ms: 10,
            persist_retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    async fn harness_with(campaigns: Vec<Value>, config: JourneyConfig, backend: Arc<MemoryBackend>) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let profile = Profile {
            campaigns,
            ..Default::default()
        };
        let ports = MemoryPorts::new("user-1", profile, clock.clone());
        let sink = capture_sink();
        let orchestrator = JourneyOrchestrator::new(config, ports.ports(), backend.clone())
            .with_clock(clock.clone())
            .with_event_sink(sink.clone());
        orchestrator.initialize().await.unwrap();
        Harness {
            orchestrator,
            ports,
            clock,
            backend,
            sink,
        }
    }

    async fn harness(campaigns: Vec<Value>) -> Harness {
        harness_with(campaigns, test_config(), Arc::new(MemoryBackend::new())).await
    }

    fn campaign_json(id: &str, reentry: Value, nodes: Value) -> Value {
        json!({
            "id": id,
            "name": id,
            "version": 1,
            "trigger": {"type": "event", "event_name": "app_open"},
            "entry_node_id": "start",
            "nodes": nodes,
            "reentry": reentry
        })
    }

    /// A campaign whose journeys park forever on a false condition.
    fn parking_campaign(id: &str, reentry: Value) -> Campaign {
        serde_json::from_value(campaign_json(
            id,
            reentry,
            json!([
                {"id": "start", "type": "wait_until", "paths": [
                    {"condition": {"version": 1, "expr": {"op": "literal", "value": false}}, "next": "end"}
                ]},
                {"id": "end", "type": "exit"}
            ]),
        ))
        .unwrap()
    }

    fn exiting_campaign(id: &str, reentry: Value) -> Campaign {
        serde_json::from_value(campaign_json(
            id,
            reentry,
            json!([{"id": "start", "type": "exit", "reason": "done"}]),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_calls_before_initialize_fail() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ports = MemoryPorts::new("user-1", Profile::default(), clock);
        let orchestrator =
            JourneyOrchestrator::new(test_config(), ports.ports(), Arc::new(MemoryBackend::new()));
        let campaign = exiting_campaign("c", json!({"type": "once"}));
        assert!(matches!(
            orchestrator.start_journey(&campaign, "user-1", None).await,
            Err(JourneyError::NotRunning)
        ));
        assert!(orchestrator.get_active_journeys("user-1").is_empty());
    }

    #[tokio::test]
    async fn test_once_policy_blocks_after_completion() {
        let h = harness(vec![]).await;
        let campaign = exiting_campaign("welcome", json!({"type": "once"}));

        let first = h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap();
        assert!(first.is_some());
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.orchestrator.completion_ledger("user-1", "welcome").len(), 1);

        let second = h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap();
        assert!(second.is_none());
        assert_eq!(h.sink.count_type(EventType::JourneyRejected), 1);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_every_rematch_requires_previous_to_finish() {
        let h = harness(vec![]).await;
        let campaign = parking_campaign("nudge", json!({"type": "every_rematch"}));

        assert!(h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap().is_some());
        h.orchestrator.idle().await.unwrap();
        assert!(h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap().is_none());
        assert_eq!(h.orchestrator.get_active_journeys("user-1").len(), 1);

        let concurrent = parking_campaign("overlap", json!({"type": "concurrent"}));
        h.orchestrator.start_journey(&concurrent, "user-1", None).await.unwrap();
        h.orchestrator.start_journey(&concurrent, "user-1", None).await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.orchestrator.get_active_journeys("user-1").len(), 3);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cooldown_policy() {
        let h = harness(vec![]).await;
        let campaign = exiting_campaign("promo", json!({"type": "cooldown", "seconds": 3600}));

        assert!(h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap().is_some());
        h.orchestrator.idle().await.unwrap();
        h.clock.advance(Duration::minutes(30));
        assert!(h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap().is_none());
        h.clock.advance(Duration::minutes(31));
        assert!(h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap().is_some());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_cap_and_disabled() {
        let config = JourneyConfig {
            max_active_journeys: 1,
            ..test_config()
        };
        let h = harness_with(vec![], config, Arc::new(MemoryBackend::new())).await;
        let a = parking_campaign("a", json!({"type": "once"}));
        let b = parking_campaign("b", json!({"type": "once"}));
        assert!(h.orchestrator.start_journey(&a, "user-1", None).await.unwrap().is_some());
        assert!(h.orchestrator.start_journey(&b, "user-1", None).await.unwrap().is_none());
        h.orchestrator.shutdown().await;

        let disabled = JourneyConfig {
            enabled: false,
            ..test_config()
        };
        let h = harness_with(vec![], disabled, Arc::new(MemoryBackend::new())).await;
        assert!(h.orchestrator.start_journey(&a, "user-1", None).await.unwrap().is_none());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_campaign_is_rejected() {
        let h = harness(vec![]).await;
        let mut campaign = exiting_campaign("broken", json!({"type": "once"}));
        campaign.entry_node_id = "missing".to_string();
        assert!(matches!(
            h.orchestrator.start_journey(&campaign, "user-1", None).await,
            Err(JourneyError::Configuration(_))
        ));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_trigger_with_condition() {
        let mut gated = campaign_json(
            "gated",
            json!({"type": "once"}),
            json!([{"id": "start", "type": "call_host", "name": "welcome"}]),
        );
        gated["trigger"] = json!({
            "type": "event",
            "event_name": "app_open",
            "condition": {"version": 1, "expr": {
                "op": "compare", "operator": "equals",
                "left": {"op": "user_property", "key": "event.source"},
                "right": {"op": "literal", "value": "push"}
            }}
        });
        let h = harness(vec![gated]).await;
        let now = h.clock.now();

        let mut organic = Map::new();
        organic.insert("source".to_string(), json!("organic"));
        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", now).with_properties(organic))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        assert!(h.ports.host.calls().is_empty());

        let mut push = Map::new();
        push.insert("source".to_string(), json!("push"));
        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", now).with_properties(push))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.ports.host.calls().len(), 1);
        assert_eq!(h.orchestrator.completion_ledger("user-1", "gated").len(), 1);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_goal_met_completes_journey() {
        let mut raw = campaign_json(
            "trial",
            json!({"type": "once"}),
            json!([
                {"id": "start", "type": "wait_until", "paths": [
                    {"condition": {"version": 1, "expr": {"op": "literal", "value": false}}, "next": "end"}
                ]},
                {"id": "end", "type": "exit"}
            ]),
        );
        raw["goal"] = json!({"kind": "event", "event_name": "purchase", "window_secs": 86400});
        let h = harness(vec![raw]).await;
        let now = h.clock.now();

        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", now))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.orchestrator.get_active_journeys("user-1").len(), 1);

        let bought = now + Duration::hours(1);
        h.clock.set(bought);
        h.ports.events.record("purchase", "user-1", bought);
        h.orchestrator
            .handle_event(TrackedEvent::new("purchase", "user-1", bought))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();

        assert!(h.orchestrator.get_active_journeys("user-1").is_empty());
        let ledger = h.orchestrator.completion_ledger("user-1", "trial");
        assert_eq!(ledger[0].exit_reason, ExitReason::GoalMet);
        assert_eq!(h.sink.count_type(EventType::JourneyGoalMet), 1);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_step_limit_errors_looping_journey() {
        let config = JourneyConfig {
            max_steps_per_drive: 5,
            ..test_config()
        };
        let h = harness_with(vec![], config, Arc::new(MemoryBackend::new())).await;
        let campaign: Campaign = serde_json::from_value(campaign_json(
            "loop",
            json!({"type": "once"}),
            json!([
                {"id": "start", "type": "call_host", "name": "ping", "next": ["again"]},
                {"id": "again", "type": "call_host", "name": "pong", "next": ["start"]}
            ]),
        ))
        .unwrap();

        h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap();
        h.orchestrator.idle().await.unwrap();

        let ledger = h.orchestrator.completion_ledger("user-1", "loop");
        assert_eq!(ledger.len(), 1);
        assert!(matches!(ledger[0].exit_reason, ExitReason::Errored { .. }));
        assert_eq!(h.ports.host.calls().len(), 6);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_as_errored() {
        let backend = Arc::new(MemoryBackend::new());
        let h = harness_with(vec![], test_config(), backend.clone()).await;
        let campaign = parking_campaign("flaky", json!({"type": "once"}));

        h.backend.fail_next_writes(3);
        let result = h.orchestrator.start_journey(&campaign, "user-1", None).await;
        assert!(matches!(result, Err(JourneyError::Persistence(_))));
        assert!(h.orchestrator.get_active_journeys("user-1").is_empty());

        let snapshot = backend.snapshot();
        assert!(snapshot.journeys.is_empty());
        assert!(matches!(
            snapshot.ledger[0].exit_reason,
            ExitReason::Errored { .. }
        ));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_withdrawn_campaign_exits_on_refresh() {
        let raw = serde_json::to_value(parking_campaign("seasonal", json!({"type": "once"}))).unwrap();
        let h = harness(vec![raw]).await;
        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", h.clock.now()))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.orchestrator.get_active_journeys("user-1").len(), 1);

        h.ports.profile.replace(Profile::default());
        h.orchestrator.refresh_profile().await.unwrap();

        assert!(h.orchestrator.get_active_journeys("user-1").is_empty());
        assert_eq!(
            h.orchestrator.completion_ledger("user-1", "seasonal")[0].exit_reason,
            ExitReason::CampaignUnavailable
        );
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_segment_trigger_starts_on_segment_change() {
        let mut raw = campaign_json(
            "vip",
            json!({"type": "once"}),
            json!([{"id": "start", "type": "call_host", "name": "vip_welcome"}]),
        );
        raw["trigger"] = json!({
            "type": "segment",
            "condition": {"version": 1, "expr": {"op": "in_segment", "segment_id": "vip"}}
        });
        let h = harness(vec![raw]).await;

        h.orchestrator.segments_changed().await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert!(h.ports.host.calls().is_empty());

        h.ports.segments.join("vip");
        h.orchestrator.segments_changed().await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.ports.host.calls()[0].0, "vip_welcome");
        assert_eq!(h.orchestrator.completion_ledger("user-1", "vip").len(), 1);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_content_invalidation_refreshes_referenced_flows() {
        let raw = campaign_json(
            "paywall",
            json!({"type": "once"}),
            json!([
                {"id": "start", "type": "show_content", "flow_id": "flow-1", "next": ["end"]},
                {"id": "end", "type": "exit"}
            ]),
        );
        let h = harness(vec![raw]).await;
        h.orchestrator.did_enter_background().await.unwrap();
        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", h.clock.now()))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.orchestrator.get_active_journeys("user-1").len(), 1);

        h.ports.profile.replace(Profile::default());
        h.orchestrator.content_invalidated("flow-other").await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.orchestrator.get_active_journeys("user-1").len(), 1);

        h.orchestrator.content_invalidated("flow-1").await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert!(h.orchestrator.get_active_journeys("user-1").is_empty());
        assert_eq!(
            h.orchestrator.completion_ledger("user-1", "paywall")[0].exit_reason,
            ExitReason::CampaignUnavailable
        );
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_presentation_waits_for_foreground_grace() {
        let raw = campaign_json(
            "paywall",
            json!({"type": "once"}),
            json!([
                {"id": "start", "type": "show_content", "flow_id": "flow-1", "next": ["end"]},
                {"id": "end", "type": "exit"}
            ]),
        );
        let h = harness(vec![raw]).await;

        h.orchestrator.did_enter_background().await.unwrap();
        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", h.clock.now()))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        let parked = h.orchestrator.get_active_journeys("user-1");
        assert_eq!(parked[0].status, JourneyStatus::Paused);
        assert!(h.ports.presenter.presented().is_empty());

        h.orchestrator.will_enter_foreground().await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert!(h.ports.presenter.presented().is_empty());

        h.orchestrator.did_become_active().await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.ports.presenter.presented(), vec!["flow-1".to_string()]);
        assert!(h.orchestrator.get_active_journeys("user-1").is_empty());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_resumes_persisted_journeys() {
        let backend = Arc::new(MemoryBackend::new());
        let raw = campaign_json(
            "restore",
            json!({"type": "once"}),
            json!([
                {"id": "start", "type": "wait_until", "paths": [
                    {"max_time_secs": 60, "next": "done"}
                ]},
                {"id": "done", "type": "call_host", "name": "resumed"}
            ]),
        );

        let h = harness_with(vec![raw.clone()], test_config(), backend.clone()).await;
        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", h.clock.now()))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        let parked = h.orchestrator.get_active_journeys("user-1");
        assert_eq!(parked[0].status, JourneyStatus::Paused);
        let started = h.clock.now();
        h.orchestrator.shutdown().await;

        let clock = Arc::new(ManualClock::new(started + Duration::seconds(90)));
        let profile = Profile {
            campaigns: vec![raw],
            ..Default::default()
        };
        let ports = MemoryPorts::new("user-1", profile, clock.clone());
        let orchestrator = JourneyOrchestrator::new(test_config(), ports.ports(), backend.clone())
            .with_clock(clock);
        orchestrator.initialize().await.unwrap();
        orchestrator.idle().await.unwrap();

        assert!(orchestrator.get_active_journeys("user-1").is_empty());
        assert_eq!(ports.host.calls()[0].0, "resumed");
        assert_eq!(orchestrator.completion_ledger("user-1", "restore").len(), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_cooldown_is_rejected_without_stopping_worker() {
        let h = harness(vec![]).await;
        let mut campaign = exiting_campaign("forever", json!({"type": "once"}));
        campaign.reentry = ReentryPolicy::Cooldown {
            seconds: 10_000_000_000_000_000,
        };
        assert!(matches!(
            h.orchestrator.start_journey(&campaign, "user-1", None).await,
            Err(JourneyError::Configuration(_))
        ));

        let longest = exiting_campaign(
            "century",
            json!({"type": "cooldown", "seconds": clock::MAX_SPAN_SECS}),
        );
        assert!(h.orchestrator.start_journey(&longest, "user-1", None).await.unwrap().is_some());
        h.orchestrator.idle().await.unwrap();
        h.clock.advance(Duration::days(365));
        assert!(h.orchestrator.start_journey(&longest, "user-1", None).await.unwrap().is_none());

        let other = exiting_campaign("other", json!({"type": "once"}));
        assert!(h.orchestrator.start_journey(&other, "user-1", None).await.unwrap().is_some());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_goal_already_met_at_start_completes_journey() {
        let h = harness(vec![]).await;
        h.ports.segments.join("subscribers");
        let mut raw = serde_json::to_value(parking_campaign("upsell", json!({"type": "once"}))).unwrap();
        raw["goal"] = json!({"kind": "segment_enter", "segment_id": "subscribers", "window_secs": 3600});
        let campaign: Campaign = serde_json::from_value(raw).unwrap();

        assert!(h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap().is_some());
        h.orchestrator.idle().await.unwrap();

        assert!(h.orchestrator.get_active_journeys("user-1").is_empty());
        let ledger = h.orchestrator.completion_ledger("user-1", "upsell");
        assert_eq!(ledger[0].exit_reason, ExitReason::GoalMet);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_segment_conversion_latches_after_leaving() {
        let h = harness(vec![]).await;
        let mut raw = serde_json::to_value(parking_campaign("member", json!({"type": "once"}))).unwrap();
        raw["goal"] = json!({"kind": "segment_enter", "segment_id": "subscribers", "window_secs": 3600});
        raw["exit_policy"] = json!("never");
        let campaign: Campaign = serde_json::from_value(raw).unwrap();

        h.orchestrator.start_journey(&campaign, "user-1", None).await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert!(h.orchestrator.get_active_journeys("user-1")[0].converted_at().is_none());

        h.ports.segments.join("subscribers");
        h.orchestrator.segments_changed().await.unwrap();
        h.orchestrator.idle().await.unwrap();
        let converted = h.orchestrator.get_active_journeys("user-1")[0].converted_at();
        assert!(converted.is_some());

        h.clock.advance(Duration::hours(2));
        h.ports.segments.leave("subscribers");
        h.orchestrator.segments_changed().await.unwrap();
        h.orchestrator.idle().await.unwrap();

        let active = h.orchestrator.get_active_journeys("user-1");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].converted_at(), converted);
        assert_eq!(h.sink.count_type(EventType::JourneyGoalMet), 1);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_completion_is_finished_on_restart() {
        let backend = Arc::new(MemoryBackend::new());
        let raw = serde_json::to_value(parking_campaign("seasonal", json!({"type": "once"}))).unwrap();
        let h = harness_with(vec![raw], test_config(), backend.clone()).await;
        h.orchestrator
            .handle_event(TrackedEvent::new("app_open", "user-1", h.clock.now()))
            .await
            .unwrap();
        h.orchestrator.idle().await.unwrap();
        assert_eq!(h.orchestrator.get_active_journeys("user-1").len(), 1);

        h.ports.profile.replace(Profile::default());
        backend.fail_next_writes(3);
        h.orchestrator.refresh_profile().await.unwrap();
        h.orchestrator.idle().await.unwrap();
        assert!(h.orchestrator.get_active_journeys("user-1").is_empty());
        h.orchestrator.shutdown().await;

        let snapshot = backend.snapshot();
        assert!(snapshot.ledger.is_empty());
        assert!(snapshot.journeys.iter().all(|j| j.is_terminal()));

        let ports = MemoryPorts::new("user-1", Profile::default(), h.clock.clone());
        let orchestrator = JourneyOrchestrator::new(test_config(), ports.ports(), backend.clone())
            .with_clock(h.clock.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.idle().await.unwrap();

        assert!(orchestrator.get_active_journeys("user-1").is_empty());
        let ledger = orchestrator.completion_ledger("user-1", "seasonal");
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].exit_reason, ExitReason::CampaignUnavailable);
        assert!(backend.snapshot().journeys.is_empty());
        orchestrator.shutdown().await;
    }
}
