//! In-process implementations of every port. The runner binary wires these
//! together; tests script them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::info;

use crate::clock::Clock;
use crate::error::{PortError, PortResult};
use crate::expression::FeatureAccess;
use crate::journey::Journey;
use crate::ports::{
    EventPort, FeaturePort, HostPort, IdentityPort, PresentationOutcome, PresentationPort, Ports,
    Profile, ProfilePort, SegmentPort,
};

/// A stored event occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub name: String,
    pub distinct_id: String,
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Event log for a single device. `track` stamps events with the clock and
/// the identity's distinct id.
pub struct InMemoryEvents {
    clock: Arc<dyn Clock>,
    distinct_id: String,
    events: RwLock<Vec<StoredEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryEvents {
    pub fn new(clock: Arc<dyn Clock>, distinct_id: impl Into<String>) -> Self {
        Self {
            clock,
            distinct_id: distinct_id.into(),
            events: RwLock::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Records an occurrence at an explicit time.
    pub fn record(&self, name: &str, distinct_id: &str, timestamp: DateTime<Utc>) {
        self.events.write().push(StoredEvent {
            name: name.to_string(),
            distinct_id: distinct_id.to_string(),
            properties: Map::new(),
            timestamp,
        });
    }

    pub fn tracked(&self, name: &str) -> Vec<StoredEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// Makes every lookup fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn matching(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<Vec<DateTime<Utc>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("event store offline".to_string()));
        }
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.name == name && e.distinct_id == distinct_id)
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .filter(|e| until.map_or(true, |u| e.timestamp < u))
            .map(|e| e.timestamp)
            .collect())
    }
}

#[async_trait]
impl EventPort for InMemoryEvents {
    async fn track(&self, name: &str, properties: Map<String, Value>) -> PortResult<()> {
        self.events.write().push(StoredEvent {
            name: name.to_string(),
            distinct_id: self.distinct_id.clone(),
            properties,
            timestamp: self.clock.now(),
        });
        Ok(())
    }

    async fn last_event_time(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<Option<DateTime<Utc>>> {
        Ok(self.matching(name, distinct_id, since, until)?.into_iter().max())
    }

    async fn first_event_time(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<Option<DateTime<Utc>>> {
        Ok(self.matching(name, distinct_id, since, until)?.into_iter().min())
    }

    async fn count_events(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<u64> {
        Ok(self.matching(name, distinct_id, since, until)?.len() as u64)
    }
}

#[derive(Default)]
pub struct StaticSegments {
    members: RwLock<HashSet<String>>,
}

impl StaticSegments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, segment_id: &str) {
        self.members.write().insert(segment_id.to_string());
    }

    pub fn leave(&self, segment_id: &str) {
        self.members.write().remove(segment_id);
    }
}

#[async_trait]
impl SegmentPort for StaticSegments {
    async fn is_in_segment(&self, segment_id: &str) -> PortResult<bool> {
        Ok(self.members.read().contains(segment_id))
    }
}

pub struct InMemoryIdentity {
    distinct_id: String,
    properties: RwLock<Map<String, Value>>,
}

impl InMemoryIdentity {
    pub fn new(distinct_id: impl Into<String>) -> Self {
        Self {
            distinct_id: distinct_id.into(),
            properties: RwLock::new(Map::new()),
        }
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties.read().get(key).cloned()
    }
}

#[async_trait]
impl IdentityPort for InMemoryIdentity {
    fn distinct_id(&self) -> String {
        self.distinct_id.clone()
    }

    async fn user_property(&self, key: &str) -> PortResult<Option<Value>> {
        Ok(self.property(key))
    }

    async fn set_user_property(&self, key: &str, value: Value) -> PortResult<()> {
        self.properties.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticFeatures {
    access: RwLock<HashMap<String, FeatureAccess>>,
}

impl StaticFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, feature_id: &str, access: FeatureAccess) {
        self.access.write().insert(feature_id.to_string(), access);
    }
}

#[async_trait]
impl FeaturePort for StaticFeatures {
    async fn cached_access(&self, feature_id: &str, _entity_id: Option<&str>) -> PortResult<FeatureAccess> {
        Ok(self.access.read().get(feature_id).copied().unwrap_or_default())
    }
}

/// Profile source returning whatever was last set.
#[derive(Default)]
pub struct StaticProfile {
    profile: RwLock<Profile>,
}

impl StaticProfile {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile: RwLock::new(profile),
        }
    }

    pub fn replace(&self, profile: Profile) {
        *self.profile.write() = profile;
    }
}

#[async_trait]
impl ProfilePort for StaticProfile {
    async fn fetch_profile(&self, _distinct_id: &str) -> PortResult<Profile> {
        Ok(self.profile.read().clone())
    }
}

/// Presenter that answers from a queue of scripted results, falling back to
/// `Dismissed`.
#[derive(Default)]
pub struct ScriptedPresenter {
    script: Mutex<VecDeque<PortResult<PresentationOutcome>>>,
    presented: Mutex<Vec<String>>,
    dismissals: Mutex<u32>,
    presenting: AtomicBool,
}

impl ScriptedPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: PortResult<PresentationOutcome>) {
        self.script.lock().push_back(result);
    }

    /// Flow ids presented so far, in order.
    pub fn presented(&self) -> Vec<String> {
        self.presented.lock().clone()
    }

    pub fn dismissals(&self) -> u32 {
        *self.dismissals.lock()
    }

    pub fn set_presenting(&self, presenting: bool) {
        self.presenting.store(presenting, Ordering::SeqCst);
    }
}

#[async_trait]
impl PresentationPort for ScriptedPresenter {
    async fn present_flow(&self, flow_id: &str, journey: &Journey) -> PortResult<PresentationOutcome> {
        let result = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Ok(PresentationOutcome::Dismissed));
        if result.is_ok() {
            info!(flow_id, journey_id = %journey.id, "Presenting flow");
            self.presented.lock().push(flow_id.to_string());
        }
        result
    }

    async fn dismiss_current(&self) {
        *self.dismissals.lock() += 1;
    }

    fn is_presenting(&self) -> bool {
        self.presenting.load(Ordering::SeqCst)
    }
}

/// Host that records every notification.
#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

impl HostPort for RecordingHost {
    fn notify(&self, name: &str, payload: &Value, journey: &Journey) {
        info!(name, journey_id = %journey.id, "Host notified");
        self.calls.lock().push((name.to_string(), payload.clone()));
    }
}

/// Concrete handles to a full in-memory port set.
#[derive(Clone)]
pub struct MemoryPorts {
    pub presenter: Arc<ScriptedPresenter>,
    pub profile: Arc<StaticProfile>,
    pub events: Arc<InMemoryEvents>,
    pub segments: Arc<StaticSegments>,
    pub identity: Arc<InMemoryIdentity>,
    pub features: Arc<StaticFeatures>,
    pub host: Arc<RecordingHost>,
}

impl MemoryPorts {
    /// Builds the port set for `distinct_id`, seeding segments, features, and
    /// user properties from `profile`.
    pub fn new(distinct_id: &str, profile: Profile, clock: Arc<dyn Clock>) -> Self {
        let segments = Arc::new(StaticSegments::new());
        for segment in &profile.segments {
            segments.join(segment);
        }
        let features = Arc::new(StaticFeatures::new());
        for (id, access) in &profile.features {
            features.set(id, *access);
        }
        let identity = Arc::new(InMemoryIdentity::new(distinct_id));
        identity
            .properties
            .write()
            .extend(profile.user_properties.clone());

        Self {
            presenter: Arc::new(ScriptedPresenter::new()),
            profile: Arc::new(StaticProfile::new(profile)),
            events: Arc::new(InMemoryEvents::new(clock, distinct_id)),
            segments,
            identity,
            features,
            host: Arc::new(RecordingHost::new()),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            presentation: self.presenter.clone(),
            profile: self.profile.clone(),
            events: self.events.clone(),
            segments: self.segments.clone(),
            identity: self.identity.clone(),
            features: self.features.clone(),
            host: self.host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    #[tokio::test]
    async fn test_event_window_is_half_open() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let events = InMemoryEvents::new(clock.clone(), "user-1");
        events.record("purchase", "user-1", start);
        events.record("purchase", "user-1", start + Duration::hours(1));
        events.record("purchase", "user-2", start);

        let until = start + Duration::hours(1);
        assert_eq!(
            events
                .count_events("purchase", "user-1", Some(start), Some(until))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            events
                .last_event_time("purchase", "user-1", None, None)
                .await
                .unwrap(),
            Some(until)
        );
        assert_eq!(
            events
                .first_event_time("purchase", "user-1", None, None)
                .await
                .unwrap(),
            Some(start)
        );
        assert!(events.has_event("purchase", "user-1", None, None).await.unwrap());

        clock.advance(Duration::minutes(5));
        events.track("open", Map::new()).await.unwrap();
        assert_eq!(events.tracked("open")[0].timestamp, start + Duration::minutes(5));

        events.set_unavailable(true);
        assert!(events.count_events("open", "user-1", None, None).await.is_err());
    }

    #[test]
    fn test_memory_ports_seed_from_profile() {
        let mut profile = Profile {
            segments: vec!["vip".to_string()],
            ..Default::default()
        };
        profile
            .user_properties
            .insert("plan".to_string(), Value::from("free"));
        let ports = MemoryPorts::new("user-1", profile, Arc::new(ManualClock::new(Utc::now())));
        assert_eq!(ports.identity.property("plan"), Some(Value::from("free")));
        assert_eq!(ports.identity.distinct_id(), "user-1");
    }
}
