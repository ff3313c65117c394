//! Contracts the engine needs from its host: presentation, profile, events,
//! segments, identity, features, and host notifications.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{JourneyError, PortResult};
use crate::expression::{DataAdapters, FeatureAccess};
use crate::journey::Journey;
use crate::model::Campaign;

/// How a presented flow ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PresentationOutcome {
    Dismissed,
    Purchased {
        product_id: String,
        #[serde(default)]
        transaction_id: Option<String>,
    },
    Restored,
    TimedOut,
    Errored {
        message: String,
    },
}

#[async_trait]
pub trait PresentationPort: Send + Sync {
    /// Presents `flow_id` and resolves once it reaches a terminal outcome.
    /// Returns `PortError::NoSurface` when nothing can be shown right now.
    async fn present_flow(&self, flow_id: &str, journey: &Journey) -> PortResult<PresentationOutcome>;

    async fn dismiss_current(&self);

    fn is_presenting(&self) -> bool;

    /// Called before timers are re-armed on foregrounding.
    fn will_enter_foreground(&self) {}

    /// Called when the app is active; presentation resumes after the grace
    /// period.
    fn did_become_active(&self) {}
}

/// Everything the host knows about the current user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Raw campaign definitions; each is parsed and validated independently.
    #[serde(default)]
    pub campaigns: Vec<Value>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub features: std::collections::HashMap<String, FeatureAccess>,
    #[serde(default)]
    pub user_properties: Map<String, Value>,
}

impl Profile {
    /// Parses and validates every campaign. Bad campaigns are returned as
    /// errors alongside the good ones.
    pub fn parse_campaigns(&self) -> (Vec<Campaign>, Vec<JourneyError>) {
        let mut campaigns = Vec::new();
        let mut errors = Vec::new();
        for raw in &self.campaigns {
            match serde_json::from_value::<Campaign>(raw.clone()) {
                Ok(campaign) => match campaign.validate() {
                    Ok(()) => campaigns.push(campaign),
                    Err(e) => errors.push(e),
                },
                Err(e) => errors.push(JourneyError::Configuration(format!(
                    "malformed campaign {}: {e}",
                    raw.get("id").and_then(Value::as_str).unwrap_or("<unknown>")
                ))),
            }
        }
        (campaigns, errors)
    }
}

#[async_trait]
pub trait ProfilePort: Send + Sync {
    async fn fetch_profile(&self, distinct_id: &str) -> PortResult<Profile>;
}

#[async_trait]
pub trait EventPort: Send + Sync {
    async fn track(&self, name: &str, properties: Map<String, Value>) -> PortResult<()>;

    /// Latest occurrence in `[since, until)`.
    async fn last_event_time(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<Option<DateTime<Utc>>>;

    /// Earliest occurrence in `[since, until)`.
    async fn first_event_time(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<Option<DateTime<Utc>>>;

    async fn has_event(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<bool> {
        Ok(self
            .last_event_time(name, distinct_id, since, until)
            .await?
            .is_some())
    }

    async fn count_events(
        &self,
        name: &str,
        distinct_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> PortResult<u64>;
}

#[async_trait]
pub trait SegmentPort: Send + Sync {
    async fn is_in_segment(&self, segment_id: &str) -> PortResult<bool>;
}

#[async_trait]
pub trait IdentityPort: Send + Sync {
    fn distinct_id(&self) -> String;

    async fn user_property(&self, key: &str) -> PortResult<Option<Value>>;

    async fn set_user_property(&self, key: &str, value: Value) -> PortResult<()>;
}

#[async_trait]
pub trait FeaturePort: Send + Sync {
    async fn cached_access(&self, feature_id: &str, entity_id: Option<&str>) -> PortResult<FeatureAccess>;
}

/// Fire-and-forget notifications to the embedding application.
pub trait HostPort: Send + Sync {
    fn notify(&self, name: &str, payload: &Value, journey: &Journey);
}

/// The full set of collaborators, injected at construction.
#[derive(Clone)]
pub struct Ports {
    pub presentation: Arc<dyn PresentationPort>,
    pub profile: Arc<dyn ProfilePort>,
    pub events: Arc<dyn EventPort>,
    pub segments: Arc<dyn SegmentPort>,
    pub identity: Arc<dyn IdentityPort>,
    pub features: Arc<dyn FeaturePort>,
    pub host: Arc<dyn HostPort>,
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}

/// Expression data adapters backed by the ports for one user at one instant.
/// Port failures degrade to "no data".
pub struct PortAdapters<'a> {
    ports: &'a Ports,
    distinct_id: &'a str,
    now: DateTime<Utc>,
    event_properties: Option<&'a Map<String, Value>>,
}

impl<'a> PortAdapters<'a> {
    pub fn new(ports: &'a Ports, distinct_id: &'a str, now: DateTime<Utc>) -> Self {
        Self {
            ports,
            distinct_id,
            now,
            event_properties: None,
        }
    }

    /// Exposes the triggering event's properties as `event.<key>`.
    pub fn with_event_properties(mut self, properties: &'a Map<String, Value>) -> Self {
        self.event_properties = Some(properties);
        self
    }
}

#[async_trait]
impl<'a> DataAdapters for PortAdapters<'a> {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    async fn user_property(&self, key: &str) -> Option<Value> {
        if let (Some(props), Some(event_key)) = (self.event_properties, key.strip_prefix("event.")) {
            return props.get(event_key).cloned();
        }
        match self.ports.identity.user_property(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "User property unavailable");
                None
            }
        }
    }

    async fn event_last_time(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self
            .ports
            .events
            .last_event_time(name, self.distinct_id, since, until)
            .await
        {
            Ok(at) => at,
            Err(e) => {
                warn!(event = name, error = %e, "Event lookup failed");
                None
            }
        }
    }

    async fn event_count(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> u64 {
        self.ports
            .events
            .count_events(name, self.distinct_id, since, until)
            .await
            .unwrap_or_else(|e| {
                warn!(event = name, error = %e, "Event count failed");
                0
            })
    }

    async fn in_segment(&self, segment_id: &str) -> bool {
        self.ports
            .segments
            .is_in_segment(segment_id)
            .await
            .unwrap_or_else(|e| {
                debug!(segment_id, error = %e, "Segment lookup failed");
                false
            })
    }

    async fn feature_access(&self, feature_id: &str, entity_id: Option<&str>) -> FeatureAccess {
        self.ports
            .features
            .cached_access(feature_id, entity_id)
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_campaigns_skips_bad_ones() {
        let profile = Profile {
            campaigns: vec![
                serde_json::json!({
                    "id": "good",
                    "name": "Good",
                    "version": 1,
                    "trigger": {"type": "event", "event_name": "app_open"},
                    "entry_node_id": "end",
                    "nodes": [{"id": "end", "type": "exit"}]
                }),
                serde_json::json!({"id": "broken", "name": "Broken"}),
                serde_json::json!({
                    "id": "dangling",
                    "name": "Dangling",
                    "version": 1,
                    "trigger": {"type": "event", "event_name": "app_open"},
                    "entry_node_id": "start",
                    "nodes": [{"id": "start", "type": "call_host", "name": "x", "next": ["gone"]}]
                }),
            ],
            ..Default::default()
        };

        let (campaigns, errors) = profile.parse_campaigns();
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].id, "good");
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|e| matches!(e, JourneyError::Configuration(_))));
        assert!(errors[0].to_string().contains("broken"));
    }

    #[test]
    fn test_outcome_json() {
        let outcome: PresentationOutcome = serde_json::from_value(serde_json::json!({
            "type": "purchased",
            "product_id": "pro_monthly"
        }))
        .unwrap();
        assert_eq!(
            outcome,
            PresentationOutcome::Purchased {
                product_id: "pro_monthly".to_string(),
                transaction_id: None
            }
        );
    }
}
