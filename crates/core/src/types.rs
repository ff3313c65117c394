use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytics event emitted by the journey engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub journey_id: String,
    pub campaign_id: Option<String>,
    pub distinct_id: Option<String>,
    pub node_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JourneyEntered,
    JourneyStepCompleted,
    JourneyStepSkipped,
    JourneyParked,
    JourneyGoalMet,
    JourneyCompleted,
    JourneyExited,
    JourneyError,
    JourneyRejected,
}

impl EventType {
    /// Stable label used as a metrics tag and in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JourneyEntered => "journey_entered",
            EventType::JourneyStepCompleted => "journey_step_completed",
            EventType::JourneyStepSkipped => "journey_step_skipped",
            EventType::JourneyParked => "journey_parked",
            EventType::JourneyGoalMet => "journey_goal_met",
            EventType::JourneyCompleted => "journey_completed",
            EventType::JourneyExited => "journey_exited",
            EventType::JourneyError => "journey_error",
            EventType::JourneyRejected => "journey_rejected",
        }
    }
}
