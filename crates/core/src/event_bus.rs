//! Analytics event bus: trait for emitting journey analytics from the engine.
//!
//! The orchestrator accepts an `Arc<dyn EventSink>`; emission is best-effort
//! and never fails the journey the event originates from.

use crate::types::{AnalyticsEvent, EventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting analytics events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// No-op sink for hosts that don't collect journey analytics.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating `AnalyticsEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    journey_id: impl Into<String>,
    campaign_id: Option<String>,
    distinct_id: Option<String>,
) -> AnalyticsEvent {
    AnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        journey_id: journey_id.into(),
        campaign_id,
        distinct_id,
        node_id: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

impl AnalyticsEvent {
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Convenience: create a no-op event bus.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            EventType::JourneyEntered,
            "journey-1",
            Some("camp-1".into()),
            Some("user-1".into()),
        ));
        sink.emit(
            make_event(EventType::JourneyStepCompleted, "journey-1", None, None)
                .with_node("show-paywall"),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::JourneyEntered), 1);
        assert_eq!(sink.count_type(EventType::JourneyStepCompleted), 1);

        let events = sink.events();
        assert_eq!(events[0].campaign_id, Some("camp-1".into()));
        assert_eq!(events[1].node_id, Some("show-paywall".into()));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EventType::JourneyExited, "journey-1", None, None));
    }

    #[test]
    fn test_event_type_labels_are_snake_case() {
        let json = serde_json::to_string(&EventType::JourneyGoalMet).unwrap();
        assert_eq!(json, format!("\"{}\"", EventType::JourneyGoalMet.as_str()));
    }
}
