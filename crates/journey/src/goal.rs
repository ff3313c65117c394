//! Conversion goal checks against a journey's frozen goal snapshot.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::expression::ExpressionEvaluator;
use crate::journey::Journey;
use crate::model::{GoalConfig, GoalKind};
use crate::ports::{PortAdapters, Ports};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoalOutcome {
    pub met: bool,
    /// When the goal was satisfied. For event goals this is the event's own
    /// timestamp, not the time of discovery.
    pub at: Option<DateTime<Utc>>,
}

impl GoalOutcome {
    pub const NOT_MET: GoalOutcome = GoalOutcome { met: false, at: None };

    fn met(at: DateTime<Utc>) -> Self {
        Self { met: true, at: Some(at) }
    }
}

#[derive(Debug, Clone)]
pub struct GoalEvaluator {
    ports: Ports,
    evaluator: ExpressionEvaluator,
}

impl GoalEvaluator {
    pub fn new(ports: Ports) -> Self {
        Self {
            ports,
            evaluator: ExpressionEvaluator::new(),
        }
    }

    /// Checks the journey's goal as of `now`. An already converted journey
    /// always reports its original conversion time without querying ports.
    pub async fn is_goal_met(&self, journey: &Journey, now: DateTime<Utc>) -> GoalOutcome {
        if let Some(at) = journey.converted_at() {
            return GoalOutcome::met(at);
        }
        let Some(goal) = journey.goal_snapshot() else {
            return GoalOutcome::NOT_MET;
        };

        let anchor = journey.conversion_anchor_at;
        // An end past the representable range is no end at all.
        let window_end = goal.window().and_then(|w| anchor.checked_add_signed(w));

        match goal.kind {
            GoalKind::Event => self.check_event(goal, journey, anchor, window_end).await,
            GoalKind::SegmentEnter | GoalKind::SegmentLeave | GoalKind::Attribute => {
                if window_end.is_some_and(|end| now >= end) {
                    debug!(journey_id = %journey.id, "Goal window closed");
                    return GoalOutcome::NOT_MET;
                }
                if self.check_live(goal, journey, now).await {
                    GoalOutcome::met(now)
                } else {
                    GoalOutcome::NOT_MET
                }
            }
        }
    }

    // Late discovery of an in-window event still counts. The earliest
    // in-window occurrence is used so the conversion time never moves later.
    async fn check_event(
        &self,
        goal: &GoalConfig,
        journey: &Journey,
        anchor: DateTime<Utc>,
        window_end: Option<DateTime<Utc>>,
    ) -> GoalOutcome {
        let Some(name) = goal.event_name.as_deref() else {
            return GoalOutcome::NOT_MET;
        };
        match self
            .ports
            .events
            .first_event_time(name, &journey.distinct_id, Some(anchor), window_end)
            .await
        {
            Ok(Some(at)) => GoalOutcome::met(at),
            Ok(None) => GoalOutcome::NOT_MET,
            Err(e) => {
                warn!(journey_id = %journey.id, event = name, error = %e, "Goal lookup failed, treating as not met");
                GoalOutcome::NOT_MET
            }
        }
    }

    async fn check_live(&self, goal: &GoalConfig, journey: &Journey, now: DateTime<Utc>) -> bool {
        match goal.kind {
            GoalKind::SegmentEnter | GoalKind::SegmentLeave => {
                let Some(segment_id) = goal.segment_id.as_deref() else {
                    return false;
                };
                match self.ports.segments.is_in_segment(segment_id).await {
                    Ok(member) => member == (goal.kind == GoalKind::SegmentEnter),
                    Err(e) => {
                        warn!(journey_id = %journey.id, segment_id, error = %e, "Segment lookup failed, treating as not met");
                        false
                    }
                }
            }
            GoalKind::Attribute => match &goal.expression {
                Some(expression) => {
                    let adapters = PortAdapters::new(&self.ports, &journey.distinct_id, now);
                    self.evaluator.evaluate_bool(expression, &adapters).await
                }
                None => false,
            },
            GoalKind::Event => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::expression::{ComparisonOperator, Envelope, Expr};
    use crate::memory::MemoryPorts;
    use crate::model::{Campaign, ConversionAnchor, ExitPolicy, ReentryPolicy, Trigger, WorkflowNode};
    use crate::model::NodeKind;
    use crate::ports::Profile;
    use chrono::Duration;
    use serde_json::Value;
    use std::sync::Arc;

    fn campaign(goal: GoalConfig) -> Campaign {
        Campaign {
            id: "camp-1".to_string(),
            name: "Trial".to_string(),
            version: 1,
            trigger: Trigger::Event {
                event_name: "trial_started".to_string(),
                condition: None,
            },
            entry_node_id: "end".to_string(),
            nodes: vec![WorkflowNode {
                id: "end".to_string(),
                next: vec![],
                kind: NodeKind::Exit { reason: None },
            }],
            goal: Some(goal),
            exit_policy: ExitPolicy::Never,
            conversion_anchor: ConversionAnchor::JourneyStart,
            reentry: ReentryPolicy::Once,
        }
    }

    fn goal(kind: GoalKind, window_secs: Option<i64>) -> GoalConfig {
        GoalConfig {
            kind,
            event_name: Some("purchase".to_string()),
            segment_id: Some("subscribers".to_string()),
            expression: None,
            window_secs,
        }
    }

    fn setup(goal: GoalConfig) -> (MemoryPorts, GoalEvaluator, Journey, DateTime<Utc>) {
        let t0 = Utc::now();
        let ports = MemoryPorts::new("user-1", Profile::default(), Arc::new(ManualClock::new(t0)));
        let evaluator = GoalEvaluator::new(ports.ports());
        let journey = Journey::start(&campaign(goal), "user-1", None, t0);
        (ports, evaluator, journey, t0)
    }

    #[tokio::test]
    async fn test_event_goal_uses_event_timestamp() {
        let (ports, evaluator, journey, t0) = setup(goal(GoalKind::Event, Some(21 * 86_400)));
        let hit = t0 + Duration::days(2);
        ports.events.record("purchase", "user-1", hit);

        let outcome = evaluator.is_goal_met(&journey, t0 + Duration::days(30)).await;
        assert_eq!(outcome, GoalOutcome::met(hit));
    }

    #[tokio::test]
    async fn test_event_goal_ignores_out_of_window() {
        let (ports, evaluator, journey, t0) = setup(goal(GoalKind::Event, Some(21 * 86_400)));
        ports.events.record("purchase", "user-1", t0 + Duration::days(22));
        ports.events.record("purchase", "user-1", t0 - Duration::seconds(1));

        let outcome = evaluator.is_goal_met(&journey, t0 + Duration::days(22)).await;
        assert_eq!(outcome, GoalOutcome::NOT_MET);
    }

    #[tokio::test]
    async fn test_converted_journey_short_circuits() {
        let (ports, evaluator, mut journey, t0) = setup(goal(GoalKind::Event, Some(60)));
        journey.record_conversion(t0 + Duration::seconds(5));
        ports.events.set_unavailable(true);

        for _ in 0..3 {
            let outcome = evaluator.is_goal_met(&journey, t0 + Duration::days(400)).await;
            assert_eq!(outcome, GoalOutcome::met(t0 + Duration::seconds(5)));
        }
    }

    #[tokio::test]
    async fn test_segment_goal_only_inside_window() {
        let (ports, evaluator, journey, t0) = setup(goal(GoalKind::SegmentEnter, Some(3600)));
        ports.segments.join("subscribers");

        let inside = t0 + Duration::minutes(30);
        assert_eq!(evaluator.is_goal_met(&journey, inside).await, GoalOutcome::met(inside));
        assert_eq!(
            evaluator.is_goal_met(&journey, t0 + Duration::hours(2)).await,
            GoalOutcome::NOT_MET
        );
    }

    #[tokio::test]
    async fn test_segment_leave_goal() {
        let (ports, evaluator, journey, t0) = setup(goal(GoalKind::SegmentLeave, None));
        ports.segments.join("subscribers");
        assert!(!evaluator.is_goal_met(&journey, t0).await.met);
        ports.segments.leave("subscribers");
        assert!(evaluator.is_goal_met(&journey, t0).await.met);
    }

    #[tokio::test]
    async fn test_attribute_goal() {
        let mut config = goal(GoalKind::Attribute, Some(0));
        config.expression = Some(Envelope::new(Expr::compare(
            ComparisonOperator::Equals,
            Expr::UserProperty {
                key: "plan".to_string(),
            },
            Expr::literal("pro"),
        )));
        let (ports, evaluator, journey, t0) = setup(config);
        let later = t0 + Duration::days(365);

        assert!(!evaluator.is_goal_met(&journey, later).await.met);
        use crate::ports::IdentityPort;
        ports
            .identity
            .set_user_property("plan", Value::from("pro"))
            .await
            .unwrap();
        assert_eq!(evaluator.is_goal_met(&journey, later).await, GoalOutcome::met(later));
    }

    #[tokio::test]
    async fn test_unrepresentable_window_is_unbounded() {
        let (ports, evaluator, journey, t0) = setup(goal(GoalKind::Event, Some(10_000_000_000_000)));
        let hit = t0 + Duration::days(400);
        ports.events.record("purchase", "user-1", hit);
        assert_eq!(evaluator.is_goal_met(&journey, hit).await, GoalOutcome::met(hit));

        let (ports, evaluator, journey, t0) = setup(goal(GoalKind::SegmentEnter, Some(i64::MAX)));
        ports.segments.join("subscribers");
        let later = t0 + Duration::days(4000);
        assert_eq!(evaluator.is_goal_met(&journey, later).await, GoalOutcome::met(later));
    }

    #[tokio::test]
    async fn test_port_failure_is_not_met() {
        let (ports, evaluator, journey, t0) = setup(goal(GoalKind::Event, None));
        ports.events.record("purchase", "user-1", t0);
        ports.events.set_unavailable(true);
        assert_eq!(evaluator.is_goal_met(&journey, t0).await, GoalOutcome::NOT_MET);
    }
}
