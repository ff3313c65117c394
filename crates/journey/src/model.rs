//! Campaign templates and the closed set of workflow node variants.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{self, MAX_SPAN_SECS};
use crate::error::{JourneyError, JourneyResult};
use crate::expression::Envelope;

pub type NodeId = String;

/// Immutable campaign template. Replaced wholesale on profile refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub trigger: Trigger,
    pub entry_node_id: NodeId,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub goal: Option<GoalConfig>,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
    #[serde(default)]
    pub conversion_anchor: ConversionAnchor,
    #[serde(default)]
    pub reentry: ReentryPolicy,
}

/// What starts a journey for a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Trigger {
    Event {
        event_name: String,
        #[serde(default)]
        condition: Option<Envelope>,
    },
    Segment {
        condition: Envelope,
    },
}

/// One step of a campaign graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    #[serde(default)]
    pub next: Vec<NodeId>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NodeKind {
    /// `next[0]` when the condition holds, `next[1]` otherwise.
    Branch { condition: Envelope },
    ShowContent { flow_id: String },
    WaitUntil { paths: Vec<WaitPath> },
    RandomBranch { branches: Vec<RandomArm> },
    CallHost {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    SetAttribute { key: String, value: Value },
    SendEvent {
        name: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    Exit {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Branch { .. } => "branch",
            NodeKind::ShowContent { .. } => "show_content",
            NodeKind::WaitUntil { .. } => "wait_until",
            NodeKind::RandomBranch { .. } => "random_branch",
            NodeKind::CallHost { .. } => "call_host",
            NodeKind::SetAttribute { .. } => "set_attribute",
            NodeKind::SendEvent { .. } => "send_event",
            NodeKind::Exit { .. } => "exit",
        }
    }
}

/// One exit of a WaitUntil node.
///
/// A path with a condition is a candidate until its `max_time_secs` elapses,
/// after which it is abandoned. A path without a condition is a timeout edge
/// taken once its `max_time_secs` elapses (immediately when absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitPath {
    #[serde(default)]
    pub condition: Option<Envelope>,
    #[serde(default)]
    pub max_time_secs: Option<u64>,
    pub next: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomArm {
    /// Percentage in `[0, 100]`.
    pub weight: f64,
    pub next: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    Event,
    SegmentEnter,
    SegmentLeave,
    Attribute,
}

/// Conversion goal. Copied into a journey once at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalConfig {
    pub kind: GoalKind,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub expression: Option<Envelope>,
    /// Window length after the anchor; unbounded when absent or `<= 0`.
    #[serde(default)]
    pub window_secs: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// A met goal completes the journey.
    #[default]
    OnGoalMet,
    /// Conversion is recorded but the journey keeps running.
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionAnchor {
    #[default]
    JourneyStart,
    TriggerEvent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ReentryPolicy {
    /// Never again after any prior journey for the pair.
    #[default]
    Once,
    /// Again once the previous journey finished.
    EveryRematch,
    /// Again once the last completion is older than `seconds`.
    Cooldown { seconds: u64 },
    /// Overlapping journeys allowed.
    Concurrent,
}

impl Campaign {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn trigger_event(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Event { event_name, .. } => Some(event_name),
            Trigger::Segment { .. } => None,
        }
    }

    /// Checks the graph and every embedded expression.
    pub fn validate(&self) -> JourneyResult<()> {
        let invalid = |msg: String| {
            JourneyError::Configuration(format!("campaign {}: {}", self.id, msg))
        };

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(invalid(format!("duplicate node id {}", node.id)));
            }
        }
        if !ids.contains(self.entry_node_id.as_str()) {
            return Err(invalid(format!("entry node {} missing", self.entry_node_id)));
        }

        match &self.trigger {
            Trigger::Event { event_name, condition } => {
                if event_name.is_empty() {
                    return Err(invalid("trigger event name is empty".to_string()));
                }
                if let Some(condition) = condition {
                    condition.validate().map_err(|e| invalid(e.to_string()))?;
                }
            }
            Trigger::Segment { condition } => {
                condition.validate().map_err(|e| invalid(e.to_string()))?
            }
        }

        for node in &self.nodes {
            for succ in node.successors() {
                if !ids.contains(succ) {
                    return Err(invalid(format!(
                        "node {} references unknown node {}",
                        node.id, succ
                    )));
                }
            }
            node.validate().map_err(|e| invalid(e.to_string()))?;
        }

        if let Some(goal) = &self.goal {
            goal.validate().map_err(|e| invalid(e.to_string()))?;
        }
        if let ReentryPolicy::Cooldown { seconds } = self.reentry {
            check_span("cooldown", seconds).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }
}

impl WorkflowNode {
    /// Every node id this node may transition to.
    pub fn successors(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.next.iter().map(String::as_str).collect();
        match &self.kind {
            NodeKind::WaitUntil { paths } => out.extend(paths.iter().map(|p| p.next.as_str())),
            NodeKind::RandomBranch { branches } => {
                out.extend(branches.iter().map(|b| b.next.as_str()))
            }
            _ => {}
        }
        out
    }

    fn validate(&self) -> JourneyResult<()> {
        match &self.kind {
            NodeKind::Branch { condition } => condition.validate(),
            NodeKind::WaitUntil { paths } => {
                if paths.is_empty() {
                    return Err(JourneyError::Configuration(format!(
                        "wait node {} has no paths",
                        self.id
                    )));
                }
                for path in paths {
                    if let Some(condition) = &path.condition {
                        condition.validate()?;
                    }
                    if let Some(secs) = path.max_time_secs {
                        check_span(&format!("wait node {} max_time_secs", self.id), secs)?;
                    }
                }
                Ok(())
            }
            NodeKind::RandomBranch { branches } => {
                if branches.iter().any(|b| !(b.weight >= 0.0)) {
                    return Err(JourneyError::Configuration(format!(
                        "random branch {} has a negative weight",
                        self.id
                    )));
                }
                let total: f64 = branches.iter().map(|b| b.weight).sum();
                if total > 100.0 + f64::EPSILON * 100.0 {
                    return Err(JourneyError::Configuration(format!(
                        "random branch {} weights sum to {total}",
                        self.id
                    )));
                }
                Ok(())
            }
            NodeKind::ShowContent { flow_id } if flow_id.is_empty() => Err(
                JourneyError::Configuration(format!("show content {} has no flow", self.id)),
            ),
            _ => Ok(()),
        }
    }
}

impl GoalConfig {
    /// `None` means unbounded, including windows too long to represent.
    pub fn window(&self) -> Option<chrono::Duration> {
        self.window_secs
            .and_then(|secs| u64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
            .and_then(clock::span)
    }

    fn validate(&self) -> JourneyResult<()> {
        let missing = |field: &str| {
            JourneyError::Configuration(format!("{:?} goal requires {field}", self.kind))
        };
        if let Some(secs) = self.window_secs.and_then(|s| u64::try_from(s).ok()) {
            check_span("goal window_secs", secs)?;
        }
        match self.kind {
            GoalKind::Event if self.event_name.is_none() => Err(missing("event_name")),
            GoalKind::SegmentEnter | GoalKind::SegmentLeave if self.segment_id.is_none() => {
                Err(missing("segment_id"))
            }
            GoalKind::Attribute => match &self.expression {
                Some(expression) => expression.validate(),
                None => Err(missing("expression")),
            },
            _ => Ok(()),
        }
    }
}

fn check_span(field: &str, secs: u64) -> JourneyResult<()> {
    if secs > MAX_SPAN_SECS {
        return Err(JourneyError::Configuration(format!(
            "{field} of {secs}s exceeds {MAX_SPAN_SECS}s"
        )));
    }
    Ok(())
}
