//! Per-node transition function. Every port failure is converted into a
//! terminal result here and never reaches the orchestrator loop.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::clock;
use crate::error::{JourneyError, JourneyResult, PortError};
use crate::expression::ExpressionEvaluator;
use crate::journey::{ExitReason, Journey};
use crate::model::{NodeId, NodeKind, RandomArm, WaitPath, WorkflowNode};
use crate::ports::{PortAdapters, Ports, PresentationOutcome};

/// Name of the event tracked when a presented flow ends in a purchase.
pub const PURCHASE_EVENT: &str = "journey_purchase";

/// Why a node is being (re-)executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ResumeReason {
    Start,
    /// The previous node continued into this one.
    Advance,
    Event { name: String },
    SegmentChange,
    Timer,
    Foreground,
    /// Re-driven after a restart.
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NodeExecutionResult {
    Continue { next: Vec<NodeId> },
    /// Suspend until the deadline, an external trigger, or a retry.
    Async { deadline: Option<DateTime<Utc>> },
    Skip { next: Option<NodeId> },
    Complete { reason: ExitReason },
}

impl NodeExecutionResult {
    fn cont(next: impl Into<NodeId>) -> Self {
        NodeExecutionResult::Continue {
            next: vec![next.into()],
        }
    }

    fn complete(reason: ExitReason) -> Self {
        NodeExecutionResult::Complete { reason }
    }
}

/// Inputs the orchestrator supplies for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    pub now: DateTime<Utc>,
    /// False while backgrounded or inside the foreground grace period.
    pub can_present: bool,
}

#[derive(Debug, Clone)]
pub struct Executor {
    ports: Ports,
    evaluator: ExpressionEvaluator,
}

impl Executor {
    pub fn new(ports: Ports) -> Self {
        Self {
            ports,
            evaluator: ExpressionEvaluator::new(),
        }
    }

    /// Executes `node` for `journey`.
    pub async fn execute(
        &self,
        node: &WorkflowNode,
        journey: &Journey,
        reason: &ResumeReason,
        ctx: ExecutionContext,
    ) -> NodeExecutionResult {
        debug!(
            journey_id = %journey.id,
            node_id = %node.id,
            kind = node.kind.label(),
            ?reason,
            "Executing journey node"
        );

        match self.try_execute(node, journey, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    journey_id = %journey.id,
                    node_id = %node.id,
                    error = %e,
                    "Node execution failed"
                );
                NodeExecutionResult::complete(ExitReason::errored(e.to_string()))
            }
        }
    }

    async fn try_execute(
        &self,
        node: &WorkflowNode,
        journey: &Journey,
        ctx: ExecutionContext,
    ) -> JourneyResult<NodeExecutionResult> {
        let first_next = || node.next.first().cloned();

        match &node.kind {
            NodeKind::Branch { condition } => {
                let adapters = PortAdapters::new(&self.ports, &journey.distinct_id, ctx.now);
                let index = if self.evaluator.evaluate_bool(condition, &adapters).await {
                    0
                } else {
                    1
                };
                Ok(match node.next.get(index) {
                    Some(next) => NodeExecutionResult::cont(next.clone()),
                    None => NodeExecutionResult::Skip { next: None },
                })
            }
            NodeKind::ShowContent { flow_id } => {
                self.show_content(node, flow_id, journey, ctx).await
            }
            NodeKind::WaitUntil { paths } => Ok(self.wait_until(paths, journey, ctx).await),
            NodeKind::RandomBranch { branches } => Ok(random_branch(node, branches, journey)),
            NodeKind::CallHost { name, payload } => {
                self.ports.host.notify(name, payload, journey);
                Ok(continue_or_complete(first_next()))
            }
            NodeKind::SetAttribute { key, value } => {
                self.ports
                    .identity
                    .set_user_property(key, value.clone())
                    .await
                    .map_err(|e| JourneyError::port("identity", e))?;
                Ok(continue_or_complete(first_next()))
            }
            NodeKind::SendEvent { name, properties } => {
                if name.is_empty() {
                    return Ok(NodeExecutionResult::Skip { next: first_next() });
                }
                let mut properties = properties.clone();
                annotate(&mut properties, journey);
                self.ports
                    .events
                    .track(name, properties)
                    .await
                    .map_err(|e| JourneyError::port("events", e))?;
                Ok(continue_or_complete(first_next()))
            }
            NodeKind::Exit { reason } => Ok(NodeExecutionResult::complete(ExitReason::ExitNode {
                reason: reason.clone(),
            })),
        }
    }

    async fn show_content(
        &self,
        node: &WorkflowNode,
        flow_id: &str,
        journey: &Journey,
        ctx: ExecutionContext,
    ) -> JourneyResult<NodeExecutionResult> {
        let presentation = &self.ports.presentation;
        if !ctx.can_present || presentation.is_presenting() {
            debug!(journey_id = %journey.id, flow_id, "No surface available, parking");
            return Ok(NodeExecutionResult::Async { deadline: None });
        }

        let outcome = match presentation.present_flow(flow_id, journey).await {
            Ok(outcome) => outcome,
            Err(PortError::NoSurface) => {
                return Ok(NodeExecutionResult::Async { deadline: None });
            }
            Err(PortError::ContentUnavailable(detail)) => {
                warn!(journey_id = %journey.id, flow_id, detail = %detail, "Content unavailable, skipping");
                return Ok(NodeExecutionResult::Skip {
                    next: node.next.first().cloned(),
                });
            }
            Err(e) => return Err(JourneyError::port("presentation", e)),
        };

        info!(journey_id = %journey.id, flow_id, ?outcome, "Presentation finished");
        Ok(match outcome {
            PresentationOutcome::Dismissed | PresentationOutcome::TimedOut => {
                continue_or_complete(node.next.first().cloned())
            }
            PresentationOutcome::Purchased {
                product_id,
                transaction_id,
            } => {
                self.track_purchase(journey, flow_id, &product_id, transaction_id.as_deref())
                    .await;
                NodeExecutionResult::complete(ExitReason::Purchased {
                    product_id,
                    transaction_id,
                })
            }
            PresentationOutcome::Restored => NodeExecutionResult::complete(ExitReason::Restored),
            PresentationOutcome::Errored { message } => {
                NodeExecutionResult::complete(ExitReason::errored(message))
            }
        })
    }

    // Best-effort: a tracking failure never fails the journey.
    async fn track_purchase(
        &self,
        journey: &Journey,
        flow_id: &str,
        product_id: &str,
        transaction_id: Option<&str>,
    ) {
        let mut properties = Map::new();
        properties.insert("product_id".to_string(), Value::from(product_id));
        properties.insert("flow_id".to_string(), Value::from(flow_id));
        if let Some(tx) = transaction_id {
            properties.insert("transaction_id".to_string(), Value::from(tx));
        }
        annotate(&mut properties, journey);
        if let Err(e) = self.ports.events.track(PURCHASE_EVENT, properties).await {
            warn!(journey_id = %journey.id, error = %e, "Purchase tracking failed");
        }
    }

    /// Paths are checked in declared order and the first one that fires wins:
    /// a live conditional path whose condition holds, or a timeout path whose
    /// `max_time_secs` has elapsed. An elapsed timeout declared before a true
    /// condition is taken first.
    async fn wait_until(
        &self,
        paths: &[WaitPath],
        journey: &Journey,
        ctx: ExecutionContext,
    ) -> NodeExecutionResult {
        let adapters = PortAdapters::new(&self.ports, &journey.distinct_id, ctx.now);
        let mut next_deadline: Option<DateTime<Utc>> = None;
        let mut live = false;

        for path in paths {
            // `Some(None)`: a limit too far out to represent, which never elapses.
            let limit = path
                .max_time_secs
                .map(|secs| clock::after(journey.node_entered_at, secs));
            let deadline = limit.flatten();
            let elapsed = deadline.is_some_and(|d| ctx.now >= d);

            match &path.condition {
                Some(condition) => {
                    if elapsed {
                        continue;
                    }
                    if self.evaluator.evaluate_bool(condition, &adapters).await {
                        return NodeExecutionResult::cont(path.next.clone());
                    }
                    live = true;
                }
                None => {
                    if limit.is_none() || elapsed {
                        return NodeExecutionResult::cont(path.next.clone());
                    }
                    live = true;
                }
            }

            if let Some(d) = deadline {
                next_deadline = Some(next_deadline.map_or(d, |current| current.min(d)));
            }
        }

        if !live {
            return NodeExecutionResult::complete(ExitReason::WaitExpired);
        }
        NodeExecutionResult::Async {
            deadline: next_deadline,
        }
    }
}

fn continue_or_complete(next: Option<NodeId>) -> NodeExecutionResult {
    match next {
        Some(next) => NodeExecutionResult::cont(next),
        None => NodeExecutionResult::complete(ExitReason::Completed),
    }
}

fn annotate(properties: &mut Map<String, Value>, journey: &Journey) {
    properties.insert("journey_id".to_string(), Value::from(journey.id.to_string()));
    properties.insert(
        "campaign_id".to_string(),
        Value::from(journey.campaign_id.clone()),
    );
}

/// Rolls in `[0, 100)` from the journey's stored seed and the node id, so
/// re-evaluating the same node for the same journey picks the same arm.
fn random_branch(node: &WorkflowNode, arms: &[RandomArm], journey: &Journey) -> NodeExecutionResult {
    let roll = branch_roll(journey.random_seed(), &node.id);
    let mut cumulative = 0.0;
    for arm in arms {
        cumulative += arm.weight;
        if roll < cumulative {
            return NodeExecutionResult::cont(arm.next.clone());
        }
    }
    debug!(journey_id = %journey.id, node_id = %node.id, roll, "Random branch matched no arm");
    NodeExecutionResult::complete(ExitReason::NoMatch)
}

fn branch_roll(seed: u64, node_id: &str) -> f64 {
    let digest = Sha256::digest(node_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let mut rng = StdRng::seed_from_u64(seed ^ u64::from_be_bytes(bytes));
    rng.gen_range(0.0..100.0)
}
