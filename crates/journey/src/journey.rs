//! A running instance of a campaign's workflow for one user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::JourneyResult;
use crate::model::{Campaign, ConversionAnchor, ExitPolicy, GoalConfig, NodeId};
use crate::state_machine::JourneyStateMachine;

const SEED_KEY: &str = "random_seed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Active,
    Paused,
    Completed,
    Errored,
    Exited,
}

impl JourneyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JourneyStatus::Completed | JourneyStatus::Errored | JourneyStatus::Exited
        )
    }
}

/// Why a journey ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ExitReason {
    /// Ran off the end of the graph.
    Completed,
    ExitNode {
        #[serde(default)]
        reason: Option<String>,
    },
    GoalMet,
    Purchased {
        product_id: String,
        #[serde(default)]
        transaction_id: Option<String>,
    },
    Restored,
    /// A random branch roll fell outside every arm.
    NoMatch,
    /// Every wait path was abandoned without a timeout edge.
    WaitExpired,
    CampaignUnavailable,
    Errored {
        message: String,
    },
}

impl ExitReason {
    pub fn errored(message: impl Into<String>) -> Self {
        ExitReason::Errored {
            message: message.into(),
        }
    }

    /// Terminal status recorded for this reason.
    pub fn status(&self) -> JourneyStatus {
        match self {
            ExitReason::Completed
            | ExitReason::GoalMet
            | ExitReason::Purchased { .. }
            | ExitReason::Restored => JourneyStatus::Completed,
            ExitReason::ExitNode { .. }
            | ExitReason::NoMatch
            | ExitReason::WaitExpired
            | ExitReason::CampaignUnavailable => JourneyStatus::Exited,
            ExitReason::Errored { .. } => JourneyStatus::Errored,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::ExitNode { .. } => "exit_node",
            ExitReason::GoalMet => "goal_met",
            ExitReason::Purchased { .. } => "purchased",
            ExitReason::Restored => "restored",
            ExitReason::NoMatch => "no_match",
            ExitReason::WaitExpired => "wait_expired",
            ExitReason::CampaignUnavailable => "campaign_unavailable",
            ExitReason::Errored { .. } => "errored",
        }
    }
}

/// Per-user campaign instance. The goal snapshot is frozen at start and the
/// conversion timestamp only ever moves earlier, so both are private.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub campaign_id: String,
    pub campaign_version: u32,
    pub distinct_id: String,
    pub status: JourneyStatus,
    pub current_node_id: NodeId,
    /// When the journey arrived at `current_node_id`.
    pub node_entered_at: DateTime<Utc>,
    goal_snapshot: Option<GoalConfig>,
    pub exit_policy: ExitPolicy,
    pub conversion_anchor_at: DateTime<Utc>,
    converted_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub origin_event_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
}

/// The event that caused a journey to start.
#[derive(Debug, Clone)]
pub struct Origin {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Journey {
    /// Creates a journey positioned at the campaign's entry node.
    pub fn start(
        campaign: &Campaign,
        distinct_id: &str,
        origin: Option<&Origin>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        let anchor = match (campaign.conversion_anchor, origin) {
            (ConversionAnchor::TriggerEvent, Some(origin)) => origin.timestamp,
            _ => now,
        };
        let mut context = Map::new();
        context.insert(SEED_KEY.to_string(), Value::from(derive_seed(&id)));

        Self {
            id,
            campaign_id: campaign.id.clone(),
            campaign_version: campaign.version,
            distinct_id: distinct_id.to_string(),
            status: JourneyStatus::Active,
            current_node_id: campaign.entry_node_id.clone(),
            node_entered_at: now,
            goal_snapshot: campaign.goal.clone(),
            exit_policy: campaign.exit_policy,
            conversion_anchor_at: anchor,
            converted_at: None,
            resume_at: None,
            context,
            origin_event_id: origin.map(|o| o.event_id.clone()),
            started_at: now,
            updated_at: now,
            completed_at: None,
            exit_reason: None,
        }
    }

    pub fn goal_snapshot(&self) -> Option<&GoalConfig> {
        self.goal_snapshot.as_ref()
    }

    pub fn converted_at(&self) -> Option<DateTime<Utc>> {
        self.converted_at
    }

    /// Latches a conversion. Returns `true` when the stored timestamp changed;
    /// a later timestamp never replaces an earlier one.
    pub fn record_conversion(&mut self, at: DateTime<Utc>) -> bool {
        match self.converted_at {
            Some(existing) if existing <= at => false,
            _ => {
                self.converted_at = Some(at);
                true
            }
        }
    }

    /// Seed for random branching, stable for the lifetime of the journey.
    pub fn random_seed(&self) -> u64 {
        self.context
            .get(SEED_KEY)
            .and_then(Value::as_u64)
            .unwrap_or_else(|| derive_seed(&self.id))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves to `node_id` and clears any pending deadline. Re-entering the
    /// current node through an edge counts as a fresh entry.
    pub fn advance_to(&mut self, node_id: &str, now: DateTime<Utc>) -> JourneyResult<()> {
        JourneyStateMachine::transition(&mut self.status, JourneyStatus::Active)?;
        self.current_node_id = node_id.to_string();
        self.node_entered_at = now;
        self.resume_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Parks at the current node until `resume_at` or an external trigger.
    pub fn park(&mut self, resume_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> JourneyResult<()> {
        JourneyStateMachine::transition(&mut self.status, JourneyStatus::Paused)?;
        self.resume_at = resume_at;
        self.updated_at = now;
        Ok(())
    }

    pub fn finish(&mut self, reason: ExitReason, now: DateTime<Utc>) -> JourneyResult<()> {
        JourneyStateMachine::transition(&mut self.status, reason.status())?;
        self.resume_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.exit_reason = Some(reason);
        Ok(())
    }
}

fn derive_seed(id: &Uuid) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
