//! Journey execution: runs multi-step campaign workflows for a single user,
//! advancing them on events, time, and app lifecycle, evaluating conversion
//! goals, and persisting progress so it survives restarts.

pub mod clock;
pub mod error;
pub mod executor;
pub mod expression;
pub mod goal;
pub mod journey;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod state_machine;
pub mod store;

pub use error::{JourneyError, JourneyResult, PortError, PortResult};
pub use executor::{Executor, NodeExecutionResult, ResumeReason};
pub use expression::{Envelope, Expr, ExpressionEvaluator};
pub use goal::{GoalEvaluator, GoalOutcome};
pub use journey::{ExitReason, Journey, JourneyStatus, Origin};
pub use model::{Campaign, NodeKind, WorkflowNode};
pub use orchestrator::{JourneyOrchestrator, TrackedEvent};
pub use ports::{Ports, PresentationOutcome, Profile};
pub use store::{CompletionRecord, FileBackend, JourneyBackend, JourneyStore, MemoryBackend};
