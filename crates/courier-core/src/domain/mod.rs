//! Domain model (ids, task rows, outcomes, decisions, errors).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{CourierError, StoreError};
pub use ids::{LeaseToken, TaskId};
pub use outcome::{HandlerError, OutboundMessage, Outcome};
pub use task::{
    LeaseInfo, LeasedTask, NewTask, Priority, QueueCounts, TaskKind, TaskRecord, TaskState,
};
