//! Task queues for polling agents
//!
//! Agents sit behind firewalls and cannot be reached directly, so work is
//! queued here and handed out when the agent polls. Two structurally distinct
//! queues share one lifecycle: shell [`TaskKind::Command`]s and
//! [`TaskKind::HttpRequest`]s.
//!
//! Delivery is an atomic `pending -> sent` claim (see [`TaskDispatcher::poll`]),
//! so overlapping polls from the same agent never receive the same task twice.

pub mod dispatcher;
pub mod error;
pub mod policy;
mod store;
pub mod summary;
pub mod task;

pub use dispatcher::{KnownAgents, TaskDispatcher};
pub use error::QueueError;
pub use outpost_db::TaskStatus;
pub use policy::{RetentionPolicy, StuckPolicy};
pub use summary::{KindSummary, PurgeReport, QueueSummary, StatusCounts, StuckReport};
pub use task::{QueuedTask, ReportOutcome, TaskKind, TaskPayload};
