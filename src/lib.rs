//! A persistent, status-driven task engine on SQLite.
//!
//! Tasks carry a status string; registered handlers advance them from one
//! status to the next, with per-status retry policies, delayed dispatch and
//! a full audit log. Queues are discovered from the data itself: every
//! distinct live status gets its own polling workers.

mod binder;
mod dispatcher;
mod engine;
mod registry;
mod retry;
mod scheduler;
mod store;
mod task;

pub use binder::Binder;
pub use engine::{Engine, EngineConfig, EngineError};
pub use registry::{ConfigError, HandlerError, HandlerOptions};
pub use retry::RetryPolicy;
pub use store::{StoreError, TaskStore};
pub use task::{Task, TaskLogRow};
