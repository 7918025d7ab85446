//! Durable persistence for tasks and their attempt log.

mod sqlite;

pub use sqlite::TaskStore;
pub(crate) use sqlite::now_micros;

/// Errors raised by the task store. Fatal for the current advance, not for
/// the engine: workers log them and poll again.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bad timestamp in column {column}: '{value}'")]
    BadTimestamp { column: &'static str, value: String },

    #[error("cannot insert a task with an empty status")]
    EmptyStatus,
}

pub type Result<T> = std::result::Result<T, StoreError>;
