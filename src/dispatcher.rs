//! The single-task advance: claim, resolve, load, invoke, persist, log.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use crate::binder::{BinderRegistry, ErasedBinder};
use crate::registry::{BoxedAttachment, HandlerEntry, HandlerError, HandlerRegistry};
use crate::retry::RetryPolicy;
use crate::store::{now_micros, StoreError, TaskStore};
use crate::task::{LogEntry, Task};

/// Floor for re-dispatching a task whose handler kept the same status, so a
/// self-rescheduling step cannot spin hot.
const MIN_SAME_STATUS_SPACING: Duration = Duration::from_secs(1);

/// How far a task is pushed back when its advance died on a store error.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of one `advance` call, as seen by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// No due task in the queue.
    Idle,
    /// A task was claimed but cannot be dispatched; it was released.
    Unhandled,
    /// The handler's delay has not elapsed yet; the task was pushed back.
    Deferred,
    /// An attempt ran and its outcome was persisted.
    Advanced,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A handler failed with no retry policy to absorb the failure. The task
    /// stays claimed until an operator intervenes.
    #[error("task {task_id} failed in status '{status}' with no retry policy: {error}")]
    Fatal {
        task_id: i64,
        status: String,
        error: HandlerError,
    },
}

enum CompleteError {
    Store(StoreError),
    Unload(HandlerError),
}

pub(crate) struct Dispatcher {
    store: Arc<TaskStore>,
    registry: Arc<HandlerRegistry>,
    binders: Arc<BinderRegistry>,
    advance_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<HandlerRegistry>,
        binders: Arc<BinderRegistry>,
        advance_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            binders,
            advance_timeout,
        }
    }

    /// Advances at most one task from `queue` through one attempt.
    pub async fn advance(&self, queue: &str) -> Result<Advance, DispatchError> {
        let now = now_micros();
        let Some(task) = self.store.claim_next(queue, now).await? else {
            return Ok(Advance::Idle);
        };

        let task_id = task.id;
        let result = self.dispatch(task, now).await;
        if let Err(DispatchError::Store(error)) = &result {
            // A dead advance must not keep the claim: release it so the
            // task stays visible to later polls, pushed back a beat.
            warn!(task_id, error = %error, "Advance hit a store error, releasing the claim");
            let due = after(now_micros(), STORE_ERROR_BACKOFF);
            if let Err(release_error) = self.store.release_delayed(task_id, due).await {
                error!(
                    task_id,
                    error = %release_error,
                    "Failed to release the claim, the task stays held until restart"
                );
            }
        }
        result
    }

    async fn dispatch(&self, mut task: Task, now: DateTime<Utc>) -> Result<Advance, DispatchError> {
        // The claim filters terminal rows, so a claimed task has a status.
        let Some(status) = task.status.clone() else {
            self.store.release(&mut task).await?;
            return Ok(Advance::Unhandled);
        };

        let Some(entry) = self.registry.resolve(&status) else {
            warn!(task_id = task.id, status = %status, "No handler for status, releasing task");
            self.store.release(&mut task).await?;
            return Ok(Advance::Unhandled);
        };

        if let Some(delay) = entry.delay {
            let due = after(task.modified, delay);
            if now < due {
                task.execute_after = due;
                let mut tx = self.store.begin().await?;
                self.store.save(&mut tx, &mut task).await?;
                tx.commit().await.map_err(StoreError::from)?;
                debug!(task_id = task.id, status = %status, "Deferred until {}", task.execute_after);
                return Ok(Advance::Deferred);
            }
        }

        // A task that kept failing past its window is moved to the fallback
        // status without another attempt.
        if let (Some(failing_since), Some(retry)) = (task.failing_since, entry.retry.as_ref()) {
            if elapsed_exceeds(failing_since, retry.window, now) {
                return self.exhaust(task, retry, None).await;
            }
        }

        let binder = match entry.attachment {
            Some(key) => match self.binders.get(key.type_id) {
                Some(binder) => Some(binder),
                None => {
                    // Start-up verification makes this unreachable unless the
                    // registries were wired by hand.
                    warn!(
                        task_id = task.id,
                        status = %status,
                        attachment = key.type_name,
                        "No binder for attachment type, releasing task"
                    );
                    self.store.release(&mut task).await?;
                    return Ok(Advance::Unhandled);
                }
            },
            None => None,
        };

        let attachment = match &binder {
            Some(binder) => {
                let loaded = {
                    let mut conn = self.store.acquire().await?;
                    binder.load(&mut conn, &task).await
                };
                match loaded {
                    Ok(value) => Some(value),
                    Err(error) => {
                        warn!(task_id = task.id, status = %status, error = %error, "Attachment load failed");
                        return self.fail(task, &entry, error).await;
                    }
                }
            }
            None => None,
        };

        debug!(task_id = task.id, status = %status, handler = %entry.name, "Dispatching task");
        match self.invoke(&entry, task.clone(), attachment).await {
            Ok((returned, returned_attachment)) => {
                let done = now_micros();
                let mut updated = returned;
                updated.failing_since = None;
                updated.modified = done;
                if updated.status == task.status {
                    let spacing = entry
                        .delay
                        .unwrap_or(Duration::ZERO)
                        .max(MIN_SAME_STATUS_SPACING);
                    updated.execute_after = after(done, spacing);
                }

                let log = LogEntry {
                    task_id: updated.id,
                    status_before: task.status.clone(),
                    status_after: updated.status.clone(),
                    exception_type: None,
                    exception_message: None,
                    extra_json: None,
                };

                match self
                    .complete_success(&mut updated, returned_attachment, binder.as_ref(), &log)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            task_id = updated.id,
                            from = %status,
                            to = updated.status().unwrap_or("finished"),
                            "Task advanced"
                        );
                        Ok(Advance::Advanced)
                    }
                    Err(CompleteError::Store(error)) => Err(error.into()),
                    Err(CompleteError::Unload(error)) => {
                        // The completion transaction rolled back, so the
                        // attempt failed as a whole; retry from the claimed
                        // state.
                        warn!(task_id = task.id, status = %status, error = %error, "Attachment unload failed");
                        self.fail(task, &entry, error).await
                    }
                }
            }
            Err(error) => {
                warn!(task_id = task.id, status = %status, error = %error, "Handler failed");
                self.fail(task, &entry, error).await
            }
        }
    }

    /// Runs the handler on its own task so a panic or an overrun cannot take
    /// the worker down with it.
    async fn invoke(
        &self,
        entry: &HandlerEntry,
        task: Task,
        attachment: Option<BoxedAttachment>,
    ) -> Result<(Task, Option<BoxedAttachment>), HandlerError> {
        let future = (entry.invoke)(task, attachment);
        let mut handle = AbortOnDrop(tokio::spawn(future));

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                HandlerError::new("Panic", message)
            } else {
                HandlerError::new("Cancelled", "handler was cancelled")
            }
        };

        tokio::select! {
            result = &mut handle.0 => result.map_err(join_to_error)?,
            _ = tokio::time::sleep(self.advance_timeout) => {
                Err(HandlerError::new(
                    "TimeoutError",
                    format!("handler exceeded the {:?} attempt timeout", self.advance_timeout),
                ))
            }
        }
    }

    /// Applies the retry policy to a failed attempt.
    async fn fail(
        &self,
        mut task: Task,
        entry: &HandlerEntry,
        error: HandlerError,
    ) -> Result<Advance, DispatchError> {
        let now = now_micros();
        let failing_since = match task.failing_since {
            Some(since) => since,
            None => {
                task.failing_since = Some(now);
                now
            }
        };

        let log = LogEntry {
            task_id: task.id,
            status_before: task.status.clone(),
            status_after: task.status.clone(),
            exception_type: Some(error.exception_type().to_string()),
            exception_message: Some(error.message().to_string()),
            extra_json: self.augment(&task, &error),
        };

        match entry.retry.as_ref() {
            Some(retry) if !elapsed_exceeds(failing_since, retry.window, now) => {
                // Still inside the window: reschedule, status and modified
                // untouched.
                task.execute_after = after(now, retry.interval);
                let mut tx = self.store.begin().await?;
                self.store.save(&mut tx, &mut task).await?;
                self.log_attempt(&mut tx, &log).await;
                tx.commit().await.map_err(StoreError::from)?;
                debug!(task_id = task.id, "Retry scheduled at {}", task.execute_after);
                Ok(Advance::Advanced)
            }
            Some(retry) => self.exhaust(task, retry, Some(error)).await,
            None => {
                // No policy: record the failure and leave the task claimed so
                // it cannot loop; reviving it is an operator decision.
                let mut tx = self.store.begin().await?;
                self.log_attempt(&mut tx, &log).await;
                tx.commit().await.map_err(StoreError::from)?;
                Err(DispatchError::Fatal {
                    task_id: task.id,
                    status: task.status.clone().unwrap_or_default(),
                    error,
                })
            }
        }
    }

    /// Moves a task whose retry window ran out to its fallback status. When
    /// the window expired during an attempt, that attempt's error is recorded
    /// on the log row.
    async fn exhaust(
        &self,
        mut task: Task,
        retry: &RetryPolicy,
        error: Option<HandlerError>,
    ) -> Result<Advance, DispatchError> {
        let now = now_micros();
        let status_before = task.status.clone();
        warn!(
            task_id = task.id,
            status = status_before.as_deref().unwrap_or(""),
            fallback = %retry.fallback_status,
            "Retry window exhausted, moving task to fallback status"
        );

        task.set_status(retry.fallback_status.clone());
        task.failing_since = None;
        task.modified = now;

        let log = LogEntry {
            task_id: task.id,
            status_before,
            status_after: task.status.clone(),
            exception_type: error.as_ref().map(|e| e.exception_type().to_string()),
            exception_message: error.as_ref().map(|e| e.message().to_string()),
            extra_json: error.as_ref().and_then(|e| self.augment(&task, e)),
        };

        let mut tx = self.store.begin().await?;
        self.store.save(&mut tx, &mut task).await?;
        self.log_attempt(&mut tx, &log).await;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(Advance::Advanced)
    }

    async fn complete_success(
        &self,
        task: &mut Task,
        attachment: Option<BoxedAttachment>,
        binder: Option<&Arc<dyn ErasedBinder>>,
        log: &LogEntry,
    ) -> Result<(), CompleteError> {
        let mut tx = self.store.begin().await.map_err(CompleteError::Store)?;
        if let (Some(binder), Some(value)) = (binder, attachment) {
            // Dropping the transaction on this error path rolls everything
            // back, including the save below that never happened.
            binder
                .unload(&mut tx, task, value)
                .await
                .map_err(CompleteError::Unload)?;
        }
        self.store
            .save(&mut tx, task)
            .await
            .map_err(CompleteError::Store)?;
        self.log_attempt(&mut tx, log).await;
        tx.commit()
            .await
            .map_err(|e| CompleteError::Store(e.into()))
    }

    /// A lost log row must not fail the dispatch that produced it.
    async fn log_attempt(&self, conn: &mut sqlx::SqliteConnection, entry: &LogEntry) {
        if let Err(error) = self.store.append_log(conn, entry).await {
            error!(task_id = entry.task_id, error = %error, "Failed to append a task log row");
        }
    }

    /// Collects augmenter output for a failure row. A panicking augmenter is
    /// skipped; it can never mask the original failure.
    fn augment(&self, task: &Task, error: &HandlerError) -> Option<serde_json::Value> {
        let mut map = serde_json::Map::new();
        for augmenter in self.registry.augmenters() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                augmenter(task, error, &mut map)
            }));
            if outcome.is_err() {
                warn!(task_id = task.id, "Error augmenter panicked, skipping it");
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(map))
        }
    }
}

/// Handler task tied to the lifetime of the advance: dropped on timeout or
/// when a hard shutdown drops the advance future, the handler stops too.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// `base + delay`, saturating at a far-future timestamp that still sorts
/// after every realistic value in the TEXT columns.
fn after(base: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| base.checked_add_signed(delay))
        .unwrap_or_else(far_future)
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or_else(Utc::now)
}

/// True once more than `limit` has passed between `since` and `now`.
fn elapsed_exceeds(since: DateTime<Utc>, limit: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(limit) {
        Ok(limit) => now.signed_duration_since(since) > limit,
        Err(_) => false,
    }
}
