//! Handler registration and status resolution.
//!
//! Handlers are async closures keyed by the status labels they accept. The
//! registry erases both the closure and its optional attachment type so the
//! dispatcher works with one entry shape regardless of what the handler takes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::task::Task;

/// Configuration mistakes caught while wiring the engine. All of these are
/// programming errors and abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a handler for status '{status}' is already registered")]
    DuplicateStatus { status: String },

    #[error("handler '{name}' accepts no statuses")]
    NoStatuses { name: String },

    #[error("status labels must not be empty (handler '{name}')")]
    EmptyStatus { name: String },

    #[error("invalid retry spec '{spec}': {reason}")]
    InvalidRetrySpec { spec: String, reason: String },

    #[error("no binder registered for attachment type {type_name} (handler for status '{status}')")]
    MissingBinder {
        status: String,
        type_name: &'static str,
    },

    #[error("a binder for attachment type {type_name} is already registered")]
    DuplicateBinder { type_name: &'static str },

    #[error("handlers, binders and augmenters must be registered before start")]
    AlreadyStarted,

    #[error("a stopped engine cannot be restarted")]
    Stopped,
}

/// Failure raised by a handler (or by an attachment loader/unloader).
///
/// Carries the failing type's name and message into the task log. This type
/// intentionally does not implement `std::error::Error`: that keeps the
/// blanket `From<E: Error>` below coherent, so handlers can use `?` on any
/// ordinary error and still have its concrete type name recorded.
#[derive(Debug, Clone)]
pub struct HandlerError {
    exception_type: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerError {
    /// A failure with an explicit exception type, for errors that do not
    /// originate from an `Error` value (remote rejections, guard checks).
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Shorthand for a plain message failure, typed `HandlerError`.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("HandlerError", message)
    }

    /// Attaches structured context; augmenters can copy it into the log row.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn exception_type(&self) -> &str {
        &self.exception_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            exception_type: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

/// Per-handler knobs, chained builder-style.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    name: Option<String>,
    delay: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short name used in logs; defaults to the first accepted status.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Minimum pause after the previous save before this handler runs.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Retry policy applied when this handler fails.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Attachment value with its type erased for transport through the registry.
pub(crate) type BoxedAttachment = Box<dyn Any + Send>;

pub(crate) type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<(Task, Option<BoxedAttachment>), HandlerError>> + Send>>;

pub(crate) type BoxedHandler =
    Arc<dyn Fn(Task, Option<BoxedAttachment>) -> HandlerFuture + Send + Sync>;

/// Identifies the attachment type a handler declared, for binder lookup and
/// startup verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AttachmentKey {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

pub(crate) struct HandlerEntry {
    pub name: String,
    pub delay: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub attachment: Option<AttachmentKey>,
    pub invoke: BoxedHandler,
}

pub(crate) type Augmenter =
    Box<dyn Fn(&Task, &HandlerError, &mut serde_json::Map<String, serde_json::Value>) + Send + Sync>;

/// Status -> handler map plus the augmenter list. Built while the engine is
/// wiring up, frozen behind an `Arc` once it starts.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: HashMap<String, Arc<HandlerEntry>>,
    augmenters: Vec<Augmenter>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler that works on the task alone.
    pub fn add<I, S, F, Fut>(
        &mut self,
        statuses: I,
        options: HandlerOptions,
        handler: F,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Task, HandlerError>> + Send + 'static,
    {
        let invoke: BoxedHandler = Arc::new(move |task, _attachment| {
            let fut = handler(task);
            Box::pin(async move { fut.await.map(|task| (task, None)) }) as HandlerFuture
        });
        self.add_erased(collect_statuses(statuses), options, None, invoke)
    }

    /// Registers a handler that receives a loaded attachment of type `A` and
    /// returns it for the unloader.
    pub fn add_with<A, I, S, F, Fut>(
        &mut self,
        statuses: I,
        options: HandlerOptions,
        handler: F,
    ) -> Result<(), ConfigError>
    where
        A: Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Task, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(Task, A), HandlerError>> + Send + 'static,
    {
        let invoke: BoxedHandler = Arc::new(move |task, attachment| {
            match attachment.and_then(|boxed| boxed.downcast::<A>().ok()) {
                Some(value) => {
                    let fut = handler(task, *value);
                    Box::pin(async move {
                        fut.await
                            .map(|(task, value)| (task, Some(Box::new(value) as BoxedAttachment)))
                    }) as HandlerFuture
                }
                // Unreachable when the binder registry is consistent; kept
                // total so a wiring bug surfaces as a logged failure.
                None => Box::pin(async move {
                    Err(HandlerError::new(
                        "AttachmentMismatch",
                        "loaded attachment had an unexpected type",
                    ))
                }) as HandlerFuture,
            }
        });
        let key = AttachmentKey {
            type_id: TypeId::of::<A>(),
            type_name: std::any::type_name::<A>(),
        };
        self.add_erased(collect_statuses(statuses), options, Some(key), invoke)
    }

    fn add_erased(
        &mut self,
        statuses: Vec<String>,
        options: HandlerOptions,
        attachment: Option<AttachmentKey>,
        invoke: BoxedHandler,
    ) -> Result<(), ConfigError> {
        let name = options
            .name
            .or_else(|| statuses.first().cloned())
            .unwrap_or_default();
        if statuses.is_empty() {
            return Err(ConfigError::NoStatuses { name });
        }
        if statuses.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::EmptyStatus { name });
        }
        for status in &statuses {
            if self.handlers.contains_key(status) || statuses.iter().filter(|s| *s == status).count() > 1 {
                return Err(ConfigError::DuplicateStatus {
                    status: status.clone(),
                });
            }
        }

        let entry = Arc::new(HandlerEntry {
            name,
            delay: options.delay,
            retry: options.retry,
            attachment,
            invoke,
        });
        for status in statuses {
            self.handlers.insert(status, Arc::clone(&entry));
        }
        Ok(())
    }

    pub fn add_augmenter<F>(&mut self, augmenter: F)
    where
        F: Fn(&Task, &HandlerError, &mut serde_json::Map<String, serde_json::Value>)
            + Send
            + Sync
            + 'static,
    {
        self.augmenters.push(Box::new(augmenter));
    }

    pub fn resolve(&self, status: &str) -> Option<Arc<HandlerEntry>> {
        self.handlers.get(status).cloned()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &HandlerEntry)> {
        self.handlers
            .iter()
            .map(|(status, entry)| (status.as_str(), entry.as_ref()))
    }

    pub fn augmenters(&self) -> &[Augmenter] {
        &self.augmenters
    }
}

fn collect_statuses<I, S>(statuses: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    statuses.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass_through(task: Task) -> impl Future<Output = Result<Task, HandlerError>> {
        async move { Ok(task) }
    }

    #[test]
    fn rejects_second_handler_for_same_status() {
        let mut registry = HandlerRegistry::new();
        registry
            .add(["New order created"], HandlerOptions::new(), pass_through)
            .unwrap();
        let err = registry
            .add(["New order created"], HandlerOptions::new(), pass_through)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStatus { status } if status == "New order created"));
    }

    #[test]
    fn rejects_duplicate_within_one_registration() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .add(["A", "B", "A"], HandlerOptions::new(), pass_through)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStatus { status } if status == "A"));
    }

    #[test]
    fn rejects_empty_inputs() {
        let mut registry = HandlerRegistry::new();
        let none: [&str; 0] = [];
        assert!(matches!(
            registry.add(none, HandlerOptions::new(), pass_through),
            Err(ConfigError::NoStatuses { .. })
        ));
        assert!(matches!(
            registry.add([""], HandlerOptions::new(), pass_through),
            Err(ConfigError::EmptyStatus { .. })
        ));
    }

    #[test]
    fn multi_status_registration_resolves_to_one_entry() {
        let mut registry = HandlerRegistry::new();
        registry
            .add(
                ["Payment failed", "No Goods"],
                HandlerOptions::new().named("cancel_payment"),
                pass_through,
            )
            .unwrap();

        let a = registry.resolve("Payment failed").unwrap();
        let b = registry.resolve("No Goods").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name, "cancel_payment");
        assert!(registry.resolve("Order paid").is_none());
    }

    #[test]
    fn options_are_carried_on_the_entry() {
        let mut registry = HandlerRegistry::new();
        let policy = RetryPolicy::parse("every 1s during 10s", "Fallback").unwrap();
        registry
            .add(
                ["A"],
                HandlerOptions::new()
                    .delay(Duration::from_secs(3))
                    .retry(policy.clone()),
                pass_through,
            )
            .unwrap();

        let entry = registry.resolve("A").unwrap();
        assert_eq!(entry.name, "A");
        assert_eq!(entry.delay, Some(Duration::from_secs(3)));
        assert_eq!(entry.retry, Some(policy));
        assert!(entry.attachment.is_none());
    }

    #[test]
    fn blanket_from_captures_the_error_type_name() {
        fn fails() -> Result<(), HandlerError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))?;
            Ok(())
        }

        let err = fails().unwrap_err();
        assert!(err.exception_type().starts_with("std::io"), "got {}", err.exception_type());
        assert!(err.exception_type().ends_with("Error"));
        assert_eq!(err.message(), "disk on fire");
    }

    #[tokio::test]
    async fn erased_handler_round_trips_the_attachment() {
        #[derive(Debug, PartialEq)]
        struct Cargo(u32);

        let mut registry = HandlerRegistry::new();
        registry
            .add_with(["A"], HandlerOptions::new(), |mut task: Task, cargo: Cargo| async move {
                task.set_status("B");
                Ok((task, Cargo(cargo.0 + 1)))
            })
            .unwrap();

        let entry = registry.resolve("A").unwrap();
        assert_eq!(
            entry.attachment.map(|key| key.type_id),
            Some(TypeId::of::<Cargo>())
        );

        let task = Task::new_for_tests(1, "A");
        let (task, cargo) = (entry.invoke)(task, Some(Box::new(Cargo(41))))
            .await
            .unwrap();
        assert_eq!(task.status(), Some("B"));
        let cargo = cargo.unwrap().downcast::<Cargo>().unwrap();
        assert_eq!(*cargo, Cargo(42));
    }

    #[tokio::test]
    async fn mismatched_attachment_is_a_failure_not_a_panic() {
        let mut registry = HandlerRegistry::new();
        registry
            .add_with(["A"], HandlerOptions::new(), |task: Task, value: u32| async move {
                Ok((task, value))
            })
            .unwrap();

        let entry = registry.resolve("A").unwrap();
        let task = Task::new_for_tests(1, "A");
        let err = (entry.invoke)(task, Some(Box::new("wrong".to_string())))
            .await
            .unwrap_err();
        assert_eq!(err.exception_type(), "AttachmentMismatch");
    }

    #[test]
    fn augmenters_accumulate_in_order() {
        let mut registry = HandlerRegistry::new();
        registry.add_augmenter(|_task, _err, map| {
            map.insert("first".into(), serde_json::json!(1));
        });
        registry.add_augmenter(|_task, _err, map| {
            map.insert("second".into(), serde_json::json!(2));
        });

        let task = Task::new_for_tests(1, "A");
        let err = HandlerError::msg("boom");
        let mut map = serde_json::Map::new();
        for augmenter in registry.augmenters() {
            augmenter(&task, &err, &mut map);
        }
        assert_eq!(map.len(), 2);
    }
}
