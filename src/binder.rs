//! Attachment binding: loading and saving the entity a handler works on.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::registry::{BoxedAttachment, ConfigError, HandlerError};
use crate::task::Task;

/// Supplies the loader/unloader pair for attachment type `A`.
///
/// `load` runs right before the handler on a plain pool connection; `unload`
/// runs inside the completion transaction, so the entity and the task commit
/// together. An error from either half is treated like a handler failure and
/// goes through the retry policy.
#[async_trait]
pub trait Binder<A>: Send + Sync + 'static {
    async fn load(&self, conn: &mut SqliteConnection, task: &Task) -> Result<A, HandlerError>;

    async fn unload(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        value: A,
    ) -> Result<(), HandlerError>;
}

/// Object-safe face of a `Binder<A>` with `A` erased, so the dispatcher can
/// hold binders for arbitrary attachment types in one map.
#[async_trait]
pub(crate) trait ErasedBinder: Send + Sync {
    async fn load(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
    ) -> Result<BoxedAttachment, HandlerError>;

    async fn unload(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        value: BoxedAttachment,
    ) -> Result<(), HandlerError>;
}

struct TypedBinder<A, B> {
    binder: B,
    _attachment: PhantomData<fn() -> A>,
}

#[async_trait]
impl<A, B> ErasedBinder for TypedBinder<A, B>
where
    A: Send + 'static,
    B: Binder<A>,
{
    async fn load(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
    ) -> Result<BoxedAttachment, HandlerError> {
        let value = self.binder.load(conn, task).await?;
        Ok(Box::new(value))
    }

    async fn unload(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        value: BoxedAttachment,
    ) -> Result<(), HandlerError> {
        match value.downcast::<A>() {
            Ok(value) => self.binder.unload(conn, task, *value).await,
            Err(_) => Err(HandlerError::new(
                "AttachmentMismatch",
                "attachment returned by the handler had an unexpected type",
            )),
        }
    }
}

/// Binders keyed by the attachment's `TypeId`. Filled while wiring, frozen
/// behind an `Arc` once the engine starts.
#[derive(Default)]
pub(crate) struct BinderRegistry {
    binders: HashMap<TypeId, Arc<dyn ErasedBinder>>,
}

impl BinderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<A, B>(&mut self, binder: B) -> Result<(), ConfigError>
    where
        A: Send + 'static,
        B: Binder<A>,
    {
        let type_id = TypeId::of::<A>();
        if self.binders.contains_key(&type_id) {
            return Err(ConfigError::DuplicateBinder {
                type_name: std::any::type_name::<A>(),
            });
        }
        self.binders.insert(
            type_id,
            Arc::new(TypedBinder {
                binder,
                _attachment: PhantomData::<fn() -> A>,
            }),
        );
        Ok(())
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.binders.contains_key(&type_id)
    }

    pub fn get(&self, type_id: TypeId) -> Option<Arc<dyn ErasedBinder>> {
        self.binders.get(&type_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    #[derive(Debug, PartialEq)]
    struct Note(String);

    struct NoteBinder;

    #[async_trait]
    impl Binder<Note> for NoteBinder {
        async fn load(
            &self,
            _conn: &mut SqliteConnection,
            task: &Task,
        ) -> Result<Note, HandlerError> {
            Ok(Note(format!("for task {}", task.id)))
        }

        async fn unload(
            &self,
            _conn: &mut SqliteConnection,
            _task: &Task,
            value: Note,
        ) -> Result<(), HandlerError> {
            if value.0.is_empty() {
                return Err(HandlerError::msg("empty note"));
            }
            Ok(())
        }
    }

    async fn connection() -> SqliteConnection {
        SqliteConnection::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn erased_binder_round_trips_the_value() {
        let mut registry = BinderRegistry::new();
        registry.bind::<Note, _>(NoteBinder).unwrap();

        let binder = registry.get(TypeId::of::<Note>()).unwrap();
        let task = Task::new_for_tests(7, "A");
        let mut conn = connection().await;

        let boxed = binder.load(&mut conn, &task).await.unwrap();
        let note = boxed.downcast_ref::<Note>().unwrap();
        assert_eq!(note, &Note("for task 7".to_string()));

        let boxed = binder.load(&mut conn, &task).await.unwrap();
        binder.unload(&mut conn, &task, boxed).await.unwrap();
    }

    #[tokio::test]
    async fn unload_rejects_a_foreign_type() {
        let mut registry = BinderRegistry::new();
        registry.bind::<Note, _>(NoteBinder).unwrap();

        let binder = registry.get(TypeId::of::<Note>()).unwrap();
        let task = Task::new_for_tests(7, "A");
        let mut conn = connection().await;

        let err = binder
            .unload(&mut conn, &task, Box::new(42_u32))
            .await
            .unwrap_err();
        assert_eq!(err.exception_type(), "AttachmentMismatch");
    }

    #[test]
    fn binding_twice_is_rejected() {
        let mut registry = BinderRegistry::new();
        registry.bind::<Note, _>(NoteBinder).unwrap();
        assert!(matches!(
            registry.bind::<Note, _>(NoteBinder),
            Err(ConfigError::DuplicateBinder { .. })
        ));
        assert!(registry.contains(TypeId::of::<Note>()));
        assert!(!registry.contains(TypeId::of::<u32>()));
    }
}
