//! Engine facade: configuration, registration, lifecycle and the operator
//! API.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binder::{Binder, BinderRegistry};
use crate::dispatcher::Dispatcher;
use crate::registry::{ConfigError, HandlerError, HandlerOptions, HandlerRegistry};
use crate::scheduler::Scheduler;
use crate::store::{StoreError, TaskStore};
use crate::task::Task;

/// Tuning knobs for the scheduler. The defaults suit a service that wants
/// second-level latency without hammering the database.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between polls of a queue with nothing due.
    pub idle_poll_interval: Duration,
    /// How often the queue set is re-read from the store.
    pub queues_reload_interval: Duration,
    /// Upper bound on a single handler invocation.
    pub advance_timeout: Duration,
    /// Polling workers per queue.
    pub max_workers_per_queue: usize,
    /// Concurrent attempts across all queues.
    pub max_workers_total: usize,
    /// How long `stop` waits for attempts in flight before dropping them.
    pub shutdown_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_secs(1),
            queues_reload_interval: Duration::from_secs(30),
            advance_timeout: Duration::from_secs(300),
            max_workers_per_queue: 1,
            max_workers_total: 8,
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

/// Anything `start` can fail with.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Phase {
    Building {
        registry: HandlerRegistry,
        binders: BinderRegistry,
    },
    Running {
        shutdown: CancellationToken,
        hard: CancellationToken,
        scheduler: JoinHandle<()>,
    },
    Stopped,
}

/// The public face of the task engine.
///
/// An engine is built in three steps: connect, register handlers and
/// binders, start. Once started the registries are frozen and the operator
/// API (insert, load, reload triggers) is all that remains.
pub struct Engine {
    store: Arc<TaskStore>,
    config: EngineConfig,
    task_wake: Arc<Notify>,
    queues_reload: Arc<Notify>,
    phase: Phase,
}

impl Engine {
    /// Connects with default tuning. See [`TaskStore::connect`] for the
    /// accepted URL forms.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Self::with_config(database_url, EngineConfig::default()).await
    }

    pub async fn with_config(database_url: &str, config: EngineConfig) -> Result<Self, StoreError> {
        let store = Arc::new(TaskStore::connect(database_url).await?);
        Ok(Self {
            store,
            config,
            task_wake: Arc::new(Notify::new()),
            queues_reload: Arc::new(Notify::new()),
            phase: Phase::Building {
                registry: HandlerRegistry::new(),
                binders: BinderRegistry::new(),
            },
        })
    }

    fn building(&mut self) -> Result<(&mut HandlerRegistry, &mut BinderRegistry), ConfigError> {
        match &mut self.phase {
            Phase::Building { registry, binders } => Ok((registry, binders)),
            _ => Err(ConfigError::AlreadyStarted),
        }
    }

    /// Registers a handler for one or more statuses.
    pub fn register<I, S, F, Fut>(
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
        let (registry, _) = self.building()?;
        registry.add(statuses, options, handler)
    }

    /// Registers a handler that works on a loaded attachment of type `A`.
    /// `start` refuses to run until a binder for `A` is registered too.
    pub fn register_with<A, I, S, F, Fut>(
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
        let (registry, _) = self.building()?;
        registry.add_with(statuses, options, handler)
    }

    /// Registers the loader/unloader pair for attachment type `A`.
    pub fn bind<A, B>(&mut self, binder: B) -> Result<(), ConfigError>
    where
        A: Send + 'static,
        B: Binder<A>,
    {
        let (_, binders) = self.building()?;
        binders.bind::<A, B>(binder)
    }

    /// Adds a hook that can enrich the extra JSON recorded with every
    /// failure log row.
    pub fn augment<F>(&mut self, augmenter: F) -> Result<(), ConfigError>
    where
        F: Fn(&Task, &HandlerError, &mut serde_json::Map<String, serde_json::Value>)
            + Send
            + Sync
            + 'static,
    {
        let (registry, _) = self.building()?;
        registry.add_augmenter(augmenter);
        Ok(())
    }

    /// Verifies the wiring, recovers claims left behind by a previous run,
    /// and spawns the scheduler. Calling `start` on a running engine is a
    /// no-op; a stopped engine cannot be restarted.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        match &self.phase {
            Phase::Running { .. } => return Ok(()),
            Phase::Stopped => return Err(ConfigError::Stopped.into()),
            Phase::Building { .. } => {}
        }
        let phase = std::mem::replace(&mut self.phase, Phase::Stopped);
        let Phase::Building { registry, binders } = phase else {
            return Err(ConfigError::Stopped.into());
        };

        if let Err(error) = verify_bindings(&registry, &binders) {
            self.phase = Phase::Building { registry, binders };
            return Err(error.into());
        }

        let recovered = match self.store.recover_in_progress().await {
            Ok(recovered) => recovered,
            Err(error) => {
                self.phase = Phase::Building { registry, binders };
                return Err(error.into());
            }
        };
        if recovered > 0 {
            warn!(tasks = recovered, "Recovered tasks left claimed by a previous run");
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.store),
            Arc::new(registry),
            Arc::new(binders),
            self.config.advance_timeout,
        ));
        let shutdown = CancellationToken::new();
        let hard = CancellationToken::new();
        let scheduler = Scheduler::new(
            dispatcher,
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.task_wake),
            Arc::clone(&self.queues_reload),
            shutdown.clone(),
            hard.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        self.phase = Phase::Running {
            shutdown,
            hard,
            scheduler: handle,
        };
        info!("Engine started");
        Ok(())
    }

    /// Stops claiming new work, waits up to the shutdown deadline for
    /// attempts in flight, then drops whatever is still running.
    pub async fn stop(&mut self) {
        if !matches!(self.phase, Phase::Running { .. }) {
            return;
        }
        let Phase::Running {
            shutdown,
            hard,
            mut scheduler,
        } = std::mem::replace(&mut self.phase, Phase::Stopped)
        else {
            return;
        };

        info!("Engine stopping");
        shutdown.cancel();
        if tokio::time::timeout(self.config.shutdown_deadline, &mut scheduler)
            .await
            .is_err()
        {
            warn!("Shutdown deadline exceeded, dropping attempts in flight");
            hard.cancel();
            if tokio::time::timeout(Duration::from_secs(1), &mut scheduler)
                .await
                .is_err()
            {
                scheduler.abort();
            }
        }
        info!("Engine stopped");
    }

    /// Blocks until ctrl-c, then runs a graceful stop.
    pub async fn wait_for_shutdown(&mut self) {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "Failed to listen for ctrl-c");
        }
        self.stop().await;
    }

    /// Creates a task in `status`, due immediately, and nudges the
    /// scheduler so a brand-new queue is picked up without waiting for the
    /// next reload.
    pub async fn insert(&self, status: &str) -> Result<Task, StoreError> {
        let task = self.store.insert(status).await?;
        info!(task_id = task.id, status = %status, "Task inserted");
        self.queues_reload.notify_one();
        self.task_wake.notify_waiters();
        Ok(task)
    }

    pub async fn load_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        self.store.load(id).await
    }

    /// Re-reads the queue set from the database right away. Use after
    /// inserting tasks with plain SQL from outside this process.
    pub fn trigger_queues_reload_from_db(&self) {
        self.queues_reload.notify_one();
    }

    /// Wakes idle workers so a task changed out-of-band is reconsidered
    /// without waiting for the next poll.
    pub fn trigger_task_reload_from_db(&self, id: i64) {
        debug!(task_id = id, "Task reload requested");
        self.task_wake.notify_waiters();
        self.queues_reload.notify_one();
    }

    /// Read access to the store, for log read-backs and surrounding glue.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }
}

fn verify_bindings(registry: &HandlerRegistry, binders: &BinderRegistry) -> Result<(), ConfigError> {
    for (status, entry) in registry.entries() {
        if let Some(key) = entry.attachment {
            if !binders.contains(key.type_id) {
                return Err(ConfigError::MissingBinder {
                    status: status.to_string(),
                    type_name: key.type_name,
                });
            }
        }
    }
    Ok(())
}
