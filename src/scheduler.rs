//! Per-queue worker loops and the queue-set supervisor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatcher::{Advance, DispatchError, Dispatcher};
use crate::engine::EngineConfig;
use crate::store::{StoreError, TaskStore};

struct QueueWorkers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the worker map and reconciles it against the queues found in the
/// store: at startup, every `queues_reload_interval`, and whenever an
/// operator trigger fires.
pub(crate) struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    store: Arc<TaskStore>,
    config: EngineConfig,
    workers_total: Arc<Semaphore>,
    task_wake: Arc<Notify>,
    queues_reload: Arc<Notify>,
    shutdown: CancellationToken,
    hard: CancellationToken,
}

impl Scheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<TaskStore>,
        config: EngineConfig,
        task_wake: Arc<Notify>,
        queues_reload: Arc<Notify>,
        shutdown: CancellationToken,
        hard: CancellationToken,
    ) -> Self {
        let workers_total = Arc::new(Semaphore::new(config.max_workers_total.max(1)));
        Self {
            dispatcher,
            store,
            config,
            workers_total,
            task_wake,
            queues_reload,
            shutdown,
            hard,
        }
    }

    pub async fn run(self) {
        info!("Scheduler started");
        let mut queues: HashMap<String, QueueWorkers> = HashMap::new();
        let mut retired: Vec<JoinHandle<()>> = Vec::new();

        loop {
            if let Err(error) = self.reconcile(&mut queues, &mut retired).await {
                error!(error = %error, "Failed to reload the queue set");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.queues_reload.notified() => {}
                _ = tokio::time::sleep(self.config.queues_reload_interval) => {}
            }
        }

        debug!("Draining workers");
        for (_, workers) in queues.drain() {
            for handle in workers.handles {
                let _ = handle.await;
            }
        }
        for handle in retired {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }

    async fn reconcile(
        &self,
        queues: &mut HashMap<String, QueueWorkers>,
        retired: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), StoreError> {
        // Queues come and go with every drained status, so retired workers
        // accumulate; reap the ones that have already stopped.
        retired.retain(|handle| !handle.is_finished());

        let live: HashSet<String> = self.store.distinct_queues().await?.into_iter().collect();

        let gone: Vec<String> = queues
            .keys()
            .filter(|queue| !live.contains(queue.as_str()))
            .cloned()
            .collect();
        for queue in gone {
            if let Some(workers) = queues.remove(&queue) {
                debug!(queue = %queue, "Queue drained, stopping its workers");
                workers.token.cancel();
                retired.extend(workers.handles);
            }
        }

        for queue in live {
            if !queues.contains_key(&queue) {
                let workers = self.start_queue(&queue);
                queues.insert(queue, workers);
            }
        }
        Ok(())
    }

    fn start_queue(&self, queue: &str) -> QueueWorkers {
        let token = self.shutdown.child_token();
        let slots = self.config.max_workers_per_queue.max(1);
        let mut handles = Vec::new();
        for slot in 0..slots {
            let worker = Worker {
                dispatcher: Arc::clone(&self.dispatcher),
                queue: queue.to_string(),
                slot,
                idle_poll_interval: self.config.idle_poll_interval,
                workers_total: Arc::clone(&self.workers_total),
                task_wake: Arc::clone(&self.task_wake),
            };
            let shutdown = token.clone();
            let hard = self.hard.clone();
            handles.push(tokio::spawn(async move {
                worker.run(shutdown, hard).await;
            }));
        }
        info!(queue = %queue, workers = slots, "Queue workers started");
        QueueWorkers { token, handles }
    }
}

/// One polling loop bound to a single queue slot.
struct Worker {
    dispatcher: Arc<Dispatcher>,
    queue: String,
    slot: usize,
    idle_poll_interval: Duration,
    workers_total: Arc<Semaphore>,
    task_wake: Arc<Notify>,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken, hard: CancellationToken) {
        debug!(queue = %self.queue, slot = self.slot, "Worker started");

        loop {
            // wait for a slot under the global concurrency cap
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.workers_total.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // a soft shutdown lets the attempt in flight finish; only the
            // hard token drops it
            let outcome = tokio::select! {
                _ = hard.cancelled() => break,
                outcome = self.dispatcher.advance(&self.queue) => outcome,
            };
            drop(permit);

            let pause = match outcome {
                Ok(Advance::Advanced) | Ok(Advance::Deferred) => None,
                Ok(Advance::Idle) | Ok(Advance::Unhandled) => Some(self.idle_poll_interval),
                Err(DispatchError::Fatal {
                    task_id,
                    status,
                    error,
                }) => {
                    error!(
                        task_id,
                        status = %status,
                        error = %error,
                        "Task failed with no retry policy and stays claimed"
                    );
                    None
                }
                Err(DispatchError::Store(error)) => {
                    error!(queue = %self.queue, error = %error, "Dispatch failed");
                    Some(self.idle_poll_interval)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.task_wake.notified() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        debug!(queue = %self.queue, slot = self.slot, "Worker stopped");
    }
}
