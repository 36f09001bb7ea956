//! Dispatch queue consumer.
//!
//! Pops job ids from the Redis queue and dispatches each in its own task,
//! with at most `concurrency` dispatches in flight. Recipients within a job
//! are still sent sequentially by the dispatcher.
//!
//! On shutdown the consumer stops popping and waits for every in-flight
//! dispatch to persist its job before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use relay_dispatcher::NotificationDispatcher;
use relay_dispatcher::queue::TaskQueue;

const POP_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct QueueConsumer {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<NotificationDispatcher>,
    permits: Arc<Semaphore>,
    block_secs: u64,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<NotificationDispatcher>,
        concurrency: usize,
        block_secs: u64,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            block_secs,
        }
    }

    /// Consume the queue until `shutdown` turns true, then drain.
    ///
    /// A pop already waiting when shutdown is signalled finishes first, so
    /// stopping takes up to `block_secs`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            concurrency = self.permits.available_permits(),
            "Dispatch queue consumer started"
        );

        let mut tasks = JoinSet::new();

        while !*shutdown.borrow_and_update() {
            // Take a slot before popping so tasks stay queued while we are busy
            let permit = Arc::clone(&self.permits).acquire_owned().await?;

            match self.queue.pop(self.block_secs).await {
                Ok(Some(job_id)) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tasks.spawn(async move {
                        let outcome = dispatcher.dispatch(job_id).await;
                        tracing::debug!(job_id = %job_id, outcome = ?outcome, "Dispatch task finished");
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to pop dispatch task, retrying...");
                    tokio::time::sleep(POP_RETRY_DELAY).await;
                }
            }

            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }
        }

        tracing::info!(in_flight = tasks.len(), "Draining dispatch tasks");
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }

        tracing::info!("Dispatch queue consumer stopped");
        Ok(())
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Dispatch task panicked");
    }
}
