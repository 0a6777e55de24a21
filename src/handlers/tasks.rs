//! Task sync from the mobile app.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{DomainEvent, Envelope, EventHandler, HandlerError, TaskOperation};

/// Simulated storage write per operation.
pub const DEFAULT_STORE_DELAY: Duration = Duration::from_millis(100);
/// Simulated follow-up work after every task message.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Messages with an operation this build does not know.
    pub ignored: u64,
}

/// Applies task create/update/delete operations.
pub struct TaskHandler {
    store_delay: Duration,
    settle_delay: Duration,
    stats: Arc<watch::Sender<TaskStats>>,
}

impl Default for TaskHandler {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_DELAY, DEFAULT_SETTLE_DELAY)
    }
}

impl TaskHandler {
    pub fn new(store_delay: Duration, settle_delay: Duration) -> Self {
        let (stats, _) = watch::channel(TaskStats::default());
        Self {
            store_delay,
            settle_delay,
            stats: Arc::new(stats),
        }
    }

    pub fn snapshot(&self) -> TaskStats {
        *self.stats.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStats> {
        self.stats.subscribe()
    }
}

impl EventHandler for TaskHandler {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let store_delay = self.store_delay;
        let settle_delay = self.settle_delay;
        let stats = self.stats.clone();

        Box::pin(async move {
            let DomainEvent::TaskSync(sync) = &envelope.event else {
                debug!(event_type = envelope.event_type(), "Skipping non-task event");
                return Ok(());
            };
            let task = &sync.task;

            info!(
                task_id = %task.id,
                operation = sync.operation.as_str(),
                source = sync.source.as_deref().unwrap_or("unknown"),
                "Task sync received"
            );

            match sync.operation {
                TaskOperation::Create => {
                    tokio::time::sleep(store_delay).await;
                    stats.send_modify(|s| s.created += 1);
                    info!(task_id = %task.id, title = %task.title, "Task created");
                }
                TaskOperation::Update => {
                    tokio::time::sleep(store_delay).await;
                    stats.send_modify(|s| s.updated += 1);
                    info!(
                        task_id = %task.id,
                        completed = task.completed,
                        "Task updated"
                    );
                }
                TaskOperation::Delete => {
                    tokio::time::sleep(store_delay).await;
                    stats.send_modify(|s| s.deleted += 1);
                    info!(task_id = %task.id, "Task deleted");
                }
                TaskOperation::Other => {
                    stats.send_modify(|s| s.ignored += 1);
                    warn!(task_id = %task.id, "Unknown task operation");
                }
            }

            tokio::time::sleep(settle_delay).await;
            Ok(())
        })
    }
}
