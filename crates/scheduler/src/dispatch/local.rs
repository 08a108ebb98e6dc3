//! In-process dispatch over a bounded tokio channel

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{DispatchChannel, DispatchError, DispatchReceipt, ResultSender};
use crate::model::ClaimedTask;

/// A task as seen by a local worker
#[derive(Debug)]
pub struct DispatchedTask {
    pub task: ClaimedTask,
    pub reply: ResultSender,
}

/// Scheduler side of the in-process channel
///
/// Never blocks: a full queue rejects the task so the scheduler can release
/// the claim and move on.
#[derive(Clone)]
pub struct LocalDispatchChannel {
    tx: mpsc::Sender<DispatchedTask>,
}

impl LocalDispatchChannel {
    /// Create a channel holding at most `capacity` undelivered tasks
    pub fn new(capacity: usize) -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self { tx },
            DispatchQueue {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

#[async_trait]
impl DispatchChannel for LocalDispatchChannel {
    async fn dispatch(&self, task: ClaimedTask) -> Result<DispatchReceipt, DispatchError> {
        let (receipt, reply) = DispatchReceipt::pair(task.id, task.attempt);
        let task_id = task.id;

        self.tx
            .try_send(DispatchedTask { task, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    DispatchError::Rejected("local dispatch queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            })?;

        debug!(%task_id, "dispatched task locally");
        Ok(receipt)
    }
}

/// Worker side of the in-process channel, shareable between workers
#[derive(Clone)]
pub struct DispatchQueue {
    rx: Arc<Mutex<mpsc::Receiver<DispatchedTask>>>,
}

impl DispatchQueue {
    /// Next task, or `None` once every channel handle is gone
    pub async fn recv(&self) -> Option<DispatchedTask> {
        self.rx.lock().await.recv().await
    }
}
