//! Dispatch channel between schedulers and workers
//!
//! A [`DispatchChannel`] carries a claimed task to some worker and hands
//! back a [`DispatchReceipt`] that later resolves to the worker's
//! [`TaskReport`]. Delivery is at-least-once: a task whose result never
//! arrives is recovered by lease expiry and dispatched again.

mod local;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::model::{ClaimedTask, TaskReport};

pub use local::{DispatchQueue, DispatchedTask, LocalDispatchChannel};

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No worker is listening on the channel any more
    #[error("dispatch channel closed")]
    Closed,

    /// The channel refused the task (e.g. full)
    #[error("dispatch rejected: {0}")]
    Rejected(String),

    /// The worker went away without reporting
    #[error("result lost for task {0}")]
    ResultLost(Uuid),

    /// No result before the deadline
    #[error("timed out waiting for result of task {0}")]
    TimedOut(Uuid),
}

/// Carries claimed tasks to workers
#[async_trait]
pub trait DispatchChannel: Send + Sync + 'static {
    /// Hand a task to a worker
    ///
    /// `Ok` means the channel accepted the task; the result arrives through
    /// the receipt.
    async fn dispatch(&self, task: ClaimedTask) -> Result<DispatchReceipt, DispatchError>;
}

/// Pending result of one dispatched attempt
#[derive(Debug)]
pub struct DispatchReceipt {
    task_id: Uuid,
    attempt: u32,
    result: oneshot::Receiver<TaskReport>,
}

impl DispatchReceipt {
    /// A receipt and the sender the worker side reports through
    pub fn pair(task_id: Uuid, attempt: u32) -> (Self, ResultSender) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                task_id,
                attempt,
                result: rx,
            },
            ResultSender { tx },
        )
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Wait for the worker's report, at most `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<TaskReport, DispatchError> {
        match tokio::time::timeout(timeout, self.result).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(DispatchError::ResultLost(self.task_id)),
            Err(_) => Err(DispatchError::TimedOut(self.task_id)),
        }
    }
}

/// Worker side of a receipt
#[derive(Debug)]
pub struct ResultSender {
    tx: oneshot::Sender<TaskReport>,
}

impl ResultSender {
    /// Deliver the report. Returns false when nobody is waiting any more.
    pub fn send(self, report: TaskReport) -> bool {
        self.tx.send(report).is_ok()
    }

    /// True once the scheduler side stopped waiting
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receipt_resolves_to_report() {
        let task_id = Uuid::now_v7();
        let (receipt, sender) = DispatchReceipt::pair(task_id, 1);
        assert!(sender.send(TaskReport::done(serde_json::json!({"ok": true}))));

        let report = receipt.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.status, crate::model::ReportStatus::Done);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_result_lost() {
        let (receipt, sender) = DispatchReceipt::pair(Uuid::now_v7(), 1);
        drop(sender);
        assert!(matches!(
            receipt.wait(Duration::from_secs(1)).await,
            Err(DispatchError::ResultLost(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (receipt, _sender) = DispatchReceipt::pair(Uuid::now_v7(), 1);
        assert!(matches!(
            receipt.wait(Duration::from_secs(5)).await,
            Err(DispatchError::TimedOut(_))
        ));
    }
}
