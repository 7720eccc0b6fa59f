//! Execution queue and worker

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_core::dto::job::ExecutionRequest;

use crate::service::{CancelRegistry, Executor};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("job runner {0} is already accepted")]
    Duplicate(i64),

    #[error("execution queue is full")]
    Full,

    #[error("execution worker stopped")]
    Stopped,
}

/// Sending side of the execution queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<ExecutionRequest>,
    cancels: CancelRegistry,
}

impl JobQueue {
    /// Create the queue; `depth` requests may wait behind the running one
    pub fn new(depth: usize, cancels: CancelRegistry) -> (Self, mpsc::Receiver<ExecutionRequest>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx, cancels }, rx)
    }

    /// Accept a request without waiting
    ///
    /// Its cancellation handle is registered before it is queued, so a
    /// cancel arriving while it waits is honoured when it starts.
    pub fn submit(&self, req: ExecutionRequest) -> Result<(), SubmitError> {
        let id = req.job_runner.id;
        if self.cancels.register(id).is_none() {
            return Err(SubmitError::Duplicate(id));
        }

        match self.tx.try_send(req) {
            Ok(()) => {
                info!("Job runner {} accepted", id);
                Ok(())
            }
            Err(e) => {
                self.cancels.remove(id);
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => SubmitError::Full,
                    mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
                })
            }
        }
    }
}

pub struct Worker {
    executor: Executor,
    cancels: CancelRegistry,
}

impl Worker {
    pub fn new(executor: Executor, cancels: CancelRegistry) -> Self {
        Self { executor, cancels }
    }

    /// Run queued requests one at a time until the queue closes
    pub async fn run(self, mut rx: mpsc::Receiver<ExecutionRequest>) {
        info!("Execution worker started");

        while let Some(req) = rx.recv().await {
            let id = req.job_runner.id;
            let cancel = self.cancels.get(id).unwrap_or_else(|| {
                warn!("Job runner {} has no cancellation handle", id);
                CancellationToken::new()
            });

            self.executor.execute(&req, &cancel).await;
            self.cancels.remove(id);
        }

        info!("Execution worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use keel_core::dto::job::{JobSnapshot, StepSnapshot};

    use crate::checkout::Checkout;
    use crate::service::outbox::tests::{RecordingTransport, eventually};
    use crate::service::{Outbox, OutboxConfig};

    fn request(id: i64, commands: &[&str]) -> ExecutionRequest {
        ExecutionRequest {
            job: JobSnapshot {
                id: 1,
                tag: "1".to_string(),
                envs: BTreeMap::new(),
            },
            pipeline_id: 1,
            git: None,
            job_runner: StepSnapshot {
                id,
                commands: commands.iter().map(|c| c.to_string()).collect(),
            },
            runner_id: 2,
        }
    }

    #[test]
    fn test_submit_rejects_duplicates_and_overflow() {
        let cancels = CancelRegistry::new();
        let (queue, _rx) = JobQueue::new(1, cancels.clone());

        assert_eq!(queue.submit(request(1, &["true"])), Ok(()));
        assert_eq!(
            queue.submit(request(1, &["true"])),
            Err(SubmitError::Duplicate(1))
        );
        assert_eq!(queue.submit(request(2, &["true"])), Err(SubmitError::Full));

        // The rejected request leaves no handle behind
        assert!(cancels.get(2).is_none());
        assert!(cancels.get(1).is_some());
    }

    #[tokio::test]
    async fn test_worker_runs_in_order_and_honours_queued_cancel() {
        let transport = Arc::new(RecordingTransport::default());
        let outbox = Outbox::start(
            transport.clone(),
            OutboxConfig {
                capacity: 64,
                event_attempts: 1,
                backoff: Duration::from_millis(1),
            },
        );
        let workspace = tempfile::tempdir().unwrap();
        let cancels = CancelRegistry::new();
        let executor = Executor::new("r1", Checkout::new(workspace.path()), outbox);
        let (queue, rx) = JobQueue::new(5, cancels.clone());

        queue.submit(request(1, &["sleep 0.2"])).unwrap();
        queue.submit(request(2, &["echo second"])).unwrap();
        assert!(cancels.cancel(2));

        tokio::spawn(Worker::new(executor, cancels.clone()).run(rx));

        assert!(eventually(|| transport.events().len() == 2).await);
        let events = transport.events();
        assert_eq!(events[0].0, 1);
        assert!(events[0].1.success);
        assert_eq!(events[1].0, 2);
        assert_eq!(events[1].1.message, "[r1] job interrupted");

        assert!(eventually(|| cancels.get(1).is_none() && cancels.get(2).is_none()).await);
    }
}
