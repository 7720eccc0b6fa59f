//! Completion Aggregator
//!
//! Consumes completion events from agents, one at a time. Each event frees
//! the agents of its job runner, is counted once per reporting agent, and
//! the last expected event finalizes the row. A finalized success chains to
//! the next automatic step; anything else hands the freed agents to queued
//! work instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use keel_core::domain::job_runner::{JobRunner, JobRunnerStatus};
use keel_core::domain::pipeline::Trigger;
use keel_core::domain::runner::Runner;
use keel_core::dto::event::CompletionEvent;

use crate::repository::{EventRecord, Store, StoreError};
use crate::scheduler::dispatcher::DispatchHandle;

/// A completion event waiting to be processed
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub job_runner_id: i64,
    pub event: CompletionEvent,
    /// How many times this event was put back because it beat its dispatch
    pub attempt: u32,
}

/// Sending side of the aggregator queue
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl AggregatorHandle {
    pub fn submit(&self, job_runner_id: i64, event: CompletionEvent) {
        self.send(EventEnvelope {
            job_runner_id,
            event,
            attempt: 0,
        });
    }

    fn send(&self, envelope: EventEnvelope) {
        let id = envelope.job_runner_id;
        if self.tx.send(envelope).is_err() {
            warn!("Aggregator stopped; event for job runner {} dropped", id);
        }
    }
}

/// Create the aggregator queue
pub fn channel() -> (AggregatorHandle, mpsc::UnboundedReceiver<EventEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AggregatorHandle { tx }, rx)
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// Unknown job runner, or requeue limit reached
    Dropped,

    /// Arrived before the dispatch was recorded; will be looked at again
    Requeued,

    /// Job runner already terminal, or the reporter was not assigned
    Ignored,

    /// Same agent reported twice
    Duplicate,

    /// Counted; other agents still have to report
    Counted,

    /// Counted and finalized
    Finalized {
        status: JobRunnerStatus,
        /// Next step that was queued, if any
        chained: Option<i64>,
        /// Queued job runners handed to the dispatcher for the freed agents
        redispatched: Vec<i64>,
    },
}

pub struct Aggregator {
    store: Arc<dyn Store>,
    dispatcher: DispatchHandle,
    handle: AggregatorHandle,
    retry_delay: Duration,
    retry_limit: u32,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: DispatchHandle,
        handle: AggregatorHandle,
        retry_delay: Duration,
        retry_limit: u32,
    ) -> Self {
        Self {
            store,
            dispatcher,
            handle,
            retry_delay,
            retry_limit,
        }
    }

    /// Worker loop; never exits on an event error
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<EventEnvelope>) {
        info!("Aggregator started");

        while let Some(envelope) = rx.recv().await {
            let id = envelope.job_runner_id;
            match self.process(envelope).await {
                Ok(outcome) => debug!("Event for job runner {}: {:?}", id, outcome),
                Err(e) => error!("Failed to process event for job runner {}: {}", id, e),
            }
        }

        info!("Aggregator stopped");
    }

    pub async fn process(&self, envelope: EventEnvelope) -> Result<AggregateOutcome, StoreError> {
        let id = envelope.job_runner_id;

        let Some(job_runner) = self.store.get_job_runner(id).await? else {
            warn!("Event for unknown job runner {}", id);
            return Ok(AggregateOutcome::Dropped);
        };

        if job_runner.status.is_terminal() {
            info!(
                "Ignoring event for job runner {}: already {}",
                id, job_runner.status
            );
            return Ok(AggregateOutcome::Ignored);
        }

        if job_runner.assign_runner_ids.is_empty() {
            return Ok(self.requeue(envelope));
        }

        let freed = self.release_assigned(&job_runner).await?;

        let event = &envelope.event;
        let record = self
            .store
            .record_event(id, event.runner_id, event.success, &event.message)
            .await?;

        match record {
            EventRecord::Ignored(status) => {
                info!("Ignoring event for job runner {}: now {}", id, status);
                Ok(AggregateOutcome::Ignored)
            }
            EventRecord::Unassigned => {
                warn!(
                    "Job runner {} got an event from unassigned runner {:?}",
                    id, event.runner_id
                );
                Ok(AggregateOutcome::Ignored)
            }
            EventRecord::Duplicate => {
                debug!(
                    "Duplicate event for job runner {} from runner {:?}",
                    id, event.runner_id
                );
                Ok(AggregateOutcome::Duplicate)
            }
            EventRecord::Counted {
                finalized: None, ..
            } => Ok(AggregateOutcome::Counted),
            EventRecord::Counted {
                job_runner,
                finalized: Some(status),
            } => {
                info!("Job runner {} finished: {}", id, status);

                let chained = if status == JobRunnerStatus::Success {
                    self.chain_next(&job_runner).await?
                } else {
                    None
                };

                let redispatched = if chained.is_none() {
                    self.redispatch_queued(&freed).await?
                } else {
                    Vec::new()
                };

                Ok(AggregateOutcome::Finalized {
                    status,
                    chained,
                    redispatched,
                })
            }
        }
    }

    /// Put an early event back on the queue after a delay
    fn requeue(&self, envelope: EventEnvelope) -> AggregateOutcome {
        if envelope.attempt >= self.retry_limit {
            warn!(
                "Dropping event for job runner {}: still unassigned after {} attempts",
                envelope.job_runner_id, envelope.attempt
            );
            return AggregateOutcome::Dropped;
        }

        debug!(
            "Job runner {} has no assignment yet; requeueing event",
            envelope.job_runner_id
        );

        let handle = self.handle.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.send(EventEnvelope {
                attempt: envelope.attempt + 1,
                ..envelope
            });
        });

        AggregateOutcome::Requeued
    }

    /// Clear the soft lock of every assigned agent
    async fn release_assigned(&self, job_runner: &JobRunner) -> Result<Vec<Runner>, StoreError> {
        let mut freed = Vec::new();

        for runner_id in &job_runner.assign_runner_ids {
            if self.store.release_runner(*runner_id).await? {
                if let Some(runner) = self.store.get_runner(*runner_id).await? {
                    freed.push(runner);
                }
            }
        }

        Ok(freed)
    }

    /// Queue the next pending step of the job if it starts automatically
    async fn chain_next(&self, job_runner: &JobRunner) -> Result<Option<i64>, StoreError> {
        let Some(next) = self.store.next_pending_after(job_runner).await? else {
            debug!("Job {} has no further pending steps", job_runner.job_id);
            return Ok(None);
        };

        if next.trigger == Trigger::Manual {
            info!(
                "Job runner {} waits for a manual start",
                next.id
            );
            return Ok(None);
        }

        if !self
            .store
            .transition_job_runner(next.id, JobRunnerStatus::Queueing, None)
            .await?
        {
            return Ok(None);
        }

        info!("Job runner {} queued after {}", next.id, job_runner.id);
        self.dispatcher.enqueue(next.id).await;

        Ok(Some(next.id))
    }

    /// Hand queued work the freed agents can take to the dispatcher
    async fn redispatch_queued(&self, freed: &[Runner]) -> Result<Vec<i64>, StoreError> {
        let labels: HashSet<&str> = freed
            .iter()
            .filter(|r| r.is_available())
            .flat_map(|r| r.labels.iter().map(String::as_str))
            .collect();

        if labels.is_empty() {
            return Ok(Vec::new());
        }

        let mut redispatched = Vec::new();
        for queued in self.store.queueing_job_runners().await? {
            let Some(step) = self.store.get_step(queued.step_id).await? else {
                continue;
            };

            if labels.contains(step.runner_label.as_str()) {
                self.dispatcher.enqueue(queued.id).await;
                redispatched.push(queued.id);
            }
        }

        if !redispatched.is_empty() {
            debug!("Freed runners picked up {} queued job runner(s)", redispatched.len());
        }

        Ok(redispatched)
    }
}
