//! Delivery outbox
//!
//! Completion events and log lines leave the agent through two bounded
//! queues, each drained by its own task. Enqueueing never blocks an
//! execution: when a queue is full the item is dropped with a warning.
//! Events are retried with doubling backoff; log lines get one attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use keel_client::{ClientError, OrchestratorClient};
use keel_core::dto::event::CompletionEvent;

/// Where events and log lines are delivered
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send_event(&self, job_runner_id: i64, event: &CompletionEvent)
    -> Result<(), ClientError>;

    async fn send_log(&self, job_runner_id: i64, line: &str) -> Result<(), ClientError>;
}

#[async_trait]
impl EventTransport for OrchestratorClient {
    async fn send_event(
        &self,
        job_runner_id: i64,
        event: &CompletionEvent,
    ) -> Result<(), ClientError> {
        OrchestratorClient::send_event(self, job_runner_id, event).await
    }

    async fn send_log(&self, job_runner_id: i64, line: &str) -> Result<(), ClientError> {
        OrchestratorClient::send_log(self, job_runner_id, line).await
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub capacity: usize,
    pub event_attempts: u32,
    /// Delay before the first event retry; doubled after each failure
    pub backoff: Duration,
}

impl OutboxConfig {
    pub fn new(capacity: usize, event_attempts: u32) -> Self {
        Self {
            capacity,
            event_attempts,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Sending side of the delivery queues
#[derive(Debug, Clone)]
pub struct Outbox {
    events: mpsc::Sender<(i64, CompletionEvent)>,
    logs: mpsc::Sender<(i64, String)>,
}

struct Receivers {
    events: mpsc::Receiver<(i64, CompletionEvent)>,
    logs: mpsc::Receiver<(i64, String)>,
}

impl Outbox {
    /// Create the queues and spawn their delivery tasks
    pub fn start(transport: Arc<dyn EventTransport>, config: OutboxConfig) -> Self {
        let (outbox, rx) = Self::channels(config.capacity);

        tokio::spawn(deliver_events(
            transport.clone(),
            rx.events,
            config.event_attempts,
            config.backoff,
        ));
        tokio::spawn(deliver_logs(transport, rx.logs));

        outbox
    }

    fn channels(capacity: usize) -> (Self, Receivers) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (log_tx, log_rx) = mpsc::channel(capacity);
        (
            Self {
                events: event_tx,
                logs: log_tx,
            },
            Receivers {
                events: event_rx,
                logs: log_rx,
            },
        )
    }

    /// Queue a completion event; false if it was dropped
    pub fn event(&self, job_runner_id: i64, event: CompletionEvent) -> bool {
        match self.events.try_send((job_runner_id, event)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Event for job runner {} dropped: {}", job_runner_id, e);
                false
            }
        }
    }

    /// Queue a log line; false if it was dropped
    pub fn log(&self, job_runner_id: i64, line: String) -> bool {
        match self.logs.try_send((job_runner_id, line)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Log line for job runner {} dropped: {}", job_runner_id, e);
                false
            }
        }
    }
}

async fn deliver_events(
    transport: Arc<dyn EventTransport>,
    mut rx: mpsc::Receiver<(i64, CompletionEvent)>,
    attempts: u32,
    backoff: Duration,
) {
    while let Some((id, event)) = rx.recv().await {
        let mut delay = backoff;
        for attempt in 1..=attempts {
            match transport.send_event(id, &event).await {
                Ok(()) => {
                    debug!("Event for job runner {} delivered", id);
                    break;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Event for job runner {} failed (attempt {}/{}): {}",
                        id, attempt, attempts, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => error!(
                    "Event for job runner {} lost after {} attempts: {}",
                    id, attempts, e
                ),
            }
        }
    }
}

async fn deliver_logs(transport: Arc<dyn EventTransport>, mut rx: mpsc::Receiver<(i64, String)>) {
    while let Some((id, line)) = rx.recv().await {
        if let Err(e) = transport.send_log(id, &line).await {
            warn!("Log line for job runner {} not delivered: {}", id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Transport that records deliveries and fails the first few events
    #[derive(Default)]
    pub struct RecordingTransport {
        pub failures_left: Mutex<u32>,
        pub event_calls: Mutex<u32>,
        pub events: Mutex<Vec<(i64, CompletionEvent)>>,
        pub logs: Mutex<Vec<(i64, String)>>,
    }

    impl RecordingTransport {
        pub fn failing(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                ..Default::default()
            }
        }

        pub fn events(&self) -> Vec<(i64, CompletionEvent)> {
            self.events.lock().unwrap().clone()
        }

        pub fn logs(&self) -> Vec<(i64, String)> {
            self.logs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventTransport for RecordingTransport {
        async fn send_event(
            &self,
            job_runner_id: i64,
            event: &CompletionEvent,
        ) -> Result<(), ClientError> {
            *self.event_calls.lock().unwrap() += 1;
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ClientError::api_error(503, "unavailable"));
            }
            self.events
                .lock()
                .unwrap()
                .push((job_runner_id, event.clone()));
            Ok(())
        }

        async fn send_log(&self, job_runner_id: i64, line: &str) -> Result<(), ClientError> {
            self.logs
                .lock()
                .unwrap()
                .push((job_runner_id, line.to_string()));
            Ok(())
        }
    }

    /// Poll `check` until it holds or a few seconds pass
    pub async fn eventually(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn config(attempts: u32) -> OutboxConfig {
        OutboxConfig {
            capacity: 16,
            event_attempts: attempts,
            backoff: Duration::from_millis(1),
        }
    }

    fn done() -> CompletionEvent {
        CompletionEvent {
            success: true,
            message: String::new(),
            runner_id: Some(3),
        }
    }

    #[tokio::test]
    async fn test_event_retried_until_delivered() {
        let transport = Arc::new(RecordingTransport::failing(2));
        let outbox = Outbox::start(transport.clone(), config(3));

        assert!(outbox.event(9, done()));
        assert!(eventually(|| transport.events().len() == 1).await);
        assert_eq!(*transport.event_calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_event_dropped_after_attempts() {
        let transport = Arc::new(RecordingTransport::failing(10));
        let outbox = Outbox::start(transport.clone(), config(3));

        outbox.event(9, done());
        assert!(eventually(|| *transport.event_calls.lock().unwrap() == 3).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*transport.event_calls.lock().unwrap(), 3);
        assert!(transport.events().is_empty());
    }

    #[tokio::test]
    async fn test_logs_delivered_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let outbox = Outbox::start(transport.clone(), config(1));

        outbox.log(1, "a".to_string());
        outbox.log(1, "b".to_string());

        assert!(eventually(|| transport.logs().len() == 2).await);
        assert_eq!(
            transport.logs(),
            vec![(1, "a".to_string()), (1, "b".to_string())]
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (outbox, _rx) = Outbox::channels(1);

        assert!(outbox.log(1, "kept".to_string()));
        assert!(!outbox.log(1, "dropped".to_string()));
        assert!(outbox.event(1, done()));
        assert!(!outbox.event(1, done()));
    }
}
