//! Cancellation handles of accepted executions
//!
//! A handle is registered when a request is accepted and removed once its
//! execution has reported, so a cancel can reach a step that is still
//! waiting in the queue as well as one that is running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a fresh handle; `None` when `id` already has one
    pub fn register(&self, job_runner_id: i64) -> Option<CancellationToken> {
        let mut tokens = self.lock();
        if tokens.contains_key(&job_runner_id) {
            return None;
        }
        let token = CancellationToken::new();
        tokens.insert(job_runner_id, token.clone());
        Some(token)
    }

    pub fn get(&self, job_runner_id: i64) -> Option<CancellationToken> {
        self.lock().get(&job_runner_id).cloned()
    }

    /// Signal the handle of `id`; false when it is unknown
    pub fn cancel(&self, job_runner_id: i64) -> bool {
        match self.lock().get(&job_runner_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_runner_id: i64) {
        self.lock().remove(&job_runner_id);
    }
}
