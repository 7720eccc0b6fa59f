//! Orchestrator configuration
//!
//! Connection settings, bind address and the timing knobs of the two
//! background workers.

use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL; `None` selects the in-memory store
    pub database_url: Option<String>,

    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Delay before a single-agent step with no free agent is retried
    pub dispatch_retry: Duration,

    /// Delay before an event that raced its dispatch is looked at again
    pub event_retry: Duration,

    /// How many times such an event is requeued before it is dropped
    pub event_retry_limit: u32,

    /// Capacity of the dispatcher's input queue
    pub dispatch_queue_depth: usize,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(database_url: Option<String>) -> Self {
        Self {
            database_url,
            bind_addr: "0.0.0.0:8080".to_string(),
            dispatch_retry: Duration::from_secs(10),
            event_retry: Duration::from_millis(500),
            event_retry_limit: 120,
            dispatch_queue_depth: 1024,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (optional; unset selects the in-memory store)
    /// - KEEL_STORE (optional; `memory` forces the in-memory store)
    /// - ORCHESTRATOR_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - DISPATCH_RETRY_SECS (optional, default: 10)
    /// - EVENT_RETRY_MILLIS (optional, default: 500)
    /// - EVENT_RETRY_LIMIT (optional, default: 120)
    /// - DISPATCH_QUEUE_DEPTH (optional, default: 1024)
    pub fn from_env() -> Self {
        let memory_forced = std::env::var("KEEL_STORE")
            .map(|s| s.eq_ignore_ascii_case("memory"))
            .unwrap_or(false);

        let database_url = if memory_forced {
            None
        } else {
            std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty())
        };

        let defaults = Self::new(database_url);

        Self {
            bind_addr: std::env::var("ORCHESTRATOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            dispatch_retry: env_parse("DISPATCH_RETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dispatch_retry),
            event_retry: env_parse("EVENT_RETRY_MILLIS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.event_retry),
            event_retry_limit: env_parse("EVENT_RETRY_LIMIT").unwrap_or(defaults.event_retry_limit),
            dispatch_queue_depth: env_parse("DISPATCH_QUEUE_DEPTH")
                .unwrap_or(defaults.dispatch_queue_depth),
            ..defaults
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
            }
        }

        if self.dispatch_retry.is_zero() {
            anyhow::bail!("dispatch_retry must be greater than 0");
        }

        if self.dispatch_queue_depth == 0 {
            anyhow::bail!("dispatch_queue_depth must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(None)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
