//! Runner configuration
//!
//! Identity advertised to the orchestrator, where the agent listens, where
//! checkouts live and the sizes of the execution and delivery queues.

use std::path::PathBuf;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name this agent registers under; also prefixes every log line
    pub name: String,

    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// URL the orchestrator uses to reach this agent
    pub endpoint: String,

    /// Address the agent's HTTP server binds to
    pub bind_addr: String,

    /// Capability labels matched against step runner labels
    pub labels: Vec<String>,

    pub ip: Option<String>,

    /// Root under which pipeline checkouts are kept
    pub workspace_dir: PathBuf,

    /// Execution requests that may wait behind the running one
    pub job_queue_depth: usize,

    /// Capacity of each delivery queue (events, log lines)
    pub outbox_capacity: usize,

    /// Delivery attempts per completion event
    pub event_delivery_attempts: u32,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(name: String, orchestrator_url: String) -> Self {
        Self {
            name,
            orchestrator_url,
            endpoint: "http://localhost:5913".to_string(),
            bind_addr: "0.0.0.0:5913".to_string(),
            labels: Vec::new(),
            ip: None,
            workspace_dir: std::env::temp_dir().join("keel-runner").join("repos"),
            job_queue_depth: 5,
            outbox_capacity: 1000,
            event_delivery_attempts: 3,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - RUNNER_NAME (default: runner-<uuid>)
    /// - ORCHESTRATOR_URL (default: http://localhost:8080)
    /// - RUNNER_ENDPOINT (default: http://localhost:5913)
    /// - RUNNER_BIND_ADDR (default: 0.0.0.0:5913)
    /// - RUNNER_LABELS (comma-separated)
    /// - RUNNER_IP
    /// - WORKSPACE_DIR (default: <tmp>/keel-runner/repos)
    /// - JOB_QUEUE_DEPTH (default: 5)
    /// - OUTBOX_CAPACITY (default: 1000)
    /// - EVENT_DELIVERY_ATTEMPTS (default: 3)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("RUNNER_NAME") {
            config.name = name;
        }
        if let Ok(url) = std::env::var("ORCHESTRATOR_URL") {
            config.orchestrator_url = url;
        }
        if let Ok(endpoint) = std::env::var("RUNNER_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(addr) = std::env::var("RUNNER_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(labels) = std::env::var("RUNNER_LABELS") {
            config.labels = parse_labels(&labels);
        }
        config.ip = std::env::var("RUNNER_IP").ok().filter(|ip| !ip.is_empty());
        if let Ok(dir) = std::env::var("WORKSPACE_DIR") {
            config.workspace_dir = PathBuf::from(dir);
        }

        config.job_queue_depth = env_parse("JOB_QUEUE_DEPTH").unwrap_or(config.job_queue_depth);
        config.outbox_capacity = env_parse("OUTBOX_CAPACITY").unwrap_or(config.outbox_capacity);
        config.event_delivery_attempts =
            env_parse("EVENT_DELIVERY_ATTEMPTS").unwrap_or(config.event_delivery_attempts);

        config
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name cannot be empty");
        }

        for (key, url) in [
            ("orchestrator_url", &self.orchestrator_url),
            ("endpoint", &self.endpoint),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", key);
            }
        }

        if self.job_queue_depth == 0 {
            anyhow::bail!("job_queue_depth must be greater than 0");
        }

        if self.outbox_capacity == 0 {
            anyhow::bail!("outbox_capacity must be greater than 0");
        }

        if self.event_delivery_attempts == 0 {
            anyhow::bail!("event_delivery_attempts must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            format!("runner-{}", uuid::Uuid::new_v4()),
            "http://localhost:8080".to_string(),
        )
    }
}

/// Splits a comma-separated label list, dropping blanks and duplicates
pub fn parse_labels(raw: &str) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for label in raw.split(',').map(str::trim).filter(|l| !l.is_empty()) {
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }
    labels
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
