//! Keel Runner
//!
//! The execution agent. It registers with the orchestrator under a name and
//! a set of capability labels, then waits for the orchestrator to push
//! steps to it.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - API: `/start_job`, `/cancel_job/{id}` and `/health`
//! - Scheduler: bounded queue drained by a single execution worker
//! - Services: step execution, cancellation handles, delivery outbox
//!
//! Completion events and log lines are delivered asynchronously, so a slow
//! or unreachable orchestrator never stalls a running step.

mod api;
mod checkout;
mod config;
mod process;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_client::OrchestratorClient;
use keel_core::domain::runner::Runner;
use keel_core::dto::runner::RegisterRunner;

use crate::checkout::Checkout;
use crate::config::Config;
use crate::scheduler::{JobQueue, Worker};
use crate::service::execution::workspace_root;
use crate::service::{CancelRegistry, Executor, Outbox, OutboxConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_runner=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Runner");

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: name={}, orchestrator_url={}, labels={:?}",
        config.name, config.orchestrator_url, config.labels
    );

    let client = Arc::new(OrchestratorClient::new(config.orchestrator_url.clone()));

    let workspace = workspace_root(&config.workspace_dir);
    tokio::fs::create_dir_all(&workspace)
        .await
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
    info!("Workspace: {}", workspace.display());

    let outbox = Outbox::start(
        client.clone(),
        OutboxConfig::new(config.outbox_capacity, config.event_delivery_attempts),
    );
    let cancels = CancelRegistry::new();
    let executor = Executor::new(config.name.clone(), Checkout::new(workspace), outbox);

    let (queue, rx) = JobQueue::new(config.job_queue_depth, cancels.clone());
    tokio::spawn(Worker::new(executor.clone(), cancels.clone()).run(rx));

    // Listen before registering so the first dispatch finds us
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    let registration = RegisterRunner {
        name: config.name.clone(),
        endpoint: config.endpoint.clone(),
        labels: config.labels.clone(),
        ip: config.ip.clone(),
    };
    let runner = register_with_retry(&client, &registration).await?;
    info!("Registered as runner {} ({})", runner.id, runner.name);

    let app = api::create_router(api::AgentState {
        queue,
        cancels,
        executor,
    });

    axum::serve(listener, app).await.context("Server terminated")?;

    Ok(())
}

/// Register with orchestrator with retry logic and exponential backoff
///
/// This handles the case where the orchestrator may not be ready yet when
/// the runner starts (common in container environments).
async fn register_with_retry(
    client: &OrchestratorClient,
    registration: &RegisterRunner,
) -> Result<Runner> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.register_runner(registration).await {
            Ok(runner) => {
                if attempt > 1 {
                    info!(
                        "Successfully registered with orchestrator after {} attempt(s)",
                        attempt
                    );
                }
                return Ok(runner);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!(
                        "Failed to register with orchestrator after {} attempts",
                        MAX_RETRIES
                    );
                    return Err(anyhow::anyhow!(
                        "Failed to register with orchestrator: {}",
                        e
                    ));
                }

                warn!(
                    "Failed to register with orchestrator (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
