use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_client::AgentClient;

mod api;
mod config;
mod db;
mod git;
mod repository;
mod scheduler;
mod service;
#[cfg(test)]
mod testing;

use config::Config;
use git::GitCommitResolver;
use repository::{MemoryStore, PgStore, Store};
use scheduler::{Aggregator, Dispatcher, HttpAgentTransport, aggregator, dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keel Orchestrator...");

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;

    let store = open_store(&config).await?;
    let agents = Arc::new(HttpAgentTransport::new(AgentClient::new()));

    // Background workers
    let (dispatch_handle, dispatch_rx) = dispatcher::channel(config.dispatch_queue_depth);
    let (event_handle, event_rx) = aggregator::channel();

    let dispatcher = Dispatcher::new(
        store.clone(),
        agents.clone(),
        dispatch_handle.clone(),
        config.dispatch_retry,
    );
    tokio::spawn(dispatcher.run(dispatch_rx));

    let aggregator = Aggregator::new(
        store.clone(),
        dispatch_handle.clone(),
        event_handle.clone(),
        config.event_retry,
        config.event_retry_limit,
    );
    tokio::spawn(aggregator.run(event_rx));

    // Steps left queued by a previous run
    let queued = store
        .queueing_job_runners()
        .await
        .context("Failed to load queued job runners")?;
    if !queued.is_empty() {
        tracing::info!("Re-queueing {} job runner(s)", queued.len());
    }
    for job_runner in queued {
        dispatch_handle.enqueue(job_runner.id).await;
    }

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        store,
        agents,
        resolver: Arc::new(GitCommitResolver),
        dispatcher: dispatch_handle,
        aggregator: event_handle,
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let Some(database_url) = &config.database_url else {
        tracing::warn!("No DATABASE_URL set; using the in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(database_url)
        .await
        .context("Failed to create database pool")?;

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database ready");

    Ok(Arc::new(PgStore::new(pool)))
}
