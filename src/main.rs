mod auth;
mod backend;
mod config;
mod dataset;
mod error;
mod evaluation;
mod handlers;
mod metrics;
mod ollama;
mod report;
mod router;
mod scheduler;
mod store;
#[cfg(test)]
mod testkit;
mod types;
mod ws;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use evaluation::{Collaborators, Orchestrator};
use router::{EventKind, EventRouter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("llm_bench=info".parse()?),
        )
        .init();

    let config = Arc::new(config::Config::from_env());
    config.print_banner();

    let backend = Arc::new(
        ollama::OllamaClient::new(config.ollama_url.clone()).context("Failed to build Ollama client")?,
    );
    let store: Arc<dyn store::ResultStore> = Arc::new(
        store::JsonStore::open(&config.data_path)
            .with_context(|| format!("Failed to open result store {}", config.data_path.display()))?,
    );
    let metrics_store = metrics::Metrics::new();
    let event_router = EventRouter::spawn();

    let orchestrator = Orchestrator::new(
        Collaborators {
            backend,
            store: store.clone(),
            tasks: Arc::new(dataset::YamlTaskSource::new()),
            reporter: Arc::new(report::TableReporter::new(store)),
        },
        config.settings(),
        event_router.clone(),
        metrics_store.clone(),
    );

    let recovered = orchestrator
        .recover_interrupted_runs()
        .context("Failed to recover interrupted runs")?;
    if !recovered.is_empty() {
        warn!(runs = ?recovered, "Runs interrupted by a previous shutdown can be resumed");
    }

    // Fan every routed event out to websocket clients.
    let (events_tx, _) = broadcast::channel(config.event_buffer);
    for kind in EventKind::ALL {
        let tx = events_tx.clone();
        orchestrator.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }

    let state = Arc::new(handlers::AppState {
        config: config.clone(),
        orchestrator: orchestrator.clone(),
        metrics: metrics_store,
        events_tx,
        started_at: chrono::Utc::now(),
    });

    let app = handlers::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );
    let addr = format!("0.0.0.0:{}", config.port);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, draining...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    if let Some(run_id) = orchestrator.active_run() {
        info!(run_id, "Stopping active run");
        match tokio::time::timeout(SHUTDOWN_GRACE, orchestrator.stop()).await {
            Ok(Ok(status)) => info!(run_id, status = %status, "Run settled"),
            Ok(Err(e)) => warn!(run_id, error = %e, "Could not stop run"),
            Err(_) => warn!(run_id, "Run did not settle before shutdown; it will be recovered on restart"),
        }
    }
    event_router.shutdown();

    info!("Shutdown complete");
    Ok(())
}
