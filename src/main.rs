use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use tracing_subscriber::{fmt, EnvFilter};

use orchestrator::{api_routes, config, scheduler, RuntimeClient, SchedulerState};

async fn root() -> &'static str {
    "Remediation Orchestrator API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();

    let client = RuntimeClient::from_env();
    let scheduler_state = Arc::new(SchedulerState::default());

    if *config::SCHEDULER_ENABLED {
        scheduler_state.mark_running();
        scheduler::spawn(client.clone(), scheduler_state.clone());
        tracing::info!(
            interval_secs = *config::SCHEDULER_INTERVAL_SECS,
            "scheduler auto-started"
        );
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(client.clone()))
        .layer(Extension(scheduler_state.clone()));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, runtime = %client.base_url(), "listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
