mod api_client;
mod avatar;
mod config;
mod metrics;
mod models;
mod pipeline;
mod provision;
mod queue;
mod storage;

use axum::{Json, Router, extract::State, routing::get};
use config::WorkerConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use pipeline::Pipeline;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "avatar.worker", "worker crashed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = WorkerConfig::from_env();

    // Model weights come first: a worker that cannot provision its assets
    // must not start pulling jobs it would immediately degrade or fail.
    if config.provision.enabled {
        let provisioner = provision::Provisioner::from_config(&config.provision)?;
        let report = provisioner.sync(&config.provision, &config.assets).await?;
        info!(
            target = "avatar.worker",
            downloaded = report.downloaded,
            kept = report.kept,
            relocated = report.relocated,
            "model assets provisioned"
        );
    } else {
        info!(target = "avatar.worker", "model sync disabled, using local assets as-is");
    }

    let storage = storage::ArtifactStore::from_config(
        &config.artifacts,
        config.pipeline.upload_max_attempts,
    )?;
    let api = api_client::JobStoreClient::new(
        config.api_base_url.clone(),
        config.pipeline.terminal_callback_max_attempts,
    );
    let pipeline = Pipeline::new(config.pipeline.clone(), &config.assets, storage, api);

    let consumer = Arc::new(queue::JobConsumer::new(
        &config.redis_url,
        &config.queue_name,
        pipeline,
        config.concurrency,
    )?);
    let _consumer = tokio::spawn(consumer.run());

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(prometheus_handle)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = ([0, 0, 0, 0], config.admin_port).into();
    info!(target = "avatar.worker", "admin server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "avatar-worker-rs",
    }))
}

async fn metrics_endpoint(
    State(handle): State<PrometheusHandle>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
