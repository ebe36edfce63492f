use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the Prometheus recorder and serves `/metrics` on `bind_addr`.
pub fn init(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics.bind_addr '{bind_addr}': {e}"))?;

    if PROM_HANDLE.get().is_none() {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
        let _ = PROM_HANDLE.set(handle);
    }

    describe_metrics();

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "metrics listener started");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });

    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("ned_fetch_total", "NED fetch cycles that produced a snapshot");
    metrics::describe_counter!("ned_fetch_errors_total", "NED fetch cycles that failed");
    metrics::describe_counter!("price_observations_total", "Realised prices received");
    metrics::describe_counter!("model_fit_total", "Completed price model fits");
    metrics::describe_histogram!("model_fit_duration_seconds", "Wall time of a model fit");
    metrics::describe_gauge!("model_r_squared", "R² of the active price model");
    metrics::describe_counter!("questdb_ingested_records_total", "Rows written to QuestDB");
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}
