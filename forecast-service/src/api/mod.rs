use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use ned_client::domain::RSquared;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    model::{features::FEATURE_COUNT, FitOutcome, ModelFitter},
    sensors::{SensorKind, SensorRegistry, SensorState},
};

const FEATURE_NAMES: [&str; FEATURE_COUNT] = ["residual_load_gw", "solar_gw", "hour_sin", "hour_cos"];

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SensorRegistry>,
    pub fitter: ModelFitter,
}

#[derive(Debug, Serialize)]
pub struct ModelStatus {
    pub fitted: bool,
    pub fit_running: bool,
    pub r_squared: Option<RSquared>,
    pub samples: Option<usize>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub fitted_at: Option<OffsetDateTime>,
    pub intercept: Option<f64>,
    pub coefficients: Vec<(&'static str, f64)>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sensors", get(list_sensors))
        .route("/api/sensors/:id", get(get_sensor))
        .route("/api/model", get(model_status))
        .route("/api/model/fit", post(fit_model))
        .with_state(state)
}

/// Serves the API until `cancel` fires.
pub async fn serve(bind_addr: &str, state: ApiState, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api.bind_addr '{bind_addr}': {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "sensor API listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn list_sensors(State(state): State<ApiState>) -> Json<Vec<SensorState>> {
    Json(state.registry.all().await)
}

async fn get_sensor(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SensorState>, (StatusCode, String)> {
    let kind = SensorKind::from_id(&id).ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown sensor '{id}'")))?;
    state
        .registry
        .get(kind)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown sensor '{id}'")))
}

async fn model_status(State(state): State<ApiState>) -> Json<ModelStatus> {
    let model = state.fitter.current();
    let fit_running = state.fitter.is_running();

    Json(match model {
        Some(m) => ModelStatus {
            fitted: true,
            fit_running,
            r_squared: Some(m.r_squared),
            samples: Some(m.samples),
            fitted_at: Some(m.fitted_at),
            intercept: Some(m.regression.intercept),
            coefficients: FEATURE_NAMES
                .into_iter()
                .zip(m.regression.coefficients.iter().copied())
                .collect(),
        },
        None => ModelStatus {
            fitted: false,
            fit_running,
            r_squared: None,
            samples: None,
            fitted_at: None,
            intercept: None,
            coefficients: Vec::new(),
        },
    })
}

async fn fit_model(State(state): State<ApiState>) -> Result<Json<FitOutcome>, (StatusCode, String)> {
    match state.fitter.fit_now().await {
        Ok(FitOutcome::AlreadyRunning) => Err((StatusCode::CONFLICT, "a model fit is already running".to_string())),
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            tracing::error!(error = %e, "manual model fit failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
