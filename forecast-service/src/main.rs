use std::{sync::Arc, time::Duration};

use anyhow::Result;
use forecast_service::{
    api::{self, ApiState},
    config::AppConfig,
    forecast::PriceForecaster,
    metrics_server,
    model::{ModelFitter, TrainingData},
    observability,
    pipeline::{Pipeline, PipelineError},
    sensors::{SensorRegistry, SensorSink},
    sinks::{FanoutSink, InMemoryHistory, QuestDbHistory, QuestDbSink},
    sources::{HomeAssistantPriceClient, HomeAssistantPriceSource, HttpPriceSource, NedClient, NedPollingSource},
    transform,
};
use ned_client::domain::{EnergyRecord, PriceRow};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let cancel = CancellationToken::new();

    // QuestDB is optional; without it history lives in memory only.
    let pool = match &cfg.questdb {
        Some(q) => Some(
            PgPoolOptions::new()
                .max_connections(q.max_connections)
                .connect(&q.uri)
                .await?,
        ),
        None => None,
    };

    let memory = Arc::new(InMemoryHistory::new(cfg.history.retention_days));
    let training: Arc<dyn TrainingData> = match &pool {
        Some(pool) => Arc::new(QuestDbHistory::new(pool.clone())),
        None => memory.clone(),
    };

    let fitter = ModelFitter::new(training, &cfg.model)?;
    let forecaster = Arc::new(PriceForecaster::new(&cfg.model)?);
    let registry = Arc::new(SensorRegistry::new());

    let ned = NedClient::new(&cfg.ned.base_url, &cfg.ned.api_key, cfg.ned.request_timeout())?
        .with_retry_config(cfg.ned.max_retries, cfg.ned.retry_backoff());
    match ned.validate_api_key().await {
        Ok(true) => tracing::info!("NED API key accepted"),
        Ok(false) => tracing::error!("NED API key rejected; NED sensors will stay unavailable"),
        Err(e) => tracing::warn!(error = %e, "could not validate NED API key, continuing"),
    }

    let mut tasks: JoinSet<Result<(), PipelineError>> = JoinSet::new();

    // NED -> validation -> sensors + history
    let ned_pipeline: Pipeline<_, _, _> = Pipeline {
        name: "ned",
        source: NedPollingSource::new(ned, cfg.ned.forecast_hours, cfg.ned.poll_interval(), cancel.clone()),
        transforms: vec![Arc::new(transform::SnapshotValidation)],
        sink: FanoutSink::new(
            SensorSink::new(registry.clone(), forecaster.clone(), fitter.clone()),
            FanoutSink::new(
                memory.clone(),
                pool.clone()
                    .map(|p| QuestDbSink::<EnergyRecord>::new(p, &cfg.sink)),
            ),
        ),
    };
    tasks.spawn(ned_pipeline.run());

    if let Some(ps) = &cfg.price_sensor {
        let client = HomeAssistantPriceClient::new(&ps.ha_base_url, &ps.token)?;
        if let Err(e) = client.validate_price_sensor(&ps.entity_id).await {
            tracing::error!(entity_id = %ps.entity_id, error = %e, "price sensor check failed");
        }

        let pipeline: Pipeline<_, _, _> = Pipeline {
            name: "ha_price",
            source: HomeAssistantPriceSource::new(
                client,
                ps.entity_id.clone(),
                Duration::from_secs(ps.poll_interval_secs),
                cancel.clone(),
            ),
            transforms: vec![Arc::new(transform::PriceValidation)],
            sink: FanoutSink::new(
                memory.clone(),
                pool.clone().map(|p| QuestDbSink::<PriceRow>::new(p, &cfg.sink)),
            ),
        };
        tasks.spawn(pipeline.run());
    }

    if let Some(ingest) = &cfg.price_ingest {
        let source = HttpPriceSource::new(
            &ingest.http_bind_addr,
            ingest.channel_capacity,
            ingest.auth_bearer_token.clone(),
            cancel.clone(),
        )
        .await?;

        let pipeline: Pipeline<_, _, _> = Pipeline {
            name: "http_price",
            source,
            transforms: vec![Arc::new(transform::PriceValidation)],
            sink: FanoutSink::new(
                memory.clone(),
                pool.clone().map(|p| QuestDbSink::<PriceRow>::new(p, &cfg.sink)),
            ),
        };
        tasks.spawn(pipeline.run());
    }

    let fitter_handle = fitter.spawn(cancel.child_token());

    let api_state = ApiState {
        registry: registry.clone(),
        fitter: fitter.clone(),
    };
    let api_cancel = cancel.clone();
    let api_addr = cfg.api.bind_addr.clone();
    let mut api_task = tokio::spawn(async move { api::serve(&api_addr, api_state, api_cancel).await });

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        }
        res = &mut api_task => {
            match res {
                Ok(Ok(())) => tracing::warn!("sensor API stopped"),
                Ok(Err(e)) => tracing::error!(error = %e, "sensor API failed"),
                Err(e) => tracing::error!(error = %e, "sensor API task panicked"),
            }
        }
    }

    cancel.cancel();
    fitter_handle.shutdown().await;

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "pipeline ended with error"),
                Err(e) => tracing::error!(error = %e, "pipeline task panicked"),
            }
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!("pipelines did not stop in time, aborting");
        tasks.abort_all();
    }

    tracing::info!("forecast service stopped");
    Ok(())
}
