use anyhow::{bail, Context, Result};
use forecast_service::{
    config::AppConfig, observability, pipeline::Pipeline, sinks::QuestDbSink, sources::PriceCsvFileSource, transform,
};
use ned_client::domain::{PriceObservation, PriceRow, PriceUnit};
use sqlx::postgres::PgPoolOptions;
use std::{env, sync::Arc};

/// Backfill `price_history` from a CSV file of realised prices.
///
/// Usage:
///   backfill_prices <csv_file_path> [default_unit]
///
/// `default_unit` (e.g. `ct/kWh`) applies to rows without a `unit` column.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_prices <csv_file_path> [default_unit]");
    }
    let file_path = &args[1];

    // FORECAST_CONFIG can point to a backfill-specific file.
    let cfg = AppConfig::load()?;
    let Some(questdb) = &cfg.questdb else {
        bail!("backfill_prices needs a [questdb] section in the config");
    };

    let pool = PgPoolOptions::new()
        .max_connections(questdb.max_connections)
        .connect(&questdb.uri)
        .await?;

    let mut source = PriceCsvFileSource::new(file_path);
    if let Some(raw) = args.get(2) {
        let unit = PriceUnit::parse(raw).with_context(|| format!("invalid default unit '{raw}'"))?;
        source = source.with_default_unit(unit);
    }

    let pipeline: Pipeline<_, PriceObservation, _> = Pipeline {
        name: "price_backfill",
        source,
        transforms: vec![Arc::new(transform::PriceValidation)],
        sink: QuestDbSink::<PriceRow>::new(pool.clone(), &cfg.sink),
    };

    pipeline.run().await?;

    match ned_client::db::latest_price(&pool).await? {
        Some(row) => tracing::info!(ts = %row.ts, eur_per_kwh = row.eur_per_kwh, source = %row.source, "latest stored price"),
        None => tracing::warn!("price_history is still empty"),
    }

    Ok(())
}
