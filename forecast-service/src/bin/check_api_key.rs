use anyhow::{bail, Result};
use forecast_service::{
    config::AppConfig,
    observability,
    sources::{HomeAssistantPriceClient, NedClient},
};

/// Checks the configured credentials without starting the service.
///
/// Validates the NED API key and, when configured, that the Home Assistant
/// price sensor exists and reports a usable unit.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let ned = NedClient::new(&cfg.ned.base_url, &cfg.ned.api_key, cfg.ned.request_timeout())?
        .with_retry_config(cfg.ned.max_retries, cfg.ned.retry_backoff());
    if !ned.validate_api_key().await? {
        bail!("NED API key was rejected (invalid_api_key)");
    }
    tracing::info!("NED API key is valid");

    if let Some(ps) = &cfg.price_sensor {
        let client = HomeAssistantPriceClient::new(&ps.ha_base_url, &ps.token)?;
        client.validate_price_sensor(&ps.entity_id).await?;
        let price = client.read_price(&ps.entity_id).await?;
        tracing::info!(entity_id = %ps.entity_id, price = %price.price, "price sensor is usable");
    }

    Ok(())
}
