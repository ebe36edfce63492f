use std::time::Duration;

use ned_client::domain::{PriceObservation, PriceSource, PriceUnit, UnitError};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(thiserror::Error, Debug)]
pub enum PriceSensorError {
    #[error("sensor not found: {0}")]
    SensorNotFound(String),
    #[error("authentication with Home Assistant failed")]
    AuthenticationFailed,
    #[error("Home Assistant returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("state '{state}' of {entity_id} is not numeric")]
    NotNumeric { entity_id: String, state: String },
    #[error("{entity_id}: {source}")]
    Unit {
        entity_id: String,
        #[source]
        source: UnitError,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Deserialize)]
struct EntityState {
    entity_id: String,
    state: String,
    #[serde(default)]
    attributes: EntityAttributes,
    last_updated: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EntityAttributes {
    unit_of_measurement: Option<String>,
}

/// Reads a price sensor through the Home Assistant REST API.
#[derive(Clone)]
pub struct HomeAssistantPriceClient {
    base_url: String,
    token: String,
    client: Client,
}

impl HomeAssistantPriceClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, PriceSensorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PriceSensorError::Client(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    async fn get_state(&self, entity_id: &str) -> Result<EntityState, PriceSensorError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;

        match response.status() {
            StatusCode::OK => Ok(response.json::<EntityState>().await?),
            StatusCode::NOT_FOUND => Err(PriceSensorError::SensorNotFound(entity_id.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PriceSensorError::AuthenticationFailed),
            status => Err(PriceSensorError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Checks that the configured sensor exists and carries a usable price unit.
    pub async fn validate_price_sensor(&self, entity_id: &str) -> Result<(), PriceSensorError> {
        let state = self.get_state(entity_id).await?;
        parse_unit(&state)?;
        Ok(())
    }

    /// Current price of `entity_id`, normalized to €/kWh.
    ///
    /// The sensor must declare `unit_of_measurement`; a bare number is never
    /// interpreted.
    pub async fn read_price(&self, entity_id: &str) -> Result<PriceObservation, PriceSensorError> {
        let state = self.get_state(entity_id).await?;
        let unit = parse_unit(&state)?;

        let value: f64 = state
            .state
            .trim()
            .parse()
            .map_err(|_| PriceSensorError::NotNumeric {
                entity_id: state.entity_id.clone(),
                state: state.state.clone(),
            })?;

        let ts = state
            .last_updated
            .as_deref()
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        Ok(PriceObservation {
            ts,
            price: unit.to_eur_per_kwh(value),
            source: PriceSource::HomeAssistant,
        })
    }
}

fn parse_unit(state: &EntityState) -> Result<PriceUnit, PriceSensorError> {
    let raw = state.attributes.unit_of_measurement.as_deref().unwrap_or("");
    PriceUnit::parse(raw).map_err(|source| PriceSensorError::Unit {
        entity_id: state.entity_id.clone(),
        source,
    })
}

/// Polls a Home Assistant price sensor, yielding each new reading once.
pub struct HomeAssistantPriceSource {
    client: HomeAssistantPriceClient,
    entity_id: String,
    interval: Duration,
    cancel: CancellationToken,
}

impl HomeAssistantPriceSource {
    pub fn new(
        client: HomeAssistantPriceClient,
        entity_id: impl Into<String>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            entity_id: entity_id.into(),
            interval,
            cancel,
        }
    }
}

#[async_trait::async_trait]
impl Source<PriceObservation> for HomeAssistantPriceSource {
    async fn stream(&self) -> EnvelopeStream<PriceObservation> {
        let client = self.client.clone();
        let entity_id = self.entity_id.clone();
        let interval = self.interval;
        let cancel = self.cancel.clone();

        let s = async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen: Option<OffsetDateTime> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match client.read_price(&entity_id).await {
                    Ok(obs) if last_seen == Some(obs.ts) => {
                        tracing::trace!(entity_id = %entity_id, "price sensor unchanged");
                    }
                    Ok(obs) => {
                        last_seen = Some(obs.ts);
                        metrics::counter!("price_observations_total", "source" => "home_assistant").increment(1);
                        yield Ok(Envelope::new(obs));
                    }
                    Err(e) => {
                        tracing::warn!(entity_id = %entity_id, error = %e, "failed to read price sensor");
                        yield Err(PipelineError::Source(e.to_string()));
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mockito::Server;
    use ned_client::domain::EurPerKwh;
    use serde_json::json;
    use time::macros::datetime;

    fn state_body(state: &str, unit: Option<&str>) -> String {
        let mut attributes = json!({ "friendly_name": "EPEX" });
        if let Some(u) = unit {
            attributes["unit_of_measurement"] = json!(u);
        }
        json!({
            "entity_id": "sensor.epex",
            "state": state,
            "attributes": attributes,
            "last_changed": "2024-06-01T10:00:00+00:00",
            "last_updated": "2024-06-01T10:00:00+00:00"
        })
        .to_string()
    }

    #[tokio::test]
    async fn reads_price_in_cents_and_normalizes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/states/sensor.epex")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(state_body("12.5", Some("ct/kWh")))
            .create_async()
            .await;

        let client = HomeAssistantPriceClient::new(server.url(), "tok").unwrap();
        let obs = client.read_price("sensor.epex").await.unwrap();

        assert_eq!(obs.price, EurPerKwh(0.125));
        assert_eq!(obs.ts, datetime!(2024-06-01 10:00 UTC));
        assert_eq!(obs.source, PriceSource::HomeAssistant);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn price_without_unit_is_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/states/sensor.epex")
            .with_status(200)
            .with_body(state_body("0.21", None))
            .create_async()
            .await;

        let client = HomeAssistantPriceClient::new(server.url(), "tok").unwrap();
        let res = client.read_price("sensor.epex").await;
        assert!(matches!(
            res,
            Err(PriceSensorError::Unit {
                source: UnitError::Missing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unavailable_state_is_not_numeric() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/states/sensor.epex")
            .with_status(200)
            .with_body(state_body("unavailable", Some("€/kWh")))
            .create_async()
            .await;

        let client = HomeAssistantPriceClient::new(server.url(), "tok").unwrap();
        let res = client.read_price("sensor.epex").await;
        assert!(matches!(res, Err(PriceSensorError::NotNumeric { .. })));
    }

    #[tokio::test]
    async fn missing_sensor_fails_validation() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/states/sensor.nope")
            .with_status(404)
            .create_async()
            .await;

        let client = HomeAssistantPriceClient::new(server.url(), "tok").unwrap();
        let res = client.validate_price_sensor("sensor.nope").await;
        assert!(matches!(res, Err(PriceSensorError::SensorNotFound(id)) if id == "sensor.nope"));
    }

    #[tokio::test]
    async fn source_yields_reading_then_stops() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/states/sensor.epex")
            .with_status(200)
            .with_body(state_body("95", Some("EUR/MWh")))
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let source = HomeAssistantPriceSource::new(
            HomeAssistantPriceClient::new(server.url(), "tok").unwrap(),
            "sensor.epex",
            Duration::from_secs(3600),
            cancel.clone(),
        );
        let mut stream = source.stream().await;

        let env = stream.next().await.unwrap().unwrap();
        assert!((env.payload.price.0 - 0.095).abs() < 1e-12);

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
