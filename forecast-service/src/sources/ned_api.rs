use std::time::Duration;

use ned_client::domain::{EnergyKind, EnergySnapshot, ForecastPoint, Gigawatts, Kilowatts, Series};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

const UTILIZATIONS_PATH: &str = "/v1/utilizations";

// Query constants of the utilizations endpoint.
const POINT_NETHERLANDS: &str = "0";
const GRANULARITY_HOURLY: &str = "5";
const GRANULARITY_TIMEZONE_CET: &str = "1";
const CLASSIFICATION_FORECAST: &str = "1";

#[derive(thiserror::Error, Debug)]
pub enum NedError {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("API access forbidden - check your API key")]
    Forbidden,
    #[error("NED API returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("no data returned for {0}")]
    Empty(EnergyKind),
    #[error("failed to format query date: {0}")]
    DateFormat(#[from] time::error::Format),
}

#[derive(Deserialize)]
struct UtilizationPage {
    #[serde(rename = "hydra:member", default)]
    members: Vec<Utilization>,
}

#[derive(Deserialize)]
struct Utilization {
    capacity: Option<f64>,
    validfrom: Option<String>,
    lastupdate: Option<String>,
}

/// One fetched series plus the newest `lastupdate` seen in it.
#[derive(Debug, Clone)]
pub struct FetchedSeries {
    pub series: Series<Gigawatts>,
    pub last_update: Option<OffsetDateTime>,
}

/// Client for the NED utilizations API.
#[derive(Clone)]
pub struct NedClient {
    base_url: String,
    api_key: String,
    client: Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl NedClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, NedError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NedError::Client(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        })
    }

    /// `max_retries` counts retries after the first attempt.
    pub fn with_retry_config(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    /// Fetches the forecast of one kind from today up to `now + hours`.
    pub async fn fetch_series(
        &self,
        kind: EnergyKind,
        now: OffsetDateTime,
        hours: u32,
    ) -> Result<FetchedSeries, NedError> {
        let date_fmt = format_description!("[year]-[month]-[day]");
        // The upper bound is exclusive and day-granular; fetch one extra day and
        // trim to the horizon locally.
        let end = now + time::Duration::hours(i64::from(hours)) + time::Duration::days(1);
        let start_date = now.date().format(&date_fmt)?;
        let end_date = end.date().format(&date_fmt)?;

        let type_id = kind.ned_type_id().to_string();
        let activity = kind.activity().code().to_string();
        let params: [(&str, &str); 8] = [
            ("point", POINT_NETHERLANDS),
            ("type", &type_id),
            ("granularity", GRANULARITY_HOURLY),
            ("granularitytimezone", GRANULARITY_TIMEZONE_CET),
            ("classification", CLASSIFICATION_FORECAST),
            ("activity", &activity),
            ("validfrom[after]", &start_date),
            ("validfrom[strictly_before]", &end_date),
        ];

        let url = format!("{}{}", self.base_url, UTILIZATIONS_PATH);
        tracing::debug!(%kind, %start_date, %end_date, "fetching NED series");

        let response = self
            .retry_request(|| {
                self.client
                    .get(&url)
                    .header("X-AUTH-TOKEN", &self.api_key)
                    .header("accept", "application/ld+json")
                    .query(&params)
                    .send()
            })
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(NedError::InvalidApiKey),
            StatusCode::FORBIDDEN => return Err(NedError::Forbidden),
            status => {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(%kind, status = status.as_u16(), %body, "NED API returned an error status");
                return Err(NedError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
        }

        let page: UtilizationPage = response.json().await?;
        if page.members.is_empty() {
            return Err(NedError::Empty(kind));
        }

        let mut last_update: Option<OffsetDateTime> = None;
        let mut points = Vec::with_capacity(page.members.len());
        for record in page.members {
            let Some(raw_ts) = record.validfrom.as_deref() else {
                continue;
            };
            let ts = match OffsetDateTime::parse(raw_ts, &Rfc3339) {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::debug!(%kind, ts = raw_ts, error = %e, "skipping record with unparsable timestamp");
                    continue;
                }
            };

            if let Some(lu) = record
                .lastupdate
                .as_deref()
                .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
            {
                last_update = Some(last_update.map_or(lu, |cur| cur.max(lu)));
            }

            let gw: Gigawatts = Kilowatts(record.capacity.unwrap_or(0.0)).into();
            points.push(ForecastPoint::new(ts, gw));
        }

        let series = Series::from_points(points).within_horizon(now, hours);
        tracing::debug!(%kind, records = series.len(), "fetched NED series");

        Ok(FetchedSeries { series, last_update })
    }

    /// Fetches all four kinds. Any failing kind fails the whole snapshot.
    pub async fn fetch_snapshot(&self, now: OffsetDateTime, hours: u32) -> Result<EnergySnapshot, NedError> {
        let mut snapshot = EnergySnapshot::empty(now);

        for kind in EnergyKind::ALL {
            let fetched = self.fetch_series(kind, now, hours).await?;
            if let Some(lu) = fetched.last_update {
                snapshot.source_updated_at = Some(snapshot.source_updated_at.map_or(lu, |cur| cur.max(lu)));
            }
            snapshot.set_series(kind, fetched.series);
        }

        Ok(snapshot)
    }

    /// Probes the API with a small wind onshore request.
    ///
    /// Returns `Ok(false)` when the key is rejected; other failures are errors.
    pub async fn validate_api_key(&self) -> Result<bool, NedError> {
        match self
            .fetch_series(EnergyKind::WindOnshore, OffsetDateTime::now_utc(), 24)
            .await
        {
            Ok(_) | Err(NedError::Empty(_)) => Ok(true),
            Err(NedError::InvalidApiKey) | Err(NedError::Forbidden) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Retries transport failures and 5xx responses with exponential backoff.
    /// Once retries are exhausted the last response or error is returned.
    async fn retry_request<F, Fut>(&self, mut request_fn: F) -> Result<reqwest::Response, NedError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.retry_backoff;

        loop {
            let failure = match request_fn().await {
                Ok(response) if !response.status().is_server_error() => return Ok(response),
                Ok(response) if attempt >= self.max_retries => return Ok(response),
                Ok(response) => format!("server returned {}", response.status()),
                Err(e) if attempt >= self.max_retries => {
                    tracing::error!(error = %e, attempt, "NED request failed, giving up");
                    return Err(NedError::Http(e));
                }
                Err(e) => e.to_string(),
            };

            attempt += 1;
            tracing::warn!(error = %failure, attempt, ?delay, "NED request failed, retrying");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}

/// Polls NED on a fixed interval and yields one snapshot per cycle.
///
/// The first cycle runs immediately. A failed cycle yields an error item so
/// downstream sensors can go unavailable until the next successful fetch.
pub struct NedPollingSource {
    client: NedClient,
    forecast_hours: u32,
    interval: Duration,
    cancel: CancellationToken,
}

impl NedPollingSource {
    pub fn new(client: NedClient, forecast_hours: u32, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            client,
            forecast_hours,
            interval,
            cancel,
        }
    }
}

#[async_trait::async_trait]
impl Source<EnergySnapshot> for NedPollingSource {
    async fn stream(&self) -> EnvelopeStream<EnergySnapshot> {
        let client = self.client.clone();
        let hours = self.forecast_hours;
        let interval = self.interval;
        let cancel = self.cancel.clone();

        let s = async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = OffsetDateTime::now_utc();
                let res = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = client.fetch_snapshot(now, hours) => res,
                };

                match res {
                    Ok(snapshot) => {
                        metrics::counter!("ned_fetch_total").increment(1);
                        tracing::info!(
                            points = snapshot.consumption.len(),
                            "fetched NED snapshot"
                        );
                        yield Ok(Envelope::new(snapshot));
                    }
                    Err(e) => {
                        metrics::counter!("ned_fetch_errors_total").increment(1);
                        tracing::warn!(error = %e, "NED fetch cycle failed");
                        yield Err(PipelineError::Source(e.to_string()));
                    }
                }
            }

            tracing::info!("NED polling stopped");
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use time::macros::datetime;

    fn page(records: serde_json::Value) -> String {
        json!({
            "@context": "/v1/contexts/Utilization",
            "hydra:member": records,
        })
        .to_string()
    }

    fn client(url: String) -> NedClient {
        NedClient::new(url, "test-key", Duration::from_secs(5))
            .unwrap()
            .with_retry_config(0, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn fetch_series_sends_query_and_converts_to_gigawatts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/utilizations")
            .match_header("x-auth-token", "test-key")
            .match_header("accept", "application/ld+json")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("point".into(), "0".into()),
                Matcher::UrlEncoded("type".into(), "51".into()),
                Matcher::UrlEncoded("activity".into(), "1".into()),
                Matcher::UrlEncoded("granularity".into(), "5".into()),
                Matcher::UrlEncoded("classification".into(), "1".into()),
                Matcher::UrlEncoded("validfrom[after]".into(), "2024-06-01".into()),
                Matcher::UrlEncoded("validfrom[strictly_before]".into(), "2024-06-03".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/ld+json")
            .with_body(page(json!([
                { "capacity": 3200000, "validfrom": "2024-06-01T11:00:00+00:00", "lastupdate": "2024-06-01T06:00:00+00:00" },
                { "capacity": 2100000, "validfrom": "2024-06-01T10:00:00+00:00", "lastupdate": "2024-06-01T07:00:00+00:00" },
                { "capacity": 1000000, "validfrom": "not a date" },
            ])))
            .create_async()
            .await;

        let fetched = client(server.url())
            .fetch_series(EnergyKind::WindOffshore, datetime!(2024-06-01 10:30 UTC), 24)
            .await
            .unwrap();

        let values: Vec<f64> = fetched.series.iter().map(|p| p.value.0).collect();
        assert_eq!(values, vec![2.1, 3.2]);
        assert_eq!(fetched.last_update, Some(datetime!(2024-06-01 07:00 UTC)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_maps_to_invalid_api_key() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/utilizations")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let c = client(server.url());
        let res = c
            .fetch_series(EnergyKind::Solar, datetime!(2024-06-01 10:00 UTC), 24)
            .await;
        assert!(matches!(res, Err(NedError::InvalidApiKey)));
        assert!(!c.validate_api_key().await.unwrap());
    }

    #[tokio::test]
    async fn forbidden_and_server_errors_are_distinguished() {
        let mut server = Server::new_async().await;
        let _forbidden = server
            .mock("GET", "/v1/utilizations")
            .match_query(Matcher::UrlEncoded("type".into(), "2".into()))
            .with_status(403)
            .create_async()
            .await;
        let _broken = server
            .mock("GET", "/v1/utilizations")
            .match_query(Matcher::UrlEncoded("type".into(), "59".into()))
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let c = client(server.url());
        let now = datetime!(2024-06-01 10:00 UTC);

        let res = c.fetch_series(EnergyKind::Solar, now, 24).await;
        assert!(matches!(res, Err(NedError::Forbidden)));

        let res = c.fetch_series(EnergyKind::Consumption, now, 24).await;
        match res {
            Err(NedError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_collects_all_four_kinds() {
        let mut server = Server::new_async().await;
        let mut mocks = Vec::new();
        for (type_id, kw) in [("1", 2_000_000.0), ("51", 1_500_000.0), ("2", 6_500_000.0), ("59", 12_500_000.0)] {
            mocks.push(
                server
                    .mock("GET", "/v1/utilizations")
                    .match_query(Matcher::UrlEncoded("type".into(), type_id.into()))
                    .with_status(200)
                    .with_body(page(json!([
                        { "capacity": kw, "validfrom": "2024-06-01T12:00:00+00:00" }
                    ])))
                    .create_async()
                    .await,
            );
        }

        let snapshot = client(server.url())
            .fetch_snapshot(datetime!(2024-06-01 12:00 UTC), 48)
            .await
            .unwrap();

        assert!(snapshot.is_complete());
        let overview = snapshot.overview();
        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].total_renewable, Gigawatts(10.0));
        for m in mocks {
            m.assert_async().await;
        }
    }

    #[tokio::test]
    async fn server_error_is_retried_until_success() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/v1/utilizations")
            .match_query(Matcher::Any)
            .with_status(502)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/v1/utilizations")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(page(json!([
                { "capacity": 4000000, "validfrom": "2024-06-01T10:00:00+00:00" }
            ])))
            .expect(1)
            .create_async()
            .await;

        let fetched = NedClient::new(server.url(), "test-key", Duration::from_secs(5))
            .unwrap()
            .with_retry_config(2, Duration::from_millis(1))
            .fetch_series(EnergyKind::Solar, datetime!(2024-06-01 10:00 UTC), 24)
            .await
            .unwrap();

        assert_eq!(fetched.series.iter().map(|p| p.value.0).collect::<Vec<_>>(), vec![4.0]);
        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn retries_are_bounded_and_keep_the_last_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/utilizations")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .expect(3)
            .create_async()
            .await;

        let res = NedClient::new(server.url(), "test-key", Duration::from_secs(5))
            .unwrap()
            .with_retry_config(2, Duration::from_millis(1))
            .fetch_series(EnergyKind::Solar, datetime!(2024-06-01 10:00 UTC), 24)
            .await;

        assert!(matches!(res, Err(NedError::Status { status: 503, .. })));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn connection_failures_end_as_http_errors_after_retries() {
        // Bind and drop to get a port nobody listens on.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let res = NedClient::new(format!("http://{addr}"), "test-key", Duration::from_secs(5))
            .unwrap()
            .with_retry_config(2, Duration::from_millis(1))
            .fetch_series(EnergyKind::Solar, datetime!(2024-06-01 10:00 UTC), 24)
            .await;

        assert!(matches!(res, Err(NedError::Http(_))));
    }

    #[tokio::test]
    async fn polling_source_yields_error_items_and_stops_on_cancel() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/utilizations")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let source = NedPollingSource::new(client(server.url()), 48, Duration::from_secs(3600), cancel.clone());
        let mut stream = source.stream().await;

        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(PipelineError::Source(msg)) if msg.contains("invalid API key")));

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
