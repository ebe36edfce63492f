use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use futures::StreamExt;
use ned_client::domain::{PriceObservation, PriceSource, PriceUnit};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<PriceObservation>>,
    auth_bearer_token: Option<Arc<str>>,
}

/// Push endpoint for realised prices: `POST /ingest/prices`.
#[derive(Clone)]
pub struct HttpPriceSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<PriceObservation>>>>>,
}

/// Every incoming price must state its unit.
#[derive(serde::Deserialize)]
struct IncomingPrice {
    #[serde(with = "time::serde::rfc3339")]
    ts: time::OffsetDateTime,
    value: f64,
    unit: String,
}

impl TryFrom<IncomingPrice> for PriceObservation {
    type Error = String;

    fn try_from(i: IncomingPrice) -> Result<Self, Self::Error> {
        let unit = PriceUnit::parse(&i.unit).map_err(|e| e.to_string())?;
        Ok(PriceObservation {
            ts: i.ts,
            price: unit.to_eur_per_kwh(i.value),
            source: PriceSource::HttpIngest,
        })
    }
}

impl HttpPriceSource {
    /// Starts the listener. Once `cancel` fires the server drains its
    /// connections and drops the router, which ends the stream.
    pub async fn new(
        bind_addr: &str,
        channel_capacity: usize,
        auth_bearer_token: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;

        let (source, app) = Self::with_router(channel_capacity, auth_bearer_token);

        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    tracing::info!(%addr, "price ingest listener started");
                    let served = axum::serve(listener, app.into_make_service())
                        .with_graceful_shutdown(cancel.cancelled_owned())
                        .await;
                    match served {
                        Ok(()) => tracing::info!(%addr, "price ingest listener stopped"),
                        Err(e) => tracing::error!(error = %e, "price ingest server error"),
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to bind price ingest listener");
                }
            }
        });

        Ok(source)
    }

    /// Builds the source and its router without binding a listener.
    pub fn with_router(channel_capacity: usize, auth_bearer_token: Option<String>) -> (Self, Router) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let shared = SharedSender {
            tx,
            auth_bearer_token: auth_bearer_token.map(Arc::from),
        };

        let app = Router::new()
            .route("/ingest/prices", post(ingest_prices))
            .with_state(shared);

        let source = Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        };
        (source, app)
    }
}

#[async_trait::async_trait]
impl Source<PriceObservation> for HttpPriceSource {
    async fn stream(&self) -> EnvelopeStream<PriceObservation> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(futures::stream::once(async {
                Err(PipelineError::Source(
                    "HttpPriceSource stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

fn authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

async fn ingest_prices(
    State(sender): State<SharedSender>,
    headers: HeaderMap,
    Json(payload): Json<Vec<IncomingPrice>>,
) -> Result<StatusCode, (StatusCode, String)> {
    metrics::counter!("http_price_ingest_requests_total").increment(1);

    if !authorized(&headers, sender.auth_bearer_token.as_deref()) {
        return Err((StatusCode::UNAUTHORIZED, "missing or invalid bearer token".to_string()));
    }

    // Convert the whole batch first so a bad record rejects the request atomically.
    let observations = payload
        .into_iter()
        .enumerate()
        .map(|(idx, incoming)| {
            PriceObservation::try_from(incoming).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("record {idx}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let count = observations.len();
    for obs in observations {
        if sender.tx.send(Envelope::new(obs)).await.is_err() {
            metrics::counter!("http_price_ingest_failed_total").increment(1);
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "pipeline closed".to_string()));
        }
    }

    metrics::counter!("price_observations_total", "source" => "http_ingest").increment(count as u64);
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ned_client::domain::EurPerKwh;
    use serde_json::json;
    use time::macros::datetime;
    use tower::ServiceExt;

    fn request(body: serde_json::Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/ingest/prices")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn accepted_prices_reach_the_stream_in_euros() {
        let (source, app) = HttpPriceSource::with_router(16, None);
        let body = json!([
            { "ts": "2024-06-01T10:00:00Z", "value": 0.25, "unit": "€/kWh" },
            { "ts": "2024-06-01T11:00:00Z", "value": 80.0, "unit": "EUR/MWh" },
        ]);

        let res = app.oneshot(request(body, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let mut stream = source.stream().await;
        let first = stream.next().await.unwrap().unwrap().payload;
        assert_eq!(first.ts, datetime!(2024-06-01 10:00 UTC));
        assert_eq!(first.price, EurPerKwh(0.25));
        assert_eq!(first.source, PriceSource::HttpIngest);

        let second = stream.next().await.unwrap().unwrap().payload;
        assert!((second.price.0 - 0.08).abs() < 1e-12);
    }

    #[tokio::test]
    async fn batch_with_unitless_price_is_rejected_whole() {
        let (source, app) = HttpPriceSource::with_router(16, None);
        let body = json!([
            { "ts": "2024-06-01T10:00:00Z", "value": 0.25, "unit": "€/kWh" },
            { "ts": "2024-06-01T11:00:00Z", "value": 25.0, "unit": "" },
        ]);

        let res = app.oneshot(request(body, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mut guard = source.receiver.lock().await;
        assert!(guard.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn bearer_token_is_enforced_when_configured() {
        let (_source, app) = HttpPriceSource::with_router(16, Some("s3cret".to_string()));
        let body = json!([{ "ts": "2024-06-01T10:00:00Z", "value": 0.25, "unit": "€/kWh" }]);

        let res = app.clone().oneshot(request(body.clone(), None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app.clone().oneshot(request(body.clone(), Some("wrong"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app.oneshot(request(body, Some("s3cret"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn stream_ends_when_cancelled() {
        let cancel = CancellationToken::new();
        let source = HttpPriceSource::new("127.0.0.1:0", 4, None, cancel.clone())
            .await
            .unwrap();
        let mut stream = source.stream().await;

        cancel.cancel();
        let next = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("stream should end after cancel");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once() {
        let (source, _app) = HttpPriceSource::with_router(1, None);
        let _first = source.stream().await;
        let mut second = source.stream().await;
        assert!(matches!(second.next().await, Some(Err(PipelineError::Source(_)))));
    }
}
