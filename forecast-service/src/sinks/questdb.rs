use std::{marker::PhantomData, time::Duration};

use futures::{Stream, StreamExt};
use ned_client::domain::{EnergyRecord, EnergySnapshot, PriceObservation, PriceRow, TrainingRow};
use sqlx::{
    postgres::PgPool,
    query_builder::Separated,
    Postgres, QueryBuilder,
};
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;

use crate::{
    config::SinkConfig,
    model::TrainingData,
    pipeline::{Envelope, PipelineError, Sink},
};

/// A row type with a QuestDB table behind it.
pub trait QuestDbRow: Send + Sync + 'static {
    /// `INSERT INTO table (columns) ` prefix, values are appended.
    const INSERT: &'static str;

    fn bind_values(&self, b: &mut Separated<'_, '_, Postgres, &'static str>);
}

impl QuestDbRow for EnergyRecord {
    const INSERT: &'static str = "INSERT INTO energy_history (ts, kind, gw) ";

    fn bind_values(&self, b: &mut Separated<'_, '_, Postgres, &'static str>) {
        b.push_bind(self.ts).push_bind(self.kind.clone()).push_bind(self.gw);
    }
}

impl QuestDbRow for PriceRow {
    const INSERT: &'static str = "INSERT INTO price_history (ts, eur_per_kwh, source) ";

    fn bind_values(&self, b: &mut Separated<'_, '_, Postgres, &'static str>) {
        b.push_bind(self.ts)
            .push_bind(self.eur_per_kwh)
            .push_bind(self.source.clone());
    }
}

/// Batched pgwire writer. Partial batches are flushed on a timer so sparse
/// streams (one snapshot an hour) still land promptly.
pub struct QuestDbSink<R> {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    flush_interval: Duration,
    _row: PhantomData<fn() -> R>,
}

impl<R: QuestDbRow> QuestDbSink<R> {
    pub fn new(pool: PgPool, cfg: &SinkConfig) -> Self {
        Self {
            pool,
            batch_size: cfg.batch_size,
            max_retries: cfg.max_retries,
            retry_backoff: cfg.retry_backoff(),
            flush_interval: cfg.flush_interval(),
            _row: PhantomData,
        }
    }

    async fn flush_batch(&self, batch: &[R], oldest: Option<std::time::SystemTime>) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match self.insert_batch(batch).await {
                Ok(()) => {
                    metrics::counter!("questdb_ingested_records_total").increment(batch.len() as u64);

                    if let Some(dur) = oldest.and_then(|t| std::time::SystemTime::now().duration_since(t).ok()) {
                        metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
                    }

                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "questdb sink flush failed, retrying with backoff"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "questdb sink flush failed, giving up");
                    metrics::counter!("questdb_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }
    }

    async fn insert_batch(&self, batch: &[R]) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(R::INSERT);
        builder.push_values(batch, |mut b, row| row.bind_values(&mut b));
        builder.build().execute(&self.pool).await.map(|_| ())
    }

    async fn run_rows<T, S, F>(&self, mut input: S, to_rows: F) -> Result<(), PipelineError>
    where
        T: Send,
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin,
        F: Fn(Envelope<T>) -> Vec<R> + Send + Sync,
    {
        let mut buffer: Vec<R> = Vec::with_capacity(self.batch_size);
        let mut oldest = None;
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = input.next() => match item {
                    Some(Ok(env)) => {
                        oldest.get_or_insert(env.received_at);
                        buffer.extend(to_rows(env));
                        if buffer.len() >= self.batch_size {
                            self.flush_batch(&buffer, oldest.take()).await?;
                            buffer.clear();
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "error in upstream pipeline for QuestDbSink");
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush_batch(&buffer, oldest.take()).await?;
                        buffer.clear();
                    }
                }
            }
        }

        self.flush_batch(&buffer, oldest).await
    }
}

#[async_trait::async_trait]
impl Sink<EnergySnapshot> for QuestDbSink<EnergyRecord> {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<EnergySnapshot>, PipelineError>> + Send + Unpin + 'static,
    {
        // Only the hour current at fetch time is persisted; forecasts for
        // later hours are rewritten by later fetches anyway.
        self.run_rows(input, |env| env.payload.current_records(env.payload.fetched_at))
            .await
    }
}

#[async_trait::async_trait]
impl Sink<PriceObservation> for QuestDbSink<PriceRow> {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<PriceObservation>, PipelineError>> + Send + Unpin + 'static,
    {
        self.run_rows(input, |env| vec![PriceRow::from(&env.payload)]).await
    }
}

/// Training data read back from QuestDB.
pub struct QuestDbHistory {
    pool: PgPool,
}

impl QuestDbHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TrainingData for QuestDbHistory {
    async fn training_rows(&self, start: OffsetDateTime, end: OffsetDateTime) -> anyhow::Result<Vec<TrainingRow>> {
        ned_client::db::training_rows(&self.pool, start, end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sql_for<R: QuestDbRow>(rows: &[R]) -> String {
        let mut builder = QueryBuilder::<Postgres>::new(R::INSERT);
        builder.push_values(rows, |mut b, row| row.bind_values(&mut b));
        builder.sql().to_string()
    }

    #[test]
    fn energy_rows_bind_three_columns_each() {
        let ts = datetime!(2024-05-01 10:00 UTC);
        let rows = vec![
            EnergyRecord::new(ts, ned_client::domain::EnergyKind::Solar, ned_client::domain::Gigawatts(4.2)),
            EnergyRecord::new(ts, ned_client::domain::EnergyKind::Consumption, ned_client::domain::Gigawatts(12.0)),
        ];
        assert_eq!(
            sql_for(&rows),
            "INSERT INTO energy_history (ts, kind, gw) VALUES ($1, $2, $3), ($4, $5, $6)"
        );
    }

    #[test]
    fn price_rows_target_price_history() {
        let row = PriceRow {
            ts: datetime!(2024-05-01 10:00 UTC),
            eur_per_kwh: 0.21,
            source: "home_assistant".to_string(),
        };
        assert_eq!(
            sql_for(&[row]),
            "INSERT INTO price_history (ts, eur_per_kwh, source) VALUES ($1, $2, $3)"
        );
    }
}
