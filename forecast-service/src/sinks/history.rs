use std::collections::BTreeMap;

use futures::StreamExt;
use ned_client::domain::{floor_to_hour, EnergySnapshot, EurPerKwh, OverviewPoint, PriceObservation, TrainingRow};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::{
    model::TrainingData,
    pipeline::{Envelope, PipelineError, Sink},
};

#[derive(Default)]
struct HistoryInner {
    /// Latest known energy picture per hour; later fetches overwrite.
    energy: BTreeMap<OffsetDateTime, OverviewPoint>,
    /// Sum and count of observed prices per hour.
    prices: BTreeMap<OffsetDateTime, (f64, u32)>,
}

/// Training history kept in process, used when no database is configured.
pub struct InMemoryHistory {
    retention: Duration,
    inner: RwLock<HistoryInner>,
}

impl InMemoryHistory {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention: Duration::days(i64::from(retention_days)),
            inner: RwLock::new(HistoryInner::default()),
        }
    }

    pub async fn record_snapshot(&self, snapshot: &EnergySnapshot) {
        let mut inner = self.inner.write().await;
        for p in snapshot.overview() {
            inner.energy.insert(floor_to_hour(p.ts), p);
        }
        prune(&mut inner, snapshot.fetched_at - self.retention);
    }

    pub async fn record_price(&self, obs: &PriceObservation) {
        let mut inner = self.inner.write().await;
        let slot = inner.prices.entry(floor_to_hour(obs.ts)).or_insert((0.0, 0));
        slot.0 += obs.price.0;
        slot.1 += 1;
        prune(&mut inner, OffsetDateTime::now_utc() - self.retention);
    }

    pub async fn sizes(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.energy.len(), inner.prices.len())
    }
}

fn prune(inner: &mut HistoryInner, cutoff: OffsetDateTime) {
    inner.energy = inner.energy.split_off(&cutoff);
    inner.prices = inner.prices.split_off(&cutoff);
}

#[async_trait::async_trait]
impl TrainingData for InMemoryHistory {
    async fn training_rows(&self, start: OffsetDateTime, end: OffsetDateTime) -> anyhow::Result<Vec<TrainingRow>> {
        let inner = self.inner.read().await;
        let rows = inner
            .prices
            .range(start..end)
            .filter_map(|(ts, (sum, count))| {
                let energy = inner.energy.get(ts)?;
                Some(TrainingRow::new(
                    *ts,
                    energy.residual_load,
                    energy.solar,
                    EurPerKwh(sum / f64::from(*count)),
                ))
            })
            .collect();
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl Sink<EnergySnapshot> for InMemoryHistory {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<EnergySnapshot>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            if let Ok(env) = item {
                self.record_snapshot(&env.payload).await;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sink<PriceObservation> for InMemoryHistory {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<PriceObservation>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            match item {
                Ok(env) => self.record_price(&env.payload).await,
                Err(e) => tracing::debug!(error = %e, "price not recorded"),
            }
        }
        Ok(())
    }
}
