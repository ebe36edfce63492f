use crate::pipeline::{Envelope, PipelineError, Transform};
use ned_client::domain::{EnergyKind, EnergySnapshot, PriceObservation};
use time::{macros::datetime, OffsetDateTime};

/// Prices outside this band (€/kWh) are treated as unit mistakes.
pub const PRICE_SANITY_LIMIT_EUR: f64 = 5.0;

fn ts_in_range(ts: OffsetDateTime) -> bool {
    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);
    ts >= min_ts && ts <= max_ts
}

/// Pure validation of an `EnergySnapshot`.
///
/// Rules:
/// - every value is finite and non-negative (GW).
/// - every timestamp lies within [2000-01-01, 2100-01-01].
/// - consumption is present; production series may be empty.
pub fn validate_snapshot(env: Envelope<EnergySnapshot>) -> Result<Envelope<EnergySnapshot>, PipelineError> {
    let s = &env.payload;

    if s.consumption.is_empty() {
        return Err(PipelineError::Transform("snapshot has no consumption data".to_string()));
    }

    for kind in EnergyKind::ALL {
        for p in s.series(kind).iter() {
            if !p.value.0.is_finite() || p.value.0 < 0.0 {
                return Err(PipelineError::Transform(format!(
                    "{kind} value {} at {} is not a non-negative number",
                    p.value.0, p.ts
                )));
            }
            if !ts_in_range(p.ts) {
                return Err(PipelineError::Transform(format!("{kind} timestamp out of allowed range")));
            }
        }
    }

    Ok(env)
}

/// Pure validation of a realised price.
///
/// Rules:
/// - price is finite and within ±[`PRICE_SANITY_LIMIT_EUR`] €/kWh.
/// - ts lies within the same sanity window as snapshots.
pub fn validate_price(env: Envelope<PriceObservation>) -> Result<Envelope<PriceObservation>, PipelineError> {
    let p = &env.payload;

    if !p.price.0.is_finite() || p.price.0.abs() > PRICE_SANITY_LIMIT_EUR {
        return Err(PipelineError::Transform(format!(
            "price {} €/kWh outside sanity band",
            p.price.0
        )));
    }

    if !ts_in_range(p.ts) {
        return Err(PipelineError::Transform("timestamp out of allowed range".to_string()));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct SnapshotValidation;

#[async_trait::async_trait]
impl Transform<EnergySnapshot, EnergySnapshot> for SnapshotValidation {
    async fn apply(&self, input: Envelope<EnergySnapshot>) -> Result<Envelope<EnergySnapshot>, PipelineError> {
        validate_snapshot(input).inspect_err(|e| {
            metrics::counter!("validation_snapshot_rejected_total").increment(1);
            tracing::warn!(error = %e, "rejected NED snapshot");
        })
    }
}

#[derive(Clone, Default)]
pub struct PriceValidation;

#[async_trait::async_trait]
impl Transform<PriceObservation, PriceObservation> for PriceValidation {
    async fn apply(
        &self,
        input: Envelope<PriceObservation>,
    ) -> Result<Envelope<PriceObservation>, PipelineError> {
        validate_price(input).inspect_err(|e| {
            metrics::counter!("validation_price_rejected_total").increment(1);
            tracing::warn!(error = %e, "rejected price observation");
        })
    }
}
