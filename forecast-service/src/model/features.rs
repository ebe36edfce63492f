use std::f64::consts::PI;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use ned_client::domain::{OverviewPoint, TrainingRow};
use time::OffsetDateTime;

/// Width of a feature row: residual load, solar, hour-of-day (sin, cos).
pub const FEATURE_COUNT: usize = 4;

/// Hour of day of `ts` on the wall clock of `tz`.
pub fn local_hour(ts: OffsetDateTime, tz: Tz) -> u32 {
    DateTime::<Utc>::from_timestamp(ts.unix_timestamp(), 0)
        .map(|utc| utc.with_timezone(&tz).hour())
        .unwrap_or(0)
}

fn row(residual_gw: f64, solar_gw: f64, ts: OffsetDateTime, tz: Tz) -> Vec<f64> {
    let angle = 2.0 * PI * f64::from(local_hour(ts, tz)) / 24.0;
    vec![residual_gw, solar_gw, angle.sin(), angle.cos()]
}

pub fn from_training_row(r: &TrainingRow, tz: Tz) -> Vec<f64> {
    row(r.residual_load_gw, r.solar_gw, r.ts, tz)
}

pub fn from_overview(p: &OverviewPoint, tz: Tz) -> Vec<f64> {
    row(p.residual_load.0, p.solar.0, p.ts, tz)
}

/// Splits training rows into a feature matrix and the €/kWh target.
pub fn training_matrix(rows: &[TrainingRow], tz: Tz) -> (Vec<Vec<f64>>, Vec<f64>) {
    rows.iter()
        .map(|r| (from_training_row(r, tz), r.eur_per_kwh))
        .unzip()
}
