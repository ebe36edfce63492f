use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::units::{EurPerKwh, Gigawatts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    HomeAssistant,
    HttpIngest,
    Backfill,
}

impl PriceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HomeAssistant => "home_assistant",
            Self::HttpIngest => "http_ingest",
            Self::Backfill => "backfill",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home_assistant" => Ok(Self::HomeAssistant),
            "http_ingest" => Ok(Self::HttpIngest),
            "backfill" => Ok(Self::Backfill),
            other => Err(format!("unknown price source '{other}'")),
        }
    }
}

/// An observed (settled) electricity price, used as training target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceObservation {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub price: EurPerKwh,
    pub source: PriceSource,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PriceRow {
    pub ts: OffsetDateTime,
    pub eur_per_kwh: f64,
    pub source: String,
}

impl From<&PriceObservation> for PriceRow {
    fn from(o: &PriceObservation) -> Self {
        PriceRow {
            ts: o.ts,
            eur_per_kwh: o.price.0,
            source: o.source.as_str().to_string(),
        }
    }
}

impl TryFrom<PriceRow> for PriceObservation {
    type Error = String;

    fn try_from(row: PriceRow) -> Result<Self, Self::Error> {
        Ok(PriceObservation {
            ts: row.ts,
            price: EurPerKwh(row.eur_per_kwh),
            source: row.source.parse()?,
        })
    }
}

/// One hour for which both the energy picture and the realised price are known.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct TrainingRow {
    pub ts: OffsetDateTime,
    pub residual_load_gw: f64,
    pub solar_gw: f64,
    pub eur_per_kwh: f64,
}

impl TrainingRow {
    pub fn new(ts: OffsetDateTime, residual_load: Gigawatts, solar: Gigawatts, price: EurPerKwh) -> Self {
        Self {
            ts,
            residual_load_gw: residual_load.0,
            solar_gw: solar.0,
            eur_per_kwh: price.0,
        }
    }

    pub fn residual_load(&self) -> Gigawatts {
        Gigawatts(self.residual_load_gw)
    }

    pub fn solar(&self) -> Gigawatts {
        Gigawatts(self.solar_gw)
    }

    pub fn price(&self) -> EurPerKwh {
        EurPerKwh(self.eur_per_kwh)
    }
}
