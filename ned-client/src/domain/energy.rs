use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{
    series::{ForecastPoint, Series},
    units::{Gigawatts, Percent},
};

/// NED `activity` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Production,
    Consumption,
}

impl Activity {
    pub fn code(self) -> u32 {
        match self {
            Self::Production => 1,
            Self::Consumption => 2,
        }
    }
}

/// The four national series fetched from NED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyKind {
    WindOnshore,
    WindOffshore,
    Solar,
    Consumption,
}

impl EnergyKind {
    pub const ALL: [EnergyKind; 4] = [
        EnergyKind::WindOnshore,
        EnergyKind::WindOffshore,
        EnergyKind::Solar,
        EnergyKind::Consumption,
    ];

    /// NED `type` query parameter.
    pub fn ned_type_id(self) -> u32 {
        match self {
            Self::WindOnshore => 1,
            Self::Solar => 2,
            Self::WindOffshore => 51,
            Self::Consumption => 59,
        }
    }

    pub fn activity(self) -> Activity {
        match self {
            Self::Consumption => Activity::Consumption,
            _ => Activity::Production,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WindOnshore => "wind_onshore",
            Self::WindOffshore => "wind_offshore",
            Self::Solar => "solar",
            Self::Consumption => "consumption",
        }
    }
}

impl fmt::Display for EnergyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnergyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown energy kind '{s}'"))
    }
}

/// One persisted hourly value of one series.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EnergyRecord {
    pub ts: OffsetDateTime,
    pub kind: String,
    pub gw: f64,
}

impl EnergyRecord {
    pub fn new(ts: OffsetDateTime, kind: EnergyKind, value: Gigawatts) -> Self {
        Self {
            ts,
            kind: kind.as_str().to_string(),
            gw: value.0,
        }
    }

    pub fn energy_kind(&self) -> Option<EnergyKind> {
        self.kind.parse().ok()
    }

    pub fn value(&self) -> Gigawatts {
        Gigawatts(self.gw)
    }
}

/// Result of one fetch cycle: the forecast series of every kind.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergySnapshot {
    pub fetched_at: OffsetDateTime,
    /// Most recent `lastupdate` reported by NED across all series.
    pub source_updated_at: Option<OffsetDateTime>,
    pub wind_onshore: Series<Gigawatts>,
    pub wind_offshore: Series<Gigawatts>,
    pub solar: Series<Gigawatts>,
    pub consumption: Series<Gigawatts>,
}

/// Joined per-hour view of a snapshot with the derived quantities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverviewPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub wind_onshore: Gigawatts,
    pub wind_offshore: Gigawatts,
    pub solar: Gigawatts,
    pub consumption: Gigawatts,
    pub total_renewable: Gigawatts,
    pub coverage: Percent,
    /// Consumption not covered by renewable production.
    pub residual_load: Gigawatts,
}

impl OverviewPoint {
    pub fn new(
        ts: OffsetDateTime,
        wind_onshore: Gigawatts,
        wind_offshore: Gigawatts,
        solar: Gigawatts,
        consumption: Gigawatts,
    ) -> Self {
        let total_renewable = wind_onshore + wind_offshore + solar;
        let coverage = if consumption.0 > 0.0 {
            Percent(total_renewable.0 / consumption.0 * 100.0)
        } else {
            Percent(0.0)
        };

        Self {
            ts,
            wind_onshore,
            wind_offshore,
            solar,
            consumption,
            total_renewable,
            coverage,
            residual_load: consumption - total_renewable,
        }
    }
}

impl EnergySnapshot {
    pub fn empty(fetched_at: OffsetDateTime) -> Self {
        Self {
            fetched_at,
            source_updated_at: None,
            wind_onshore: Series::default(),
            wind_offshore: Series::default(),
            solar: Series::default(),
            consumption: Series::default(),
        }
    }

    pub fn series(&self, kind: EnergyKind) -> &Series<Gigawatts> {
        match kind {
            EnergyKind::WindOnshore => &self.wind_onshore,
            EnergyKind::WindOffshore => &self.wind_offshore,
            EnergyKind::Solar => &self.solar,
            EnergyKind::Consumption => &self.consumption,
        }
    }

    pub fn set_series(&mut self, kind: EnergyKind, series: Series<Gigawatts>) {
        match kind {
            EnergyKind::WindOnshore => self.wind_onshore = series,
            EnergyKind::WindOffshore => self.wind_offshore = series,
            EnergyKind::Solar => self.solar = series,
            EnergyKind::Consumption => self.consumption = series,
        }
    }

    pub fn is_complete(&self) -> bool {
        EnergyKind::ALL.iter().all(|k| !self.series(*k).is_empty())
    }

    /// Joins the four series on timestamp. Hours missing from any series are
    /// left out.
    pub fn overview(&self) -> Vec<OverviewPoint> {
        self.wind_onshore
            .iter()
            .filter_map(|on| {
                let off = self.wind_offshore.get(on.ts)?;
                let solar = self.solar.get(on.ts)?;
                let consumption = self.consumption.get(on.ts)?;
                Some(OverviewPoint::new(on.ts, on.value, off, solar, consumption))
            })
            .collect()
    }

    pub fn total_renewable(&self) -> Series<Gigawatts> {
        Series::from_points(
            self.overview()
                .into_iter()
                .map(|p| ForecastPoint::new(p.ts, p.total_renewable)),
        )
    }

    pub fn coverage(&self) -> Series<Percent> {
        Series::from_points(
            self.overview()
                .into_iter()
                .map(|p| ForecastPoint::new(p.ts, p.coverage)),
        )
    }

    /// Rows describing the hour that is current at `now`, one per kind.
    pub fn current_records(&self, now: OffsetDateTime) -> Vec<EnergyRecord> {
        EnergyKind::ALL
            .iter()
            .filter_map(|kind| {
                self.series(*kind)
                    .current_at(now)
                    .map(|p| EnergyRecord::new(p.ts, *kind, p.value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn one_point(ts: OffsetDateTime, gw: f64) -> Series<Gigawatts> {
        Series::from_points([ForecastPoint::new(ts, Gigawatts(gw))])
    }

    fn snapshot() -> EnergySnapshot {
        let t0 = datetime!(2024-06-01 12:00 UTC);
        let t1 = datetime!(2024-06-01 13:00 UTC);
        let mut s = EnergySnapshot::empty(t0);
        s.wind_onshore = Series::from_points([
            ForecastPoint::new(t0, Gigawatts(2.0)),
            ForecastPoint::new(t1, Gigawatts(2.5)),
        ]);
        s.wind_offshore = Series::from_points([
            ForecastPoint::new(t0, Gigawatts(1.5)),
            ForecastPoint::new(t1, Gigawatts(1.0)),
        ]);
        s.solar = Series::from_points([
            ForecastPoint::new(t0, Gigawatts(6.5)),
            ForecastPoint::new(t1, Gigawatts(5.5)),
        ]);
        // Consumption lacks t1.
        s.consumption = one_point(t0, 12.5);
        s
    }

    #[test]
    fn energy_kinds_map_to_ned_type_ids() {
        assert_eq!(EnergyKind::WindOnshore.ned_type_id(), 1);
        assert_eq!(EnergyKind::Solar.ned_type_id(), 2);
        assert_eq!(EnergyKind::WindOffshore.ned_type_id(), 51);
        assert_eq!(EnergyKind::Consumption.ned_type_id(), 59);
        assert_eq!(EnergyKind::Consumption.activity().code(), 2);
        assert_eq!(EnergyKind::Solar.activity().code(), 1);
    }

    #[test]
    fn energy_kind_round_trips_through_str() {
        for kind in EnergyKind::ALL {
            assert_eq!(kind.as_str().parse::<EnergyKind>(), Ok(kind));
        }
        assert!("hydro".parse::<EnergyKind>().is_err());
    }

    #[test]
    fn overview_joins_only_hours_present_everywhere() {
        let overview = snapshot().overview();
        assert_eq!(overview.len(), 1);

        let p = overview[0];
        assert_eq!(p.total_renewable, Gigawatts(10.0));
        assert_eq!(p.coverage, Percent(80.0));
        assert_eq!(p.residual_load, Gigawatts(2.5));
    }

    #[test]
    fn coverage_is_zero_without_consumption() {
        let p = OverviewPoint::new(
            datetime!(2024-06-01 00:00 UTC),
            Gigawatts(1.0),
            Gigawatts(1.0),
            Gigawatts(0.0),
            Gigawatts(0.0),
        );
        assert_eq!(p.coverage, Percent(0.0));
        assert_eq!(p.residual_load, Gigawatts(-2.0));
    }

    #[test]
    fn completeness_requires_all_four_series() {
        let mut s = snapshot();
        assert!(s.is_complete());
        s.set_series(EnergyKind::Solar, Series::default());
        assert!(!s.is_complete());
    }

    #[test]
    fn current_records_emit_one_row_per_kind() {
        let rows = snapshot().current_records(datetime!(2024-06-01 13:10 UTC));
        assert_eq!(rows.len(), 4);

        let consumption = rows
            .iter()
            .find(|r| r.energy_kind() == Some(EnergyKind::Consumption))
            .unwrap();
        assert_eq!(consumption.ts, datetime!(2024-06-01 12:00 UTC));

        let solar = rows.iter().find(|r| r.kind == "solar").unwrap();
        assert_eq!(solar.value(), Gigawatts(5.5));
    }
}
