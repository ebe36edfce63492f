use serde::Serialize;
use time::{Duration, OffsetDateTime, UtcOffset};

use super::units::Quantity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForecastPoint<Q> {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub value: Q,
}

impl<Q> ForecastPoint<Q> {
    pub fn new(ts: OffsetDateTime, value: Q) -> Self {
        Self { ts, value }
    }
}

/// Time-ordered values of a single quantity.
///
/// Points are kept sorted by timestamp; a timestamp appears at most once
/// (the last value supplied for it wins).
#[derive(Debug, Clone, PartialEq)]
pub struct Series<Q> {
    points: Vec<ForecastPoint<Q>>,
}

impl<Q> Default for Series<Q> {
    fn default() -> Self {
        Self { points: Vec::new() }
    }
}

impl<Q: Quantity> Series<Q> {
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = ForecastPoint<Q>>,
    {
        let mut raw: Vec<ForecastPoint<Q>> = points.into_iter().collect();
        // Stable sort keeps insertion order among equal timestamps.
        raw.sort_by_key(|p| p.ts);

        let mut points: Vec<ForecastPoint<Q>> = Vec::with_capacity(raw.len());
        for p in raw {
            match points.last_mut() {
                Some(last) if last.ts == p.ts => *last = p,
                _ => points.push(p),
            }
        }

        Self { points }
    }

    pub fn points(&self) -> &[ForecastPoint<Q>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&ForecastPoint<Q>> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&ForecastPoint<Q>> {
        self.points.last()
    }

    /// Value at exactly `ts`, if present.
    pub fn get(&self, ts: OffsetDateTime) -> Option<Q> {
        self.points
            .binary_search_by_key(&ts, |p| p.ts)
            .ok()
            .map(|idx| self.points[idx].value)
    }

    /// The point describing "now": the most recent point not in the future,
    /// or the first point when the whole series lies ahead of `now`.
    pub fn current_at(&self, now: OffsetDateTime) -> Option<&ForecastPoint<Q>> {
        let idx = self.points.partition_point(|p| p.ts <= now);
        if idx == 0 {
            self.points.first()
        } else {
            self.points.get(idx - 1)
        }
    }

    /// Points strictly before `now + hours`.
    pub fn within_horizon(&self, now: OffsetDateTime, hours: u32) -> Self {
        let cutoff = now + Duration::hours(i64::from(hours));
        Self {
            points: self.points.iter().copied().filter(|p| p.ts < cutoff).collect(),
        }
    }

    pub fn map<R, F>(&self, mut f: F) -> Series<R>
    where
        R: Quantity,
        F: FnMut(Q) -> R,
    {
        Series {
            points: self
                .points
                .iter()
                .map(|p| ForecastPoint::new(p.ts, f(p.value)))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForecastPoint<Q>> {
        self.points.iter()
    }
}

/// Truncates a timestamp to the start of its UTC hour.
pub fn floor_to_hour(ts: OffsetDateTime) -> OffsetDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    let past_hour = Duration::seconds(i64::from(utc.minute()) * 60 + i64::from(utc.second()))
        + Duration::nanoseconds(i64::from(utc.nanosecond()));
    utc - past_hour
}
