use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use ned_client::domain::{PriceObservation, PriceSource, PriceUnit};
use time::OffsetDateTime;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// CSV backfill of realised prices.
///
/// Expected header columns (by name):
/// - ts (RFC3339 timestamp)
/// - price
/// - unit (`€/kWh`, `ct/kWh`, `EUR/MWh`, ...)
///
/// A file-wide unit may be given instead of a `unit` column; a per-row unit
/// still wins.
pub struct PriceCsvFileSource {
    path: PathBuf,
    default_unit: Option<PriceUnit>,
}

impl PriceCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            default_unit: None,
        }
    }

    pub fn with_default_unit(mut self, unit: PriceUnit) -> Self {
        self.default_unit = Some(unit);
        self
    }
}

fn record_to_price(
    record: &StringRecord,
    headers: &StringRecord,
    default_unit: Option<PriceUnit>,
) -> Result<PriceObservation, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid ts '{ts_str}': {e}")))?;

    let price_str = get("price")?;
    let value: f64 = price_str
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid price '{price_str}': {e}")))?;

    let unit = match get("unit").ok().filter(|u| !u.trim().is_empty()) {
        Some(raw) => PriceUnit::parse(raw).map_err(|e| PipelineError::Source(e.to_string()))?,
        None => default_unit.ok_or_else(|| PipelineError::Source(format!("price at {ts_str} has no unit")))?,
    };

    Ok(PriceObservation {
        ts,
        price: unit.to_eur_per_kwh(value),
        source: PriceSource::Backfill,
    })
}

#[async_trait::async_trait]
impl Source<PriceObservation> for PriceCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<PriceObservation> {
        // Blocking reader inside a single task; backfill files are small.
        let path = self.path.clone();
        let default_unit = self.default_unit;
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open CSV file: {e}")))?;
            let mut rdr = csv::Reader::from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read CSV record: {e}"
                )))?;

                let obs = match record_to_price(&record, &headers, default_unit) {
                    Ok(o) => o,
                    Err(e) => {
                        metrics::counter!("price_csv_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                yield Envelope::new(obs);
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use ned_client::domain::EurPerKwh;
    use std::io::Write;
    use time::macros::datetime;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn reads_rows_and_converts_units() {
        let f = write_csv(
            "ts,price,unit\n\
             2024-01-01T00:00:00Z,0.12,€/kWh\n\
             2024-01-01T01:00:00Z,9.5,ct/kWh\n",
        );

        let items: Vec<_> = PriceCsvFileSource::new(f.path()).stream().await.collect().await;
        assert_eq!(items.len(), 2);

        let first = items[0].as_ref().unwrap();
        assert_eq!(first.payload.ts, datetime!(2024-01-01 00:00 UTC));
        assert_eq!(first.payload.price, EurPerKwh(0.12));
        assert_eq!(first.payload.source, PriceSource::Backfill);

        let second = items[1].as_ref().unwrap();
        assert!((second.payload.price.0 - 0.095).abs() < 1e-12);
    }

    #[tokio::test]
    async fn file_wide_unit_applies_when_column_missing() {
        let f = write_csv("ts,price\n2024-01-01T00:00:00Z,100\n");

        let items: Vec<_> = PriceCsvFileSource::new(f.path())
            .with_default_unit(PriceUnit::EurPerMwh)
            .stream()
            .await
            .collect()
            .await;
        assert!((items[0].as_ref().unwrap().payload.price.0 - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_unit_stops_the_stream_with_an_error() {
        let f = write_csv("ts,price\n2024-01-01T00:00:00Z,100\n");

        let items: Vec<_> = PriceCsvFileSource::new(f.path()).stream().await.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(PipelineError::Source(msg)) if msg.contains("no unit")));
    }
}
