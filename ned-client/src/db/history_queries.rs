use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{PriceRow, TrainingRow};

/// Energy rows are averaged per (hour, kind) first so repeated fetches of the
/// same hour count once; hours missing any of the four kinds are dropped.
const TRAINING_ROWS_SQL: &str = r#"
    SELECT
        e.ts,
        e.residual_load_gw,
        e.solar_gw,
        p.eur_per_kwh
    FROM (
        SELECT
            ts,
            SUM(CASE WHEN kind = 'consumption' THEN gw ELSE -gw END) AS residual_load_gw,
            SUM(CASE WHEN kind = 'solar' THEN gw ELSE 0.0 END)        AS solar_gw,
            COUNT(*)                                                  AS kinds
        FROM (
            SELECT timestamp_floor('h', ts) AS ts, kind, AVG(gw) AS gw
            FROM energy_history
            WHERE ts >= $1
              AND ts <  $2
            GROUP BY timestamp_floor('h', ts), kind
        ) per_kind
        GROUP BY ts
    ) e
    JOIN (
        SELECT timestamp_floor('h', ts) AS ts, AVG(eur_per_kwh) AS eur_per_kwh
        FROM price_history
        WHERE ts >= $1
          AND ts <  $2
        GROUP BY timestamp_floor('h', ts)
    ) p ON p.ts = e.ts
    WHERE e.kinds = 4
    ORDER BY e.ts
    "#;

const LATEST_PRICE_SQL: &str = r#"
    SELECT ts, eur_per_kwh, source
    FROM price_history
    ORDER BY ts DESC
    LIMIT 1
    "#;

/// Join hourly energy history with realised prices for model training.
pub async fn training_rows(
    pool: &PgPool,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<TrainingRow>> {
    let rows = sqlx::query_as::<_, TrainingRow>(TRAINING_ROWS_SQL)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// Most recent realised price, if any has been stored.
pub async fn latest_price(pool: &PgPool) -> Result<Option<PriceRow>> {
    let row = sqlx::query_as::<_, PriceRow>(LATEST_PRICE_SQL)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnergyKind;

    fn normalized(sql: &str) -> String {
        sql.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn training_query_buckets_both_tables_by_hour() {
        let sql = normalized(TRAINING_ROWS_SQL);
        assert_eq!(sql.matches("timestamp_floor('h', ts)").count(), 4);
        assert!(sql.contains("FROM energy_history WHERE ts >= $1 AND ts < $2"));
        assert!(sql.contains("FROM price_history WHERE ts >= $1 AND ts < $2"));
        assert!(sql.contains("GROUP BY timestamp_floor('h', ts), kind"));
        assert!(sql.contains(") p ON p.ts = e.ts"));
        assert!(!sql.contains("$3"));
    }

    #[test]
    fn training_query_keeps_only_complete_hours_in_time_order() {
        let sql = normalized(TRAINING_ROWS_SQL);
        assert!(sql.contains(&format!("WHERE e.kinds = {}", EnergyKind::ALL.len())));
        assert!(sql.ends_with("ORDER BY e.ts"));
    }

    #[test]
    fn training_query_projects_residual_and_solar_from_stored_kinds() {
        let sql = normalized(TRAINING_ROWS_SQL);
        // Residual load: consumption minus every production kind.
        assert!(sql.contains(&format!(
            "SUM(CASE WHEN kind = '{}' THEN gw ELSE -gw END) AS residual_load_gw",
            EnergyKind::Consumption.as_str()
        )));
        assert!(sql.contains(&format!(
            "SUM(CASE WHEN kind = '{}' THEN gw ELSE 0.0 END) AS solar_gw",
            EnergyKind::Solar.as_str()
        )));
        assert!(sql.starts_with("SELECT e.ts, e.residual_load_gw, e.solar_gw, p.eur_per_kwh"));
    }

    #[test]
    fn latest_price_reads_newest_row() {
        assert_eq!(
            normalized(LATEST_PRICE_SQL),
            "SELECT ts, eur_per_kwh, source FROM price_history ORDER BY ts DESC LIMIT 1"
        );
    }
}
