use anyhow::{bail, Result};
use sqlx::{postgres::PgPool, Row};
use time::{Date, PrimitiveDateTime};

/// Idempotent upsert layer over the per-quantity series tables.
///
/// Every table is keyed by `bucket_start`; re-merging a bucket never
/// creates a second row, and a later merge with a different value
/// overwrites the old one (last write wins). Tables are created lazily
/// and meter columns are added with an explicit pre-checked ALTER, not
/// discovered through upsert failure.
#[derive(Clone)]
pub struct SeriesStore {
    pool: PgPool,
}

/// Table/column identifiers are interpolated into SQL (they cannot be
/// bound as parameters), so only lowercase snake_case names are let
/// through.
pub(crate) fn check_ident(name: &str) -> Result<&str> {
    let ok = !name.is_empty()
        && name.chars().next().map(|c| c.is_ascii_lowercase()).unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !ok {
        bail!("refusing unsafe SQL identifier '{name}'");
    }
    Ok(name)
}

impl SeriesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// CREATE TABLE IF NOT EXISTS with `bucket_start` as the
    /// uniqueness constraint. Value columns are added separately.
    pub async fn ensure_series_table(&self, table: &str) -> Result<()> {
        let table = check_ident(table)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} \
             (bucket_start TIMESTAMP NOT NULL UNIQUE, PRIMARY KEY (bucket_start))"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(1) AS n FROM information_schema.columns \
             WHERE table_name = $1 AND column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Add a numeric value column if it does not exist yet. Must be
    /// called before the first merge into that column.
    pub async fn ensure_column(&self, table: &str, column: &str) -> Result<()> {
        let table = check_ident(table)?;
        let column = check_ident(column)?;
        if self.has_column(table, column).await? {
            return Ok(());
        }
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} DOUBLE PRECISION");
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert one bucket value. Safe to repeat with the same bucket;
    /// converges to the latest value merged.
    pub async fn merge(
        &self,
        table: &str,
        column: &str,
        bucket_start: PrimitiveDateTime,
        value: Option<f64>,
    ) -> Result<()> {
        let table = check_ident(table)?;
        let column = check_ident(column)?;
        let sql = format!(
            "INSERT INTO {table} (bucket_start, {column}) VALUES ($1, $2) \
             ON CONFLICT (bucket_start) DO UPDATE SET {column} = EXCLUDED.{column}"
        );
        sqlx::query(&sql).bind(bucket_start).bind(value).execute(&self.pool).await?;
        Ok(())
    }

    /// Row count, optionally only rows where `populated` is non-null.
    pub async fn row_count(&self, table: &str, populated: Option<&str>) -> Result<i64> {
        let table = check_ident(table)?;
        let mut sql = format!("SELECT COUNT(1) AS n FROM {table}");
        if let Some(col) = populated {
            let col = check_ident(col)?;
            sql.push_str(&format!(" WHERE {col} IS NOT NULL"));
        }
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    /// Earliest and latest bucket timestamps in a table, `None` when
    /// the table is empty. Used for gap checks and to decide how far
    /// back to resume an import.
    pub async fn time_extremes(
        &self,
        table: &str,
        populated: Option<&str>,
    ) -> Result<Option<(PrimitiveDateTime, PrimitiveDateTime)>> {
        let table = check_ident(table)?;
        let mut sql =
            format!("SELECT MIN(bucket_start) AS lo, MAX(bucket_start) AS hi FROM {table}");
        if let Some(col) = populated {
            let col = check_ident(col)?;
            sql.push_str(&format!(" WHERE {col} IS NOT NULL"));
        }
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let lo: Option<PrimitiveDateTime> = row.try_get("lo")?;
        let hi: Option<PrimitiveDateTime> = row.try_get("hi")?;
        Ok(lo.zip(hi))
    }

    /// Create the hourly and daily forecast-history tables.
    pub async fn ensure_forecast_tables(&self, table: &str) -> Result<()> {
        let table = check_ident(table)?;
        let hourly = format!(
            "CREATE TABLE IF NOT EXISTS {table} \
             (bucket_start TIMESTAMP NOT NULL UNIQUE, \
              cloud_cover DOUBLE PRECISION, \
              visibility DOUBLE PRECISION, \
              summary VARCHAR(255), \
              icon VARCHAR(40), \
              PRIMARY KEY (bucket_start))"
        );
        let daily = format!(
            "CREATE TABLE IF NOT EXISTS {table}_daily \
             (day DATE NOT NULL UNIQUE, \
              cloud_cover DOUBLE PRECISION, \
              visibility DOUBLE PRECISION, \
              summary VARCHAR(255), \
              icon VARCHAR(40), \
              PRIMARY KEY (day))"
        );
        sqlx::query(&hourly).execute(&self.pool).await?;
        sqlx::query(&daily).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn merge_forecast_hour(
        &self,
        table: &str,
        ts: PrimitiveDateTime,
        cloud_cover: Option<f64>,
        visibility: Option<f64>,
        summary: Option<&str>,
        icon: Option<&str>,
    ) -> Result<()> {
        let table = check_ident(table)?;
        let sql = format!(
            "INSERT INTO {table} (bucket_start, cloud_cover, visibility, summary, icon) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (bucket_start) DO UPDATE SET \
             cloud_cover = EXCLUDED.cloud_cover, visibility = EXCLUDED.visibility, \
             summary = EXCLUDED.summary, icon = EXCLUDED.icon"
        );
        sqlx::query(&sql)
            .bind(ts)
            .bind(cloud_cover)
            .bind(visibility)
            .bind(summary)
            .bind(icon)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn merge_forecast_day(
        &self,
        table: &str,
        day: Date,
        cloud_cover: Option<f64>,
        visibility: Option<f64>,
        summary: Option<&str>,
        icon: Option<&str>,
    ) -> Result<()> {
        let table = check_ident(table)?;
        let sql = format!(
            "INSERT INTO {table}_daily (day, cloud_cover, visibility, summary, icon) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (day) DO UPDATE SET \
             cloud_cover = EXCLUDED.cloud_cover, visibility = EXCLUDED.visibility, \
             summary = EXCLUDED.summary, icon = EXCLUDED.icon"
        );
        sqlx::query(&sql)
            .bind(day)
            .bind(cloud_cover)
            .bind(visibility)
            .bind(summary)
            .bind(icon)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_vetted_before_interpolation() {
        assert!(check_ident("weather_station").is_ok());
        assert!(check_ident("sol_rad").is_ok());
        assert!(check_ident("pv2_gen").is_ok());
        assert!(check_ident("").is_err());
        assert!(check_ident("1abc").is_err());
        assert!(check_ident("power; DROP TABLE x").is_err());
        assert!(check_ident("Power").is_err());
    }
}
