use std::collections::HashMap;

use anyhow::Result;
use sqlx::{postgres::PgPool, Row};
use time::{Date, Duration, PrimitiveDateTime, Time};

use crate::db::series_store::check_ident;
use crate::domain::{Meter, Site};

/// One stored row of a wide power table for a single day, with the
/// per-meter cells in the same order as the requested column list.
#[derive(Debug, Clone)]
pub struct MeterDayRow {
    pub bucket_start: PrimitiveDateTime,
    pub values: Vec<Option<f64>>,
}

fn day_bounds(date: Date) -> (PrimitiveDateTime, PrimitiveDateTime) {
    let start = PrimitiveDateTime::new(date, Time::MIDNIGHT);
    (start, start + Duration::days(1))
}

/// Fetch all stored buckets of `date` from a wide power table,
/// time-ordered, selecting one cell per meter column.
pub async fn meter_day_rows(
    pool: &PgPool,
    table: &str,
    columns: &[String],
    date: Date,
) -> Result<Vec<MeterDayRow>> {
    let table = check_ident(table)?;
    let mut select = String::from("SELECT bucket_start");
    for col in columns {
        let col = check_ident(col)?;
        select.push_str(", ");
        select.push_str(col);
    }
    select.push_str(&format!(
        " FROM {table} WHERE bucket_start >= $1 AND bucket_start < $2 ORDER BY bucket_start"
    ));

    let (lo, hi) = day_bounds(date);
    let rows = sqlx::query(&select).bind(lo).bind(hi).fetch_all(pool).await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let bucket_start: PrimitiveDateTime = row.try_get("bucket_start")?;
        let mut values = Vec::with_capacity(columns.len());
        for (i, _) in columns.iter().enumerate() {
            values.push(row.try_get::<Option<f64>, _>(i + 1)?);
        }
        out.push(MeterDayRow { bucket_start, values });
    }
    Ok(out)
}

/// Irradiance by bucket start for one day from a single-column weather
/// table. Missing table is reported as an empty map by the caller.
pub async fn irradiance_for_day(
    pool: &PgPool,
    table: &str,
    column: &str,
    date: Date,
) -> Result<HashMap<PrimitiveDateTime, f64>> {
    let table = check_ident(table)?;
    let column = check_ident(column)?;
    let sql = format!(
        "SELECT bucket_start, {column} FROM {table} \
         WHERE bucket_start >= $1 AND bucket_start < $2 AND {column} IS NOT NULL"
    );
    let (lo, hi) = day_bounds(date);
    let rows = sqlx::query(&sql).bind(lo).bind(hi).fetch_all(pool).await?;
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let ts: PrimitiveDateTime = row.try_get(0)?;
        let v: f64 = row.try_get(1)?;
        out.insert(ts, v);
    }
    Ok(out)
}

pub async fn ensure_entity_tables(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sites \
         (token VARCHAR(64) NOT NULL UNIQUE, \
          code VARCHAR(64) NOT NULL, \
          name VARCHAR(255), \
          PRIMARY KEY (token))",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS meters \
         (code VARCHAR(64) NOT NULL UNIQUE, \
          serial VARCHAR(64), \
          meter_type VARCHAR(64), \
          site_token VARCHAR(64), \
          PRIMARY KEY (code))",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_site(pool: &PgPool, site: &Site) -> Result<()> {
    sqlx::query(
        "INSERT INTO sites (token, code, name) VALUES ($1, $2, $3) \
         ON CONFLICT (token) DO UPDATE SET code = EXCLUDED.code, name = EXCLUDED.name",
    )
    .bind(&site.token)
    .bind(&site.code)
    .bind(&site.name)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_meter(pool: &PgPool, meter: &Meter) -> Result<()> {
    sqlx::query(
        "INSERT INTO meters (code, serial, meter_type, site_token) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (code) DO UPDATE SET serial = EXCLUDED.serial, \
         meter_type = EXCLUDED.meter_type, site_token = EXCLUDED.site_token",
    )
    .bind(&meter.code)
    .bind(&meter.serial)
    .bind(&meter.meter_type)
    .bind(&meter.site_token)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn all_meters(pool: &PgPool) -> Result<Vec<Meter>> {
    let rows = sqlx::query_as::<_, Meter>(
        "SELECT code, serial, meter_type, site_token FROM meters ORDER BY code",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
