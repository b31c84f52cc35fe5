use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use super::models::{AveragedWeather, City, CityEntry};
use crate::errors::AppError;
use crate::helpers::f64_to_decimal_full;
use crate::providers::Weather;
use crate::services::catalog::CatalogCity;

/// City SELECT column list. Keep in sync with the `City` model struct.
const CITY_COLS: &str = "id, name, country, latitude, longitude, population";

// ---------------------------------------------------------------------------
// City catalog
// ---------------------------------------------------------------------------

/// Load every `(latitude, longitude)` pair already present in the catalog.
pub(crate) async fn existing_coordinates(
    pool: &PgPool,
) -> Result<HashSet<(Decimal, Decimal)>, sqlx::Error> {
    let rows: Vec<(Decimal, Decimal)> =
        sqlx::query_as("SELECT latitude, longitude FROM city").fetch_all(pool).await?;
    Ok(rows.into_iter().collect())
}

/// Insert the catalog rows whose coordinate is not already present, in one
/// transaction. Returns the number of cities inserted.
pub(crate) async fn insert_missing_cities(
    pool: &PgPool,
    rows: &[CatalogCity],
) -> Result<usize, sqlx::Error> {
    let present = existing_coordinates(pool).await?;

    let mut tx = pool.begin().await?;
    let mut inserted = 0u64;
    for row in rows {
        let latitude = f64_to_decimal_full(row.latitude);
        let longitude = f64_to_decimal_full(row.longitude);
        if present.contains(&(latitude, longitude)) {
            continue;
        }

        // ON CONFLICT covers a concurrent bootstrap racing this transaction.
        let result = sqlx::query(
            "INSERT INTO city (name, country, latitude, longitude, population)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (latitude, longitude) DO NOTHING",
        )
        .bind(&row.name)
        .bind(&row.country)
        .bind(latitude)
        .bind(longitude)
        .bind(row.population)
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected();
    }
    tx.commit().await?;

    Ok(inserted as usize)
}

/// All cities, most populous first, the order the collector fans out in.
pub(crate) async fn list_cities_by_population(pool: &PgPool) -> Result<Vec<City>, sqlx::Error> {
    sqlx::query_as::<_, City>(&format!(
        "SELECT {CITY_COLS} FROM city ORDER BY population DESC"
    ))
    .fetch_all(pool)
    .await
}

/// Prefix search over city names, most populous first.
pub(crate) async fn search_cities(
    pool: &PgPool,
    prefix: &str,
    limit: i64,
) -> Result<Vec<CityEntry>, sqlx::Error> {
    sqlx::query_as::<_, CityEntry>(
        "SELECT name, country FROM city
         WHERE name ILIKE $1 || '%'
         ORDER BY population DESC
         LIMIT $2",
    )
    .bind(prefix)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Resolve the catalog city nearest to a point (plain coordinate-space
/// distance, consistent with the station index).
pub(crate) async fn closest_city(
    pool: &PgPool,
    latitude: f64,
    longitude: f64,
) -> Result<Option<City>, sqlx::Error> {
    sqlx::query_as::<_, City>(&format!(
        "SELECT {CITY_COLS} FROM city
         ORDER BY POWER(latitude::float8 - $1, 2) + POWER(longitude::float8 - $2, 2)
         LIMIT 1"
    ))
    .bind(latitude)
    .bind(longitude)
    .fetch_optional(pool)
    .await
}

// ---------------------------------------------------------------------------
// Weather journal
// ---------------------------------------------------------------------------

/// The dedup window: dates already journaled for this (city, provider)
/// inside `[start, end]`.
pub(crate) async fn present_dates(
    pool: &PgPool,
    city_id: i32,
    data_source: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<HashSet<DateTime<Utc>>, sqlx::Error> {
    let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT date FROM weather_journal
         WHERE city_id = $1 AND data_source = $2 AND date BETWEEN $3 AND $4",
    )
    .bind(city_id)
    .bind(data_source)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Append the records whose `date` is not already journaled, in one
/// transaction. A unique-violation on commit means a concurrent run
/// inserted an overlapping batch first: the batch is logged and skipped,
/// not retried. Returns the number of rows written.
pub(crate) async fn append_new_records(
    pool: &PgPool,
    city_id: i32,
    records: &[Weather],
    present: &HashSet<DateTime<Utc>>,
) -> Result<usize, AppError> {
    let result = append_all(pool, city_id, records, present).await;
    match result {
        Ok(written) => Ok(written),
        Err(err) if err.is_integrity_violation() => {
            tracing::warn!(
                "Journal batch for city {} overlaps a concurrent insert, skipping: {}",
                city_id,
                err
            );
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

/// The records whose `date` is not in the dedup window.
pub(crate) fn unseen<'a>(
    records: &'a [Weather],
    present: &HashSet<DateTime<Utc>>,
) -> Vec<&'a Weather> {
    records
        .iter()
        .filter(|record| !present.contains(&record.date))
        .collect()
}

async fn append_all(
    pool: &PgPool,
    city_id: i32,
    records: &[Weather],
    present: &HashSet<DateTime<Utc>>,
) -> Result<usize, AppError> {
    let mut tx = pool.begin().await.map_err(AppError::Database)?;
    let mut written = 0;

    for record in unseen(records, present) {
        sqlx::query(
            "INSERT INTO weather_journal
                 (data_source, date, temperature, pressure, wind_speed,
                  wind_direction, humidity, clouds, precipitation, snow, city_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.data_source)
        .bind(record.date)
        .bind(record.temperature)
        .bind(record.pressure)
        .bind(record.wind_speed)
        .bind(record.wind_direction)
        .bind(record.humidity)
        .bind(record.clouds)
        .bind(record.precipitation)
        .bind(record.snow)
        .bind(city_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;
        written += 1;
    }

    tx.commit().await.map_err(AppError::Database)?;
    Ok(written)
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

/// Per-hour averages across data sources for one city, keyset-paginated by
/// `date`. Fetches `limit` rows; the route layer asks for one extra row to
/// detect whether a next page exists.
pub(crate) async fn averaged_weather(
    pool: &PgPool,
    city_id: i32,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<AveragedWeather>, sqlx::Error> {
    sqlx::query_as::<_, AveragedWeather>(
        "SELECT
             date,
             COUNT(id) AS merge_rows_count,
             AVG(temperature)::float8 AS temperature,
             AVG(pressure)::float8 AS pressure,
             AVG(wind_speed)::float8 AS wind_speed,
             AVG(wind_direction)::float8 AS wind_direction,
             AVG(humidity)::float8 AS humidity,
             AVG(precipitation)::float8 AS precipitation,
             AVG(snow)::float8 AS snow
         FROM weather_journal
         WHERE city_id = $1 AND date >= $2 AND date <= $3
         GROUP BY date
         ORDER BY date
         LIMIT $4",
    )
    .bind(city_id)
    .bind(from)
    .bind(to)
    .bind(limit)
    .fetch_all(pool)
    .await
}
