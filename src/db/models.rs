use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::errors::AppError;
use crate::helpers::dec_to_f64;
use crate::providers::Coordinate;

/// A catalog city. Created once by the catalog loader, never mutated or
/// deleted afterwards; `(latitude, longitude)` is the logical key.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct City {
    pub id: i32,
    pub name: String,
    pub country: String,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub population: i64,
}

impl City {
    pub fn coordinate(&self) -> Result<Coordinate, AppError> {
        Coordinate::new(dec_to_f64(self.latitude), dec_to_f64(self.longitude))
    }
}

/// A city search hit.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct CityEntry {
    pub name: String,
    pub country: String,
}

/// One hour of journal data averaged across data sources.
///
/// Averages are NULL when no source supplied the field for that hour, so
/// every measurement is optional.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct AveragedWeather {
    pub date: DateTime<Utc>,
    /// How many journal rows (data sources) were merged into this hour.
    pub merge_rows_count: i64,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation: Option<f64>,
    pub snow: Option<f64>,
}
