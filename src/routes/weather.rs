use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::AppState;
use crate::db::models::AveragedWeather;
use crate::db::queries;
use crate::errors::AppError;
use crate::providers::Coordinate;

/// Rows per page of averaged weather.
const PAGE_SIZE: i64 = 500;

#[derive(Debug, Deserialize, IntoParams)]
pub struct WeatherParams {
    /// Latitude of the point to resolve to the nearest catalog city
    pub lat: f64,
    /// Longitude of the point to resolve to the nearest catalog city
    pub lon: f64,
    /// Window start (inclusive)
    pub from: DateTime<Utc>,
    /// Window end (inclusive)
    pub to: DateTime<Utc>,
    /// Keyset cursor: resume from this date (from a previous `next_date`)
    pub cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WeatherResponse {
    /// Resolved city name
    pub city: String,
    /// Resolved city country
    pub country: String,
    /// Per-hour averages across data sources, ascending by date
    pub data: Vec<AveragedWeather>,
    /// Cursor for the next page, absent on the last page
    pub next_date: Option<DateTime<Utc>>,
}

/// Averaged hourly weather for the city nearest to a point.
#[utoipa::path(
    get,
    path = "/api/v1/weather",
    tag = "Weather",
    params(WeatherParams),
    responses(
        (status = 200, description = "Averaged hourly weather", body = WeatherResponse),
        (status = 400, description = "Invalid window or coordinates", body = crate::errors::ErrorResponse),
        (status = 404, description = "City catalog is empty", body = crate::errors::ErrorResponse),
    )
)]
pub async fn get_weather(
    State(state): State<AppState>,
    Query(params): Query<WeatherParams>,
) -> Result<Json<WeatherResponse>, AppError> {
    if params.from > params.to {
        return Err(AppError::BadRequest(
            "`from` must not be later than `to`".to_string(),
        ));
    }
    let coordinate = Coordinate::new(params.lat, params.lon)?;

    let city = queries::closest_city(&state.pool, coordinate.latitude, coordinate.longitude)
        .await?
        .ok_or_else(|| AppError::NotFound("the city catalog is empty".to_string()))?;

    tracing::info!("Fetching weather data for: {}", city.name);

    let from = params.cursor.unwrap_or(params.from).max(params.from);
    let mut data =
        queries::averaged_weather(&state.pool, city.id, from, params.to, PAGE_SIZE + 1).await?;

    // One extra row was fetched to detect a next page; it becomes the cursor.
    let next_date = if data.len() as i64 > PAGE_SIZE {
        data.pop().map(|row| row.date)
    } else {
        None
    };

    Ok(Json(WeatherResponse {
        city: city.name,
        country: city.country,
        data,
        next_date,
    }))
}
