//! Weatherbit history provider.
//!
//! Single request per window against `/history/hourly`; values are already
//! metric (m/s, °C, hPa, mm). API key goes in the `key` query parameter.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::errors::AppError;
use crate::http::HttpClient;
use crate::providers::{gust_or_wind, Coordinate, Lifecycle, Provider, Weather};

const BASE_URL: &str = "https://api.weatherbit.io/v2.0/";

/// Timestamp format of the `datetime` field.
const DATETIME_FORMAT: &str = "%Y-%m-%d:%H";

pub struct WeatherBit {
    http: HttpClient,
    api_key: String,
    lifecycle: Lifecycle,
}

impl WeatherBit {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self::with_base_url(client, api_key, BASE_URL)
    }

    pub(crate) fn with_base_url(client: reqwest::Client, api_key: String, base_url: &str) -> Self {
        Self {
            http: HttpClient::new(client, base_url),
            api_key,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    data: Vec<HourEntry>,
}

#[derive(Debug, Deserialize)]
struct HourEntry {
    datetime: String,
    temp: f64,
    app_temp: Option<f64>,
    /// Sea-level pressure (hPa).
    slp: f64,
    wind_spd: f64,
    wind_gust_spd: Option<f64>,
    wind_dir: f64,
    rh: f64,
    clouds: Option<f64>,
    precip: Option<f64>,
    snow: Option<f64>,
}

#[async_trait]
impl Provider for WeatherBit {
    fn name(&self) -> &'static str {
        "weather_bit"
    }

    async fn setup(&self) -> Result<(), AppError> {
        self.lifecycle.begin_setup(self.name());
        Ok(())
    }

    async fn teardown(&self) -> Result<(), AppError> {
        self.lifecycle.begin_teardown(self.name());
        Ok(())
    }

    async fn get_historical_weather(
        &self,
        coordinate: Coordinate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Weather>, AppError> {
        self.lifecycle.ensure_ready(self.name())?;

        let response: HistoryResponse = self
            .http
            .get_json(
                "/history/hourly",
                &[
                    ("lat", coordinate.latitude.to_string()),
                    ("lon", coordinate.longitude.to_string()),
                    ("start_date", start.format("%Y-%m-%d").to_string()),
                    ("end_date", end.format("%Y-%m-%d").to_string()),
                    ("key", self.api_key.clone()),
                ],
            )
            .await?;

        let mut records = Vec::with_capacity(response.data.len());
        for entry in response.data {
            let date = NaiveDateTime::parse_from_str(&entry.datetime, DATETIME_FORMAT)
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
                .map_err(|e| {
                    AppError::Decode(format!(
                        "weather_bit: invalid datetime \"{}\": {}",
                        entry.datetime, e
                    ))
                })?;

            if date < start || date > end {
                continue;
            }

            records.push(Weather {
                data_source: self.name(),
                date,
                temperature: entry.temp,
                apparent_temperature: entry.app_temp,
                pressure: entry.slp,
                wind_speed: entry.wind_spd,
                wind_gust_speed: gust_or_wind(entry.wind_gust_spd, entry.wind_spd),
                wind_direction: entry.wind_dir,
                humidity: entry.rh,
                clouds: entry.clouds,
                precipitation: entry.precip,
                snow: entry.snow.map(|v| v.round() as i32),
            });
        }

        records.sort_by_key(|r| r.date);
        Ok(records)
    }
}
