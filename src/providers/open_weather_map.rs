//! OpenWeatherMap history provider.
//!
//! One request per window against `/history/city` with a unix-seconds
//! window. Temperatures arrive in Kelvin and are converted to °C; wind is
//! already m/s. API key goes in the `appid` query parameter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::AppError;
use crate::http::HttpClient;
use crate::providers::{gust_or_wind, Coordinate, Lifecycle, Provider, Weather};

const BASE_URL: &str = "https://history.openweathermap.org/data/2.5";

const KELVIN_OFFSET: f64 = 273.15;

fn kelvin_to_celsius(v: f64) -> f64 {
    ((v - KELVIN_OFFSET) * 100.0).round() / 100.0
}

pub struct OpenWeatherMap {
    http: HttpClient,
    api_key: String,
    lifecycle: Lifecycle,
}

impl OpenWeatherMap {
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
    list: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    dt: i64,
    main: MainBlock,
    wind: WindBlock,
    clouds: Option<CloudsBlock>,
    rain: Option<VolumeBlock>,
    snow: Option<VolumeBlock>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    /// Kelvin.
    temp: f64,
    feels_like: Option<f64>,
    pressure: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct WindBlock {
    speed: f64,
    deg: f64,
    gust: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CloudsBlock {
    all: f64,
}

#[derive(Debug, Deserialize)]
struct VolumeBlock {
    #[serde(rename = "1h")]
    one_hour: Option<f64>,
}

#[async_trait]
impl Provider for OpenWeatherMap {
    fn name(&self) -> &'static str {
        "open_weather_map"
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
                "/history/city",
                &[
                    ("lat", coordinate.latitude.to_string()),
                    ("lon", coordinate.longitude.to_string()),
                    ("type", "hour".to_string()),
                    ("start_date", start.timestamp().to_string()),
                    ("end_date", end.timestamp().to_string()),
                    ("appid", self.api_key.clone()),
                ],
            )
            .await?;

        let mut records = Vec::with_capacity(response.list.len());
        for entry in response.list {
            let date = DateTime::<Utc>::from_timestamp(entry.dt, 0).ok_or_else(|| {
                AppError::Decode(format!("open_weather_map: epoch {} out of range", entry.dt))
            })?;

            if date < start || date > end {
                continue;
            }

            records.push(Weather {
                data_source: self.name(),
                date,
                temperature: kelvin_to_celsius(entry.main.temp),
                apparent_temperature: entry.main.feels_like.map(kelvin_to_celsius),
                pressure: entry.main.pressure,
                wind_speed: entry.wind.speed,
                wind_gust_speed: gust_or_wind(entry.wind.gust, entry.wind.speed),
                wind_direction: entry.wind.deg,
                humidity: entry.main.humidity,
                clouds: entry.clouds.map(|c| c.all),
                precipitation: entry.rain.and_then(|r| r.one_hour),
                snow: entry
                    .snow
                    .and_then(|s| s.one_hour)
                    .map(|v| v.round() as i32),
            });
        }

        records.sort_by_key(|r| r.date);
        Ok(records)
    }
}
