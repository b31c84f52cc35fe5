//! Open-Meteo archive provider.
//!
//! One request per window: the archive endpoint takes whole days and
//! returns parallel hourly arrays which are flattened into canonical
//! records. No API key required.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::errors::AppError;
use crate::helpers::{cm_to_mm, kmh_to_ms};
use crate::http::HttpClient;
use crate::providers::{gust_or_wind, Coordinate, Lifecycle, Provider, Weather};

const BASE_URL: &str = "https://archive-api.open-meteo.com/v1";

/// Hourly variables requested from the archive. `pressure_msl` is chosen
/// over `surface_pressure` because the canonical record wants sea-level
/// pressure when the source offers it.
const HOURLY_VARIABLES: &[&str] = &[
    "temperature_2m",
    "relative_humidity_2m",
    "apparent_temperature",
    "precipitation",
    "snowfall",
    "pressure_msl",
    "cloud_cover",
    "wind_speed_10m",
    "wind_direction_10m",
    "wind_gusts_10m",
];

/// Timestamp format of the hourly `time` array.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

pub struct OpenMeteo {
    http: HttpClient,
    lifecycle: Lifecycle,
}

impl OpenMeteo {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, BASE_URL)
    }

    pub(crate) fn with_base_url(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            http: HttpClient::new(client, base_url),
            lifecycle: Lifecycle::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    hourly: HourlyBlock,
}

/// Parallel arrays; individual slots may be null.
#[derive(Debug, Deserialize)]
struct HourlyBlock {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    relative_humidity_2m: Vec<Option<f64>>,
    apparent_temperature: Vec<Option<f64>>,
    precipitation: Vec<Option<f64>>,
    snowfall: Vec<Option<f64>>,
    pressure_msl: Vec<Option<f64>>,
    cloud_cover: Vec<Option<f64>>,
    wind_speed_10m: Vec<Option<f64>>,
    wind_direction_10m: Vec<Option<f64>>,
    wind_gusts_10m: Vec<Option<f64>>,
}

impl HourlyBlock {
    fn value(array: &[Option<f64>], i: usize) -> Option<f64> {
        array.get(i).copied().flatten()
    }
}

#[async_trait]
impl Provider for OpenMeteo {
    fn name(&self) -> &'static str {
        "open_meteo"
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

        let response: ArchiveResponse = self
            .http
            .get_json(
                "/archive",
                &[
                    ("latitude", coordinate.latitude.to_string()),
                    ("longitude", coordinate.longitude.to_string()),
                    ("start_date", start.format("%Y-%m-%d").to_string()),
                    ("end_date", end.format("%Y-%m-%d").to_string()),
                    ("hourly", HOURLY_VARIABLES.join(",")),
                ],
            )
            .await?;

        let hourly = &response.hourly;
        let mut records = Vec::with_capacity(hourly.time.len());

        for (i, time) in hourly.time.iter().enumerate() {
            let date = NaiveDateTime::parse_from_str(time, TIME_FORMAT)
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
                .map_err(|e| {
                    AppError::Decode(format!("open_meteo: invalid time \"{}\": {}", time, e))
                })?;

            // The archive covers whole days; trim to the requested window.
            if date < start || date > end {
                continue;
            }

            let (temperature, pressure, wind_speed, wind_direction, humidity) = match (
                HourlyBlock::value(&hourly.temperature_2m, i),
                HourlyBlock::value(&hourly.pressure_msl, i),
                HourlyBlock::value(&hourly.wind_speed_10m, i),
                HourlyBlock::value(&hourly.wind_direction_10m, i),
                HourlyBlock::value(&hourly.relative_humidity_2m, i),
            ) {
                (Some(t), Some(p), Some(ws), Some(wd), Some(h)) => (t, p, ws, wd, h),
                _ => {
                    tracing::warn!(
                        "open_meteo: hour {} is missing mandatory fields, skipping",
                        time
                    );
                    continue;
                }
            };

            let wind_speed = kmh_to_ms(wind_speed);
            records.push(Weather {
                data_source: self.name(),
                date,
                temperature,
                apparent_temperature: HourlyBlock::value(&hourly.apparent_temperature, i),
                pressure,
                wind_speed,
                wind_gust_speed: gust_or_wind(
                    HourlyBlock::value(&hourly.wind_gusts_10m, i).map(kmh_to_ms),
                    wind_speed,
                ),
                wind_direction,
                humidity,
                clouds: HourlyBlock::value(&hourly.cloud_cover, i),
                precipitation: HourlyBlock::value(&hourly.precipitation, i),
                snow: HourlyBlock::value(&hourly.snowfall, i).map(cm_to_mm),
            });
        }

        Ok(records)
    }
}
