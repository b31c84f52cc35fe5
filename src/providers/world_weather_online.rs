//! World Weather Online past-weather provider.
//!
//! One request per window; the response nests hourly blocks inside day
//! blocks, with every numeric value serialized as a string. The hourly
//! `time` field counts in HHMM (0, 100, … 2300).

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;

use crate::errors::AppError;
use crate::helpers::{cm_to_mm, kmh_to_ms};
use crate::http::HttpClient;
use crate::providers::{gust_or_wind, Coordinate, Lifecycle, Provider, Weather};

const BASE_URL: &str = "https://api.worldweatheronline.com/premium/v1";

pub struct WorldWeatherOnline {
    http: HttpClient,
    api_key: String,
    lifecycle: Lifecycle,
}

impl WorldWeatherOnline {
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
struct PastWeatherResponse {
    data: PastWeatherData,
}

#[derive(Debug, Deserialize)]
struct PastWeatherData {
    weather: Vec<DayBlock>,
}

#[derive(Debug, Deserialize)]
struct DayBlock {
    date: NaiveDate,
    #[serde(rename = "totalSnow_cm")]
    total_snow_cm: String,
    hourly: Vec<HourBlock>,
}

#[derive(Debug, Deserialize)]
struct HourBlock {
    /// HHMM as a bare number string: "0", "100", … "2300".
    time: String,
    #[serde(rename = "tempC")]
    temp_c: String,
    #[serde(rename = "FeelsLikeC")]
    feels_like_c: String,
    pressure: String,
    #[serde(rename = "windspeedKmph")]
    windspeed_kmph: String,
    #[serde(rename = "WindGustKmph")]
    wind_gust_kmph: Option<String>,
    #[serde(rename = "winddirDegree")]
    winddir_degree: String,
    humidity: String,
    cloudcover: String,
    #[serde(rename = "precipMM")]
    precip_mm: String,
}

fn numeric(value: &str, field: &str) -> Result<f64, AppError> {
    value.parse::<f64>().map_err(|e| {
        AppError::Decode(format!(
            "world_weather_online: field {} = \"{}\" is not numeric: {}",
            field, value, e
        ))
    })
}

#[async_trait]
impl Provider for WorldWeatherOnline {
    fn name(&self) -> &'static str {
        "world_weather_online"
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

        let response: PastWeatherResponse = self
            .http
            .get_json(
                "/past-weather.ashx",
                &[
                    ("q", coordinate.to_string()),
                    ("date", start.format("%Y-%m-%d").to_string()),
                    ("enddate", end.format("%Y-%m-%d").to_string()),
                    ("tp", "1".to_string()),
                    ("format", "json".to_string()),
                    ("key", self.api_key.clone()),
                ],
            )
            .await?;

        let mut records = Vec::new();
        for day in response.data.weather {
            let midnight = day
                .date
                .and_hms_opt(0, 0, 0)
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
                .expect("midnight is always a valid time of day");
            let snow = cm_to_mm(numeric(&day.total_snow_cm, "totalSnow_cm")?);

            for hour in day.hourly {
                let hhmm: i64 = hour.time.parse().map_err(|_| {
                    AppError::Decode(format!(
                        "world_weather_online: invalid hourly time \"{}\"",
                        hour.time
                    ))
                })?;
                let date = midnight + Duration::hours(hhmm / 100);

                if date < start || date > end {
                    continue;
                }

                let wind_speed = kmh_to_ms(numeric(&hour.windspeed_kmph, "windspeedKmph")?);
                let gust = match &hour.wind_gust_kmph {
                    Some(raw) => Some(kmh_to_ms(numeric(raw, "WindGustKmph")?)),
                    None => None,
                };

                records.push(Weather {
                    data_source: self.name(),
                    date,
                    temperature: numeric(&hour.temp_c, "tempC")?,
                    apparent_temperature: Some(numeric(&hour.feels_like_c, "FeelsLikeC")?),
                    pressure: numeric(&hour.pressure, "pressure")?,
                    wind_speed,
                    wind_gust_speed: gust_or_wind(gust, wind_speed),
                    wind_direction: numeric(&hour.winddir_degree, "winddirDegree")?,
                    humidity: numeric(&hour.humidity, "humidity")?,
                    clouds: Some(numeric(&hour.cloudcover, "cloudcover")?),
                    precipitation: Some(numeric(&hour.precip_mm, "precipMM")?),
                    snow: Some(snow),
                });
            }
        }

        records.sort_by_key(|r| r.date);
        Ok(records)
    }
}
