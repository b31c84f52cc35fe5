//! Tomorrow.io historical provider.
//!
//! The only POST provider: the window, field list and location travel in a
//! JSON body while the API key stays a query parameter. The location string
//! is `"lat, lon"` per the timeline API docs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::http::HttpClient;
use crate::providers::{gust_or_wind, Coordinate, Lifecycle, Provider, Weather};

const BASE_URL: &str = "https://api.tomorrow.io/v4";

/// `pressureSeaLevel` rather than `pressureSurfaceLevel`: the canonical
/// record wants sea-level pressure when the source offers it.
const FIELDS: &[&str] = &[
    "temperature",
    "temperatureApparent",
    "humidity",
    "windSpeed",
    "windDirection",
    "windGust",
    "pressureSeaLevel",
    "precipitationAccumulation",
    "snowAccumulation",
    "cloudCover",
];

pub struct Tomorrow {
    http: HttpClient,
    api_key: String,
    lifecycle: Lifecycle,
}

impl Tomorrow {
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

#[derive(Debug, Serialize)]
struct HistoricalRequest {
    timesteps: Vec<String>,
    #[serde(rename = "startTime")]
    start_time: String,
    #[serde(rename = "endTime")]
    end_time: String,
    fields: Vec<String>,
    units: String,
    location: String,
}

#[derive(Debug, Deserialize)]
struct HistoricalResponse {
    data: TimelinesData,
}

#[derive(Debug, Deserialize)]
struct TimelinesData {
    timelines: Vec<Timeline>,
}

#[derive(Debug, Deserialize)]
struct Timeline {
    intervals: Vec<Interval>,
}

#[derive(Debug, Deserialize)]
struct Interval {
    #[serde(rename = "startTime")]
    start_time: DateTime<Utc>,
    values: IntervalValues,
}

#[derive(Debug, Deserialize)]
struct IntervalValues {
    temperature: f64,
    #[serde(rename = "temperatureApparent")]
    temperature_apparent: Option<f64>,
    humidity: f64,
    #[serde(rename = "windSpeed")]
    wind_speed: f64,
    #[serde(rename = "windDirection")]
    wind_direction: f64,
    #[serde(rename = "windGust")]
    wind_gust: Option<f64>,
    #[serde(rename = "pressureSeaLevel")]
    pressure_sea_level: f64,
    #[serde(rename = "precipitationAccumulation")]
    precipitation_accumulation: Option<f64>,
    #[serde(rename = "snowAccumulation")]
    snow_accumulation: Option<f64>,
    #[serde(rename = "cloudCover")]
    cloud_cover: Option<f64>,
}

#[async_trait]
impl Provider for Tomorrow {
    fn name(&self) -> &'static str {
        "tomorrow"
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

        let body = HistoricalRequest {
            timesteps: vec!["1h".to_string()],
            start_time: start.to_rfc3339(),
            end_time: end.to_rfc3339(),
            fields: FIELDS.iter().map(|f| f.to_string()).collect(),
            units: "metric".to_string(),
            location: format!("{}, {}", coordinate.latitude, coordinate.longitude),
        };

        let response: HistoricalResponse = self
            .http
            .post_json("/historical", &[("apikey", self.api_key.clone())], &body)
            .await?;

        let mut records = Vec::new();
        for interval in response
            .data
            .timelines
            .into_iter()
            .flat_map(|t| t.intervals)
        {
            let date = interval.start_time;
            if date < start || date > end {
                continue;
            }

            let values = interval.values;
            records.push(Weather {
                data_source: self.name(),
                date,
                temperature: values.temperature,
                apparent_temperature: values.temperature_apparent,
                pressure: values.pressure_sea_level,
                wind_speed: values.wind_speed,
                wind_gust_speed: gust_or_wind(values.wind_gust, values.wind_speed),
                wind_direction: values.wind_direction,
                humidity: values.humidity,
                clouds: values.cloud_cover,
                precipitation: values.precipitation_accumulation,
                snow: values.snow_accumulation.map(|v| v.round() as i32),
            });
        }

        records.sort_by_key(|r| r.date);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_post_body_and_location_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/historical"))
            .and(query_param("apikey", "tm-key"))
            // latitude first
            .and(body_partial_json(json!({
                "timesteps": ["1h"],
                "units": "metric",
                "location": "35.6897, 139.6922",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "timelines": [{
                        "intervals": [{
                            "startTime": "2024-01-05T00:00:00Z",
                            "values": {
                                "temperature": 2.1,
                                "temperatureApparent": -0.4,
                                "humidity": 70.0,
                                "windSpeed": 4.2,
                                "windDirection": 180.0,
                                "windGust": null,
                                "pressureSeaLevel": 1015.0,
                                "precipitationAccumulation": 0.0,
                                "snowAccumulation": 0.0,
                                "cloudCover": 25.0,
                            }
                        }]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let provider = Tomorrow::with_base_url(
            crate::http::build_shared_client(),
            "tm-key".to_string(),
            &server.uri(),
        );
        provider.setup().await.unwrap();

        let coord = Coordinate::new(35.6897, 139.6922).unwrap();
        let start = "2024-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let records = provider
            .get_historical_weather(coord, start, start)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data_source, "tomorrow");
        assert_eq!(records[0].temperature, 2.1);
        assert_eq!(records[0].wind_gust_speed, Some(4.2));
        assert_eq!(records[0].snow, Some(0));
    }

    #[tokio::test]
    async fn test_intervals_outside_window_are_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/historical"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "timelines": [{
                        "intervals": [
                            {
                                "startTime": "2024-01-04T23:00:00Z",
                                "values": {
                                    "temperature": 1.0, "humidity": 70.0,
                                    "windSpeed": 4.2, "windDirection": 180.0,
                                    "pressureSeaLevel": 1015.0,
                                }
                            },
                            {
                                "startTime": "2024-01-05T00:00:00Z",
                                "values": {
                                    "temperature": 2.0, "humidity": 70.0,
                                    "windSpeed": 4.2, "windDirection": 180.0,
                                    "pressureSeaLevel": 1015.0,
                                }
                            }
                        ]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let provider = Tomorrow::with_base_url(
            crate::http::build_shared_client(),
            "tm-key".to_string(),
            &server.uri(),
        );
        provider.setup().await.unwrap();

        let coord = Coordinate::new(35.6897, 139.6922).unwrap();
        let start = "2024-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let records = provider
            .get_historical_weather(coord, start, start)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].temperature, 2.0);
        // Fields the interval omitted stay None
        assert_eq!(records[0].clouds, None);
        assert_eq!(records[0].precipitation, None);
        assert_eq!(records[0].snow, None);
    }
}
