//! Visual Crossing timeline provider.
//!
//! The timeline endpoint limits how much history one request may span, so
//! the window is split into two-day slices; each slice is an independent
//! request and the results are concatenated.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;

use crate::errors::AppError;
use crate::helpers::{cm_to_mm, kmh_to_ms};
use crate::http::HttpClient;
use crate::providers::{gust_or_wind, Coordinate, Lifecycle, Provider, Weather};

const BASE_URL: &str = "https://weather.visualcrossing.com/VisualCrossingWebServices/rest/services";

/// Maximum days covered by one timeline request. Slicing is inclusive at
/// the low edge and the final slice is capped at the window end.
pub(crate) const CHUNK_DAYS: i64 = 2;

pub struct VisualCrossing {
    http: HttpClient,
    api_key: String,
    lifecycle: Lifecycle,
}

impl VisualCrossing {
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

/// Split `[start, end]` into per-request day windows of at most
/// `CHUNK_DAYS` days each.
pub(crate) fn chunk_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(NaiveDate, NaiveDate)> {
    let end_day = end.date_naive();
    let mut windows = Vec::new();
    let mut day = start.date_naive();
    while day <= end_day {
        let chunk_end = (day + Duration::days(CHUNK_DAYS - 1)).min(end_day);
        windows.push((day, chunk_end));
        day = chunk_end + Duration::days(1);
    }
    windows
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    days: Vec<TimelineDay>,
}

#[derive(Debug, Deserialize)]
struct TimelineDay {
    hours: Vec<TimelineHour>,
}

#[derive(Debug, Deserialize)]
struct TimelineHour {
    #[serde(rename = "datetimeEpoch")]
    datetime_epoch: i64,
    temp: f64,
    feelslike: Option<f64>,
    humidity: f64,
    /// Sea-level pressure (hPa).
    pressure: f64,
    /// km/h under `unitGroup=metric`.
    windspeed: f64,
    windgust: Option<f64>,
    winddir: f64,
    cloudcover: Option<f64>,
    precip: Option<f64>,
    /// cm under `unitGroup=metric`.
    snow: Option<f64>,
}

#[async_trait]
impl Provider for VisualCrossing {
    fn name(&self) -> &'static str {
        "visual_crossing"
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

        let mut records = Vec::new();
        for (from, to) in chunk_windows(start, end) {
            let response: TimelineResponse = self
                .http
                .get_json(
                    &format!(
                        "/timeline/{},{}/{}/{}",
                        coordinate.latitude, coordinate.longitude, from, to
                    ),
                    &[
                        ("unitGroup", "metric".to_string()),
                        ("key", self.api_key.clone()),
                        ("options", "preview".to_string()),
                        ("contentType", "json".to_string()),
                    ],
                )
                .await?;

            for hour in response.days.into_iter().flat_map(|d| d.hours) {
                let date = DateTime::<Utc>::from_timestamp(hour.datetime_epoch, 0).ok_or_else(
                    || {
                        AppError::Decode(format!(
                            "visual_crossing: epoch {} out of range",
                            hour.datetime_epoch
                        ))
                    },
                )?;

                if date < start || date > end {
                    continue;
                }

                let wind_speed = kmh_to_ms(hour.windspeed);
                records.push(Weather {
                    data_source: self.name(),
                    date,
                    temperature: hour.temp,
                    apparent_temperature: hour.feelslike,
                    pressure: hour.pressure,
                    wind_speed,
                    wind_gust_speed: gust_or_wind(hour.windgust.map(kmh_to_ms), wind_speed),
                    wind_direction: hour.winddir,
                    humidity: hour.humidity,
                    clouds: hour.cloudcover,
                    precipitation: hour.precip,
                    snow: hour.snow.map(cm_to_mm),
                });
            }
        }

        records.sort_by_key(|r| r.date);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_chunk_windows_ten_day_span() {
        let start = "2024-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2024-01-15T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let windows = chunk_windows(start, end);

        let expected: Vec<(NaiveDate, NaiveDate)> = [
            ("2024-01-05", "2024-01-06"),
            ("2024-01-07", "2024-01-08"),
            ("2024-01-09", "2024-01-10"),
            ("2024-01-11", "2024-01-12"),
            ("2024-01-13", "2024-01-14"),
            // final chunk capped at the window end
            ("2024-01-15", "2024-01-15"),
        ]
        .iter()
        .map(|(a, b)| (a.parse().unwrap(), b.parse().unwrap()))
        .collect();
        assert_eq!(windows, expected);
    }

    #[test]
    fn test_chunk_windows_single_day() {
        let start = "2024-01-05T03:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2024-01-05T20:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let windows = chunk_windows(start, end);
        assert_eq!(
            windows,
            vec![("2024-01-05".parse().unwrap(), "2024-01-05".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn test_each_chunk_is_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/timeline/35\.6897,139\.6922/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"days": []})))
            .mount(&server)
            .await;

        let provider = VisualCrossing::with_base_url(
            crate::http::build_shared_client(),
            "vc-key".to_string(),
            &server.uri(),
        );
        provider.setup().await.unwrap();

        let coord = Coordinate::new(35.6897, 139.6922).unwrap();
        let start = "2024-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2024-01-15T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        provider
            .get_historical_weather(coord, start, end)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let mut slices: Vec<String> = requests
            .iter()
            .map(|r| r.url.path().trim_start_matches("/timeline/35.6897,139.6922/").to_string())
            .collect();
        slices.sort();
        assert_eq!(
            slices,
            vec![
                "2024-01-05/2024-01-06",
                "2024-01-07/2024-01-08",
                "2024-01-09/2024-01-10",
                "2024-01-11/2024-01-12",
                "2024-01-13/2024-01-14",
                "2024-01-15/2024-01-15",
            ]
        );
    }

    #[tokio::test]
    async fn test_metric_units_are_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/timeline/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "days": [{
                    "hours": [{
                        // 2024-01-05T00:00:00Z
                        "datetimeEpoch": 1704412800,
                        "temp": -2.0,
                        "feelslike": -6.0,
                        "humidity": 85.0,
                        "pressure": 1021.0,
                        "windspeed": 18.0,
                        "windgust": null,
                        "winddir": 300.0,
                        "cloudcover": 100.0,
                        "precip": 0.4,
                        "snow": 1.2,
                    }]
                }]
            })))
            .mount(&server)
            .await;

        let provider = VisualCrossing::with_base_url(
            crate::http::build_shared_client(),
            "vc-key".to_string(),
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
        // 18 km/h → 5 m/s; null gust falls back to wind speed
        assert_eq!(records[0].wind_speed, 5.0);
        assert_eq!(records[0].wind_gust_speed, Some(5.0));
        // 1.2 cm → 12 mm
        assert_eq!(records[0].snow, Some(12));
        assert_eq!(records[0].date, start);
    }
}
