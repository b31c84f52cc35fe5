//! Meteostat bulk provider.
//!
//! Operates on whole calendar years of gzipped CSV keyed by station rather
//! than by coordinate. Setup loads the stations manifest (disk-cached,
//! fetched only when the cache file is absent) into an in-memory coordinate
//! matrix; each fetch resolves the nearest station, pulls the years the
//! window spans concurrently and trims the parsed frames to the window.
//! Parsed year frames are kept in a bounded LRU keyed by (station, year).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use futures::future::try_join_all;
use serde::Deserialize;

use crate::cache::LruCache;
use crate::errors::AppError;
use crate::helpers::kmh_to_ms;
use crate::http::HttpClient;
use crate::providers::{gust_or_wind, Coordinate, Lifecycle, Provider, Weather};

const BASE_URL: &str = "https://bulk.meteostat.net/v2";

const STATIONS_MANIFEST_PATH: &str = "/stations/lite.json.gz";

/// Disk cache root; the extracted manifest lives at
/// `<root>/stations/list-lite.json`. Eviction is manual (delete the file).
const DEFAULT_CACHE_DIR: &str = "./.cache/meteostat";

/// Parsed year frames kept in memory.
const FRAME_CACHE_CAPACITY: usize = 100;

pub struct Meteostat {
    http: HttpClient,
    cache_dir: PathBuf,
    lifecycle: Lifecycle,
    stations: RwLock<Option<Arc<StationIndex>>>,
    frames: Mutex<LruCache<(String, i32), Arc<Vec<HourlyRow>>>>,
}

impl Meteostat {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, BASE_URL, Path::new(DEFAULT_CACHE_DIR))
    }

    pub(crate) fn with_base_url(client: reqwest::Client, base_url: &str, cache_dir: &Path) -> Self {
        Self {
            http: HttpClient::new(client, base_url),
            cache_dir: cache_dir.to_path_buf(),
            lifecycle: Lifecycle::new(),
            stations: RwLock::new(None),
            frames: Mutex::new(LruCache::new(FRAME_CACHE_CAPACITY)),
        }
    }

    fn stations_cache_file(&self) -> PathBuf {
        self.cache_dir.join("stations").join("list-lite.json")
    }

    async fn load_manifest(&self) -> Result<String, AppError> {
        let cache_file = self.stations_cache_file();

        if cache_file.exists() {
            tracing::info!(
                "Found cached stations manifest at {}, loading",
                cache_file.display()
            );
            let contents = tokio::fs::read_to_string(&cache_file).await?;
            if contents.is_empty() {
                return Err(AppError::Decode(format!(
                    "cached stations manifest {} is empty",
                    cache_file.display()
                )));
            }
            return Ok(contents);
        }

        tracing::info!(
            "No stations manifest cached at {}, fetching",
            cache_file.display()
        );
        let decompressed = self.http.get_gzipped(STATIONS_MANIFEST_PATH).await?;
        let contents = String::from_utf8(decompressed)
            .map_err(|e| AppError::Decode(format!("stations manifest is not UTF-8: {}", e)))?;
        if contents.is_empty() {
            return Err(AppError::Decode(
                "stations manifest endpoint returned an empty body".to_string(),
            ));
        }

        if let Some(parent) = cache_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&cache_file, &contents).await?;

        Ok(contents)
    }

    fn station_index(&self) -> Result<Arc<StationIndex>, AppError> {
        self.stations
            .read()
            .expect("stations lock poisoned")
            .clone()
            .ok_or_else(|| {
                AppError::Config("meteostat station index was not loaded at setup".to_string())
            })
    }

    /// Fetch and parse one calendar year of hourly CSV for a station,
    /// consulting the frame cache first.
    async fn year_frame(
        &self,
        station_id: &str,
        year: i32,
    ) -> Result<Arc<Vec<HourlyRow>>, AppError> {
        let key = (station_id.to_string(), year);
        let cached = {
            let mut frames = self.frames.lock().expect("frame cache lock poisoned");
            frames.get(&key).cloned()
        };
        if let Some(frame) = cached {
            tracing::debug!("meteostat: frame cache hit for station {} year {}", station_id, year);
            return Ok(frame);
        }

        let decompressed = self
            .http
            .get_gzipped(&format!("/hourly/{}/{}.csv.gz", year, station_id))
            .await?;
        let frame = Arc::new(parse_hourly_frame(&decompressed)?);

        self.frames
            .lock()
            .expect("frame cache lock poisoned")
            .insert(key, frame.clone());

        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// Stations manifest / nearest-station index
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    location: ManifestLocation,
}

#[derive(Debug, Deserialize)]
struct ManifestLocation {
    latitude: f64,
    longitude: f64,
}

/// Parallel station ids and an N×2 coordinate matrix.
#[derive(Debug)]
pub(crate) struct StationIndex {
    ids: Vec<String>,
    coordinates: Vec<[f64; 2]>,
}

impl StationIndex {
    fn parse(manifest: &str) -> Result<Self, AppError> {
        let entries: Vec<ManifestEntry> = serde_json::from_str(manifest)
            .map_err(|e| AppError::Decode(format!("invalid stations manifest: {}", e)))?;

        let mut ids = Vec::with_capacity(entries.len());
        let mut coordinates = Vec::with_capacity(entries.len());
        for entry in entries {
            coordinates.push([entry.location.latitude, entry.location.longitude]);
            ids.push(entry.id);
        }

        Ok(Self { ids, coordinates })
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Resolve the station with minimum Euclidean distance to the point;
    /// ties break to the lowest index. Plain coordinate-space distance, no
    /// great-circle correction; station coverage is dense enough.
    pub(crate) fn find_nearest(&self, point: Coordinate) -> Option<&str> {
        let mut best: Option<(usize, f64)> = None;
        for (i, [lat, lon]) in self.coordinates.iter().enumerate() {
            let d2 = (lat - point.latitude).powi(2) + (lon - point.longitude).powi(2);
            match best {
                Some((_, best_d2)) if d2 >= best_d2 => {}
                _ => best = Some((i, d2)),
            }
        }
        best.map(|(i, _)| self.ids[i].as_str())
    }
}

// ---------------------------------------------------------------------------
// Hourly CSV frames
// ---------------------------------------------------------------------------

/// One row of the bulk hourly CSV, columns
/// `date,hour,temp,dwpt,rhum,prcp,snow,wdir,wspd,wpgt,pres,tsun,coco`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HourlyRow {
    date: NaiveDate,
    hour: u32,
    temp: Option<f64>,
    #[allow(dead_code)]
    dwpt: Option<f64>,
    rhum: Option<f64>,
    prcp: Option<f64>,
    snow: Option<f64>,
    wdir: Option<f64>,
    wspd: Option<f64>,
    wpgt: Option<f64>,
    pres: Option<f64>,
    #[allow(dead_code)]
    tsun: Option<f64>,
    #[allow(dead_code)]
    coco: Option<f64>,
}

impl HourlyRow {
    fn date_utc(&self) -> DateTime<Utc> {
        let midnight = self
            .date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time of day");
        DateTime::from_naive_utc_and_offset(midnight, Utc) + Duration::hours(self.hour as i64)
    }
}

fn parse_hourly_frame(csv_bytes: &[u8]) -> Result<Vec<HourlyRow>, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(csv_bytes);

    let mut rows = Vec::new();
    for result in reader.deserialize() {
        let row: HourlyRow =
            result.map_err(|e| AppError::Decode(format!("invalid hourly CSV row: {}", e)))?;
        rows.push(row);
    }
    Ok(rows)
}

fn row_to_weather(row: &HourlyRow) -> Option<Weather> {
    let (temperature, pressure, wind_speed, wind_direction, humidity) =
        match (row.temp, row.pres, row.wspd, row.wdir, row.rhum) {
            (Some(t), Some(p), Some(ws), Some(wd), Some(h)) => (t, p, ws, wd, h),
            _ => {
                tracing::debug!(
                    "meteostat: row at {} {} is missing mandatory fields, skipping",
                    row.date,
                    row.hour
                );
                return None;
            }
        };

    let wind_speed = kmh_to_ms(wind_speed);
    Some(Weather {
        data_source: "meteostat",
        date: row.date_utc(),
        temperature,
        apparent_temperature: None,
        pressure,
        wind_speed,
        wind_gust_speed: gust_or_wind(row.wpgt.map(kmh_to_ms), wind_speed),
        wind_direction,
        humidity,
        // The frame carries a condition code, not a coverage percentage.
        clouds: None,
        precipitation: row.prcp,
        snow: row.snow.map(|v| v.round() as i32),
    })
}

#[async_trait]
impl Provider for Meteostat {
    fn name(&self) -> &'static str {
        "meteostat"
    }

    async fn setup(&self) -> Result<(), AppError> {
        if !self.lifecycle.begin_setup(self.name()) {
            return Ok(());
        }

        let manifest = self.load_manifest().await?;
        let index = StationIndex::parse(&manifest)?;
        tracing::info!("meteostat: station index loaded, {} stations", index.len());

        *self.stations.write().expect("stations lock poisoned") = Some(Arc::new(index));
        Ok(())
    }

    async fn teardown(&self) -> Result<(), AppError> {
        if !self.lifecycle.begin_teardown(self.name()) {
            return Ok(());
        }

        *self.stations.write().expect("stations lock poisoned") = None;
        *self.frames.lock().expect("frame cache lock poisoned") =
            LruCache::new(FRAME_CACHE_CAPACITY);
        Ok(())
    }

    async fn get_historical_weather(
        &self,
        coordinate: Coordinate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Weather>, AppError> {
        self.lifecycle.ensure_ready(self.name())?;

        let index = self.station_index()?;
        let station_id = index
            .find_nearest(coordinate)
            .ok_or_else(|| AppError::Decode("stations manifest has no stations".to_string()))?
            .to_string();
        tracing::debug!("meteostat: nearest station for {} is {}", coordinate, station_id);

        let frames = try_join_all(
            (start.year()..=end.year()).map(|year| self.year_frame(&station_id, year)),
        )
        .await?;

        let mut records: Vec<Weather> = frames
            .iter()
            .flat_map(|frame| frame.iter())
            .filter(|row| {
                let date = row.date_utc();
                date >= start && date <= end
            })
            .filter_map(row_to_weather)
            .collect();

        records.sort_by_key(|r| r.date);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn manifest_json() -> String {
        serde_json::json!([
            {"id": "10637", "location": {"latitude": 50.05, "longitude": 8.6}},
            {"id": "47662", "location": {"latitude": 35.69, "longitude": 139.75}},
        ])
        .to_string()
    }

    /// `date,hour,temp,dwpt,rhum,prcp,snow,wdir,wspd,wpgt,pres,tsun,coco`
    fn year_2023_csv() -> &'static str {
        "2023-12-31,21,-1.0,-3.0,80.0,0.0,,220,10.8,18.0,1015.0,,3\n\
         2023-12-31,22,-1.2,-3.1,81.0,0.0,,221,10.8,,1015.2,,3\n\
         2023-12-31,23,-1.4,-3.3,82.0,0.1,5,222,7.2,14.4,1015.4,,3\n"
    }

    fn year_2024_csv() -> &'static str {
        "2024-01-01,00,-1.6,-3.5,83.0,0.0,5,223,7.2,,1015.6,,3\n\
         2024-01-01,01,-1.8,-3.6,84.0,0.0,5,224,3.6,7.2,1015.8,,3\n\
         2024-01-01,02,-2.0,-3.8,85.0,0.0,5,225,3.6,7.2,1016.0,,3\n\
         2024-01-01,03,-2.2,-4.0,86.0,0.0,5,226,3.6,7.2,1016.2,,3\n"
    }

    async fn mock_bulk_endpoints(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/stations/lite.json.gz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(gzip_bytes(manifest_json().as_bytes())),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hourly/2023/47662.csv.gz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(gzip_bytes(year_2023_csv().as_bytes())),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hourly/2024/47662.csv.gz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(gzip_bytes(year_2024_csv().as_bytes())),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_find_nearest_station() {
        let index = StationIndex::parse(&manifest_json()).unwrap();
        let tokyo = Coordinate::new(35.6897, 139.6922).unwrap();
        assert_eq!(index.find_nearest(tokyo), Some("47662"));
        let frankfurt = Coordinate::new(50.11, 8.68).unwrap();
        assert_eq!(index.find_nearest(frankfurt), Some("10637"));
    }

    #[test]
    fn test_find_nearest_tie_breaks_to_lowest_index() {
        let manifest = serde_json::json!([
            {"id": "a", "location": {"latitude": 1.0, "longitude": 0.0}},
            {"id": "b", "location": {"latitude": -1.0, "longitude": 0.0}},
        ])
        .to_string();
        let index = StationIndex::parse(&manifest).unwrap();
        let origin = Coordinate::new(0.0, 0.0).unwrap();
        assert_eq!(index.find_nearest(origin), Some("a"));
    }

    #[test]
    fn test_parse_hourly_frame_with_empty_fields() {
        let rows = parse_hourly_frame(year_2023_csv().as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].snow, None);
        assert_eq!(rows[1].wpgt, None);
        assert_eq!(rows[2].snow, Some(5.0));
        assert_eq!(
            rows[0].date_utc(),
            "2023-12-31T21:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_window_spanning_two_years() {
        let server = MockServer::start().await;
        mock_bulk_endpoints(&server).await;
        let cache_dir = tempfile::tempdir().unwrap();

        let provider = Meteostat::with_base_url(
            crate::http::build_shared_client(),
            &server.uri(),
            cache_dir.path(),
        );
        provider.setup().await.unwrap();

        let coord = Coordinate::new(35.6897, 139.6922).unwrap();
        let start = "2023-12-31T22:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2024-01-01T02:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let records = provider
            .get_historical_weather(coord, start, end)
            .await
            .unwrap();

        // 22:00, 23:00, 00:00, 01:00, 02:00; the 21:00 and 03:00 rows fall
        // outside the window
        assert_eq!(records.len(), 5);
        assert_eq!(records.first().unwrap().date, start);
        assert_eq!(records.last().unwrap().date, end);
        assert!(records.windows(2).all(|w| w[0].date <= w[1].date));
        assert!(records.iter().all(|r| r.data_source == "meteostat"));
        assert!(records.iter().all(|r| r.clouds.is_none()));
        // 10.8 km/h → 3 m/s; missing gust falls back to wind speed
        assert_eq!(records[0].wind_speed, 3.0);
        assert_eq!(records[0].wind_gust_speed, Some(3.0));

        // Both year files fetched exactly once
        let requests = server.received_requests().await.unwrap();
        let year_fetches = requests
            .iter()
            .filter(|r| r.url.path().starts_with("/hourly/"))
            .count();
        assert_eq!(year_fetches, 2);
    }

    #[tokio::test]
    async fn test_year_frames_are_cached() {
        let server = MockServer::start().await;
        mock_bulk_endpoints(&server).await;
        let cache_dir = tempfile::tempdir().unwrap();

        let provider = Meteostat::with_base_url(
            crate::http::build_shared_client(),
            &server.uri(),
            cache_dir.path(),
        );
        provider.setup().await.unwrap();

        let coord = Coordinate::new(35.6897, 139.6922).unwrap();
        let start = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2024-01-01T02:00:00Z".parse::<DateTime<Utc>>().unwrap();
        provider.get_historical_weather(coord, start, end).await.unwrap();
        provider.get_historical_weather(coord, start, end).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let year_fetches = requests
            .iter()
            .filter(|r| r.url.path() == "/hourly/2024/47662.csv.gz")
            .count();
        assert_eq!(year_fetches, 1, "second fetch should hit the frame cache");
    }

    #[tokio::test]
    async fn test_stations_manifest_disk_cache() {
        let server = MockServer::start().await;
        mock_bulk_endpoints(&server).await;
        let cache_dir = tempfile::tempdir().unwrap();

        let first = Meteostat::with_base_url(
            crate::http::build_shared_client(),
            &server.uri(),
            cache_dir.path(),
        );
        first.setup().await.unwrap();

        // A fresh provider instance with the same cache dir reads from disk.
        let second = Meteostat::with_base_url(
            crate::http::build_shared_client(),
            &server.uri(),
            cache_dir.path(),
        );
        second.setup().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let manifest_fetches = requests
            .iter()
            .filter(|r| r.url.path() == "/stations/lite.json.gz")
            .count();
        assert_eq!(manifest_fetches, 1);
    }

    #[tokio::test]
    async fn test_missing_year_propagates_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stations/lite.json.gz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(gzip_bytes(manifest_json().as_bytes())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hourly/1970/47662.csv.gz"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let cache_dir = tempfile::tempdir().unwrap();

        let provider = Meteostat::with_base_url(
            crate::http::build_shared_client(),
            &server.uri(),
            cache_dir.path(),
        );
        provider.setup().await.unwrap();

        let coord = Coordinate::new(35.6897, 139.6922).unwrap();
        let start = "1970-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let err = provider
            .get_historical_weather(coord, start, start)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::HttpStatus { status: 404, .. }));
    }
}
