//! City catalog loader.
//!
//! One-shot bootstrap: downloads the world-cities archive, extracts the CSV
//! entry, filters by minimum population and upserts into the `city` table
//! keyed by coordinate. The filtered CSV is cached on disk so later runs
//! skip the download; eviction is manual (delete the file).

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::db::queries;
use crate::errors::AppError;
use crate::http::HttpClient;

const BASE_URL: &str = "https://simplemaps.com/static/data/world-cities/basic";

const ARCHIVE_PATH: &str = "/simplemaps_worldcities_basicv1.76.zip";

/// Name of the CSV entry inside the archive. Its absence is fatal for the
/// bootstrap step.
const ARCHIVE_CSV_ENTRY: &str = "worldcities.csv";

const DEFAULT_CACHE_FILE: &str = "./.cache/cities/cities.csv";

/// Cities below this population are dropped from the catalog.
pub(crate) const MIN_POPULATION: i64 = 1_000_000;

/// One catalog row, as cached on disk and handed to the city table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogCity {
    pub name: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub population: i64,
}

/// Raw row shape of `worldcities.csv`; columns we don't use are ignored by
/// the CSV reader.
#[derive(Debug, Deserialize)]
struct RawCityRow {
    city: String,
    lat: f64,
    lng: f64,
    country: String,
    population: Option<f64>,
}

pub struct CityCatalog {
    http: HttpClient,
    pool: PgPool,
    cache_file: PathBuf,
}

impl CityCatalog {
    pub fn new(client: reqwest::Client, pool: PgPool) -> Self {
        Self::with_base_url(client, pool, BASE_URL, Path::new(DEFAULT_CACHE_FILE))
    }

    pub(crate) fn with_base_url(
        client: reqwest::Client,
        pool: PgPool,
        base_url: &str,
        cache_file: &Path,
    ) -> Self {
        Self {
            http: HttpClient::new(client, base_url),
            pool,
            cache_file: cache_file.to_path_buf(),
        }
    }

    /// Produce the filtered city list, from the disk cache when present,
    /// otherwise by downloading and unpacking the archive.
    pub async fn fetch_cities_list(&self) -> Result<Vec<CatalogCity>, AppError> {
        if self.cache_file.exists() {
            tracing::info!(
                "Found cached cities CSV at {}, loading",
                self.cache_file.display()
            );
            let contents = tokio::fs::read(&self.cache_file).await?;
            return parse_cached_csv(&contents);
        }

        tracing::info!(
            "No cities CSV cached at {}, downloading archive",
            self.cache_file.display()
        );
        let archive = self.http.get_raw(ARCHIVE_PATH, &[]).await?;
        let csv_bytes = extract_archive_entry(&archive)?;
        let cities = parse_raw_csv(&csv_bytes)?;

        if let Some(parent) = self.cache_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.cache_file, write_cached_csv(&cities)?).await?;

        Ok(cities)
    }

    /// Insert every catalog city whose coordinate is not already present.
    /// Returns the number of cities inserted.
    pub async fn populate(&self) -> Result<usize, AppError> {
        let cities = self.fetch_cities_list().await?;
        let inserted = queries::insert_missing_cities(&self.pool, &cities).await?;
        tracing::info!(
            "City catalog populated: {} of {} rows were new",
            inserted,
            cities.len()
        );
        Ok(inserted)
    }
}

fn extract_archive_entry(archive: &[u8]) -> Result<Vec<u8>, AppError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| AppError::Decode(format!("cities archive is not a zip file: {}", e)))?;

    let mut entry = zip.by_name(ARCHIVE_CSV_ENTRY).map_err(|e| {
        AppError::Decode(format!(
            "entry \"{}\" not found in the cities archive: {}",
            ARCHIVE_CSV_ENTRY, e
        ))
    })?;

    let mut contents = Vec::new();
    entry
        .read_to_end(&mut contents)
        .map_err(|e| AppError::Decode(format!("cannot read {}: {}", ARCHIVE_CSV_ENTRY, e)))?;
    Ok(contents)
}

/// Parse the upstream CSV and apply the population filter. Rows without a
/// population count as 0 and fall below any sensible threshold.
fn parse_raw_csv(csv_bytes: &[u8]) -> Result<Vec<CatalogCity>, AppError> {
    let mut reader = csv::Reader::from_reader(csv_bytes);
    let mut cities = Vec::new();
    for result in reader.deserialize() {
        let row: RawCityRow =
            result.map_err(|e| AppError::Decode(format!("invalid worldcities row: {}", e)))?;
        let population = row.population.unwrap_or(0.0) as i64;
        if population < MIN_POPULATION {
            continue;
        }
        cities.push(CatalogCity {
            name: row.city,
            country: row.country,
            latitude: row.lat,
            longitude: row.lng,
            population,
        });
    }
    Ok(cities)
}

fn parse_cached_csv(csv_bytes: &[u8]) -> Result<Vec<CatalogCity>, AppError> {
    let mut reader = csv::Reader::from_reader(csv_bytes);
    let mut cities = Vec::new();
    for result in reader.deserialize() {
        let row: CatalogCity =
            result.map_err(|e| AppError::Decode(format!("invalid cached cities row: {}", e)))?;
        cities.push(row);
    }
    Ok(cities)
}

fn write_cached_csv(cities: &[CatalogCity]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for city in cities {
        writer
            .serialize(city)
            .map_err(|e| AppError::Decode(format!("cannot serialize cities cache: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::Decode(format!("cannot flush cities cache: {}", e)))
}
