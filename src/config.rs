use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::errors::AppError;

/// Application configuration, parsed from a YAML (or JSON) file.
///
/// A provider whose section is absent, or present without the API key it
/// needs, is disabled: the orchestrator skips it with a warning instead of
/// failing at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub data_sources: DataSourcesConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub collect: CollectConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataSourcesConfig {
    pub open_meteo: Option<ProviderConfig>,
    pub weather_bit: Option<ProviderConfig>,
    pub meteostat: Option<ProviderConfig>,
    pub visual_crossing: Option<ProviderConfig>,
    pub world_weather_online: Option<ProviderConfig>,
    pub open_weather_map: Option<ProviderConfig>,
    pub tomorrow: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

/// Collection window, whole days interpreted at midnight UTC.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectConfig {
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
    #[serde(default = "default_end_date")]
    pub end_date: NaiveDate,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            start_date: default_start_date(),
            end_date: default_end_date(),
        }
    }
}

impl CollectConfig {
    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (midnight_utc(self.start_date), midnight_utc(self.end_date))
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .expect("midnight is always a valid time of day")
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid literal date")
}

fn default_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, 1).expect("valid literal date")
}

impl AppConfig {
    /// Load the config from a YAML or JSON file. YAML 1.2 is a superset of
    /// JSON, so a single parser covers both formats.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, AppError> {
        serde_yaml::from_str(contents)
            .map_err(|e| AppError::Config(format!("invalid config file: {}", e)))
    }
}
