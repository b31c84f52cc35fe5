//! Provider abstraction: the uniform contract every upstream weather source
//! implements, plus the canonical record they all normalize into.

pub mod meteostat;
pub mod open_meteo;
pub mod open_weather_map;
pub mod tomorrow;
pub mod visual_crossing;
pub mod weather_bit;
pub mod world_weather_online;

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::DataSourcesConfig;
use crate::errors::AppError;

/// A WGS84 point. Immutable value, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, AppError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(AppError::BadRequest(format!(
                "latitude {} out of range [-90, 90]",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(AppError::BadRequest(format!(
                "longitude {} out of range [-180, 180]",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// Canonical per-hour observation. All units SI or documented:
/// °C, hPa (sea-level where the source offers it), m/s, degrees, %, mm.
///
/// Fields a source does not supply stay `None`; providers never fabricate
/// values.
#[derive(Debug, Clone, PartialEq)]
pub struct Weather {
    pub data_source: &'static str,
    pub date: DateTime<Utc>,
    pub temperature: f64,
    pub apparent_temperature: Option<f64>,
    pub pressure: f64,
    pub wind_speed: f64,
    pub wind_gust_speed: Option<f64>,
    pub wind_direction: f64,
    pub humidity: f64,
    pub clouds: Option<f64>,
    pub precipitation: Option<f64>,
    pub snow: Option<i32>,
}

/// For sources that report both wind speed and gust: a null gust falls back
/// to the wind speed rather than staying absent.
pub(crate) fn gust_or_wind(gust: Option<f64>, wind_speed: f64) -> Option<f64> {
    Some(gust.unwrap_or(wind_speed))
}

/// Contract for an upstream historical-weather source.
///
/// `setup` must complete before the first `get_historical_weather` call;
/// the collector guarantees this ordering. Records come back in ascending
/// `date`, all within `[start, end]` inclusive at hourly granularity, with
/// `data_source` set to the provider's name.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable snake_case identifier, persisted as `data_source`.
    fn name(&self) -> &'static str;

    async fn setup(&self) -> Result<(), AppError>;

    async fn teardown(&self) -> Result<(), AppError>;

    async fn get_historical_weather(
        &self,
        coordinate: Coordinate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Weather>, AppError>;
}

// ---------------------------------------------------------------------------
// Lifecycle state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Fresh,
    Ready,
    TornDown,
}

/// Shared `Fresh → Ready → TornDown` state machine. Transitions are
/// idempotent; a second setup after teardown is refused with a warning and
/// no state change.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Fresh),
        }
    }

    /// Returns true when the caller should run its setup work.
    pub fn begin_setup(&self, name: &str) -> bool {
        let mut state = self.state.lock().expect("lifecycle mutex poisoned");
        match *state {
            LifecycleState::TornDown => {
                tracing::warn!(
                    "Provider {} has already been torn down, refusing to set it up again",
                    name
                );
                false
            }
            LifecycleState::Ready => {
                tracing::warn!("Provider {} is already set up", name);
                false
            }
            LifecycleState::Fresh => {
                *state = LifecycleState::Ready;
                true
            }
        }
    }

    /// Returns true when the caller should run its teardown work.
    pub fn begin_teardown(&self, name: &str) -> bool {
        let mut state = self.state.lock().expect("lifecycle mutex poisoned");
        match *state {
            LifecycleState::Fresh => {
                tracing::warn!(
                    "Provider {} was never set up, nothing to tear down",
                    name
                );
                false
            }
            LifecycleState::TornDown => {
                tracing::warn!("Provider {} is already torn down", name);
                false
            }
            LifecycleState::Ready => {
                *state = LifecycleState::TornDown;
                true
            }
        }
    }

    pub fn ensure_ready(&self, name: &str) -> Result<(), AppError> {
        let state = self.state.lock().expect("lifecycle mutex poisoned");
        if *state == LifecycleState::Ready {
            Ok(())
        } else {
            Err(AppError::Config(format!(
                "provider {} was not set up before use",
                name
            )))
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Provider construction from config
// ---------------------------------------------------------------------------

/// Build every provider the config enables. A provider whose section is
/// missing, or that needs an API key the section doesn't carry, is
/// skipped with a warning rather than failing the run.
pub fn build_providers(
    client: &reqwest::Client,
    sources: &DataSourcesConfig,
) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if sources.open_meteo.is_some() {
        providers.push(Arc::new(open_meteo::OpenMeteo::new(client.clone())));
    } else {
        tracing::warn!("Data source open_meteo not configured, skipping");
    }

    if sources.meteostat.is_some() {
        providers.push(Arc::new(meteostat::Meteostat::new(client.clone())));
    } else {
        tracing::warn!("Data source meteostat not configured, skipping");
    }

    if let Some(key) = keyed(sources.weather_bit.as_ref(), "weather_bit") {
        providers.push(Arc::new(weather_bit::WeatherBit::new(client.clone(), key)));
    }
    if let Some(key) = keyed(sources.visual_crossing.as_ref(), "visual_crossing") {
        providers.push(Arc::new(visual_crossing::VisualCrossing::new(
            client.clone(),
            key,
        )));
    }
    if let Some(key) = keyed(
        sources.world_weather_online.as_ref(),
        "world_weather_online",
    ) {
        providers.push(Arc::new(world_weather_online::WorldWeatherOnline::new(
            client.clone(),
            key,
        )));
    }
    if let Some(key) = keyed(sources.open_weather_map.as_ref(), "open_weather_map") {
        providers.push(Arc::new(open_weather_map::OpenWeatherMap::new(
            client.clone(),
            key,
        )));
    }
    if let Some(key) = keyed(sources.tomorrow.as_ref(), "tomorrow") {
        providers.push(Arc::new(tomorrow::Tomorrow::new(client.clone(), key)));
    }

    providers
}

fn keyed(section: Option<&crate::config::ProviderConfig>, name: &str) -> Option<String> {
    match section {
        None => {
            tracing::warn!("Data source {} not configured, skipping", name);
            None
        }
        Some(cfg) => match &cfg.api_key {
            Some(key) => Some(key.clone()),
            None => {
                tracing::warn!("Data source {} has no api_key, skipping", name);
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::new(35.6897, 139.6922).is_ok());
        assert!(Coordinate::new(90.0, -180.0).is_ok());
        assert!(Coordinate::new(90.1, 0.0).is_err());
        assert!(Coordinate::new(0.0, 180.5).is_err());
    }

    #[test]
    fn test_coordinate_display() {
        let coord = Coordinate::new(35.6897, 139.6922).unwrap();
        assert_eq!(coord.to_string(), "35.6897,139.6922");
    }

    #[test]
    fn test_gust_fallback() {
        assert_eq!(gust_or_wind(Some(12.5), 4.0), Some(12.5));
        assert_eq!(gust_or_wind(None, 4.0), Some(4.0));
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.ensure_ready("test").is_err());
        assert!(lifecycle.begin_setup("test"));
        assert!(lifecycle.ensure_ready("test").is_ok());
        assert!(lifecycle.begin_teardown("test"));
        assert!(lifecycle.ensure_ready("test").is_err());
    }

    #[test]
    fn test_lifecycle_double_setup_is_noop() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_setup("test"));
        assert!(!lifecycle.begin_setup("test"));
        assert!(lifecycle.ensure_ready("test").is_ok());
    }

    #[test]
    fn test_lifecycle_setup_after_teardown_is_refused() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_setup("test"));
        assert!(lifecycle.begin_teardown("test"));
        assert!(!lifecycle.begin_setup("test"));
        assert!(lifecycle.ensure_ready("test").is_err());
    }

    #[test]
    fn test_lifecycle_teardown_is_idempotent() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.begin_teardown("test"));
        assert!(lifecycle.begin_setup("test"));
        assert!(lifecycle.begin_teardown("test"));
        assert!(!lifecycle.begin_teardown("test"));
    }

    #[test]
    fn test_build_providers_skips_unconfigured_and_keyless() {
        let client = crate::http::build_shared_client();
        let sources = DataSourcesConfig {
            open_meteo: Some(ProviderConfig::default()),
            meteostat: None,
            weather_bit: Some(ProviderConfig {
                api_key: Some("wb-key".to_string()),
            }),
            // configured but keyless: disabled
            visual_crossing: Some(ProviderConfig::default()),
            world_weather_online: None,
            open_weather_map: None,
            tomorrow: None,
        };

        let providers = build_providers(&client, &sources);
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["open_meteo", "weather_bit"]);
    }
}
