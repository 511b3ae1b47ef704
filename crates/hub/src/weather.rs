//! Weather advisory: "is rain coming, or should we water?"
//!
//! Forecasts come from an OpenWeatherMap-compatible `/forecast` endpoint and
//! are cached per coordinate pair. The advisory fails open: without an API
//! key, or when the provider misbehaves, watering is allowed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Forecast periods inspected (3 h each, so roughly the next 12 hours).
pub const FORECAST_PERIODS: usize = 4;

const FORECAST_TTL: Duration = Duration::from_secs(30 * 60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RAIN_PROBABILITY_LIMIT: f64 = 0.7;

// ---------------------------------------------------------------------------
// Provider payload (only what the hub reads)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastData {
    #[serde(default)]
    pub list: Vec<ForecastPeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastPeriod {
    pub dt: i64,
    #[serde(default)]
    pub weather: Vec<Condition>,
    /// Probability of precipitation, 0.0..=1.0.
    #[serde(default)]
    pub pop: Option<f64>,
    #[serde(default)]
    pub rain: Option<RainVolume>,
    #[serde(default)]
    pub sys: Option<PeriodSys>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub id: i32,
    #[serde(default)]
    pub main: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RainVolume {
    #[serde(rename = "3h", default)]
    pub three_hours: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeriodSys {
    /// "d" or "n".
    pub pod: String,
}

impl ForecastPeriod {
    /// Condition codes 2xx (thunderstorm), 3xx (drizzle) and 5xx (rain).
    pub fn rain_code(&self) -> Option<i32> {
        self.weather
            .first()
            .map(|c| c.id)
            .filter(|id| (200..600).contains(id))
    }

    pub fn rain_mm(&self) -> f64 {
        self.rain.as_ref().and_then(|r| r.three_hours).unwrap_or(0.0)
    }

    pub fn is_daytime(&self) -> bool {
        self.sys.as_ref().map(|s| s.pod == "d").unwrap_or(true)
    }

    fn rain_likely(&self) -> bool {
        self.rain_code().is_some() || self.pop.unwrap_or(0.0) > RAIN_PROBABILITY_LIMIT
    }
}

/// First upcoming period that argues against watering, if any.
pub fn rain_ahead(forecast: &ForecastData) -> Option<&ForecastPeriod> {
    forecast
        .list
        .iter()
        .take(FORECAST_PERIODS)
        .find(|p| p.rain_likely())
}

// ---------------------------------------------------------------------------
// Advisory seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Advisory: Send + Sync {
    async fn should_water(&self, lat: f64, lon: f64) -> bool;
}

#[derive(Debug, Clone)]
pub struct WeatherSettings {
    pub api_key: Option<String>,
    pub base_url: String,
}

pub struct WeatherService {
    http: Client,
    api_key: Option<String>,
    base_url: String,
    cache: Cache<String, Arc<ForecastData>>,
}

impl WeatherService {
    pub fn new(settings: &WeatherSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build weather http client")?;

        if settings.api_key.is_none() {
            warn!("weather: no API key configured, irrigation will never be postponed for rain");
        }

        Ok(Self {
            http,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(FORECAST_TTL)
                .build(),
        })
    }

    fn cache_key(lat: f64, lon: f64) -> String {
        format!("{lat:.4},{lon:.4}")
    }

    /// Cached forecast for the coordinates, or `None` when unavailable.
    pub async fn get_forecast(&self, lat: f64, lon: f64) -> Option<Arc<ForecastData>> {
        let api_key = self.api_key.as_deref()?;
        let key = Self::cache_key(lat, lon);

        if let Some(hit) = self.cache.get(&key).await {
            debug!(coords = %key, "weather: forecast cache hit");
            return Some(hit);
        }

        match self.fetch(api_key, lat, lon).await {
            Ok(forecast) => {
                let forecast = Arc::new(forecast);
                self.cache.insert(key, Arc::clone(&forecast)).await;
                Some(forecast)
            }
            Err(e) => {
                warn!(coords = %key, "weather: forecast unavailable: {e:#}");
                None
            }
        }
    }

    async fn fetch(&self, api_key: &str, lat: f64, lon: f64) -> Result<ForecastData> {
        let url = format!("{}/forecast", self.base_url);
        let cnt = FORECAST_PERIODS.to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("lat", lat.to_string().as_str()),
                ("lon", lon.to_string().as_str()),
                ("appid", api_key),
                ("units", "metric"),
                ("cnt", cnt.as_str()),
            ])
            .send()
            .await
            .context("forecast request failed")?
            .error_for_status()
            .context("forecast request rejected")?;

        response
            .json::<ForecastData>()
            .await
            .context("forecast payload malformed")
    }
}

#[async_trait]
impl Advisory for WeatherService {
    async fn should_water(&self, lat: f64, lon: f64) -> bool {
        let Some(forecast) = self.get_forecast(lat, lon).await else {
            return true;
        };

        match rain_ahead(&forecast) {
            Some(period) => {
                info!(
                    lat,
                    lon,
                    at = period.dt,
                    code = ?period.rain_code(),
                    pop = ?period.pop,
                    rain_mm = period.rain_mm(),
                    daytime = period.is_daytime(),
                    "weather: rain expected, advising against irrigation"
                );
                false
            }
            None => true,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
