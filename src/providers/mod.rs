//! Weather/traffic provider capability.
//!
//! Three lookups behind one trait: realtime weather + hourly forecast,
//! point traffic status, and origin/destination traffic forecasts. Two
//! variants (a live HTTP client and a deterministic emulator) share the
//! surface, and every call is idempotent on `(canonical args, time
//! bucket)` through a per-client single-flight cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::{client::HttpConnector, Client};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use serde::{Deserialize, Serialize};

use crate::geo::Coord;
use crate::Result;

pub mod emulator;
pub mod here;

/// A `hyper` client shared between all provider instances of one process.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

/// Create a shared `hyper::Client` with a connection pool sized to the
/// worker concurrency, so that we get keep-alive across the fan-out.
pub fn shared_http_client(concurrency: usize) -> SharedHttpClient {
    // Plain HTTP stays allowed: self-hosted OSRM and reverse-geocoding
    // instances usually live behind http:// on an internal network.
    Arc::new(
        Client::builder().pool_max_idle_per_host(concurrency).build(
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .https_or_http()
                .enable_all_versions()
                .build(),
        ),
    )
}

/// Lifecycle status of an observation or forecast.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Observed,
    Forecasted,
    Unknown,
}

/// A realtime weather observation at a point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherRealtime {
    pub status: FetchStatus,
    pub source: String,
    pub temperature_c: Option<f64>,
    pub precipitation_mm: Option<f64>,
    pub wind_kph: Option<f64>,
    pub condition: Option<String>,
    pub observed_at_utc: Option<String>,
}

impl WeatherRealtime {
    pub fn unknown(source: &str) -> WeatherRealtime {
        WeatherRealtime {
            status: FetchStatus::Unknown,
            source: source.to_owned(),
            temperature_c: None,
            precipitation_mm: None,
            wind_kph: None,
            condition: None,
            observed_at_utc: None,
        }
    }
}

/// One hourly weather forecast slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherSlot {
    pub start_utc: String,
    pub end_utc: String,
    pub temperature_c: Option<f64>,
    pub precipitation_mm: Option<f64>,
    pub precipitation_probability: Option<f64>,
    pub wind_kph: Option<f64>,
    pub condition: Option<String>,
    pub severity_score: f64,
}

/// A weather forecast window with its worst-case slots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherForecast {
    pub status: FetchStatus,
    pub source: String,
    pub window_hours: u32,
    pub interval_min: Option<u32>,
    pub worst_case_score: Option<f64>,
    pub worst_slots: Vec<WeatherSlot>,
    pub evaluated_slots: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WeatherForecast {
    pub fn unknown(window_hours: u32, interval_min: Option<u32>, source: &str) -> Self {
        WeatherForecast {
            status: FetchStatus::Unknown,
            source: source.to_owned(),
            window_hours,
            interval_min,
            worst_case_score: None,
            worst_slots: Vec::new(),
            evaluated_slots: 0,
            error: None,
        }
    }
}

/// A point traffic status observation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrafficRealtime {
    pub status: FetchStatus,
    pub source: String,
    pub congestion_level: Option<String>,
    pub speed_kmh: Option<f64>,
    pub free_flow_speed_kmh: Option<f64>,
    pub jam_factor: Option<f64>,
    pub confidence: Option<f64>,
    pub incident_count: Option<i64>,
    pub observed_at_utc: Option<String>,
    pub area_radius_m: u32,
}

/// One departure-time slot of a traffic forecast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrafficSlot {
    pub departure_utc: String,
    pub duration_seconds: i64,
    pub base_duration_seconds: i64,
    pub delay_seconds: i64,
    pub delay_ratio: f64,
}

/// A traffic forecast window with its worst-case slots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrafficForecast {
    pub status: FetchStatus,
    pub source: String,
    pub window_hours: u32,
    pub interval_min: u32,
    pub worst_case_delay_ratio: Option<f64>,
    pub worst_case_delay_seconds: Option<i64>,
    pub worst_slots: Vec<TrafficSlot>,
    pub evaluated_slots: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrafficForecast {
    pub fn unknown(window_hours: u32, interval_min: u32, source: &str) -> Self {
        TrafficForecast {
            status: FetchStatus::Unknown,
            source: source.to_owned(),
            window_hours,
            interval_min,
            worst_case_delay_ratio: None,
            worst_case_delay_seconds: None,
            worst_slots: Vec::new(),
            evaluated_slots: 0,
            error: None,
        }
    }
}

/// Realtime observation plus the forecast window, fetched together.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherBundle {
    pub realtime: WeatherRealtime,
    pub forecast_24h: WeatherForecast,
}

/// Per-client counters, snapshotted into `summary.here_client_stats`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub cache_hits: u64,
    pub http_requests: u64,
    pub weather_queries: u64,
    pub traffic_queries: u64,
    pub routing_queries: u64,
    pub errors: u64,
    pub emulated: bool,
}

/// Shared atomic counters behind [`ProviderStats`].
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub cache_hits: AtomicU64,
    pub http_requests: AtomicU64,
    pub weather_queries: AtomicU64,
    pub traffic_queries: AtomicU64,
    pub routing_queries: AtomicU64,
    pub errors: AtomicU64,
}

impl StatsCounters {
    pub fn bump(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self, emulated: bool) -> ProviderStats {
        ProviderStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            weather_queries: self.weather_queries.load(Ordering::Relaxed),
            traffic_queries: self.traffic_queries.load(Ordering::Relaxed),
            routing_queries: self.routing_queries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            emulated,
        }
    }
}

/// The provider capability shared by the live client and the emulator.
#[async_trait]
pub trait WeatherTraffic: Send + Sync {
    /// Realtime weather plus the forecast window at a coordinate, keyed on
    /// the hour bucket of `reference_time`.
    async fn fetch_weather(
        &self,
        coord: Coord,
        reference_time: DateTime<Utc>,
    ) -> Result<WeatherBundle>;

    /// Point traffic status, keyed on a 5-minute bucket of now.
    async fn fetch_traffic_status(&self, coord: Coord) -> Result<TrafficRealtime>;

    /// Origin/destination traffic forecast, keyed on the hour bucket of
    /// `reference_time`.
    async fn fetch_traffic_forecast(
        &self,
        origin: Coord,
        destination: Coord,
        reference_time: DateTime<Utc>,
    ) -> Result<TrafficForecast>;

    fn stats(&self) -> ProviderStats;
}

/// Round to a fixed number of decimals for stable wire output.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Weather severity for forecast worst-case ranking.
///
/// `score = 1.8·precip_mm + 2.5·clamp(precip_prob) + max(0, wind − 25)/8 +
/// condition bonus`, rounded to 3 decimals. Probabilities above 1 are taken
/// as percentages.
pub fn weather_severity_score(
    condition: Option<&str>,
    precipitation_mm: Option<f64>,
    wind_kph: Option<f64>,
    precipitation_probability: Option<f64>,
) -> f64 {
    let mut score = 0.0;
    if let Some(precip) = precipitation_mm {
        score += precip.max(0.0) * 1.8;
    }
    if let Some(mut probability) = precipitation_probability {
        if probability > 1.0 {
            probability /= 100.0;
        }
        score += probability.clamp(0.0, 1.0) * 2.5;
    }
    if let Some(wind) = wind_kph {
        score += (wind - 25.0).max(0.0) / 8.0;
    }

    let normalized = condition.unwrap_or("").to_lowercase();
    if ["thunder", "hail", "tornado", "storm"]
        .iter()
        .any(|token| normalized.contains(token))
    {
        score += 8.0;
    } else if ["freezing", "blizzard", "sleet", "snow"]
        .iter()
        .any(|token| normalized.contains(token))
        || normalized.contains("heavy rain")
    {
        score += 5.0;
    } else if normalized.contains("rain") {
        score += 3.0;
    } else if normalized.contains("fog") {
        score += 2.0;
    }
    round_to(score, 3)
}

/// Bucket a jam factor into a coarse congestion level.
pub fn congestion_level(jam_factor: Option<f64>) -> Option<&'static str> {
    let jam = jam_factor?;
    Some(if jam < 4.0 {
        "low"
    } else if jam < 7.0 {
        "medium"
    } else {
        "high"
    })
}

/// Derive a jam factor from observed vs free-flow speed when the upstream
/// feed omits one.
pub fn derive_jam_factor(speed_kmh: Option<f64>, free_flow_kmh: Option<f64>) -> Option<f64> {
    let speed = speed_kmh?;
    let free_flow = free_flow_kmh?;
    if free_flow <= 0.0 {
        return None;
    }
    Some(((1.0 - speed / free_flow) * 10.0).clamp(0.0, 10.0))
}

/// Slots within ±0.05 of the worst severity, capped at 6.
pub fn worst_weather_slots(slots: &[WeatherSlot]) -> (f64, Vec<WeatherSlot>) {
    let worst = slots
        .iter()
        .map(|slot| slot.severity_score)
        .fold(f64::MIN, f64::max);
    let mut picked: Vec<WeatherSlot> = slots
        .iter()
        .filter(|slot| (slot.severity_score - worst).abs() <= 0.05)
        .cloned()
        .collect();
    picked.truncate(6);
    (worst, picked)
}

/// Slots within ±0.01 of the worst delay ratio, capped at 6; also returns
/// the worst absolute delay.
pub fn worst_traffic_slots(slots: &[TrafficSlot]) -> (f64, i64, Vec<TrafficSlot>) {
    let worst_ratio = slots
        .iter()
        .map(|slot| slot.delay_ratio)
        .fold(f64::MIN, f64::max);
    let worst_delay = slots.iter().map(|slot| slot.delay_seconds).max().unwrap_or(0);
    let mut picked: Vec<TrafficSlot> = slots
        .iter()
        .filter(|slot| (slot.delay_ratio - worst_ratio).abs() <= 0.01)
        .cloned()
        .collect();
    picked.truncate(6);
    (worst_ratio, worst_delay, picked)
}
