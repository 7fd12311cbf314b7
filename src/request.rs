//! Request/response contract for `/solve_vrp` and `/enrich_municipality`.
//!
//! The wire format is permissive JSON, but we pin a closed set of recognized
//! fields into explicit models and ignore the rest. Raw option values are
//! normalized (defaulted, clamped) into [`EnrichConfig`] before any work
//! happens, so the rest of the crate never sees a half-parsed payload.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use anyhow::format_err;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::geo::Coord;
use crate::providers::{TrafficForecast, WeatherForecast};
use crate::semantic::SemanticLayer;
use crate::timeutil;
use crate::Result;

/// A caller-opaque identifier: integer or string on the wire.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Int(i64),
    Str(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Int(n) => n.fmt(f),
            Id::Str(s) => s.fmt(f),
        }
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Id {
        Id::Str(s.to_owned())
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Id {
        Id::Int(n)
    }
}

/// A depot, customer, or route stop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stop {
    pub id: Id,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demand: Option<i64>,
}

impl Stop {
    pub fn coord(&self) -> Coord {
        Coord::new(self.lat, self.lng)
    }

    pub fn demand_or_default(&self) -> i64 {
        self.demand.unwrap_or(1)
    }
}

/// A caller-supplied weather observation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precipitation_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_kph: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_24h: Option<WeatherForecast>,
}

impl WeatherObservation {
    pub fn coord(&self) -> Coord {
        Coord::new(self.lat, self.lng)
    }

    pub fn parsed_time(&self) -> Option<DateTime<Utc>> {
        self.time_utc.as_deref().and_then(timeutil::parse_utc)
    }
}

/// A caller-supplied traffic observation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrafficObservation {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_24h: Option<TrafficForecast>,
}

impl TrafficObservation {
    pub fn coord(&self) -> Coord {
        Coord::new(self.lat, self.lng)
    }

    pub fn parsed_time(&self) -> Option<DateTime<Utc>> {
        self.time_utc.as_deref().and_then(timeutil::parse_utc)
    }
}

/// A candidate point of interest supplied by the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_category: Option<String>,
}

impl CandidateLocation {
    pub fn coord(&self) -> Coord {
        Coord::new(self.lat, self.lng)
    }
}

/// How leg distances are computed.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DistanceMode {
    Direct,
    Osrm,
}

/// Where leg distances actually came from. `DirectFallback` means an OSRM
/// solve degraded to haversine.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DistanceSource {
    Direct,
    Osrm,
    DirectFallback,
}

impl DistanceSource {
    /// Did the distances come from a road routing source? Gates on-road
    /// geometry lookups during municipality tracing.
    pub fn is_road_based(self) -> bool {
        matches!(self, DistanceSource::Osrm)
    }
}

/// Which provider variant serves weather/traffic lookups.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Here,
    Emulator,
}

impl DataSource {
    /// Lenient parse; anything unrecognized resolves to the live source.
    pub fn resolve(raw: Option<&str>) -> DataSource {
        match raw.unwrap_or("here").trim().to_ascii_lowercase().as_str() {
            "emulator" | "mock" | "simulated" | "synthetic" => DataSource::Emulator,
            _ => DataSource::Here,
        }
    }
}

/// When provider fan-out happens relative to the solve.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Postprocessing,
    BeforeVrp,
}

impl PipelineMode {
    /// Lenient parse; invalid values resolve to the default
    /// (postprocessing).
    pub fn resolve(raw: Option<&str>) -> PipelineMode {
        match raw.unwrap_or("").trim().to_ascii_lowercase().as_str() {
            "before_vrp" | "before-vrp" | "before" => PipelineMode::BeforeVrp,
            _ => PipelineMode::Postprocessing,
        }
    }
}

/// The `/solve_vrp` request body. Required fields first, then the
/// recognized option table; unknown keys are ignored.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SolveRequest {
    #[serde(default)]
    pub depot: Option<Stop>,
    #[serde(default)]
    pub customers: Vec<Stop>,
    #[serde(default)]
    pub vehicles: Option<i64>,
    #[serde(default)]
    pub capacity: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osrm_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_semantic_layer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_time_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_avg_speed_kmh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_corridor_radius_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidate_locations: Vec<CandidateLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weather_observations: Vec<WeatherObservation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic_observations: Vec<TrafficObservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_here_platform: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_data_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_pipeline_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_emulator_seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_timeout_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_traffic_radius_m: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_forecast_window_hours: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_forecast_interval_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_enrichment_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_step_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_radius_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_max_samples_per_segment: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_reverse_min_interval_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_use_route_geometry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_capital_lookup_enabled: Option<bool>,
}

impl SolveRequest {
    /// Validate the required fields, returning the depot on success.
    pub fn validate(&self) -> Result<&Stop> {
        let depot = self
            .depot
            .as_ref()
            .ok_or_else(|| format_err!("depot and customers are required"))?;
        if self.customers.is_empty() {
            return Err(format_err!("depot and customers are required"));
        }
        for stop in std::iter::once(depot).chain(self.customers.iter()) {
            if !stop.coord().is_valid() {
                return Err(format_err!(
                    "invalid coordinate for {:?}: {},{}",
                    stop.id,
                    stop.lat,
                    stop.lng
                ));
            }
            if stop.demand.map_or(false, |d| d < 0) {
                return Err(format_err!("negative demand for {:?}", stop.id));
            }
        }
        match self.vehicles {
            None => return Err(format_err!("vehicles is required")),
            Some(v) if v < 1 => {
                return Err(format_err!("vehicles must be a positive integer"))
            }
            _ => {}
        }
        match self.capacity {
            None => return Err(format_err!("capacity is required")),
            Some(c) if c < 1 => {
                return Err(format_err!("capacity must be a positive integer"))
            }
            _ => {}
        }
        Ok(depot)
    }

    pub fn distance_mode(&self) -> Result<DistanceMode> {
        match self.distance_mode.as_deref() {
            None => Ok(DistanceMode::Direct),
            Some(raw) => DistanceMode::from_str(raw.trim().to_ascii_lowercase().as_str())
                .map_err(|_| {
                    format_err!("distance_mode must be either 'direct' or 'osrm'")
                }),
        }
    }
}

/// Default public OSRM instance used when the caller does not name one.
pub const DEFAULT_OSRM_BASE_URL: &str = "https://router.project-osrm.org";

/// Normalized, clamped enrichment configuration. This is what the pipeline
/// actually runs on.
#[derive(Clone, Debug)]
pub struct EnrichConfig {
    pub include_semantic_layer: bool,
    pub corridor_radius_km: f64,
    pub top_k: usize,
    pub avg_speed_kmh: f64,
    pub departure_time_utc: Option<DateTime<Utc>>,
    pub categories: BTreeSet<String>,
    pub pipeline_mode: PipelineMode,
    pub data_source: DataSource,
    pub use_provider: bool,
    pub emulator_seed: Option<String>,
    pub provider_timeout_sec: u64,
    pub traffic_radius_m: u32,
    pub forecast_window_hours: u32,
    pub forecast_interval_min: u32,
    pub municipality: MunicipalityConfig,
}

/// Tuning for the two-phase municipality resolver.
#[derive(Clone, Debug)]
pub struct MunicipalityConfig {
    pub enabled: bool,
    pub step_km: f64,
    pub radius_km: f64,
    pub max_samples_per_segment: usize,
    pub reverse_min_interval_ms: u64,
    pub use_route_geometry: bool,
    pub province_capital_lookup: bool,
}

impl EnrichConfig {
    /// Normalize the raw option table: fill defaults and clamp everything to
    /// its sane floor, mirroring the documented defaults.
    pub fn from_request(request: &SolveRequest) -> EnrichConfig {
        let categories = request
            .semantic_categories
            .as_ref()
            .map(|raw| {
                raw.iter()
                    .map(|c| c.trim().to_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        EnrichConfig {
            include_semantic_layer: request.include_semantic_layer.unwrap_or(true),
            corridor_radius_km: request
                .semantic_corridor_radius_km
                .unwrap_or(1.2)
                .max(0.1),
            top_k: request.semantic_top_k.unwrap_or(8).max(1) as usize,
            avg_speed_kmh: request.route_avg_speed_kmh.unwrap_or(40.0).max(5.0),
            departure_time_utc: request
                .departure_time_utc
                .as_deref()
                .and_then(timeutil::parse_utc),
            categories,
            pipeline_mode: PipelineMode::resolve(request.here_pipeline_mode.as_deref()),
            data_source: DataSource::resolve(request.here_data_source.as_deref()),
            use_provider: request.use_here_platform.unwrap_or(true),
            emulator_seed: request.here_emulator_seed.clone(),
            provider_timeout_sec: request.here_timeout_sec.unwrap_or(12).max(3) as u64,
            traffic_radius_m: request.here_traffic_radius_m.unwrap_or(300).max(50) as u32,
            forecast_window_hours: request
                .here_forecast_window_hours
                .unwrap_or(24)
                .max(1) as u32,
            forecast_interval_min: request
                .here_forecast_interval_min
                .unwrap_or(120)
                .max(30) as u32,
            municipality: MunicipalityConfig {
                enabled: request.municipality_enrichment_enabled.unwrap_or(false),
                step_km: request.municipality_step_km.unwrap_or(20.0).max(0.5),
                radius_km: request.municipality_radius_km.unwrap_or(5.0).max(0.5),
                max_samples_per_segment: request
                    .municipality_max_samples_per_segment
                    .unwrap_or(12)
                    .max(2) as usize,
                reverse_min_interval_ms: request
                    .municipality_reverse_min_interval_ms
                    .unwrap_or(1100)
                    .max(0) as u64,
                use_route_geometry: request
                    .municipality_use_route_geometry
                    .unwrap_or(true),
                province_capital_lookup: request
                    .province_capital_lookup_enabled
                    .unwrap_or(true),
            },
        }
    }
}

/// Per-solve summary counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveSummary {
    pub vehicles: i64,
    pub customers: usize,
    pub served: usize,
    pub unserved: usize,
    pub total_distance_km: f64,
    pub distance_source: DistanceSource,
}

/// One vehicle's route.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub vehicle: i64,
    pub capacity: i64,
    pub used: i64,
    pub distance_km: f64,
    pub stops: Vec<Stop>,
    pub served_customer_ids: Vec<Id>,
}

/// The `/solve_vrp` response body. Also the `vrp_result` input to
/// `/enrich_municipality`, hence `Deserialize`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveResponse {
    pub routes: Vec<Route>,
    pub unserved_customer_ids: Vec<Id>,
    pub warnings: Vec<String>,
    pub summary: SolveSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_layer: Option<SemanticLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_layer_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_enrichment_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_prefetch: Option<crate::prefetch::PrefetchReport>,
}

/// The `/enrich_municipality` request body.
#[derive(Clone, Debug, Deserialize)]
pub struct EnrichMunicipalityRequest {
    #[serde(default)]
    pub payload: Option<SolveRequest>,
    pub vrp_result: SolveResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request() -> SolveRequest {
        serde_json::from_value(serde_json::json!({
            "depot": {"id": "depot", "lat": 40.0, "lng": -3.0},
            "customers": [{"id": 1, "lat": 40.1, "lng": -3.1, "demand": 1}],
            "vehicles": 1,
            "capacity": 5
        }))
        .unwrap()
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let request: SolveRequest = serde_json::from_value(serde_json::json!({
            "depot": {"id": "depot", "lat": 40.0, "lng": -3.0},
            "customers": [{"id": 1, "lat": 40.1, "lng": -3.1}],
            "vehicles": 1,
            "capacity": 5,
            "some_future_flag": true
        }))
        .unwrap();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn missing_depot_is_rejected() {
        let request: SolveRequest = serde_json::from_value(serde_json::json!({
            "customers": [{"id": 1, "lat": 40.1, "lng": -3.1}],
            "vehicles": 1,
            "capacity": 5
        }))
        .unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn config_defaults_and_clamps() {
        let mut request = minimal_request();
        request.semantic_corridor_radius_km = Some(0.0);
        request.here_timeout_sec = Some(1);
        request.here_forecast_interval_min = Some(10);
        let config = EnrichConfig::from_request(&request);
        assert_eq!(config.corridor_radius_km, 0.1);
        assert_eq!(config.provider_timeout_sec, 3);
        assert_eq!(config.forecast_interval_min, 30);
        assert_eq!(config.top_k, 8);
        assert_eq!(config.pipeline_mode, PipelineMode::Postprocessing);
        assert!(!config.municipality.enabled);
    }

    #[test]
    fn pipeline_mode_falls_back_to_default() {
        assert_eq!(
            PipelineMode::resolve(Some("sideways")),
            PipelineMode::Postprocessing
        );
        assert_eq!(PipelineMode::resolve(Some("before_vrp")), PipelineMode::BeforeVrp);
    }

    #[test]
    fn data_source_accepts_emulator_spellings() {
        assert_eq!(DataSource::resolve(Some("MOCK")), DataSource::Emulator);
        assert_eq!(DataSource::resolve(Some("here")), DataSource::Here);
        assert_eq!(DataSource::resolve(None), DataSource::Here);
    }

    #[test]
    fn id_is_caller_opaque() {
        let ids: Vec<Id> = serde_json::from_str(r#"[1, "depot"]"#).unwrap();
        assert_eq!(ids[0], Id::Int(1));
        assert_eq!(ids[1].to_string(), "depot");
    }
}
