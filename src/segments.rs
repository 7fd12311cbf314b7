//! Route segments and the spatiotemporal observation matcher.
//!
//! A route of `n` stops yields `n − 1` ordered segments carrying midpoint,
//! cumulative distance and ETA. Caller-supplied observations attach to the
//! segment whose midpoint/ETA they fit best; the score trades 90 minutes of
//! time offset against one kilometer of distance.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::{self, Coord};
use crate::municipality::SampleTrace;
use crate::providers::{
    round_to, FetchStatus, TrafficForecast, TrafficRealtime, WeatherForecast,
    WeatherRealtime,
};
use crate::request::{Id, Stop, TrafficObservation, WeatherObservation};
use crate::timeutil::to_iso_z;

/// A derived route segment. Distances are kept unrounded here; rounding
/// happens once at the wire boundary.
#[derive(Clone, Debug)]
pub struct Segment {
    pub segment_index: usize,
    pub from_stop_id: Id,
    pub to_stop_id: Id,
    pub distance_km: f64,
    pub cumulative_distance_km: f64,
    pub eta_min_from_departure: f64,
    pub eta_utc: Option<DateTime<Utc>>,
    pub midpoint: Coord,
    pub start: Coord,
    pub end: Coord,
}

/// Split a stop sequence into segments.
pub fn build_segments(
    stops: &[Stop],
    avg_speed_kmh: f64,
    departure_time_utc: Option<DateTime<Utc>>,
) -> Vec<Segment> {
    if stops.len() < 2 {
        return Vec::new();
    }

    let mut segments = Vec::with_capacity(stops.len() - 1);
    let mut elapsed_min = 0.0;
    let mut cumulative_km = 0.0;
    for (index, pair) in stops.windows(2).enumerate() {
        let start = pair[0].coord();
        let end = pair[1].coord();
        let distance_km = geo::haversine_km(start, end);
        cumulative_km += distance_km;
        if avg_speed_kmh > 0.0 {
            elapsed_min += distance_km / avg_speed_kmh * 60.0;
        }
        let eta_utc = departure_time_utc
            .map(|departure| departure + Duration::seconds((elapsed_min * 60.0) as i64));

        segments.push(Segment {
            segment_index: index,
            from_stop_id: pair[0].id.clone(),
            to_stop_id: pair[1].id.clone(),
            distance_km,
            cumulative_distance_km: cumulative_km,
            eta_min_from_departure: elapsed_min,
            eta_utc,
            midpoint: geo::midpoint(start, end),
            start,
            end,
        });
    }
    segments
}

/// A matched observation: index into the observation list plus its distance
/// and time offset from the segment.
pub struct Match {
    pub index: usize,
    pub distance_km: f64,
    pub time_offset_min: f64,
}

/// Pick the observation minimizing `distance + |Δt| / 90 min`.
fn best_match<T>(
    midpoint: Coord,
    target_time: Option<DateTime<Utc>>,
    observations: &[T],
    coord_of: impl Fn(&T) -> Coord,
    time_of: impl Fn(&T) -> Option<DateTime<Utc>>,
) -> Option<Match> {
    let mut best: Option<(f64, Match)> = None;
    for (index, observation) in observations.iter().enumerate() {
        let distance_km = geo::haversine_km(midpoint, coord_of(observation));
        let time_offset_min = match (target_time, time_of(observation)) {
            (Some(target), Some(observed)) => {
                (observed - target).num_seconds().abs() as f64 / 60.0
            }
            _ => 0.0,
        };
        let score = distance_km + time_offset_min / 90.0;
        let better = best.as_ref().map_or(true, |(best_score, _)| score < *best_score);
        if better {
            best = Some((
                score,
                Match {
                    index,
                    distance_km,
                    time_offset_min,
                },
            ));
        }
    }
    best.map(|(_, matched)| matched)
}

pub fn match_weather(
    segment: &Segment,
    target_time: Option<DateTime<Utc>>,
    observations: &[WeatherObservation],
) -> Option<Match> {
    best_match(
        segment.midpoint,
        target_time,
        observations,
        |obs| obs.coord(),
        |obs| obs.parsed_time(),
    )
}

pub fn match_traffic(
    segment: &Segment,
    target_time: Option<DateTime<Utc>>,
    observations: &[TrafficObservation],
) -> Option<Match> {
    best_match(
        segment.midpoint,
        target_time,
        observations,
        |obs| obs.coord(),
        |obs| obs.parsed_time(),
    )
}

/// Weather attached to one segment on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherContext {
    pub status: FetchStatus,
    pub source: String,
    pub temperature_c: Option<f64>,
    pub precipitation_mm: Option<f64>,
    pub wind_kph: Option<f64>,
    pub condition: Option<String>,
    pub observed_at_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km_to_segment: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_24h: Option<WeatherForecast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_error: Option<String>,
}

impl WeatherContext {
    pub fn not_provided() -> WeatherContext {
        WeatherContext {
            status: FetchStatus::Unknown,
            source: "not_provided".to_owned(),
            temperature_c: None,
            precipitation_mm: None,
            wind_kph: None,
            condition: None,
            observed_at_utc: None,
            distance_km_to_segment: None,
            time_offset_min: None,
            forecast_24h: None,
            here_error: None,
        }
    }

    /// A matched caller observation.
    pub fn from_observation(observation: &WeatherObservation, matched: &Match) -> WeatherContext {
        WeatherContext {
            status: FetchStatus::Observed,
            source: observation
                .source
                .clone()
                .unwrap_or_else(|| "external_weather_feed".to_owned()),
            temperature_c: observation.temperature_c,
            precipitation_mm: observation.precipitation_mm,
            wind_kph: observation.wind_kph,
            condition: observation.condition.clone(),
            observed_at_utc: observation.parsed_time().map(to_iso_z),
            distance_km_to_segment: Some(round_to(matched.distance_km, 3)),
            time_offset_min: Some(round_to(matched.time_offset_min, 1)),
            forecast_24h: observation.forecast_24h.clone(),
            here_error: None,
        }
    }

    /// A provider answer for the segment midpoint itself.
    pub fn from_provider(realtime: &WeatherRealtime) -> WeatherContext {
        WeatherContext {
            status: realtime.status,
            source: realtime.source.clone(),
            temperature_c: realtime.temperature_c,
            precipitation_mm: realtime.precipitation_mm,
            wind_kph: realtime.wind_kph,
            condition: realtime.condition.clone(),
            observed_at_utc: realtime.observed_at_utc.clone(),
            distance_km_to_segment: Some(0.0),
            time_offset_min: Some(0.0),
            forecast_24h: None,
            here_error: None,
        }
    }
}

/// Traffic attached to one segment on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrafficContext {
    pub status: FetchStatus,
    pub source: String,
    pub congestion_level: Option<String>,
    pub speed_kmh: Option<f64>,
    pub incident_count: Option<i64>,
    pub observed_at_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km_to_segment: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_24h: Option<TrafficForecast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_error: Option<String>,
}

impl TrafficContext {
    pub fn not_provided() -> TrafficContext {
        TrafficContext {
            status: FetchStatus::Unknown,
            source: "not_provided".to_owned(),
            congestion_level: None,
            speed_kmh: None,
            incident_count: None,
            observed_at_utc: None,
            distance_km_to_segment: None,
            time_offset_min: None,
            forecast_24h: None,
            here_error: None,
        }
    }

    pub fn from_observation(observation: &TrafficObservation, matched: &Match) -> TrafficContext {
        TrafficContext {
            status: FetchStatus::Observed,
            source: observation
                .source
                .clone()
                .unwrap_or_else(|| "external_traffic_feed".to_owned()),
            congestion_level: observation.congestion_level.clone(),
            speed_kmh: observation.speed_kmh,
            incident_count: observation.incident_count,
            observed_at_utc: observation.parsed_time().map(to_iso_z),
            distance_km_to_segment: Some(round_to(matched.distance_km, 3)),
            time_offset_min: Some(round_to(matched.time_offset_min, 1)),
            forecast_24h: observation.forecast_24h.clone(),
            here_error: None,
        }
    }

    pub fn from_provider(realtime: &TrafficRealtime) -> TrafficContext {
        TrafficContext {
            status: realtime.status,
            source: realtime.source.clone(),
            congestion_level: realtime.congestion_level.clone(),
            speed_kmh: realtime.speed_kmh,
            incident_count: realtime.incident_count,
            observed_at_utc: realtime.observed_at_utc.clone(),
            distance_km_to_segment: Some(0.0),
            time_offset_min: Some(0.0),
            forecast_24h: None,
            here_error: None,
        }
    }
}

/// One enriched segment on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentContext {
    pub segment_index: usize,
    pub from_stop_id: Id,
    pub to_stop_id: Id,
    pub distance_km: f64,
    pub cumulative_distance_km: f64,
    pub eta_min_from_departure: f64,
    pub eta_utc: Option<String>,
    pub midpoint: Coord,
    pub weather: WeatherContext,
    pub traffic: TrafficContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_trace: Option<Vec<SampleTrace>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_capital_names: Option<Vec<String>>,
}

impl SegmentContext {
    pub fn new(segment: &Segment, weather: WeatherContext, traffic: TrafficContext) -> SegmentContext {
        SegmentContext {
            segment_index: segment.segment_index,
            from_stop_id: segment.from_stop_id.clone(),
            to_stop_id: segment.to_stop_id.clone(),
            distance_km: round_to(segment.distance_km, 3),
            cumulative_distance_km: round_to(segment.cumulative_distance_km, 3),
            eta_min_from_departure: round_to(segment.eta_min_from_departure, 1),
            eta_utc: segment.eta_utc.map(to_iso_z),
            midpoint: segment.midpoint,
            weather,
            traffic,
            municipality_trace: None,
            municipality_names: None,
            province_names: None,
            province_capital_names: None,
        }
    }
}
