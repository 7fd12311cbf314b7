//! Live HTTP provider client.
//!
//! Talks to a third-party mobility platform (weather report, traffic flow +
//! incidents, routing summaries). Responses are parsed defensively: every
//! field is pulled through a prioritized list of candidate keys, and a
//! missing field yields `None`, never a failure. Transport failures are
//! retried twice with jitter; permanent failures are cached as negative
//! results so a bad endpoint is not hammered.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hyper::{Body, Request};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::errors::ProviderError;
use crate::geo::Coord;
use crate::single_flight::SingleFlightCache;
use crate::timeutil::{self, floor_to_5min, floor_to_hour, to_iso_z};
use crate::Result;

use super::{
    congestion_level, derive_jam_factor, round_to, weather_severity_score,
    worst_traffic_slots, worst_weather_slots, FetchStatus, ProviderStats,
    SharedHttpClient, StatsCounters, TrafficForecast, TrafficRealtime, TrafficSlot,
    WeatherBundle, WeatherForecast, WeatherRealtime, WeatherSlot, WeatherTraffic,
};

const WEATHER_URL: &str = "https://weather.hereapi.com/v3/report";
const TRAFFIC_FLOW_URL: &str = "https://data.traffic.hereapi.com/v7/flow";
const TRAFFIC_INCIDENTS_URL: &str = "https://data.traffic.hereapi.com/v7/incidents";
const ROUTING_URL: &str = "https://router.hereapi.com/v8/routes";

const WEATHER_SOURCE: &str = "here_weather_v3";
const TRAFFIC_SOURCE: &str = "here_traffic_v7";
const ROUTING_SOURCE: &str = "here_routing_v8";

/// Outcome of one HTTP fetch, cached per full URL. Permanent failures are
/// remembered so repeat callers fail fast without another roundtrip.
#[derive(Clone, Debug)]
enum CachedFetch {
    Payload(Value),
    PermanentFailure(String),
}

pub struct HereProvider {
    api_key: String,
    timeout: Duration,
    traffic_radius_m: u32,
    forecast_window_hours: u32,
    forecast_step_min: u32,
    http: SharedHttpClient,
    http_cache: SingleFlightCache<String, CachedFetch>,
    weather_cache: SingleFlightCache<String, WeatherBundle>,
    traffic_cache: SingleFlightCache<String, TrafficRealtime>,
    routing_cache: SingleFlightCache<String, Option<RouteSummary>>,
    counters: StatsCounters,
}

/// Extracted `{duration, baseDuration}` pair from a routing response.
#[derive(Clone, Copy, Debug)]
struct RouteSummary {
    duration_seconds: i64,
    base_duration_seconds: i64,
}

impl HereProvider {
    pub fn new(
        api_key: String,
        http: SharedHttpClient,
        timeout_sec: u64,
        traffic_radius_m: u32,
        forecast_window_hours: u32,
        forecast_step_min: u32,
    ) -> HereProvider {
        HereProvider {
            api_key,
            timeout: Duration::from_secs(timeout_sec.max(3)),
            traffic_radius_m: traffic_radius_m.max(50),
            forecast_window_hours: forecast_window_hours.max(1),
            forecast_step_min: forecast_step_min.max(30),
            http,
            http_cache: SingleFlightCache::new(),
            weather_cache: SingleFlightCache::new(),
            traffic_cache: SingleFlightCache::new(),
            routing_cache: SingleFlightCache::new(),
            counters: StatsCounters::default(),
        }
    }

    /// GET a JSON payload, with the per-URL content cache, per-call timeout,
    /// and 2 retries (150–350 ms jitter) on transient failures.
    async fn get_json(
        &self,
        endpoint: &str,
        base_url: &str,
        params: &[(&str, String)],
        with_key_param: Option<&str>,
    ) -> Result<Value> {
        let mut url = Url::parse(base_url)?;
        for (name, value) in params {
            url.query_pairs_mut().append_pair(name, value);
        }
        if let Some(key_param) = with_key_param {
            url.query_pairs_mut().append_pair(key_param, &self.api_key);
        }
        let full_url = url.to_string();

        let cached = self
            .http_cache
            .get_or_fetch(full_url.clone(), || async {
                match self.fetch_with_retries(endpoint, &full_url).await {
                    Ok(payload) => {
                        self.counters.bump(&self.counters.http_requests, 1);
                        Ok(CachedFetch::Payload(payload))
                    }
                    Err(err) => {
                        self.counters.bump(&self.counters.errors, 1);
                        match err.downcast_ref::<ProviderError>() {
                            Some(provider_err)
                                if provider_err.kind
                                    == crate::errors::ProviderErrorKind::Permanent =>
                            {
                                Ok(CachedFetch::PermanentFailure(
                                    provider_err.reason.clone(),
                                ))
                            }
                            _ => Err(err),
                        }
                    }
                }
            })
            .await?;

        match cached {
            CachedFetch::Payload(payload) => Ok(payload),
            CachedFetch::PermanentFailure(reason) => {
                Err(ProviderError::permanent(endpoint, reason).into())
            }
        }
    }

    async fn fetch_with_retries(&self, endpoint: &str, full_url: &str) -> Result<Value> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(endpoint, full_url).await {
                Ok(payload) => return Ok(payload),
                Err(err) => {
                    let transient = err
                        .downcast_ref::<ProviderError>()
                        .map_or(false, |e| {
                            e.kind == crate::errors::ProviderErrorKind::Transient
                        });
                    if !transient || attempt >= 2 {
                        return Err(err);
                    }
                    attempt += 1;
                    let jitter_ms = rand::thread_rng().gen_range(150..350);
                    debug!(
                        "retrying {} after transient failure (attempt {}, {} ms)",
                        endpoint, attempt, jitter_ms
                    );
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
            }
        }
    }

    async fn fetch_once(&self, endpoint: &str, full_url: &str) -> Result<Value> {
        let request = Request::builder()
            .method("GET")
            .uri(full_url)
            .body(Body::empty())
            .map_err(|err| ProviderError::permanent(endpoint, err.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| {
                ProviderError::transient(
                    endpoint,
                    format!("timed out after {:?}", self.timeout),
                )
            })?
            .map_err(|err| ProviderError::transient(endpoint, err.to_string()))?;

        let status = response.status();
        let mut body = response.into_body();
        let mut body_data = Vec::new();
        while let Some(chunk_result) = body.next().await {
            let chunk = chunk_result
                .map_err(|err| ProviderError::transient(endpoint, err.to_string()))?;
            body_data.extend(&chunk[..]);
        }

        if status.is_server_error() {
            return Err(ProviderError::transient(endpoint, format!("HTTP {}", status)).into());
        }
        if !status.is_success() {
            return Err(ProviderError::permanent(endpoint, format!("HTTP {}", status)).into());
        }
        serde_json::from_slice(&body_data).map_err(|err| {
            ProviderError::permanent(endpoint, format!("bad JSON payload: {}", err)).into()
        })
    }

    async fn fetch_route_summary(
        &self,
        origin: Coord,
        destination: Coord,
        departure: DateTime<Utc>,
    ) -> Result<Option<RouteSummary>> {
        let cache_key = format!(
            "{:.5},{:.5}|{:.5},{:.5}|{}",
            origin.lat,
            origin.lng,
            destination.lat,
            destination.lng,
            to_iso_z(departure)
        );
        let mut fetched = false;
        let summary = self
            .routing_cache
            .get_or_fetch(cache_key, || {
                fetched = true;
                async move {
                    let payload = self
                        .get_json(
                            "routing.v8",
                            ROUTING_URL,
                            &[
                                ("transportMode", "car".to_owned()),
                                ("origin", format!("{:.6},{:.6}", origin.lat, origin.lng)),
                                (
                                    "destination",
                                    format!("{:.6},{:.6}", destination.lat, destination.lng),
                                ),
                                ("return", "summary".to_owned()),
                                ("departureTime", to_iso_z(departure)),
                                ("apikey", self.api_key.clone()),
                            ],
                            None,
                        )
                        .await?;
                    self.counters.bump(&self.counters.routing_queries, 1);
                    Ok(parse_route_summary(&payload))
                }
            })
            .await?;
        if !fetched {
            self.counters.bump(&self.counters.cache_hits, 1);
        }
        Ok(summary)
    }
}

#[async_trait]
impl WeatherTraffic for HereProvider {
    #[instrument(name = "HereProvider::fetch_weather", level = "debug", skip_all)]
    async fn fetch_weather(
        &self,
        coord: Coord,
        reference_time: DateTime<Utc>,
    ) -> Result<WeatherBundle> {
        let bucket = floor_to_hour(reference_time);
        let cache_key = format!("{:.4},{:.4}|{}", coord.lat, coord.lng, to_iso_z(bucket));

        let mut fetched = false;
        let bundle = self
            .weather_cache
            .get_or_fetch(cache_key, || {
                fetched = true;
                async move {
                    let payload = self
                        .get_json(
                            "weather.v3",
                            WEATHER_URL,
                            &[
                                ("products", "observation,forecastHourly".to_owned()),
                                ("location", format!("{:.6},{:.6}", coord.lat, coord.lng)),
                                ("units", "metric".to_owned()),
                            ],
                            Some("apiKey"),
                        )
                        .await?;
                    self.counters.bump(&self.counters.weather_queries, 1);
                    Ok(parse_weather_payload(
                        &payload,
                        reference_time,
                        self.forecast_window_hours,
                        self.forecast_step_min,
                    ))
                }
            })
            .await?;
        if !fetched {
            self.counters.bump(&self.counters.cache_hits, 1);
        }
        Ok(bundle)
    }

    #[instrument(name = "HereProvider::fetch_traffic_status", level = "debug", skip_all)]
    async fn fetch_traffic_status(&self, coord: Coord) -> Result<TrafficRealtime> {
        let bucket = floor_to_5min(Utc::now());
        let cache_key = format!(
            "{:.4},{:.4}|{}|{}",
            coord.lat,
            coord.lng,
            self.traffic_radius_m,
            to_iso_z(bucket)
        );
        let in_filter = format!(
            "circle:{:.6},{:.6};r={}",
            coord.lat, coord.lng, self.traffic_radius_m
        );

        let mut fetched = false;
        let status = self
            .traffic_cache
            .get_or_fetch(cache_key, || {
                fetched = true;
                let in_filter = in_filter.clone();
                async move {
                    let flow_payload = self
                        .get_json(
                            "traffic.v7.flow",
                            TRAFFIC_FLOW_URL,
                            &[
                                ("in", in_filter.clone()),
                                ("locationReferencing", "shape".to_owned()),
                            ],
                            Some("apiKey"),
                        )
                        .await?;
                    let incidents_payload = self
                        .get_json(
                            "traffic.v7.incidents",
                            TRAFFIC_INCIDENTS_URL,
                            &[
                                ("in", in_filter),
                                ("locationReferencing", "shape".to_owned()),
                            ],
                            Some("apiKey"),
                        )
                        .await?;
                    self.counters.bump(&self.counters.traffic_queries, 1);
                    Ok(parse_traffic_payloads(
                        &flow_payload,
                        &incidents_payload,
                        self.traffic_radius_m,
                    ))
                }
            })
            .await?;
        if !fetched {
            self.counters.bump(&self.counters.cache_hits, 1);
        }
        Ok(status)
    }

    #[instrument(
        name = "HereProvider::fetch_traffic_forecast",
        level = "debug",
        skip_all
    )]
    async fn fetch_traffic_forecast(
        &self,
        origin: Coord,
        destination: Coord,
        reference_time: DateTime<Utc>,
    ) -> Result<TrafficForecast> {
        let reference_time = floor_to_hour(reference_time);
        let end_time =
            reference_time + chrono::Duration::hours(self.forecast_window_hours as i64);

        let mut slots = Vec::new();
        let mut current = reference_time;
        while current <= end_time {
            if let Some(summary) =
                self.fetch_route_summary(origin, destination, current).await?
            {
                let delay_seconds =
                    (summary.duration_seconds - summary.base_duration_seconds).max(0);
                let delay_ratio = summary.duration_seconds as f64
                    / summary.base_duration_seconds as f64;
                slots.push(TrafficSlot {
                    departure_utc: to_iso_z(current),
                    duration_seconds: summary.duration_seconds,
                    base_duration_seconds: summary.base_duration_seconds,
                    delay_seconds,
                    delay_ratio: round_to(delay_ratio, 4),
                });
            }
            current = current + chrono::Duration::minutes(self.forecast_step_min as i64);
        }

        if slots.is_empty() {
            return Ok(TrafficForecast::unknown(
                self.forecast_window_hours,
                self.forecast_step_min,
                ROUTING_SOURCE,
            ));
        }

        let evaluated = slots.len();
        let (worst_ratio, worst_delay, worst_slots) = worst_traffic_slots(&slots);
        Ok(TrafficForecast {
            status: FetchStatus::Forecasted,
            source: ROUTING_SOURCE.to_owned(),
            window_hours: self.forecast_window_hours,
            interval_min: self.forecast_step_min,
            worst_case_delay_ratio: Some(round_to(worst_ratio, 4)),
            worst_case_delay_seconds: Some(worst_delay),
            worst_slots,
            evaluated_slots: evaluated,
            error: None,
        })
    }

    fn stats(&self) -> ProviderStats {
        self.counters.snapshot(false)
    }
}

// ---------------------------------------------------------------------------
// Defensive payload extraction. These are pure so they can be tested against
// canned payloads without a network.

/// Walk a dotted path where numeric tokens index into arrays.
fn nested_get<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = value;
    for token in dotted.split('.') {
        current = match current {
            Value::Object(map) => map.get(token)?,
            Value::Array(items) => items.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// First non-null value among candidate dotted paths.
fn first_path<'a>(value: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| nested_get(value, path))
        .find(|v| !v.is_null())
}

/// A numeric value, possibly wrapped in a `{value: ...}`-style object.
fn extract_scalar(candidate: &Value) -> Option<f64> {
    match candidate {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => ["value", "amount", "metric", "kmh", "kph", "mps"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(Value::as_f64))
            .next(),
        _ => None,
    }
}

fn pick_number(item: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| nested_get(item, key))
        .filter_map(extract_scalar)
        .next()
}

fn pick_string(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| nested_get(item, key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Every JSON object in the payload, preorder. Fallback scan for payload
/// shapes we have not seen before.
fn walk_objects<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            out.push(value);
            for inner in map.values() {
                walk_objects(inner, out);
            }
        }
        Value::Array(items) => {
            for inner in items {
                walk_objects(inner, out);
            }
        }
        _ => {}
    }
}

const TEMPERATURE_KEYS: &[&str] =
    &["temperature", "temp", "airTemperature", "temperature.value"];
const PRECIPITATION_KEYS: &[&str] =
    &["precipitation", "precipitationAmount", "rainfall", "rain", "snowfall"];
const CONDITION_KEYS: &[&str] =
    &["description", "condition", "iconName", "daySegment", "phrase"];
const TIME_KEYS: &[&str] = &["utcTime", "time", "observationTime", "validFrom"];

/// Wind speed normalized to km/h, accepting m/s keys.
fn pick_wind_kph(item: &Value) -> Option<f64> {
    if let Some(kph) = pick_number(item, &["windSpeedKph", "wind.speedKph", "windSpeedKmH"]) {
        return Some(kph);
    }
    if let Some(mps) = pick_number(item, &["windSpeedMps", "wind.speedMps"]) {
        return Some(round_to(mps * 3.6, 3));
    }
    pick_number(item, &["windSpeed", "wind.speed", "wind"])
}

fn extract_weather_observation(payload: &Value) -> Option<&Value> {
    if let Some(candidate) = first_path(
        payload,
        &[
            "places.0.observations.0",
            "places.0.observation.0",
            "places.0.observation",
            "observations.0",
            "observation.0",
            "observation",
        ],
    ) {
        if candidate.is_object() {
            return Some(candidate);
        }
    }

    let mut objects = Vec::new();
    walk_objects(payload, &mut objects);
    objects.into_iter().find(|item| {
        pick_number(item, TEMPERATURE_KEYS).is_some()
            && pick_string(item, TIME_KEYS).is_some()
    })
}

fn extract_forecast_entries(payload: &Value) -> Vec<&Value> {
    if let Some(candidate) = first_path(
        payload,
        &[
            "places.0.forecastHourly",
            "places.0.hourlyForecasts",
            "forecastHourly",
            "hourlyForecasts",
            "forecasts.hourly",
        ],
    ) {
        if let Value::Array(entries) = candidate {
            return entries.iter().filter(|entry| entry.is_object()).collect();
        }
    }

    let mut objects = Vec::new();
    walk_objects(payload, &mut objects);
    objects
        .into_iter()
        .filter(|item| {
            pick_string(item, &["utcTime", "time", "startTime", "validFrom"]).is_some()
                && (pick_number(item, TEMPERATURE_KEYS).is_some()
                    || pick_number(item, PRECIPITATION_KEYS).is_some()
                    || pick_wind_kph(item).is_some()
                    || pick_string(item, CONDITION_KEYS).is_some())
        })
        .collect()
}

/// Turn a raw weather report payload into a [`WeatherBundle`].
pub(crate) fn parse_weather_payload(
    payload: &Value,
    reference_time: DateTime<Utc>,
    window_hours: u32,
    step_min: u32,
) -> WeatherBundle {
    let realtime = match extract_weather_observation(payload) {
        None => WeatherRealtime::unknown(WEATHER_SOURCE),
        Some(observation) => WeatherRealtime {
            status: FetchStatus::Observed,
            source: WEATHER_SOURCE.to_owned(),
            temperature_c: pick_number(observation, TEMPERATURE_KEYS),
            precipitation_mm: pick_number(observation, PRECIPITATION_KEYS),
            wind_kph: pick_wind_kph(observation),
            condition: pick_string(observation, CONDITION_KEYS),
            observed_at_utc: pick_string(observation, TIME_KEYS)
                .and_then(|raw| timeutil::parse_utc(&raw))
                .map(to_iso_z),
        },
    };

    let window_end = reference_time + chrono::Duration::hours(window_hours as i64);
    let mut slots = Vec::new();
    for entry in extract_forecast_entries(payload) {
        let slot_start = match pick_string(entry, &["utcTime", "time", "startTime", "validFrom"])
            .and_then(|raw| timeutil::parse_utc(&raw))
        {
            Some(start) => start,
            None => continue,
        };
        if slot_start < reference_time || slot_start > window_end {
            continue;
        }
        let slot_end = pick_string(entry, &["endTime", "validTo"])
            .and_then(|raw| timeutil::parse_utc(&raw))
            .unwrap_or(slot_start + chrono::Duration::hours(1));

        let precipitation_mm = pick_number(entry, PRECIPITATION_KEYS);
        let precipitation_probability = pick_number(
            entry,
            &["precipitationProbability", "rainProbability", "pop"],
        );
        let wind_kph = pick_wind_kph(entry);
        let condition = pick_string(entry, CONDITION_KEYS);
        let severity = weather_severity_score(
            condition.as_deref(),
            precipitation_mm,
            wind_kph,
            precipitation_probability,
        );
        slots.push(WeatherSlot {
            start_utc: to_iso_z(slot_start),
            end_utc: to_iso_z(slot_end),
            temperature_c: pick_number(entry, TEMPERATURE_KEYS),
            precipitation_mm,
            precipitation_probability,
            wind_kph,
            condition,
            severity_score: severity,
        });
    }

    // Payload order is not guaranteed; the window must be.
    slots.sort_by(|a, b| a.start_utc.cmp(&b.start_utc));

    let forecast = if slots.is_empty() {
        WeatherForecast::unknown(window_hours, None, WEATHER_SOURCE)
    } else {
        let evaluated = slots.len();
        let (worst_score, worst_slots) = worst_weather_slots(&slots);
        WeatherForecast {
            status: FetchStatus::Forecasted,
            source: WEATHER_SOURCE.to_owned(),
            window_hours,
            interval_min: Some(step_min),
            worst_case_score: Some(round_to(worst_score, 3)),
            worst_slots,
            evaluated_slots: evaluated,
            error: None,
        }
    };

    WeatherBundle { realtime, forecast_24h: forecast }
}

/// Turn raw flow + incidents payloads into a [`TrafficRealtime`].
pub(crate) fn parse_traffic_payloads(
    flow_payload: &Value,
    incidents_payload: &Value,
    area_radius_m: u32,
) -> TrafficRealtime {
    let current_flow = nested_get(flow_payload, "results.0.currentFlow")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or(Value::Null);

    let mut jam_factor = pick_number(&current_flow, &["jamFactor"]);
    let speed_kmh = pick_number(&current_flow, &["speed"]);
    let free_flow_speed_kmh = pick_number(&current_flow, &["freeFlow"]);
    if jam_factor.is_none() {
        jam_factor = derive_jam_factor(speed_kmh, free_flow_speed_kmh);
    }

    let incident_count = nested_get(incidents_payload, "results")
        .and_then(Value::as_array)
        .map(|items| items.len() as i64)
        .unwrap_or(0);

    let observed_at = flow_payload
        .get("sourceUpdated")
        .and_then(timeutil::parse_utc_value)
        .unwrap_or_else(Utc::now);

    TrafficRealtime {
        status: FetchStatus::Observed,
        source: TRAFFIC_SOURCE.to_owned(),
        congestion_level: congestion_level(jam_factor).map(str::to_owned),
        speed_kmh,
        free_flow_speed_kmh,
        jam_factor: jam_factor.map(|j| round_to(j, 3)),
        confidence: pick_number(&current_flow, &["confidence"]),
        incident_count: Some(incident_count),
        observed_at_utc: Some(to_iso_z(observed_at)),
        area_radius_m,
    }
}

fn parse_route_summary(payload: &Value) -> Option<RouteSummary> {
    let summary = nested_get(payload, "routes.0.sections.0.summary")?;
    let duration = summary.get("duration")?.as_i64()?;
    let base_duration = summary.get("baseDuration")?.as_i64()?;
    if base_duration <= 0 {
        return None;
    }
    Some(RouteSummary {
        duration_seconds: duration,
        base_duration_seconds: base_duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::parse_utc;
    use serde_json::json;

    #[test]
    fn weather_payload_with_canonical_shape() {
        let payload = json!({
            "places": [{
                "observations": [{
                    "temperature": 18.5,
                    "precipitation": 0.2,
                    "windSpeedMps": 5.0,
                    "description": "Partly cloudy",
                    "utcTime": "2026-03-14T09:00:00Z"
                }],
                "forecastHourly": [
                    {
                        "utcTime": "2026-03-14T10:00:00Z",
                        "temperature": 19.0,
                        "precipitation": 1.5,
                        "precipitationProbability": 60,
                        "windSpeed": 12.0,
                        "description": "Rain"
                    },
                    {
                        "utcTime": "2026-03-14T11:00:00Z",
                        "temperature": 17.0,
                        "description": "Thunderstorms"
                    }
                ]
            }]
        });
        let reference = parse_utc("2026-03-14T09:00:00Z").unwrap();
        let bundle = parse_weather_payload(&payload, reference, 24, 120);

        assert_eq!(bundle.realtime.status, FetchStatus::Observed);
        assert_eq!(bundle.realtime.temperature_c, Some(18.5));
        // 5 m/s normalizes to 18 km/h.
        assert_eq!(bundle.realtime.wind_kph, Some(18.0));
        assert_eq!(bundle.realtime.observed_at_utc.as_deref(), Some("2026-03-14T09:00:00Z"));

        let forecast = bundle.forecast_24h;
        assert_eq!(forecast.status, FetchStatus::Forecasted);
        assert_eq!(forecast.evaluated_slots, 2);
        // The thunderstorm slot dominates: bonus 8 beats rain's 1.5·1.8 + 0.6·2.5 + 3.
        assert_eq!(forecast.worst_case_score, Some(8.0));
        assert_eq!(forecast.worst_slots.len(), 1);
        assert_eq!(
            forecast.worst_slots[0].start_utc.as_str(),
            "2026-03-14T11:00:00Z"
        );
    }

    #[test]
    fn weather_payload_with_unknown_shape_falls_back_to_walking() {
        let payload = json!({
            "report": {
                "inner": {
                    "airTemperature": {"value": 7.0},
                    "time": "2026-03-14T09:00:00Z"
                }
            }
        });
        let reference = parse_utc("2026-03-14T09:00:00Z").unwrap();
        let bundle = parse_weather_payload(&payload, reference, 24, 120);
        assert_eq!(bundle.realtime.status, FetchStatus::Observed);
        assert_eq!(bundle.realtime.temperature_c, Some(7.0));
        assert_eq!(bundle.forecast_24h.status, FetchStatus::Unknown);
    }

    #[test]
    fn empty_weather_payload_is_unknown_not_an_error() {
        let reference = parse_utc("2026-03-14T09:00:00Z").unwrap();
        let bundle = parse_weather_payload(&json!({}), reference, 24, 120);
        assert_eq!(bundle.realtime.status, FetchStatus::Unknown);
        assert!(bundle.realtime.temperature_c.is_none());
        assert_eq!(bundle.forecast_24h.evaluated_slots, 0);
    }

    #[test]
    fn traffic_payload_derives_jam_factor_from_speeds() {
        let flow = json!({
            "sourceUpdated": "2026-03-14T09:02:00Z",
            "results": [{
                "currentFlow": {"speed": 20.0, "freeFlow": 50.0, "confidence": 0.9}
            }]
        });
        let incidents = json!({"results": [{}, {}, {}]});
        let status = parse_traffic_payloads(&flow, &incidents, 300);
        // jam = (1 - 20/50)·10 = 6 → medium.
        assert_eq!(status.jam_factor, Some(6.0));
        assert_eq!(status.congestion_level.as_deref(), Some("medium"));
        assert_eq!(status.incident_count, Some(3));
        assert_eq!(status.area_radius_m, 300);
    }

    #[test]
    fn sparse_flow_payload_keeps_nulls() {
        let status = parse_traffic_payloads(&json!({}), &json!({}), 300);
        assert!(status.jam_factor.is_none());
        assert!(status.speed_kmh.is_none());
        assert!(status.congestion_level.is_none());
        assert_eq!(status.incident_count, Some(0));
    }

    #[test]
    fn route_summary_requires_positive_base_duration() {
        let good = json!({
            "routes": [{"sections": [{"summary": {"duration": 660, "baseDuration": 600}}]}]
        });
        let summary = parse_route_summary(&good).unwrap();
        assert_eq!(summary.duration_seconds, 660);
        assert_eq!(summary.base_duration_seconds, 600);

        let zero_base = json!({
            "routes": [{"sections": [{"summary": {"duration": 660, "baseDuration": 0}}]}]
        });
        assert!(parse_route_summary(&zero_base).is_none());
        assert!(parse_route_summary(&json!({})).is_none());
    }
}
