//! Deterministic provider emulator.
//!
//! Identical surface to the live client, no network. Every call derives a
//! 64-bit seed from `SHA-256(seed | endpoint | rounded args | time bucket)`,
//! so a fixed seed string reproduces the exact same "observations"; the
//! emulator never touches ambient entropy or wall-clock randomness.

use std::f64::consts::PI;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::geo::{self, Coord};
use crate::single_flight::SingleFlightCache;
use crate::timeutil::{floor_to_5min, floor_to_hour, to_iso_z};
use crate::Result;

use super::{
    congestion_level, round_to, weather_severity_score, worst_traffic_slots,
    worst_weather_slots, FetchStatus, ProviderStats, StatsCounters, TrafficForecast,
    TrafficRealtime, TrafficSlot, WeatherBundle, WeatherForecast, WeatherRealtime,
    WeatherSlot, WeatherTraffic,
};

const WEATHER_SOURCE: &str = "here_weather_v3";
const TRAFFIC_SOURCE: &str = "here_traffic_v7";
const ROUTING_SOURCE: &str = "here_routing_v8";

pub struct EmulatorProvider {
    seed: String,
    traffic_radius_m: u32,
    forecast_window_hours: u32,
    forecast_step_min: u32,
    weather_cache: SingleFlightCache<String, WeatherBundle>,
    traffic_cache: SingleFlightCache<String, TrafficRealtime>,
    routing_cache: SingleFlightCache<String, TrafficForecast>,
    counters: StatsCounters,
}

impl EmulatorProvider {
    pub fn new(
        seed: Option<String>,
        traffic_radius_m: u32,
        forecast_window_hours: u32,
        forecast_step_min: u32,
    ) -> EmulatorProvider {
        EmulatorProvider {
            seed: seed.unwrap_or_else(|| "here-emulator-v1".to_owned()),
            traffic_radius_m: traffic_radius_m.max(50),
            forecast_window_hours: forecast_window_hours.max(1),
            forecast_step_min: forecast_step_min.max(30),
            weather_cache: SingleFlightCache::new(),
            traffic_cache: SingleFlightCache::new(),
            routing_cache: SingleFlightCache::new(),
            counters: StatsCounters::default(),
        }
    }

    /// Deterministic generator for one emulated "request".
    fn rng(&self, parts: &[String]) -> StdRng {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        for part in parts {
            hasher.update(b"|");
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        StdRng::seed_from_u64(u64::from_be_bytes(word))
    }

    fn simulate_weather_at(&self, coord: Coord, at: DateTime<Utc>) -> SimulatedWeather {
        let hour = at.hour() as f64;
        let day_of_year = at.ordinal() as f64;
        let mut rng = self.rng(&[
            "weather".to_owned(),
            format!("{:.3}", coord.lat),
            format!("{:.3}", coord.lng),
            at.format("%Y%m%d%H").to_string(),
        ]);

        let seasonal = 14.0 + 9.0 * (2.0 * PI * (day_of_year - 170.0) / 365.0).sin();
        let lat_adjust = -(coord.lat - 40.0).abs() * 0.22;
        let diurnal = 5.8 * (2.0 * PI * (hour - 14.0) / 24.0).sin();
        let temperature_c =
            seasonal + lat_adjust + diurnal + rng.gen_range(-1.8..1.8);

        let cloudiness = (0.45
            + 0.30 * (2.0 * PI * (hour + 3.0) / 24.0).sin()
            + rng.gen_range(-0.25..0.25))
        .clamp(0.0, 1.0);
        let rain_trigger = (cloudiness - 0.50).max(0.0) + rng.gen_range(-0.15..0.25);
        let thunder_probability = (rain_trigger - 0.55).clamp(0.0, 1.0);

        let mut precipitation_mm = None;
        if rain_trigger > 0.15 {
            // Exponential tail stands in for the reference gamma shape.
            let burst: f64 = -1.82 * (1.0 - rng.gen::<f64>()).ln();
            let amount = round_to((burst * rain_trigger).max(0.0), 2);
            if amount > 0.0 {
                precipitation_mm = Some(amount);
            }
        }

        let precipitation_probability = round_to(rain_trigger.clamp(0.0, 1.0), 2);
        let wind_kph =
            round_to((4.0 + cloudiness * 16.0 + rng.gen_range(-3.0..10.0)).max(0.0), 2);
        let condition = format!(
            "{} {}",
            condition_phrase(cloudiness, precipitation_mm, thunder_probability),
            comfort_phrase(temperature_c)
        );

        SimulatedWeather {
            temperature_c: round_to(temperature_c, 1),
            precipitation_mm,
            precipitation_probability,
            wind_kph,
            condition,
        }
    }

    fn traffic_forecast_slots(
        &self,
        origin: Coord,
        destination: Coord,
        reference_time: DateTime<Utc>,
    ) -> Vec<TrafficSlot> {
        let distance_km =
            (geo::haversine_km(origin, destination) * 1.18).max(1.0);
        let base_speed_kmh = (76.0 - distance_km * 0.04).max(22.0);
        let base_duration_seconds = ((distance_km / base_speed_kmh) * 3600.0) as i64;

        let end_time =
            reference_time + chrono::Duration::hours(self.forecast_window_hours as i64);
        let mut slots = Vec::new();
        let mut current = reference_time;
        while current <= end_time {
            let mut rng = self.rng(&[
                "routing".to_owned(),
                format!("{:.3}", origin.lat),
                format!("{:.3}", origin.lng),
                format!("{:.3}", destination.lat),
                format!("{:.3}", destination.lng),
                current.format("%Y%m%d%H").to_string(),
            ]);
            let hour = current.hour() as f64;
            let rush = (-((hour - 8.0) / 2.1).powi(2)).exp()
                + (-((hour - 17.0) / 2.6).powi(2)).exp();
            let weekend_factor = if current.weekday().num_days_from_monday() >= 5 {
                0.75
            } else {
                1.0
            };
            let ratio = round_to(
                1.0 + (0.03 + 0.09 * rush * weekend_factor) * rng.gen_range(0.55..1.45),
                4,
            )
            .max(1.0);

            let duration_seconds = (base_duration_seconds as f64 * ratio).round() as i64;
            slots.push(TrafficSlot {
                departure_utc: to_iso_z(current),
                duration_seconds,
                base_duration_seconds,
                delay_seconds: (duration_seconds - base_duration_seconds).max(0),
                delay_ratio: ratio,
            });
            current = current + chrono::Duration::minutes(self.forecast_step_min as i64);
        }
        slots
    }
}

#[async_trait]
impl WeatherTraffic for EmulatorProvider {
    async fn fetch_weather(
        &self,
        coord: Coord,
        reference_time: DateTime<Utc>,
    ) -> Result<WeatherBundle> {
        let reference_time = floor_to_hour(reference_time);
        let cache_key = format!(
            "{:.4},{:.4}|{}",
            coord.lat,
            coord.lng,
            to_iso_z(reference_time)
        );

        let mut fetched = false;
        let bundle = self
            .weather_cache
            .get_or_fetch(cache_key, || {
                fetched = true;
                self.counters.bump(&self.counters.weather_queries, 1);
                self.counters.bump(&self.counters.http_requests, 1);

                let observed = self.simulate_weather_at(coord, reference_time);
                let realtime = WeatherRealtime {
                    status: FetchStatus::Observed,
                    source: WEATHER_SOURCE.to_owned(),
                    temperature_c: Some(observed.temperature_c),
                    precipitation_mm: observed.precipitation_mm,
                    wind_kph: Some(observed.wind_kph),
                    condition: Some(observed.condition),
                    observed_at_utc: Some(to_iso_z(reference_time)),
                };

                let mut slots = Vec::with_capacity(self.forecast_window_hours as usize);
                for hour_index in 1..=self.forecast_window_hours as i64 {
                    let slot_start = reference_time + chrono::Duration::hours(hour_index);
                    let slot_end = slot_start + chrono::Duration::hours(1);
                    let slot = self.simulate_weather_at(coord, slot_start);
                    let severity = weather_severity_score(
                        Some(&slot.condition),
                        slot.precipitation_mm,
                        Some(slot.wind_kph),
                        Some(slot.precipitation_probability),
                    );
                    slots.push(WeatherSlot {
                        start_utc: to_iso_z(slot_start),
                        end_utc: to_iso_z(slot_end),
                        temperature_c: Some(slot.temperature_c),
                        precipitation_mm: slot.precipitation_mm,
                        precipitation_probability: Some(slot.precipitation_probability),
                        wind_kph: Some(slot.wind_kph),
                        condition: Some(slot.condition),
                        severity_score: severity,
                    });
                }
                let evaluated = slots.len();
                let (worst_score, worst_slots) = worst_weather_slots(&slots);

                let forecast = WeatherForecast {
                    status: FetchStatus::Forecasted,
                    source: WEATHER_SOURCE.to_owned(),
                    window_hours: self.forecast_window_hours,
                    interval_min: Some(self.forecast_step_min),
                    worst_case_score: Some(round_to(worst_score, 3)),
                    worst_slots,
                    evaluated_slots: evaluated,
                    error: None,
                };
                async move { Ok(WeatherBundle { realtime, forecast_24h: forecast }) }
            })
            .await?;
        if !fetched {
            self.counters.bump(&self.counters.cache_hits, 1);
        }
        Ok(bundle)
    }

    async fn fetch_traffic_status(&self, coord: Coord) -> Result<TrafficRealtime> {
        let bucket = floor_to_5min(Utc::now());
        let cache_key = format!(
            "{:.4},{:.4}|{}|{}",
            coord.lat,
            coord.lng,
            self.traffic_radius_m,
            to_iso_z(bucket)
        );

        let mut fetched = false;
        let status = self
            .traffic_cache
            .get_or_fetch(cache_key, || {
                fetched = true;
                self.counters.bump(&self.counters.traffic_queries, 1);
                // Flow and incidents are two calls against the live API.
                self.counters.bump(&self.counters.http_requests, 2);

                let mut rng = self.rng(&[
                    "traffic".to_owned(),
                    format!("{:.3}", coord.lat),
                    format!("{:.3}", coord.lng),
                    self.traffic_radius_m.to_string(),
                    bucket.format("%Y%m%d%H%M").to_string(),
                ]);
                let hour = bucket.hour() as f64 + bucket.minute() as f64 / 60.0;
                let rush_wave = ((-((hour - 8.0) / 2.2).powi(2)).exp()
                    + (-((hour - 17.5) / 2.8).powi(2)).exp())
                    * 4.8;
                let jam_factor =
                    round_to(rush_wave + rng.gen_range(0.0..2.6), 2).clamp(0.0, 10.0);

                let free_flow_speed_kmh = round_to(rng.gen_range(22.0..95.0), 6);
                let realized_ratio =
                    (1.0 - jam_factor / 11.5 + rng.gen_range(-0.06..0.04)).max(0.18);
                let speed_kmh = round_to(free_flow_speed_kmh * realized_ratio, 6);
                let confidence = round_to(rng.gen_range(0.62..0.98), 2).clamp(0.55, 0.99);
                let incident_count =
                    ((jam_factor * 0.25 + rng.gen_range(-1.0..2.0)).round() as i64).max(0);

                // Mirror the live API, where some areas have sparse flow
                // coverage and return no speeds at all.
                let sparse_flow = rng.gen::<f64>() < 0.30;
                let result = if sparse_flow {
                    TrafficRealtime {
                        status: FetchStatus::Observed,
                        source: TRAFFIC_SOURCE.to_owned(),
                        congestion_level: None,
                        speed_kmh: None,
                        free_flow_speed_kmh: None,
                        jam_factor: None,
                        confidence: None,
                        incident_count: Some(incident_count),
                        observed_at_utc: Some(to_iso_z(bucket)),
                        area_radius_m: self.traffic_radius_m,
                    }
                } else {
                    TrafficRealtime {
                        status: FetchStatus::Observed,
                        source: TRAFFIC_SOURCE.to_owned(),
                        congestion_level: congestion_level(Some(jam_factor))
                            .map(str::to_owned),
                        speed_kmh: Some(speed_kmh),
                        free_flow_speed_kmh: Some(free_flow_speed_kmh),
                        jam_factor: Some(jam_factor),
                        confidence: Some(confidence),
                        incident_count: Some(incident_count),
                        observed_at_utc: Some(to_iso_z(bucket)),
                        area_radius_m: self.traffic_radius_m,
                    }
                };
                async move { Ok(result) }
            })
            .await?;
        if !fetched {
            self.counters.bump(&self.counters.cache_hits, 1);
        }
        Ok(status)
    }

    async fn fetch_traffic_forecast(
        &self,
        origin: Coord,
        destination: Coord,
        reference_time: DateTime<Utc>,
    ) -> Result<TrafficForecast> {
        let reference_time = floor_to_hour(reference_time);
        let cache_key = format!(
            "{:.5},{:.5}|{:.5},{:.5}|{}|{}",
            origin.lat,
            origin.lng,
            destination.lat,
            destination.lng,
            to_iso_z(reference_time),
            self.forecast_step_min
        );

        let mut fetched = false;
        let forecast = self
            .routing_cache
            .get_or_fetch(cache_key, || {
                fetched = true;
                self.counters.bump(&self.counters.routing_queries, 1);
                self.counters.bump(&self.counters.http_requests, 1);

                let slots =
                    self.traffic_forecast_slots(origin, destination, reference_time);
                let evaluated = slots.len();
                let (worst_ratio, worst_delay, worst_slots) = worst_traffic_slots(&slots);
                let result = TrafficForecast {
                    status: FetchStatus::Forecasted,
                    source: ROUTING_SOURCE.to_owned(),
                    window_hours: self.forecast_window_hours,
                    interval_min: self.forecast_step_min,
                    worst_case_delay_ratio: Some(round_to(worst_ratio, 4)),
                    worst_case_delay_seconds: Some(worst_delay),
                    worst_slots,
                    evaluated_slots: evaluated,
                    error: None,
                };
                async move { Ok(result) }
            })
            .await?;
        if !fetched {
            self.counters.bump(&self.counters.cache_hits, 1);
        }
        Ok(forecast)
    }

    fn stats(&self) -> ProviderStats {
        self.counters.snapshot(true)
    }
}

struct SimulatedWeather {
    temperature_c: f64,
    precipitation_mm: Option<f64>,
    precipitation_probability: f64,
    wind_kph: f64,
    condition: String,
}

fn comfort_phrase(temp_c: f64) -> &'static str {
    if temp_c <= 2.0 {
        "Cold."
    } else if temp_c <= 8.0 {
        "Chilly."
    } else if temp_c <= 16.0 {
        "Cool."
    } else if temp_c <= 24.0 {
        "Mild."
    } else if temp_c <= 31.0 {
        "Warm."
    } else {
        "Hot."
    }
}

fn condition_phrase(
    cloudiness: f64,
    precipitation_mm: Option<f64>,
    thunder_probability: f64,
) -> &'static str {
    if thunder_probability >= 0.85 {
        return "Thunderstorms.";
    }
    if let Some(precip) = precipitation_mm {
        if precip >= 7.0 {
            return "Heavy rain.";
        }
        if precip >= 1.0 {
            return "Rain.";
        }
    }
    if cloudiness < 0.15 {
        "Sunny."
    } else if cloudiness < 0.30 {
        "Mostly clear."
    } else if cloudiness < 0.50 {
        "Partly cloudy."
    } else if cloudiness < 0.70 {
        "Scattered clouds."
    } else if cloudiness < 0.88 {
        "Cloudy."
    } else {
        "Overcast."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::parse_utc;

    fn emulator(seed: &str) -> EmulatorProvider {
        EmulatorProvider::new(Some(seed.to_owned()), 300, 24, 120)
    }

    #[tokio::test]
    async fn identical_seeds_produce_identical_json() {
        let coord = Coord::new(40.4168, -3.7038);
        let reference = parse_utc("2026-03-14T09:00:00Z").unwrap();

        let first = emulator("abc").fetch_weather(coord, reference).await.unwrap();
        let second = emulator("abc").fetch_weather(coord, reference).await.unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        let other = emulator("xyz").fetch_weather(coord, reference).await.unwrap();
        assert_ne!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&other).unwrap()
        );
    }

    #[tokio::test]
    async fn weather_cache_is_content_addressable() {
        let provider = emulator("abc");
        let coord = Coord::new(40.0, -3.0);
        let reference = parse_utc("2026-03-14T09:10:00Z").unwrap();

        let first = provider.fetch_weather(coord, reference).await.unwrap();
        // Same hour bucket, different minute: must be a cache hit.
        let again = provider
            .fetch_weather(coord, parse_utc("2026-03-14T09:55:00Z").unwrap())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&again).unwrap()
        );

        let stats = provider.stats();
        assert_eq!(stats.weather_queries, 1);
        assert_eq!(stats.http_requests, 1);
        assert_eq!(stats.cache_hits, 1);
        assert!(stats.emulated);
    }

    #[tokio::test]
    async fn forecast_slots_are_monotone_and_start_after_reference() {
        let provider = emulator("abc");
        let reference = parse_utc("2026-03-14T09:00:00Z").unwrap();
        let bundle = provider
            .fetch_weather(Coord::new(40.0, -3.0), reference)
            .await
            .unwrap();
        let forecast = bundle.forecast_24h;
        assert_eq!(forecast.status, FetchStatus::Forecasted);
        assert_eq!(forecast.evaluated_slots, 24);
        assert!(forecast.worst_slots.len() <= 6);
        assert!(!forecast.worst_slots.is_empty());
        for slot in &forecast.worst_slots {
            assert!(slot.start_utc.as_str() >= "2026-03-14T09:00:00Z");
        }
    }

    #[tokio::test]
    async fn traffic_forecast_ratios_never_dip_below_one() {
        let provider = emulator("abc");
        let reference = parse_utc("2026-03-14T07:00:00Z").unwrap();
        let forecast = provider
            .fetch_traffic_forecast(
                Coord::new(40.0, -3.0),
                Coord::new(41.0, -4.0),
                reference,
            )
            .await
            .unwrap();
        assert_eq!(forecast.status, FetchStatus::Forecasted);
        assert!(forecast.evaluated_slots > 0);
        assert!(forecast.worst_case_delay_ratio.unwrap() >= 1.0);
        for slot in &forecast.worst_slots {
            assert!(slot.delay_ratio >= 1.0);
            assert!(slot.delay_seconds >= 0);
            assert_eq!(
                slot.delay_seconds,
                slot.duration_seconds - slot.base_duration_seconds
            );
        }
    }
}
