//! Prefetch pipeline mode: fetch per-point weather and traffic before the
//! solve and fold the results into the caller-supplied observation arrays.
//! Downstream segment enrichment then reuses those observations instead of
//! calling the provider again.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::providers::{ProviderStats, WeatherTraffic};
use crate::request::{
    DataSource, EnrichConfig, SolveRequest, Stop, TrafficObservation, WeatherObservation,
};
use crate::timeutil::{to_iso_z, Deadline};

/// The `here_prefetch` block of the response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrefetchReport {
    pub status: String,
    pub enabled: bool,
    pub data_source: DataSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_queried: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_stats: Option<ProviderStats>,
}

impl PrefetchReport {
    /// The degraded shape: prefetch could not run (typically a live data
    /// source without an API key), other enrichment continues.
    pub fn disabled(data_source: DataSource, error: &str) -> PrefetchReport {
        PrefetchReport {
            status: "disabled".to_owned(),
            enabled: false,
            data_source,
            error: Some(error.to_owned()),
            points_queried: None,
            errors: Vec::new(),
            client_stats: None,
        }
    }
}

/// Fetch realtime weather, traffic status, and a depot→customer traffic
/// forecast for every input point, appending to the caller observation
/// arrays. Individual failures are recorded and skipped.
#[instrument(level = "debug", skip_all, fields(customers = request.customers.len()))]
pub async fn prefetch_point_observations(
    request: &mut SolveRequest,
    config: &EnrichConfig,
    provider: &Arc<dyn WeatherTraffic>,
    deadline: &Deadline,
) -> PrefetchReport {
    let departure = config.departure_time_utc.unwrap_or_else(Utc::now);
    let depot = request.depot.clone();
    let depot_coord = depot.as_ref().map(|d| d.coord());

    let points: Vec<Stop> = depot
        .iter()
        .cloned()
        .chain(request.customers.iter().cloned())
        .collect();
    let mut errors: Vec<String> = Vec::new();

    for point in &points {
        if deadline.expired() {
            errors.push("deadline_exceeded".to_owned());
            break;
        }
        let coord = point.coord();
        if !coord.is_valid() {
            continue;
        }

        match provider.fetch_weather(coord, departure).await {
            Ok(bundle) => {
                request.weather_observations.push(WeatherObservation {
                    lat: coord.lat,
                    lng: coord.lng,
                    time_utc: Some(
                        bundle
                            .realtime
                            .observed_at_utc
                            .clone()
                            .unwrap_or_else(|| to_iso_z(departure)),
                    ),
                    temperature_c: bundle.realtime.temperature_c,
                    precipitation_mm: bundle.realtime.precipitation_mm,
                    wind_kph: bundle.realtime.wind_kph,
                    condition: bundle.realtime.condition.clone(),
                    source: Some(bundle.realtime.source.clone()),
                    forecast_24h: Some(bundle.forecast_24h),
                });
            }
            Err(err) => {
                errors.push(format!(
                    "weather prefetch failed at {},{}: {}",
                    coord.lat,
                    coord.lng,
                    crate::errors::short_phrase(&err)
                ));
            }
        }

        let traffic_result = async {
            let realtime = provider.fetch_traffic_status(coord).await?;
            // A depot→depot forecast is pointless; every other point gets
            // the departure-time corridor forecast from the depot.
            let forecast = match depot_coord {
                Some(origin) if origin.key() != coord.key() => Some(
                    provider
                        .fetch_traffic_forecast(origin, coord, departure)
                        .await?,
                ),
                _ => None,
            };
            crate::Result::Ok((realtime, forecast))
        }
        .await;

        match traffic_result {
            Ok((realtime, forecast)) => {
                request.traffic_observations.push(TrafficObservation {
                    lat: coord.lat,
                    lng: coord.lng,
                    time_utc: Some(
                        realtime
                            .observed_at_utc
                            .clone()
                            .unwrap_or_else(|| to_iso_z(departure)),
                    ),
                    congestion_level: realtime.congestion_level.clone(),
                    speed_kmh: realtime.speed_kmh,
                    incident_count: realtime.incident_count,
                    source: Some(realtime.source.clone()),
                    forecast_24h: forecast,
                });
            }
            Err(err) => {
                errors.push(format!(
                    "traffic prefetch failed at {},{}: {}",
                    coord.lat,
                    coord.lng,
                    crate::errors::short_phrase(&err)
                ));
            }
        }
    }

    // The per-segment fan-out must not call the provider again on top of
    // this data.
    request.use_here_platform = Some(false);

    errors.truncate(20);
    PrefetchReport {
        status: "completed".to_owned(),
        enabled: true,
        data_source: config.data_source,
        error: None,
        points_queried: Some(points.len()),
        errors,
        client_stats: Some(provider.stats()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::emulator::EmulatorProvider;
    use crate::request::EnrichConfig;

    fn request() -> SolveRequest {
        serde_json::from_value(serde_json::json!({
            "depot": {"id": "depot", "lat": 40.0, "lng": -3.0},
            "customers": [
                {"id": 1, "lat": 40.1, "lng": -3.1, "demand": 1},
                {"id": 2, "lat": 40.2, "lng": -3.2, "demand": 1}
            ],
            "vehicles": 1,
            "capacity": 5,
            "departure_time_utc": "2026-03-14T08:00:00Z",
            "here_data_source": "emulator",
            "here_pipeline_mode": "before_vrp",
            "here_emulator_seed": "abc"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn prefetch_appends_observations_and_disables_provider() {
        let mut request = request();
        let config = EnrichConfig::from_request(&request);
        let provider: Arc<dyn WeatherTraffic> = Arc::new(EmulatorProvider::new(
            Some("abc".to_owned()),
            300,
            24,
            120,
        ));

        let report = prefetch_point_observations(
            &mut request,
            &config,
            &provider,
            &Deadline::none(),
        )
        .await;

        // Depot + 2 customers.
        assert_eq!(report.points_queried, Some(3));
        assert_eq!(report.status, "completed");
        assert!(report.errors.is_empty());
        assert_eq!(request.weather_observations.len(), 3);
        assert_eq!(request.traffic_observations.len(), 3);
        assert_eq!(request.use_here_platform, Some(false));

        // The depot gets no depot→depot forecast; customers do.
        assert!(request.traffic_observations[0].forecast_24h.is_none());
        assert!(request.traffic_observations[1].forecast_24h.is_some());
        assert!(request.traffic_observations[2].forecast_24h.is_some());

        let stats = report.client_stats.unwrap();
        assert_eq!(stats.weather_queries, 3);
        assert_eq!(stats.routing_queries, 2);
        assert!(stats.emulated);
    }

    #[tokio::test]
    async fn expired_deadline_short_circuits() {
        let mut request = request();
        let config = EnrichConfig::from_request(&request);
        let provider: Arc<dyn WeatherTraffic> = Arc::new(EmulatorProvider::new(
            Some("abc".to_owned()),
            300,
            24,
            120,
        ));

        let report = prefetch_point_observations(
            &mut request,
            &config,
            &provider,
            &Deadline::after(std::time::Duration::from_secs(0)),
        )
        .await;
        assert!(report.errors.iter().any(|e| e == "deadline_exceeded"));
        assert!(request.weather_observations.is_empty());
    }

    #[test]
    fn disabled_report_shape() {
        let report = PrefetchReport::disabled(DataSource::Here, "API key not set");
        assert_eq!(report.status, "disabled");
        assert!(!report.enabled);
        assert_eq!(report.error.as_deref(), Some("API key not set"));
    }
}
