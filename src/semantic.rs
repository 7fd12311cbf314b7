//! The enrichment orchestrator.
//!
//! Fans out per-route and per-segment lookups across a bounded worker pool,
//! isolates every provider failure to the segment that hit it, and
//! assembles the `semantic_layer` artifact. The one rule that outranks all
//! others: enrichment must never corrupt or drop the routing answer it
//! decorates.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::errors::{short_phrase, ProviderError};
use crate::municipality::{
    MunicipalityApi, MunicipalityRunner, Phase1Point, StopMunicipalityLink,
};
use crate::osm::{AdminResolution, AreaQueryClient, ReverseGeocoder};
use crate::osrm::OsrmClient;
use crate::poi::{score_route_locations, ScoredLocation};
use crate::providers::{
    emulator::EmulatorProvider, here::HereProvider, FetchStatus, ProviderStats,
    SharedHttpClient, TrafficForecast, WeatherForecast, WeatherTraffic,
};
use crate::request::{
    DataSource, EnrichConfig, Id, PipelineMode, SolveRequest, SolveResponse,
};
use crate::segments::{
    build_segments, match_traffic, match_weather, Segment, SegmentContext,
    TrafficContext, WeatherContext,
};
use crate::timeutil::{to_iso_z, Deadline};
use crate::Result;

/// Cap on the emitted `errors` list.
const MAX_ERRORS: usize = 40;

/// Enrichment outcome status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticStatus {
    Ok,
    Partial,
    Failed,
}

/// Echo of the effective enrichment configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticConfig {
    pub semantic_corridor_radius_km: f64,
    pub semantic_top_k: usize,
    pub route_avg_speed_kmh: f64,
    pub semantic_categories: Vec<String>,
    pub departure_time_utc: Option<String>,
    pub use_here_platform: bool,
    pub here_data_source: DataSource,
    pub here_api_key_source: String,
    pub here_timeout_sec: u64,
    pub here_traffic_radius_m: u32,
    pub here_forecast_window_hours: u32,
    pub here_forecast_interval_min: u32,
    pub here_pipeline_mode: PipelineMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_mode: Option<String>,
    pub municipality_enrichment_enabled: bool,
    pub municipality_step_km: f64,
    pub municipality_radius_km: f64,
    pub municipality_max_samples_per_segment: usize,
    pub municipality_reverse_min_interval_ms: u64,
    pub municipality_use_route_geometry: bool,
    pub province_capital_lookup_enabled: bool,
}

/// Enrichment counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticSummary {
    pub status: SemanticStatus,
    pub routes_enriched: usize,
    pub segment_context_records: usize,
    pub candidate_locations_received: usize,
    pub matched_semantic_locations: usize,
    pub weather_observations_received: usize,
    pub traffic_observations_received: usize,
    pub here_platform_enabled: bool,
    pub here_data_source: DataSource,
    pub here_errors: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub here_client_stats: Option<ProviderStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_api_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_phase1_points: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_phase2_samples: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_route_geometry_fallback_to_straight: Option<u64>,
}

/// Per-route enrichment on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteEnrichment {
    pub vehicle: i64,
    pub route_distance_km: f64,
    pub served_customer_ids: Vec<Id>,
    pub semantic_locations: Vec<ScoredLocation>,
    pub segment_context: Vec<SegmentContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_municipality_links: Option<Vec<StopMunicipalityLink>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_vector: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_vector: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_capital_vector: Option<Vec<String>>,
}

/// The enrichment artifact attached to a solve response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticLayer {
    pub status: SemanticStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SemanticConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SemanticSummary>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_api: Option<MunicipalityApi>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_address_book: Option<BTreeMap<String, AdminResolution>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_phase1_input_points: Option<Vec<Phase1Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_post_output_notice: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteEnrichment>,
}

impl SemanticLayer {
    /// The minimal failed shape: the routing result stays valid, this
    /// object only records why enrichment is absent.
    pub fn failed(error: String, config: &EnrichConfig) -> SemanticLayer {
        SemanticLayer {
            status: SemanticStatus::Failed,
            error: Some(error),
            version: None,
            generated_at_utc: Some(to_iso_z(Utc::now())),
            config: None,
            summary: None,
            errors: Vec::new(),
            municipality_api: None,
            municipality_address_book: None,
            municipality_phase1_input_points: None,
            municipality_post_output_notice: None,
            routes: Vec::new(),
        }
        .with_failed_mode_tags(config)
    }

    fn with_failed_mode_tags(mut self, config: &EnrichConfig) -> SemanticLayer {
        // Keep enough of the effective config in the failed shape for the
        // caller to see which pipeline was attempted.
        self.config = Some(SemanticConfig::echo(config, "unavailable".to_owned(), None));
        self
    }
}

impl SemanticConfig {
    fn echo(
        config: &EnrichConfig,
        api_key_source: String,
        distance_mode: Option<String>,
    ) -> SemanticConfig {
        SemanticConfig {
            semantic_corridor_radius_km: config.corridor_radius_km,
            semantic_top_k: config.top_k,
            route_avg_speed_kmh: config.avg_speed_kmh,
            semantic_categories: config.categories.iter().cloned().collect(),
            departure_time_utc: config.departure_time_utc.map(to_iso_z),
            use_here_platform: config.use_provider,
            here_data_source: config.data_source,
            here_api_key_source: api_key_source,
            here_timeout_sec: config.provider_timeout_sec,
            here_traffic_radius_m: config.traffic_radius_m,
            here_forecast_window_hours: config.forecast_window_hours,
            here_forecast_interval_min: config.forecast_interval_min,
            here_pipeline_mode: config.pipeline_mode,
            distance_mode,
            municipality_enrichment_enabled: config.municipality.enabled,
            municipality_step_km: config.municipality.step_km,
            municipality_radius_km: config.municipality.radius_km,
            municipality_max_samples_per_segment: config
                .municipality
                .max_samples_per_segment,
            municipality_reverse_min_interval_ms: config
                .municipality
                .reverse_min_interval_ms,
            municipality_use_route_geometry: config.municipality.use_route_geometry,
            province_capital_lookup_enabled: config.municipality.province_capital_lookup,
        }
    }
}

/// Everything the orchestrator needs for one request.
pub struct EnrichmentContext {
    pub config: EnrichConfig,
    pub provider: Option<Arc<dyn WeatherTraffic>>,
    pub api_key_source: String,
    pub reverse: Option<Arc<ReverseGeocoder>>,
    pub area: Option<Arc<AreaQueryClient>>,
    pub osrm: Option<Arc<OsrmClient>>,
    pub deadline: Deadline,
    pub worker_pool: usize,
}

/// Default bounded worker pool: `min(8, 2 × CPU)`.
pub fn default_worker_pool() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (2 * cpus).min(8).max(1)
}

/// Build the provider variant for a request. Returns the provider (when
/// enabled and usable) and the `here_api_key_source` config echo.
pub fn make_provider(
    config: &EnrichConfig,
    http: &SharedHttpClient,
    api_key: Option<&str>,
) -> (Option<Arc<dyn WeatherTraffic>>, String) {
    if !config.use_provider {
        return (None, "disabled".to_owned());
    }
    match config.data_source {
        DataSource::Emulator => {
            let provider: Arc<dyn WeatherTraffic> = Arc::new(EmulatorProvider::new(
                config.emulator_seed.clone(),
                config.traffic_radius_m,
                config.forecast_window_hours,
                config.forecast_interval_min,
            ));
            (Some(provider), "not_required_emulator".to_owned())
        }
        DataSource::Here => {
            let api_key = api_key.unwrap_or("").trim().to_owned();
            if api_key.is_empty() {
                return (None, "missing_env:HERE_API_KEY".to_owned());
            }
            let provider: Arc<dyn WeatherTraffic> = Arc::new(HereProvider::new(
                api_key,
                http.clone(),
                config.provider_timeout_sec,
                config.traffic_radius_m,
                config.forecast_window_hours,
                config.forecast_interval_min,
            ));
            (Some(provider), "env:HERE_API_KEY".to_owned())
        }
    }
}

/// Bound a future by the request deadline.
async fn bounded<T, F>(deadline: &Deadline, endpoint: &str, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match deadline.remaining() {
        None => future.await,
        Some(remaining) if remaining.is_zero() => {
            Err(ProviderError::deadline(endpoint).into())
        }
        Some(remaining) => tokio::time::timeout(remaining, future)
            .await
            .map_err(|_| ProviderError::deadline(endpoint))?,
    }
}

/// Boxed-future wrapper around `enrich_segment`, named so its signature is
/// written out explicitly rather than inferred inside a closure; inferring
/// it inline at the `futures::stream::iter(...).map(...)` call site trips
/// rustc's higher-ranked closure inference (the closure would need to be
/// generic over the segment's borrow lifetime, which is not expressible
/// when its body also erases the result into a boxed trait object).
fn enrich_segment_boxed<'a>(
    segment: &'a Segment,
    request: &'a SolveRequest,
    ctx: &'a EnrichmentContext,
) -> futures::future::BoxFuture<'a, (SegmentContext, Vec<String>)> {
    enrich_segment(segment, request, ctx).boxed()
}

/// Enrich one segment: attach matched observations, then let the provider
/// supersede them where it is the authority. Every failure taints only this
/// segment.
async fn enrich_segment(
    segment: &Segment,
    request: &SolveRequest,
    ctx: &EnrichmentContext,
) -> (SegmentContext, Vec<String>) {
    let mut errors = Vec::new();
    let config = &ctx.config;

    let mut weather = match match_weather(segment, segment.eta_utc, &request.weather_observations)
    {
        Some(matched) => WeatherContext::from_observation(
            &request.weather_observations[matched.index],
            &matched,
        ),
        None => WeatherContext::not_provided(),
    };
    let mut traffic = match match_traffic(segment, segment.eta_utc, &request.traffic_observations)
    {
        Some(matched) => TrafficContext::from_observation(
            &request.traffic_observations[matched.index],
            &matched,
        ),
        None => TrafficContext::not_provided(),
    };

    if let Some(provider) = &ctx.provider {
        let reference_time = segment
            .eta_utc
            .or(config.departure_time_utc)
            .unwrap_or_else(Utc::now);
        let midpoint = segment.midpoint;

        match bounded(
            &ctx.deadline,
            "weather.v3",
            provider.fetch_weather(midpoint, reference_time),
        )
        .await
        {
            Ok(bundle) => {
                // Provider observations win only when actually observed;
                // provider forecasts always win.
                if bundle.realtime.status == FetchStatus::Observed
                    || weather.status == FetchStatus::Unknown
                {
                    weather = WeatherContext::from_provider(&bundle.realtime);
                }
                weather.forecast_24h = Some(bundle.forecast_24h);
            }
            Err(err) => {
                counter!("routeenrich.segment_errors.total", 1, "kind" => "weather");
                let phrase = format!(
                    "weather fetch failed at {:.4},{:.4}: {}",
                    midpoint.lat,
                    midpoint.lng,
                    short_phrase(&err)
                );
                weather.here_error = Some(short_phrase(&err));
                errors.push(phrase);
            }
        }

        match bounded(
            &ctx.deadline,
            "traffic.v7",
            provider.fetch_traffic_status(midpoint),
        )
        .await
        {
            Ok(realtime) => {
                if realtime.status == FetchStatus::Observed
                    || traffic.status == FetchStatus::Unknown
                {
                    let forecast = traffic.forecast_24h.take();
                    traffic = TrafficContext::from_provider(&realtime);
                    traffic.forecast_24h = forecast;
                }
            }
            Err(err) => {
                counter!("routeenrich.segment_errors.total", 1, "kind" => "traffic");
                let phrase = format!(
                    "traffic fetch failed at {:.4},{:.4}: {}",
                    midpoint.lat,
                    midpoint.lng,
                    short_phrase(&err)
                );
                traffic.here_error = Some(short_phrase(&err));
                errors.push(phrase);
            }
        }

        match bounded(
            &ctx.deadline,
            "routing.v8",
            provider.fetch_traffic_forecast(segment.start, segment.end, reference_time),
        )
        .await
        {
            Ok(forecast) => traffic.forecast_24h = Some(forecast),
            Err(err) => {
                counter!("routeenrich.segment_errors.total", 1, "kind" => "routing");
                let mut unknown = TrafficForecast::unknown(
                    config.forecast_window_hours,
                    config.forecast_interval_min,
                    "here_routing_v8",
                );
                unknown.error = Some(short_phrase(&err));
                traffic.forecast_24h = Some(unknown);
                errors.push(format!(
                    "traffic forecast failed ({}->{}): {}",
                    segment.start.key(),
                    segment.end.key(),
                    short_phrase(&err)
                ));
            }
        }
    }

    if weather.forecast_24h.is_none() {
        let interval = ctx.provider.as_ref().map(|_| config.forecast_interval_min);
        weather.forecast_24h = Some(WeatherForecast::unknown(
            config.forecast_window_hours,
            interval,
            "not_provided",
        ));
    }
    if traffic.forecast_24h.is_none() {
        traffic.forecast_24h = Some(TrafficForecast::unknown(
            config.forecast_window_hours,
            config.forecast_interval_min,
            "not_provided",
        ));
    }

    (SegmentContext::new(segment, weather, traffic), errors)
}

/// Build the full semantic layer for a solved request.
#[instrument(level = "debug", skip_all, fields(routes = vrp.routes.len()))]
pub async fn build_semantic_layer(
    vrp: &SolveResponse,
    request: &SolveRequest,
    ctx: &EnrichmentContext,
) -> Result<SemanticLayer> {
    let config = &ctx.config;
    let mut errors: Vec<String> = Vec::new();
    let mut route_enrichments = Vec::with_capacity(vrp.routes.len());
    let mut segment_records = 0usize;
    let mut matched_locations = 0usize;
    let mut all_route_segments: Vec<Vec<Segment>> = Vec::with_capacity(vrp.routes.len());

    for route in &vrp.routes {
        let segments = build_segments(
            &route.stops,
            config.avg_speed_kmh,
            config.departure_time_utc,
        );

        let mut semantic_locations = score_route_locations(
            &route.stops,
            &request.candidate_locations,
            config.corridor_radius_km,
            &config.categories,
            config.top_k,
        );

        // Per-segment fan-out across the bounded pool; `buffered` keeps
        // `segment_context` in `segment_index` order.
        let segment_futures: Vec<_> = segments
            .iter()
            .map(|segment| enrich_segment_boxed(segment, request, ctx))
            .collect();
        let enriched: Vec<(SegmentContext, Vec<String>)> =
            futures::stream::iter(segment_futures)
                .buffered(ctx.worker_pool.max(1))
                .collect()
                .await;

        let mut segment_context = Vec::with_capacity(enriched.len());
        for (context, segment_errors) in enriched {
            errors.extend(segment_errors);
            segment_context.push(context);
        }

        // Link each matched location to the weather/traffic of its nearest
        // segment.
        for location in &mut semantic_locations {
            if let Some(context) = segment_context
                .iter()
                .find(|c| c.segment_index == location.nearest_segment_index)
            {
                location.weather = Some(context.weather.clone());
                location.traffic = Some(context.traffic.clone());
            }
        }

        segment_records += segment_context.len();
        matched_locations += semantic_locations.len();
        route_enrichments.push(RouteEnrichment {
            vehicle: route.vehicle,
            route_distance_km: route.distance_km,
            served_customer_ids: route.served_customer_ids.clone(),
            semantic_locations,
            segment_context,
            stop_municipality_links: None,
            municipality_vector: None,
            province_vector: None,
            province_capital_vector: None,
        });
        all_route_segments.push(segments);
    }

    // Municipality pass, sharing one resolver (and its interval timer)
    // across both phases and all routes.
    let mut municipality_api = None;
    let mut municipality_address_book = None;
    let mut municipality_points = None;
    let mut municipality_notice = None;
    if config.municipality.enabled {
        if let Some(reverse) = &ctx.reverse {
            let runner = MunicipalityRunner {
                reverse,
                area: ctx.area.as_deref(),
                osrm: ctx.osrm.as_deref(),
                config: &config.municipality,
                road_based_distances: config.municipality.use_route_geometry
                    && vrp.summary.distance_source.is_road_based(),
                deadline: ctx.deadline,
            };
            let depot = request.depot.as_ref();
            let outcome = runner
                .run(depot, &request.customers, &vrp.routes, &all_route_segments)
                .await;

            for (enrichment, route_admin) in
                route_enrichments.iter_mut().zip(outcome.per_route.iter())
            {
                enrichment.stop_municipality_links = Some(route_admin.stop_links.clone());
                enrichment.municipality_vector =
                    Some(route_admin.municipality_vector.clone());
                enrichment.province_vector = Some(route_admin.province_vector.clone());
                enrichment.province_capital_vector =
                    Some(route_admin.province_capital_vector.clone());
                for (context, segment_admin) in enrichment
                    .segment_context
                    .iter_mut()
                    .zip(route_admin.segments.iter())
                {
                    context.municipality_trace = Some(segment_admin.trace.clone());
                    context.municipality_names =
                        Some(segment_admin.municipality_names.clone());
                    context.province_names = Some(segment_admin.province_names.clone());
                    context.province_capital_names =
                        Some(segment_admin.province_capital_names.clone());
                }
            }

            errors.extend(outcome.errors.clone());
            municipality_api = Some(outcome.api);
            municipality_address_book = Some(outcome.address_book);
            municipality_points = Some(outcome.phase1_points);
            municipality_notice = Some(outcome.notice);
        } else {
            warn!("municipality enrichment enabled but no resolver configured");
        }
    }

    let status = if errors.iter().any(|e| e == "deadline_exceeded") || ctx.deadline.expired()
    {
        SemanticStatus::Partial
    } else {
        SemanticStatus::Ok
    };
    if !errors.is_empty() {
        debug!("enrichment finished with {} isolated errors", errors.len());
    }
    let error_count = errors.len();
    errors.truncate(MAX_ERRORS);

    let summary = SemanticSummary {
        status,
        routes_enriched: route_enrichments.len(),
        segment_context_records: segment_records,
        candidate_locations_received: request.candidate_locations.len(),
        matched_semantic_locations: matched_locations,
        weather_observations_received: request.weather_observations.len(),
        traffic_observations_received: request.traffic_observations.len(),
        here_platform_enabled: ctx.provider.is_some(),
        here_data_source: config.data_source,
        here_errors: error_count,
        here_client_stats: ctx.provider.as_ref().map(|p| p.stats()),
        municipality_api_status: municipality_api.as_ref().map(|api| api.status.clone()),
        municipality_phase1_points: municipality_api.as_ref().map(|api| api.phase1.points),
        municipality_phase2_samples: municipality_api
            .as_ref()
            .map(|api| api.phase2.samples),
        municipality_route_geometry_fallback_to_straight: municipality_api
            .as_ref()
            .map(|api| api.route_geometry.fallback_to_straight),
    };

    Ok(SemanticLayer {
        status,
        error: None,
        version: Some("0.5".to_owned()),
        generated_at_utc: Some(to_iso_z(Utc::now())),
        config: Some(SemanticConfig::echo(
            config,
            ctx.api_key_source.clone(),
            request.distance_mode.clone(),
        )),
        summary: Some(summary),
        errors,
        municipality_api,
        municipality_address_book,
        municipality_phase1_input_points: municipality_points,
        municipality_post_output_notice: municipality_notice,
        routes: route_enrichments,
    })
}

/// Run an enrichment build with full failure isolation: an `Err`, or even
/// a panic, becomes the failed-shape layer plus the top-level notice, never
/// a dropped routing result.
pub async fn isolate_enrichment<F>(
    build: F,
    config: &EnrichConfig,
    failure_notice: &str,
) -> (SemanticLayer, Option<String>)
where
    F: std::future::Future<Output = Result<SemanticLayer>> + Send + 'static,
{
    let outcome = tokio::spawn(build).await;
    match outcome {
        Ok(Ok(layer)) => (layer, None),
        Ok(Err(err)) => {
            warn!("enrichment failed, keeping routing result: {}", err);
            (
                SemanticLayer::failed(short_phrase(&err), config),
                Some(failure_notice.to_owned()),
            )
        }
        Err(join_err) => {
            warn!("enrichment task aborted, keeping routing result: {}", join_err);
            (
                SemanticLayer::failed(join_err.to_string(), config),
                Some(failure_notice.to_owned()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SolveRequest;

    fn config() -> EnrichConfig {
        EnrichConfig::from_request(&SolveRequest::default())
    }

    #[tokio::test]
    async fn isolation_turns_errors_into_failed_shape() {
        let (layer, notice) = isolate_enrichment(
            async { Err(anyhow::format_err!("scorer exploded")) },
            &config(),
            "Semantic enrichment failed; VRP result remains valid.",
        )
        .await;
        assert_eq!(layer.status, SemanticStatus::Failed);
        assert_eq!(layer.error.as_deref(), Some("scorer exploded"));
        assert!(layer.routes.is_empty());
        assert_eq!(
            notice.as_deref(),
            Some("Semantic enrichment failed; VRP result remains valid.")
        );
    }

    #[tokio::test]
    async fn isolation_catches_panics_too() {
        let (layer, notice) = isolate_enrichment(
            async { panic!("synthetic scorer panic") },
            &config(),
            "Semantic enrichment failed; VRP result remains valid.",
        )
        .await;
        assert_eq!(layer.status, SemanticStatus::Failed);
        assert!(layer.error.unwrap().contains("panic"));
        assert!(notice.is_some());
    }

    #[test]
    fn worker_pool_is_bounded() {
        let pool = default_worker_pool();
        assert!(pool >= 1 && pool <= 8);
    }
}
