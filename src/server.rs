//! HTTP surface and the request pipeline shared with the CLI mode.
//!
//! `POST /solve_vrp` solves and (optionally) enriches; `POST
//! /enrich_municipality` runs a municipality-only pass over a prior result
//! and merges it in. Routing results are returned with HTTP 200 even when
//! enrichment degraded to `partial` or `failed`.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::ProviderError;
use crate::merge::merge_municipality_layer;
use crate::osm::{AreaQueryClient, ReverseGeocoder};
use crate::osrm::OsrmClient;
use crate::prefetch::{prefetch_point_observations, PrefetchReport};
use crate::providers::SharedHttpClient;
use crate::request::{
    DataSource, EnrichConfig, EnrichMunicipalityRequest, PipelineMode, SolveRequest,
    SolveResponse, DEFAULT_OSRM_BASE_URL,
};
use crate::semantic::{
    build_semantic_layer, default_worker_pool, isolate_enrichment, make_provider,
    EnrichmentContext,
};
use crate::solver;
use crate::timeutil::Deadline;
use crate::Result;

const ENRICH_FAILURE_NOTICE: &str =
    "Semantic enrichment failed; VRP result remains valid.";
const MUNICIPALITY_FAILURE_NOTICE: &str =
    "Municipality enrichment failed; base VRP result remains valid.";

/// Process-wide dependencies of the request pipeline.
pub struct AppState {
    pub http: SharedHttpClient,
    /// The live-provider credential, if the environment carries one.
    pub here_api_key: Option<String>,
    /// Whole-request deadline in seconds.
    pub deadline_secs: u64,
    /// Bounded fan-out pool size.
    pub worker_pool: usize,
    /// Reverse-geocoding endpoints, in fallback order. Empty uses the
    /// built-in default.
    pub reverse_endpoints: Vec<String>,
    /// Area-query endpoint. `None` uses the built-in default.
    pub area_endpoint: Option<String>,
}

impl AppState {
    pub fn new(http: SharedHttpClient, here_api_key: Option<String>) -> AppState {
        AppState {
            http,
            here_api_key,
            deadline_secs: 60,
            worker_pool: default_worker_pool(),
            reverse_endpoints: Vec::new(),
            area_endpoint: None,
        }
    }
}

/// An error that maps onto an HTTP status plus an `{error}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn from_solver(err: anyhow::Error) -> ApiError {
        // An upstream routing failure that could not fall back maps to 502;
        // anything else is an internal bug.
        if err.downcast_ref::<ProviderError>().is_some() {
            ApiError {
                status: StatusCode::BAD_GATEWAY,
                message: err.to_string(),
            }
        } else {
            ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("Unexpected VRP error: {}", err),
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn osrm_client(state: &AppState, request: &SolveRequest) -> OsrmClient {
    let base_url = request
        .osrm_base_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_OSRM_BASE_URL);
    OsrmClient::new(base_url, state.http.clone())
}

/// The `/solve_vrp` pipeline: optional prefetch, solve, optional
/// enrichment. Also the entry point for the stdio mode.
pub async fn run_solve(
    mut request: SolveRequest,
    state: &AppState,
) -> std::result::Result<SolveResponse, ApiError> {
    let depot = request
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?
        .clone();
    let distance_mode = request
        .distance_mode()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let deadline = Deadline::after(std::time::Duration::from_secs(state.deadline_secs));
    let osrm = osrm_client(state, &request);

    // Prefetch mode: per-point provider calls happen before the solve, and
    // the per-segment fan-out later reuses that data.
    let mut prefetch_report: Option<PrefetchReport> = None;
    {
        let config = EnrichConfig::from_request(&request);
        if config.pipeline_mode == PipelineMode::BeforeVrp && config.use_provider {
            let (provider, _) =
                make_provider(&config, &state.http, state.here_api_key.as_deref());
            prefetch_report = Some(match provider {
                Some(provider) => {
                    prefetch_point_observations(&mut request, &config, &provider, &deadline)
                        .await
                }
                None => PrefetchReport::disabled(DataSource::Here, "API key not set"),
            });
        }
    }

    let mut response = solver::solve(
        &depot,
        &request.customers,
        request.vehicles.unwrap_or(1),
        request.capacity.unwrap_or(1),
        distance_mode,
        Some(&osrm),
    )
    .await
    .map_err(ApiError::from_solver)?;

    // Enrichment never outranks the routing result: any failure inside this
    // block degrades to a failed-shape layer on an otherwise intact
    // response.
    let config = EnrichConfig::from_request(&request);
    if config.include_semantic_layer {
        let (provider, api_key_source) =
            make_provider(&config, &state.http, state.here_api_key.as_deref());
        let (reverse, area) = if config.municipality.enabled {
            (
                Some(Arc::new(ReverseGeocoder::new(
                    state.reverse_endpoints.clone(),
                    state.http.clone(),
                    config.municipality.reverse_min_interval_ms,
                ))),
                Some(Arc::new(AreaQueryClient::new(
                    state.area_endpoint.clone(),
                    state.http.clone(),
                    config.municipality.reverse_min_interval_ms,
                ))),
            )
        } else {
            (None, None)
        };

        let ctx = Arc::new(EnrichmentContext {
            config: config.clone(),
            provider,
            api_key_source,
            reverse,
            area,
            osrm: Some(Arc::new(osrm_client(state, &request))),
            deadline,
            worker_pool: state.worker_pool,
        });
        let vrp = response.clone();
        let enrich_request = request.clone();
        let build = async move { build_semantic_layer(&vrp, &enrich_request, &ctx).await };
        let (layer, notice) =
            isolate_enrichment(build, &config, ENRICH_FAILURE_NOTICE).await;
        response.semantic_layer = Some(layer);
        response.semantic_layer_error = notice;
    }

    response.here_prefetch = prefetch_report;
    Ok(response)
}

/// The `/enrich_municipality` pipeline: a municipality-only enrichment of a
/// prior routing result, merged into any existing layer.
pub async fn run_enrich_municipality(
    body: EnrichMunicipalityRequest,
    state: &AppState,
) -> std::result::Result<SolveResponse, ApiError> {
    let mut request = body.payload.unwrap_or_default();
    request.include_semantic_layer = Some(true);
    request.municipality_enrichment_enabled = Some(true);
    request.use_here_platform = Some(false);

    let mut response = body.vrp_result;
    let existing_layer = response.semantic_layer.take();
    let config = EnrichConfig::from_request(&request);
    let deadline = Deadline::after(std::time::Duration::from_secs(state.deadline_secs));

    let reverse = Arc::new(ReverseGeocoder::new(
        state.reverse_endpoints.clone(),
        state.http.clone(),
        config.municipality.reverse_min_interval_ms,
    ));
    let area = Arc::new(AreaQueryClient::new(
        state.area_endpoint.clone(),
        state.http.clone(),
        config.municipality.reverse_min_interval_ms,
    ));
    let ctx = Arc::new(EnrichmentContext {
        config: config.clone(),
        provider: None,
        api_key_source: "disabled".to_owned(),
        reverse: Some(reverse),
        area: Some(area),
        osrm: Some(Arc::new(osrm_client(state, &request))),
        deadline,
        worker_pool: state.worker_pool,
    });

    let vrp = response.clone();
    let enrich_request = request.clone();
    let build = async move { build_semantic_layer(&vrp, &enrich_request, &ctx).await };
    let (layer, notice) =
        isolate_enrichment(build, &config, MUNICIPALITY_FAILURE_NOTICE).await;

    if layer.status == crate::semantic::SemanticStatus::Failed {
        // Keep whatever enrichment the caller already had.
        response.municipality_enrichment_error = layer.error.clone();
        response.semantic_layer = existing_layer;
        response.semantic_layer_error = notice;
        return Ok(response);
    }

    response.semantic_layer = Some(match &existing_layer {
        Some(existing) => merge_municipality_layer(existing, &layer),
        None => layer,
    });
    Ok(response)
}

async fn handle_solve_vrp(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> std::result::Result<Json<SolveResponse>, ApiError> {
    let request: SolveRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid JSON"))?;
    let response = run_solve(request, &state).await?;
    Ok(Json(response))
}

async fn handle_enrich_municipality(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> std::result::Result<Json<SolveResponse>, ApiError> {
    let request: EnrichMunicipalityRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid JSON"))?;
    let response = run_enrich_municipality(request, &state).await?;
    Ok(Json(response))
}

/// Run the server. Should not return.
pub async fn run_server(listen_addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = Router::new()
        .route("/solve_vrp", post(handle_solve_vrp))
        .route("/enrich_municipality", post(handle_enrich_municipality))
        .layer(Extension(state));

    let listen_addr = listen_addr.parse().with_context(|| {
        format!("could not parse listen address: {:?}", listen_addr)
    })?;

    info!("listening on {}", listen_addr);
    axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await
        .context("web server failed to start")
        .map_err(|err| {
            warn!("server exited: {}", err);
            err
        })
}
