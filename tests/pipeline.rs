//! End-to-end pipeline tests, driven through the same entry points the HTTP
//! handlers use. External services are either the deterministic emulator or
//! tiny in-process mock servers, so nothing here touches the network.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use route_enrich::providers::{shared_http_client, FetchStatus};
use route_enrich::request::{
    DistanceSource, EnrichMunicipalityRequest, Id, SolveRequest, SolveResponse,
};
use route_enrich::semantic::SemanticStatus;
use route_enrich::server::{run_enrich_municipality, run_solve, AppState};

fn state() -> AppState {
    AppState::new(shared_http_client(4), None)
}

fn base_request(extra: Value) -> SolveRequest {
    let mut body = json!({
        "depot": {"id": "depot", "lat": 40.0, "lng": -3.0},
        "customers": [{"id": 1, "lat": 40.1, "lng": -3.1, "demand": 1}],
        "vehicles": 1,
        "capacity": 5,
        "distance_mode": "direct",
        "departure_time_utc": "2026-03-14T08:00:00Z",
        "here_data_source": "emulator",
        "here_emulator_seed": "abc"
    });
    if let (Value::Object(base), Value::Object(extra)) = (&mut body, extra) {
        base.extend(extra);
    }
    serde_json::from_value(body).unwrap()
}

/// A mock OSRM + reverse-geocoding + area-query endpoint: tables succeed,
/// road geometry always fails, reverse geocoding answers a fixed address.
async fn spawn_mock_osm() -> SocketAddr {
    async fn table(Path(coords): Path<String>) -> Json<Value> {
        let n = coords
            .trim_end_matches(|c: char| c == '?')
            .split(';')
            .count();
        let row: Vec<Value> = (0..n).map(|_| json!(25_000.0)).collect();
        let distances: Vec<Value> = (0..n).map(|_| json!(row.clone())).collect();
        Json(json!({"code": "Ok", "distances": distances}))
    }

    async fn geometry() -> (StatusCode, &'static str) {
        (StatusCode::INTERNAL_SERVER_ERROR, "no geometry today")
    }

    async fn reverse() -> Json<Value> {
        Json(json!({
            "osm_type": "way",
            "osm_id": 99,
            "address": {
                "city": "Sevilla",
                "state": "Andalucía",
                "country_code": "es"
            }
        }))
    }

    async fn interpreter() -> Json<Value> {
        Json(json!({"elements": []}))
    }

    let app = Router::new()
        .route("/table/v1/driving/*coords", get(table))
        .route("/route/v1/driving/*coords", get(geometry))
        .route("/reverse", get(reverse))
        .route("/api/interpreter", post(interpreter));

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    addr
}

#[tokio::test]
async fn single_customer_round_trip() {
    let response = run_solve(base_request(json!({})), &state()).await.unwrap();

    assert_eq!(response.routes.len(), 1);
    let route = &response.routes[0];
    assert_eq!(route.used, 1);
    assert_eq!(route.stops.len(), 3);
    assert!((route.distance_km - 28.08).abs() < 0.2, "{}", route.distance_km);
    assert!(response.unserved_customer_ids.is_empty());
    assert_eq!(response.summary.served, 1);

    let layer = response.semantic_layer.as_ref().unwrap();
    assert_eq!(layer.status, SemanticStatus::Ok);
    let enriched = &layer.routes[0];
    assert_eq!(enriched.segment_context.len(), 2);

    // Segment invariants: cumulative sums and monotone ETAs.
    for pair in enriched.segment_context.windows(2) {
        let expected = pair[0].cumulative_distance_km + pair[1].distance_km;
        assert!((pair[1].cumulative_distance_km - expected).abs() < 0.01);
        assert!(pair[1].eta_min_from_departure >= pair[0].eta_min_from_departure);
    }

    // The emulator answered for every segment.
    for context in &enriched.segment_context {
        assert_eq!(context.weather.status, FetchStatus::Observed);
        assert_eq!(context.weather.source, "here_weather_v3");
        let weather_forecast = context.weather.forecast_24h.as_ref().unwrap();
        assert_eq!(weather_forecast.status, FetchStatus::Forecasted);
        assert!(weather_forecast.worst_slots.len() <= 6);
        let traffic_forecast = context.traffic.forecast_24h.as_ref().unwrap();
        assert_eq!(traffic_forecast.status, FetchStatus::Forecasted);
        assert!(traffic_forecast.worst_case_delay_ratio.unwrap() >= 1.0);
    }

    // Out-and-back shares one midpoint and one hour bucket: a single
    // weather query plus a cache hit.
    let stats = layer
        .summary
        .as_ref()
        .unwrap()
        .here_client_stats
        .as_ref()
        .unwrap();
    assert_eq!(stats.weather_queries, 1);
    assert!(stats.cache_hits >= 1);
}

#[tokio::test]
async fn capacity_forces_split() {
    let request = serde_json::from_value::<SolveRequest>(json!({
        "depot": {"id": "depot", "lat": 0.0, "lng": 0.0},
        "customers": [
            {"id": 1, "lat": 0.0, "lng": 1.0, "demand": 3},
            {"id": 2, "lat": 1.0, "lng": 0.0, "demand": 3},
            {"id": 3, "lat": 0.0, "lng": -1.0, "demand": 3},
            {"id": 4, "lat": -1.0, "lng": 0.0, "demand": 3}
        ],
        "vehicles": 2,
        "capacity": 6,
        "include_semantic_layer": false
    }))
    .unwrap();
    let response = run_solve(request, &state()).await.unwrap();

    assert_eq!(response.routes.len(), 2);
    let mut total_used = 0;
    for route in &response.routes {
        assert!(route.used <= route.capacity);
        assert_eq!(route.served_customer_ids.len(), 2);
        total_used += route.used;
    }
    assert_eq!(total_used, 12);
    assert!(response.unserved_customer_ids.is_empty());
    assert!(response.semantic_layer.is_none());

    // served ∪ unserved covers all customers, disjointly.
    let served: Vec<Id> = response
        .routes
        .iter()
        .flat_map(|r| r.served_customer_ids.clone())
        .collect();
    assert_eq!(served.len(), 4);
}

#[tokio::test]
async fn unreachable_osrm_falls_back_to_direct() {
    let request = base_request(json!({
        "distance_mode": "osrm",
        "osrm_base_url": "http://127.0.0.1:9",
        "include_semantic_layer": false
    }));
    let response = run_solve(request, &state()).await.unwrap();

    assert!(response
        .warnings
        .iter()
        .any(|w| w.contains("using direct distances")));
    assert_eq!(response.summary.distance_source, DistanceSource::DirectFallback);
    assert!(response.unserved_customer_ids.is_empty());
    assert_eq!(response.routes[0].served_customer_ids.len(), 1);
}

#[tokio::test]
async fn null_leg_table_degrades_to_direct_distances() {
    // OSRM answers, but every leg is null: the table is useless and the
    // solve must degrade to direct distances instead of declaring the
    // customer unreachable.
    async fn null_table(Path(coords): Path<String>) -> Json<Value> {
        let n = coords.split(';').count();
        let row: Vec<Value> = (0..n).map(|_| Value::Null).collect();
        let distances: Vec<Value> = (0..n).map(|_| json!(row.clone())).collect();
        Json(json!({"code": "Ok", "distances": distances}))
    }
    let app = Router::new().route("/table/v1/driving/*coords", get(null_table));
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });

    let request = base_request(json!({
        "distance_mode": "osrm",
        "osrm_base_url": format!("http://{}", addr),
        "include_semantic_layer": false
    }));
    let response = run_solve(request, &state()).await.unwrap();

    assert!(response
        .warnings
        .iter()
        .any(|w| w.contains("using direct distances")));
    assert_eq!(response.summary.distance_source, DistanceSource::DirectFallback);
    assert!(response.unserved_customer_ids.is_empty());
    assert_eq!(response.routes[0].served_customer_ids, vec![Id::Int(1)]);
}

#[tokio::test]
async fn municipality_tracing_survives_geometry_failure() {
    let mock = spawn_mock_osm().await;
    let mut state = state();
    state.reverse_endpoints = vec![format!("http://{}/reverse", mock)];
    state.area_endpoint = Some(format!("http://{}/api/interpreter", mock));

    let request = base_request(json!({
        "distance_mode": "osrm",
        "osrm_base_url": format!("http://{}", mock),
        "use_here_platform": false,
        "municipality_enrichment_enabled": true,
        "municipality_reverse_min_interval_ms": 1
    }));
    let response = run_solve(request, &state).await.unwrap();

    assert_eq!(response.summary.distance_source, DistanceSource::Osrm);
    let layer = response.semantic_layer.as_ref().unwrap();
    let api = layer.municipality_api.as_ref().unwrap();

    // Geometry was attempted (road-based distances) and fell back.
    assert!(api.route_geometry.requested >= 1);
    assert!(api.route_geometry.fallback_to_straight >= 1);
    assert_eq!(api.route_geometry.fetched, 0);
    let notice = layer.municipality_post_output_notice.as_ref().unwrap();
    assert!(notice.contains("fallback"), "{}", notice);

    // Phase 1 resolved both distinct points through the mock geocoder.
    assert_eq!(api.phase1.points, 2);
    assert_eq!(api.phase1.resolved, 2);
    assert!(api.phase2.samples >= 2);

    // Admin vectors carry the resolved names, with no adjacent duplicates.
    let enriched = &layer.routes[0];
    let vector = enriched.municipality_vector.as_ref().unwrap();
    assert_eq!(vector, &vec!["Sevilla".to_owned()]);
    for pair in vector.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    assert_eq!(
        enriched.province_vector.as_ref().unwrap(),
        &vec!["Andalucía".to_owned()]
    );

    // Stop links come from the shared address book.
    let links = enriched.stop_municipality_links.as_ref().unwrap();
    assert_eq!(links.len(), 3);
    assert!(links
        .iter()
        .all(|l| l.municipality_name.as_deref() == Some("Sevilla")));
    assert!(layer.municipality_address_book.as_ref().unwrap().len() >= 2);

    // Geometry failures are isolated into the errors list, not fatal.
    assert!(layer.errors.iter().any(|e| e.contains("geometry fetch failed")));
    assert_eq!(layer.status, SemanticStatus::Ok);
}

#[tokio::test]
async fn emulator_is_deterministic_for_a_fixed_seed() {
    let first = run_solve(base_request(json!({})), &state()).await.unwrap();
    let second = run_solve(base_request(json!({})), &state()).await.unwrap();

    let stats = |response: &SolveResponse| {
        response
            .semantic_layer
            .as_ref()
            .unwrap()
            .summary
            .as_ref()
            .unwrap()
            .here_client_stats
            .clone()
            .unwrap()
    };
    assert_eq!(stats(&first).weather_queries, stats(&second).weather_queries);

    let temperature = |response: &SolveResponse| {
        response.semantic_layer.as_ref().unwrap().routes[0].segment_context[0]
            .weather
            .temperature_c
    };
    assert_eq!(temperature(&first), temperature(&second));
    assert!(temperature(&first).is_some());

    // A different seed answers differently somewhere in the layer.
    let other = run_solve(
        base_request(json!({"here_emulator_seed": "xyz"})),
        &state(),
    )
    .await
    .unwrap();
    assert_ne!(temperature(&first), temperature(&other));
}

#[tokio::test]
async fn prefetch_mode_feeds_observations_and_disables_fanout() {
    let request = base_request(json!({
        "here_pipeline_mode": "before_vrp"
    }));
    let response = run_solve(request, &state()).await.unwrap();

    let prefetch = response.here_prefetch.as_ref().unwrap();
    assert_eq!(prefetch.status, "completed");
    assert!(prefetch.enabled);
    assert_eq!(prefetch.points_queried, Some(2));
    assert!(prefetch.errors.is_empty());
    assert!(prefetch.client_stats.as_ref().unwrap().weather_queries >= 1);

    let layer = response.semantic_layer.as_ref().unwrap();
    let summary = layer.summary.as_ref().unwrap();
    // Downstream fan-out did not run a provider of its own,
    assert!(!summary.here_platform_enabled);
    assert!(summary.here_client_stats.is_none());
    // yet segments carry observed weather, matched from the prefetched
    // observation arrays.
    assert_eq!(summary.weather_observations_received, 2);
    let context = &layer.routes[0].segment_context[0];
    assert_eq!(context.weather.status, FetchStatus::Observed);
    assert_eq!(context.weather.source, "here_weather_v3");
    assert!(context.weather.forecast_24h.is_some());
}

#[tokio::test]
async fn live_source_without_key_degrades_gracefully() {
    let request = base_request(json!({
        "here_data_source": "here",
        "here_pipeline_mode": "before_vrp"
    }));
    let response = run_solve(request, &state()).await.unwrap();

    let prefetch = response.here_prefetch.as_ref().unwrap();
    assert_eq!(prefetch.status, "disabled");
    assert_eq!(prefetch.error.as_deref(), Some("API key not set"));

    // Routing and the rest of enrichment continued.
    assert_eq!(response.routes.len(), 1);
    let layer = response.semantic_layer.as_ref().unwrap();
    assert_eq!(layer.status, SemanticStatus::Ok);
    assert_eq!(
        layer.config.as_ref().unwrap().here_api_key_source,
        "missing_env:HERE_API_KEY"
    );
}

#[tokio::test]
async fn bad_requests_are_rejected_with_400() {
    let missing_customers = serde_json::from_value::<SolveRequest>(json!({
        "depot": {"id": "depot", "lat": 40.0, "lng": -3.0},
        "customers": [],
        "vehicles": 1,
        "capacity": 5
    }))
    .unwrap();
    let err = run_solve(missing_customers, &state()).await.unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);

    let bad_mode = base_request(json!({"distance_mode": "sideways"}));
    let err = run_solve(bad_mode, &state()).await.unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert!(err.message.contains("distance_mode"));
}

#[tokio::test]
async fn municipality_pass_merges_over_existing_layer() {
    let mock = spawn_mock_osm().await;
    let mut state = state();
    state.reverse_endpoints = vec![format!("http://{}/reverse", mock)];
    state.area_endpoint = Some(format!("http://{}/api/interpreter", mock));

    // First, a normal solve with emulator enrichment but no municipality.
    let solve_response = run_solve(base_request(json!({})), &state).await.unwrap();
    let base_layer = solve_response.semantic_layer.clone().unwrap();
    assert!(base_layer.municipality_api.is_none());

    // Then the municipality-only pass over that result.
    let enrich = |vrp: SolveResponse| {
        let body = EnrichMunicipalityRequest {
            payload: Some(base_request(json!({
                "municipality_reverse_min_interval_ms": 1
            }))),
            vrp_result: vrp,
        };
        run_enrich_municipality(body, &state)
    };

    let first = enrich(solve_response.clone()).await.unwrap();
    let merged = first.semantic_layer.as_ref().unwrap();

    // Municipality blocks arrived,
    assert!(merged.municipality_api.is_some());
    assert!(merged.municipality_post_output_notice.is_some());
    assert_eq!(
        merged.routes[0].municipality_vector.as_ref().unwrap(),
        &vec!["Sevilla".to_owned()]
    );
    // while the base pass's weather enrichment survived the merge.
    assert_eq!(
        merged.routes[0].segment_context[0].weather.status,
        FetchStatus::Observed
    );
    assert_eq!(
        merged.summary.as_ref().unwrap().here_data_source,
        base_layer.summary.as_ref().unwrap().here_data_source
    );

    // Applying the pass again over its own output changes nothing but the
    // timestamp.
    let second = enrich(first.clone()).await.unwrap();
    let mut first_layer = first.semantic_layer.clone().unwrap();
    let mut second_layer = second.semantic_layer.clone().unwrap();
    first_layer.generated_at_utc = None;
    second_layer.generated_at_utc = None;
    assert_eq!(
        serde_json::to_string(&first_layer).unwrap(),
        serde_json::to_string(&second_layer).unwrap()
    );
}

#[tokio::test]
async fn enrichment_failure_never_drops_routes() {
    // Municipality enrichment pointed at a dead resolver: every lookup
    // fails, yet the routing result and HTTP 200 semantics stand.
    let mut state = state();
    state.reverse_endpoints = vec!["http://127.0.0.1:9/reverse".to_owned()];
    state.area_endpoint = Some("http://127.0.0.1:9/api/interpreter".to_owned());

    let request = base_request(json!({
        "use_here_platform": false,
        "municipality_enrichment_enabled": true,
        "municipality_reverse_min_interval_ms": 1
    }));
    let response = run_solve(request, &state).await.unwrap();

    assert_eq!(response.routes.len(), 1);
    assert_eq!(response.routes[0].stops.len(), 3);

    let layer = response.semantic_layer.as_ref().unwrap();
    let api = layer.municipality_api.as_ref().unwrap();
    assert_eq!(api.status, "partial");
    assert_eq!(api.phase1.failed, api.phase1.points);
    let notice = layer.municipality_post_output_notice.as_ref().unwrap();
    assert!(notice.contains("unresolved"), "{}", notice);
    assert!(!layer.errors.is_empty());
}
