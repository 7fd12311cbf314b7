//! Merging a municipality-only enrichment pass into an existing semantic
//! layer.
//!
//! The base pass keeps everything it computed (weather, traffic, POIs); the
//! municipality pass overlays only its own keys: `municipality_*` /
//! `province_*` / `distance_*` config and summary fields, the municipality
//! report blocks, and the per-route / per-segment admin vectors. Routes join
//! by vehicle, segments by index. The overlay is idempotent.

use crate::semantic::{SemanticConfig, SemanticLayer, SemanticSummary};

/// Cap on the merged `errors` list.
const MAX_MERGED_ERRORS: usize = 40;

fn overlay_config(base: &mut SemanticConfig, municipality: &SemanticConfig) {
    base.municipality_enrichment_enabled = municipality.municipality_enrichment_enabled;
    base.municipality_step_km = municipality.municipality_step_km;
    base.municipality_radius_km = municipality.municipality_radius_km;
    base.municipality_max_samples_per_segment =
        municipality.municipality_max_samples_per_segment;
    base.municipality_reverse_min_interval_ms =
        municipality.municipality_reverse_min_interval_ms;
    base.municipality_use_route_geometry = municipality.municipality_use_route_geometry;
    base.province_capital_lookup_enabled = municipality.province_capital_lookup_enabled;
    if municipality.distance_mode.is_some() {
        base.distance_mode = municipality.distance_mode.clone();
    }
}

fn overlay_summary(base: &mut SemanticSummary, municipality: &SemanticSummary) {
    base.municipality_api_status = municipality.municipality_api_status.clone();
    base.municipality_phase1_points = municipality.municipality_phase1_points;
    base.municipality_phase2_samples = municipality.municipality_phase2_samples;
    base.municipality_route_geometry_fallback_to_straight =
        municipality.municipality_route_geometry_fallback_to_straight;
}

/// Merge `municipality` (a fresh municipality-only pass) over `base`.
pub fn merge_municipality_layer(
    base: &SemanticLayer,
    municipality: &SemanticLayer,
) -> SemanticLayer {
    let mut merged = base.clone();

    match (&mut merged.config, &municipality.config) {
        (Some(base_config), Some(municipality_config)) => {
            overlay_config(base_config, municipality_config)
        }
        (config_slot @ None, Some(municipality_config)) => {
            *config_slot = Some(municipality_config.clone())
        }
        _ => {}
    }

    match (&mut merged.summary, &municipality.summary) {
        (Some(base_summary), Some(municipality_summary)) => {
            overlay_summary(base_summary, municipality_summary)
        }
        (summary_slot @ None, Some(municipality_summary)) => {
            *summary_slot = Some(municipality_summary.clone())
        }
        _ => {}
    }

    if municipality.municipality_api.is_some() {
        merged.municipality_api = municipality.municipality_api.clone();
    }
    if municipality.municipality_address_book.is_some() {
        merged.municipality_address_book = municipality.municipality_address_book.clone();
    }
    if municipality.municipality_phase1_input_points.is_some() {
        merged.municipality_phase1_input_points =
            municipality.municipality_phase1_input_points.clone();
    }
    if municipality.municipality_post_output_notice.is_some() {
        merged.municipality_post_output_notice =
            municipality.municipality_post_output_notice.clone();
    }

    // The newer (municipality) pass stamps the merged artifact.
    if municipality.version.is_some() {
        merged.version = municipality.version.clone();
    }
    if municipality.generated_at_utc.is_some() {
        merged.generated_at_utc = municipality.generated_at_utc.clone();
    }

    // Concatenate error lists, skipping entries the base already carries so
    // a repeated municipality pass does not inflate the list.
    merged.errors = base.errors.clone();
    for error in &municipality.errors {
        if !merged.errors.contains(error) {
            merged.errors.push(error.clone());
        }
    }
    merged.errors.truncate(MAX_MERGED_ERRORS);

    for merged_route in &mut merged.routes {
        let municipality_route = municipality
            .routes
            .iter()
            .find(|r| r.vehicle == merged_route.vehicle);
        let municipality_route = match municipality_route {
            Some(route) => route,
            None => continue,
        };

        if municipality_route.stop_municipality_links.is_some() {
            merged_route.stop_municipality_links =
                municipality_route.stop_municipality_links.clone();
        }
        if municipality_route.municipality_vector.is_some() {
            merged_route.municipality_vector =
                municipality_route.municipality_vector.clone();
        }
        if municipality_route.province_vector.is_some() {
            merged_route.province_vector = municipality_route.province_vector.clone();
        }
        if municipality_route.province_capital_vector.is_some() {
            merged_route.province_capital_vector =
                municipality_route.province_capital_vector.clone();
        }

        for merged_segment in &mut merged_route.segment_context {
            let municipality_segment = municipality_route
                .segment_context
                .iter()
                .find(|s| s.segment_index == merged_segment.segment_index);
            if let Some(municipality_segment) = municipality_segment {
                merged_segment.municipality_trace =
                    municipality_segment.municipality_trace.clone();
                merged_segment.municipality_names =
                    municipality_segment.municipality_names.clone();
                merged_segment.province_names =
                    municipality_segment.province_names.clone();
                merged_segment.province_capital_names =
                    municipality_segment.province_capital_names.clone();
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EnrichConfig, SolveRequest};
    use crate::semantic::{RouteEnrichment, SemanticStatus};
    use crate::segments::{SegmentContext, TrafficContext, WeatherContext};

    fn base_layer() -> SemanticLayer {
        let mut request = SolveRequest::default();
        request.here_data_source = Some("emulator".to_owned());
        let config = EnrichConfig::from_request(&request);
        let mut layer = SemanticLayer::failed("placeholder".to_owned(), &config);
        layer.status = SemanticStatus::Ok;
        layer.error = None;
        layer.version = Some("0.5".to_owned());
        layer.generated_at_utc = Some("2026-03-14T08:00:00Z".to_owned());
        layer.errors = vec!["weather fetch failed at 40,-3: boom".to_owned()];
        layer.routes = vec![RouteEnrichment {
            vehicle: 1,
            route_distance_km: 28.08,
            served_customer_ids: Vec::new(),
            semantic_locations: Vec::new(),
            segment_context: vec![segment_context(0), segment_context(1)],
            stop_municipality_links: None,
            municipality_vector: None,
            province_vector: None,
            province_capital_vector: None,
        }];
        layer
    }

    fn segment_context(index: usize) -> SegmentContext {
        SegmentContext {
            segment_index: index,
            from_stop_id: crate::request::Id::Str("a".to_owned()),
            to_stop_id: crate::request::Id::Str("b".to_owned()),
            distance_km: 1.0,
            cumulative_distance_km: 1.0 + index as f64,
            eta_min_from_departure: 1.5,
            eta_utc: None,
            midpoint: crate::geo::Coord::new(40.0, -3.0),
            weather: WeatherContext::not_provided(),
            traffic: TrafficContext::not_provided(),
            municipality_trace: None,
            municipality_names: None,
            province_names: None,
            province_capital_names: None,
        }
    }

    fn municipality_layer() -> SemanticLayer {
        let mut layer = base_layer();
        layer.generated_at_utc = Some("2026-03-14T09:00:00Z".to_owned());
        layer.errors = vec!["municipality endpoint resolution failed at x: y".to_owned()];
        layer.municipality_post_output_notice =
            Some("Municipality fallback warning: none.".to_owned());
        let route = &mut layer.routes[0];
        route.municipality_vector = Some(vec!["Madrid".to_owned(), "Alcorcón".to_owned()]);
        route.province_vector = Some(vec!["Madrid".to_owned()]);
        route.province_capital_vector = Some(vec!["Madrid".to_owned()]);
        for (index, segment) in route.segment_context.iter_mut().enumerate() {
            segment.municipality_names = Some(vec![format!("Town{}", index)]);
            segment.province_names = Some(vec!["Madrid".to_owned()]);
            segment.province_capital_names = Some(vec!["Madrid".to_owned()]);
        }
        layer
    }

    #[test]
    fn overlay_brings_municipality_fields_onto_base() {
        let base = base_layer();
        let municipality = municipality_layer();
        let merged = merge_municipality_layer(&base, &municipality);

        // Base pass data is intact.
        assert_eq!(merged.status, SemanticStatus::Ok);
        assert_eq!(merged.routes[0].route_distance_km, 28.08);
        // Municipality fields arrived.
        assert_eq!(
            merged.routes[0].municipality_vector.as_ref().unwrap(),
            &vec!["Madrid".to_owned(), "Alcorcón".to_owned()]
        );
        assert_eq!(
            merged.routes[0].segment_context[1]
                .municipality_names
                .as_ref()
                .unwrap(),
            &vec!["Town1".to_owned()]
        );
        // The stamp comes from the newer pass.
        assert_eq!(merged.generated_at_utc.as_deref(), Some("2026-03-14T09:00:00Z"));
        // And errors concatenate.
        assert_eq!(merged.errors.len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let base = base_layer();
        let municipality = municipality_layer();
        let once = merge_municipality_layer(&base, &municipality);
        let twice = merge_municipality_layer(&once, &municipality);
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn unmatched_vehicles_pass_through() {
        let base = base_layer();
        let mut municipality = municipality_layer();
        municipality.routes[0].vehicle = 99;
        let merged = merge_municipality_layer(&base, &municipality);
        assert!(merged.routes[0].municipality_vector.is_none());
    }

    #[test]
    fn errors_are_capped_at_forty() {
        let mut base = base_layer();
        base.errors = (0..30).map(|i| format!("base {}", i)).collect();
        let mut municipality = municipality_layer();
        municipality.errors = (0..30).map(|i| format!("muni {}", i)).collect();
        let merged = merge_municipality_layer(&base, &municipality);
        assert_eq!(merged.errors.len(), 40);
        assert_eq!(merged.errors[0], "base 0");
    }
}
