//! Two-phase municipality resolver.
//!
//! Phase 1 resolves every distinct coordinate of the request (depot,
//! customers, route stops) through the shared reverse geocoder. Phase 2
//! walks each route segment along its road polyline (straight line on
//! geometry failure), resamples it, resolves every sample, and folds the
//! answers into adjacent-deduplicated municipality/province/province-capital
//! vectors. Both phases share one address book and one minimum-interval
//! timer.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::geo::{self, Coord};
use crate::osm::{
    AdminResolution, AreaQueryClient, LookupStats, ProvinceCapital, ResolutionStatus,
    ReverseGeocoder,
};
use crate::osrm::OsrmClient;
use crate::request::{Id, MunicipalityConfig, Route, Stop};
use crate::segments::Segment;
use crate::timeutil::Deadline;

/// One retained polyline sample in a segment's municipality trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SampleTrace {
    pub coord_key: String,
    pub lat: f64,
    pub lng: f64,
    pub status: ResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_name: Option<String>,
}

/// Registry entry for one distinct coordinate. Merged by coordinate key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub coord_key: String,
    pub lat: f64,
    pub lng: f64,
    pub stop_ids: BTreeSet<String>,
    pub customer_ids: BTreeSet<String>,
    pub source_tags: BTreeSet<String>,
}

/// Collects every distinct coordinate seen in a request, in first-seen
/// order.
#[derive(Debug, Default)]
pub struct PointRegistry {
    order: Vec<String>,
    entries: HashMap<String, RegistryEntry>,
}

impl PointRegistry {
    pub fn new() -> PointRegistry {
        PointRegistry::default()
    }

    pub fn observe(
        &mut self,
        coord: Coord,
        stop_id: Option<&Id>,
        is_customer: bool,
        source_tag: &str,
    ) {
        let coord_key = coord.key();
        if !self.entries.contains_key(&coord_key) {
            self.order.push(coord_key.clone());
            self.entries.insert(
                coord_key.clone(),
                RegistryEntry {
                    coord_key: coord_key.clone(),
                    lat: coord.lat,
                    lng: coord.lng,
                    stop_ids: BTreeSet::new(),
                    customer_ids: BTreeSet::new(),
                    source_tags: BTreeSet::new(),
                },
            );
        }
        let entry = self.entries.get_mut(&coord_key).expect("entry just ensured");
        if let Some(id) = stop_id {
            entry.stop_ids.insert(id.to_string());
            if is_customer {
                entry.customer_ids.insert(id.to_string());
            }
        }
        entry.source_tags.insert(source_tag.to_owned());
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.order.iter().map(move |key| &self.entries[key])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Phase 1 per-point report row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase1Point {
    pub coord_key: String,
    pub lat: f64,
    pub lng: f64,
    pub role: String,
    pub status: ResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_capital_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    pub stop_ids: Vec<String>,
    pub customer_ids: Vec<String>,
    pub source_tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Phase1Stats {
    pub points: u64,
    pub resolved: u64,
    pub unknown: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Phase2Stats {
    pub segments: u64,
    pub samples: u64,
    pub resolved: u64,
    pub unknown: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouteGeometryStats {
    pub requested: u64,
    pub fetched: u64,
    pub fallback_to_straight: u64,
}

/// The `municipality_api` block of the semantic layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MunicipalityApi {
    pub status: String,
    pub phase1: Phase1Stats,
    pub phase2: Phase2Stats,
    pub lookup_stats: LookupStats,
    pub route_geometry: RouteGeometryStats,
    pub province_capitals: BTreeMap<String, ProvinceCapital>,
}

/// One stop linked to its resolved municipality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopMunicipalityLink {
    pub stop_id: String,
    pub coord_key: String,
    pub status: ResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_name: Option<String>,
}

/// Admin vectors and trace for one segment.
#[derive(Clone, Debug)]
pub struct SegmentAdmin {
    pub segment_index: usize,
    pub trace: Vec<SampleTrace>,
    pub municipality_names: Vec<String>,
    pub province_names: Vec<String>,
    pub province_capital_names: Vec<String>,
}

/// Admin vectors for one route plus its per-segment breakdown.
#[derive(Clone, Debug, Default)]
pub struct RouteAdmin {
    pub stop_links: Vec<StopMunicipalityLink>,
    pub municipality_vector: Vec<String>,
    pub province_vector: Vec<String>,
    pub province_capital_vector: Vec<String>,
    pub segments: Vec<SegmentAdmin>,
}

/// Everything the municipality pass produces.
#[derive(Clone, Debug)]
pub struct MunicipalityOutcome {
    pub api: MunicipalityApi,
    pub address_book: BTreeMap<String, AdminResolution>,
    pub phase1_points: Vec<Phase1Point>,
    pub notice: String,
    pub per_route: Vec<RouteAdmin>,
    pub errors: Vec<String>,
}

pub struct MunicipalityRunner<'a> {
    pub reverse: &'a ReverseGeocoder,
    pub area: Option<&'a AreaQueryClient>,
    pub osrm: Option<&'a OsrmClient>,
    pub config: &'a MunicipalityConfig,
    /// Did the solve's distances come from a road routing source? On-road
    /// geometry is only requested when they did.
    pub road_based_distances: bool,
    pub deadline: Deadline,
}

impl<'a> MunicipalityRunner<'a> {
    /// Run both phases for one request.
    #[instrument(name = "MunicipalityRunner::run", level = "debug", skip_all)]
    pub async fn run(
        &self,
        depot: Option<&Stop>,
        customers: &[Stop],
        routes: &[Route],
        route_segments: &[Vec<Segment>],
    ) -> MunicipalityOutcome {
        let mut errors: Vec<String> = Vec::new();

        // Phase 1: every distinct endpoint coordinate, resolved once.
        let mut registry = PointRegistry::new();
        if let Some(depot) = depot {
            registry.observe(depot.coord(), Some(&depot.id), false, "depot_input");
        }
        for customer in customers {
            registry.observe(customer.coord(), Some(&customer.id), true, "customer_input");
        }
        let depot_id = depot
            .map(|d| d.id.to_string())
            .or_else(|| {
                routes
                    .first()
                    .and_then(|r| r.stops.first())
                    .map(|s| s.id.to_string())
            });
        for route in routes {
            for (index, stop) in route.stops.iter().enumerate() {
                let is_endpoint = index == 0 || index == route.stops.len() - 1;
                let is_customer = !is_endpoint
                    && depot_id.as_deref() != Some(stop.id.to_string().as_str());
                registry.observe(stop.coord(), Some(&stop.id), is_customer, "route_stop");
            }
        }

        let mut phase1 = Phase1Stats::default();
        let mut phase1_points = Vec::with_capacity(registry.len());
        for entry in registry.entries() {
            if self.deadline.expired() {
                errors.push("deadline_exceeded".to_owned());
                break;
            }
            let coord = Coord::new(entry.lat, entry.lng);
            let resolution = self.reverse.resolve(coord).await;
            phase1.points += 1;
            match resolution.status {
                ResolutionStatus::Resolved => phase1.resolved += 1,
                ResolutionStatus::Unknown => phase1.unknown += 1,
                ResolutionStatus::Error => {
                    phase1.failed += 1;
                    if let Some(reason) = &resolution.error {
                        errors.push(format!(
                            "municipality endpoint resolution failed at {}: {}",
                            entry.coord_key, reason
                        ));
                    }
                }
            }

            let role = if entry.source_tags.contains("depot_input")
                || (entry.customer_ids.is_empty()
                    && depot_id.as_deref()
                        .map_or(false, |d| entry.stop_ids.contains(d)))
            {
                "depot"
            } else {
                "customer"
            };
            phase1_points.push(Phase1Point {
                coord_key: entry.coord_key.clone(),
                lat: entry.lat,
                lng: entry.lng,
                role: role.to_owned(),
                status: resolution.status,
                municipality_name: resolution.municipality_name.clone(),
                province_name: resolution.province_name.clone(),
                province_capital_name: None,
                country_code: resolution.country_code.clone(),
                stop_ids: entry.stop_ids.iter().cloned().collect(),
                customer_ids: entry.customer_ids.iter().cloned().collect(),
                source_tags: entry.source_tags.iter().cloned().collect(),
            });
        }

        // Phase 2: segment-sampled resolution.
        let mut phase2 = Phase2Stats::default();
        let mut geometry_stats = RouteGeometryStats::default();
        let mut per_route = Vec::with_capacity(routes.len());
        for segments in route_segments {
            let mut route_admin = RouteAdmin::default();
            for segment in segments {
                if self.deadline.expired() {
                    if errors.last().map(String::as_str) != Some("deadline_exceeded") {
                        errors.push("deadline_exceeded".to_owned());
                    }
                    break;
                }
                let segment_admin = self
                    .trace_segment(segment, &mut phase2, &mut geometry_stats, &mut errors)
                    .await;
                route_admin.segments.push(segment_admin);
            }
            route_admin.municipality_vector = concat_adjacent_dedup(
                route_admin.segments.iter().map(|s| &s.municipality_names),
            );
            route_admin.province_vector = concat_adjacent_dedup(
                route_admin.segments.iter().map(|s| &s.province_names),
            );
            route_admin.province_capital_vector = concat_adjacent_dedup(
                route_admin.segments.iter().map(|s| &s.province_capital_names),
            );
            per_route.push(route_admin);
        }

        // Province capitals for every distinct province seen so far.
        let mut capitals: BTreeMap<String, ProvinceCapital> = BTreeMap::new();
        if self.config.province_capital_lookup {
            if let Some(area) = self.area {
                let mut wanted: Vec<(String, Option<String>)> = Vec::new();
                let mut seen: BTreeSet<String> = BTreeSet::new();
                for (_, resolution) in self.reverse.address_book_snapshot().await {
                    if let Some(province) = &resolution.province_name {
                        if seen.insert(province.to_lowercase()) {
                            wanted.push((province.clone(), resolution.country_code.clone()));
                        }
                    }
                }
                for (province, country_code) in wanted {
                    if self.deadline.expired() {
                        break;
                    }
                    let capital = area
                        .resolve_province_capital(&province, country_code.as_deref())
                        .await;
                    if capital.status == ResolutionStatus::Error {
                        if let Some(reason) = &capital.error {
                            errors.push(format!(
                                "province capital lookup failed for {}: {}",
                                province, reason
                            ));
                        }
                    }
                    capitals.insert(province, capital);
                }
            }
        }

        // Now that capitals are known, fill the capital vectors and the
        // phase 1 capital column.
        let capital_by_province: HashMap<String, String> = capitals
            .iter()
            .filter_map(|(province, capital)| {
                capital
                    .capital_name
                    .clone()
                    .map(|name| (province.to_lowercase(), name))
            })
            .collect();
        for point in &mut phase1_points {
            point.province_capital_name = point
                .province_name
                .as_ref()
                .and_then(|p| capital_by_province.get(&p.to_lowercase()).cloned());
        }
        for route_admin in &mut per_route {
            for segment_admin in &mut route_admin.segments {
                segment_admin.province_capital_names = adjacent_dedup(
                    segment_admin
                        .province_names
                        .iter()
                        .filter_map(|p| capital_by_province.get(&p.to_lowercase()).cloned()),
                );
            }
            route_admin.province_capital_vector = concat_adjacent_dedup(
                route_admin.segments.iter().map(|s| &s.province_capital_names),
            );
        }

        // Stop links from the shared address book.
        let address_book: BTreeMap<String, AdminResolution> = self
            .reverse
            .address_book_snapshot()
            .await
            .into_iter()
            .collect();
        for (route, route_admin) in routes.iter().zip(per_route.iter_mut()) {
            route_admin.stop_links = route
                .stops
                .iter()
                .map(|stop| {
                    let coord_key = stop.coord().key();
                    match address_book.get(&coord_key) {
                        Some(resolution) => StopMunicipalityLink {
                            stop_id: stop.id.to_string(),
                            coord_key,
                            status: resolution.status,
                            municipality_name: resolution.municipality_name.clone(),
                            province_name: resolution.province_name.clone(),
                        },
                        None => StopMunicipalityLink {
                            stop_id: stop.id.to_string(),
                            coord_key,
                            status: ResolutionStatus::Unknown,
                            municipality_name: None,
                            province_name: None,
                        },
                    }
                })
                .collect();
        }

        let status = if phase1.failed == 0 && phase2.failed == 0 {
            "ok"
        } else {
            "partial"
        };
        let notice = build_notice(&phase1, &geometry_stats);

        MunicipalityOutcome {
            api: MunicipalityApi {
                status: status.to_owned(),
                phase1,
                phase2,
                lookup_stats: self.reverse.stats(),
                route_geometry: geometry_stats,
                province_capitals: capitals,
            },
            address_book,
            phase1_points,
            notice,
            per_route,
            errors,
        }
    }

    /// Phase 2 for one segment: polyline, resample, resolve, fold.
    async fn trace_segment(
        &self,
        segment: &Segment,
        phase2: &mut Phase2Stats,
        geometry_stats: &mut RouteGeometryStats,
        errors: &mut Vec<String>,
    ) -> SegmentAdmin {
        phase2.segments += 1;

        let mut polyline = vec![segment.start, segment.end];
        if self.config.use_route_geometry && self.road_based_distances {
            if let Some(osrm) = self.osrm {
                geometry_stats.requested += 1;
                match osrm.route_geometry(segment.start, segment.end).await {
                    Ok(points) => {
                        geometry_stats.fetched += 1;
                        polyline = points;
                    }
                    Err(err) => {
                        geometry_stats.fallback_to_straight += 1;
                        debug!("road geometry unavailable, tracing straight line: {}", err);
                        errors.push(format!(
                            "municipality geometry fetch failed ({}->{}): {}",
                            segment.start.key(),
                            segment.end.key(),
                            crate::errors::short_phrase(&err)
                        ));
                    }
                }
            }
        }

        let samples = geo::cap_samples(
            &geo::resample_polyline(&polyline, self.config.step_km),
            self.config.max_samples_per_segment,
        );

        let mut resolutions = Vec::with_capacity(samples.len());
        for sample in &samples {
            if self.deadline.expired() {
                if errors.last().map(String::as_str) != Some("deadline_exceeded") {
                    errors.push("deadline_exceeded".to_owned());
                }
                break;
            }
            let resolution = self.reverse.resolve(*sample).await;
            phase2.samples += 1;
            match resolution.status {
                ResolutionStatus::Resolved => phase2.resolved += 1,
                ResolutionStatus::Unknown => phase2.unknown += 1,
                ResolutionStatus::Error => phase2.failed += 1,
            }
            resolutions.push((*sample, resolution));
        }

        fold_segment_samples(segment.segment_index, &resolutions)
    }
}

/// Fold a segment's ordered sample resolutions into its trace and vectors.
/// Adjacent duplicates are suppressed per vector; the trace keeps one entry
/// per municipality change.
pub(crate) fn fold_segment_samples(
    segment_index: usize,
    resolutions: &[(Coord, AdminResolution)],
) -> SegmentAdmin {
    let mut trace: Vec<SampleTrace> = Vec::new();
    let mut municipality_names = Vec::new();
    let mut province_names = Vec::new();
    for (coord, resolution) in resolutions {
        let changed = trace
            .last()
            .map_or(true, |last| last.municipality_name != resolution.municipality_name);
        if changed {
            trace.push(SampleTrace {
                coord_key: coord.key(),
                lat: coord.lat,
                lng: coord.lng,
                status: resolution.status,
                municipality_name: resolution.municipality_name.clone(),
                province_name: resolution.province_name.clone(),
            });
        }
        if let Some(name) = &resolution.municipality_name {
            push_adjacent_dedup(&mut municipality_names, name);
        }
        if let Some(name) = &resolution.province_name {
            push_adjacent_dedup(&mut province_names, name);
        }
    }

    SegmentAdmin {
        segment_index,
        trace,
        municipality_names,
        province_names,
        province_capital_names: Vec::new(),
    }
}

fn push_adjacent_dedup(vector: &mut Vec<String>, value: &str) {
    if vector.last().map(String::as_str) != Some(value) {
        vector.push(value.to_owned());
    }
}

/// Suppress adjacent duplicates in an iterator of names.
pub(crate) fn adjacent_dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        push_adjacent_dedup(&mut out, &name);
    }
    out
}

/// Order-preserving concatenation with adjacent-duplicate suppression.
pub(crate) fn concat_adjacent_dedup<'a>(
    parts: impl Iterator<Item = &'a Vec<String>>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in parts {
        for name in part {
            push_adjacent_dedup(&mut out, name);
        }
    }
    out
}

/// The human-readable fallback sentence.
fn build_notice(phase1: &Phase1Stats, geometry: &RouteGeometryStats) -> String {
    let mut warnings = Vec::new();
    if geometry.fallback_to_straight > 0 {
        warnings.push(format!(
            "Municipality tracing used straight-line fallback in {} segment(s).",
            geometry.fallback_to_straight
        ));
    }
    if phase1.unknown > 0 || phase1.failed > 0 {
        warnings.push(format!(
            "Municipality phase 1 has unresolved coordinates (unknown={}, failed={}).",
            phase1.unknown, phase1.failed
        ));
    }
    if warnings.is_empty() {
        "Municipality fallback warning: none.".to_owned()
    } else {
        warnings.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution(
        municipality: Option<&str>,
        province: Option<&str>,
        status: ResolutionStatus,
    ) -> AdminResolution {
        AdminResolution {
            status,
            municipality_name: municipality.map(str::to_owned),
            municipality_source_field: municipality.map(|_| "city".to_owned()),
            province_name: province.map(str::to_owned),
            country_code: Some("es".to_owned()),
            address_ref: String::new(),
            osm_ref: None,
            resolution_note: None,
            error: None,
        }
    }

    #[test]
    fn registry_merges_by_coordinate_key() {
        let mut registry = PointRegistry::new();
        let depot = Coord::new(40.0, -3.0);
        registry.observe(depot, Some(&Id::Str("depot".to_owned())), false, "depot_input");
        // The same physical point arrives again as a route stop.
        registry.observe(
            Coord::new(40.000_000_3, -3.000_000_2),
            Some(&Id::Str("depot".to_owned())),
            false,
            "route_stop",
        );
        registry.observe(Coord::new(40.1, -3.1), Some(&Id::Int(1)), true, "customer_input");

        assert_eq!(registry.len(), 2);
        let first = registry.entries().next().unwrap();
        assert!(first.source_tags.contains("depot_input"));
        assert!(first.source_tags.contains("route_stop"));
        assert!(first.customer_ids.is_empty());
    }

    #[test]
    fn fold_suppresses_adjacent_duplicates_only() {
        let samples = vec![
            (Coord::new(40.0, -3.0), resolution(Some("Madrid"), Some("Madrid"), ResolutionStatus::Resolved)),
            (Coord::new(40.1, -3.1), resolution(Some("Madrid"), Some("Madrid"), ResolutionStatus::Resolved)),
            (Coord::new(40.2, -3.2), resolution(Some("Alcorcón"), Some("Madrid"), ResolutionStatus::Resolved)),
            (Coord::new(40.3, -3.3), resolution(Some("Madrid"), Some("Madrid"), ResolutionStatus::Resolved)),
        ];
        let admin = fold_segment_samples(0, &samples);
        // Madrid appears twice: it is non-adjacent the second time.
        assert_eq!(admin.municipality_names, vec!["Madrid", "Alcorcón", "Madrid"]);
        assert_eq!(admin.province_names, vec!["Madrid"]);
        assert_eq!(admin.trace.len(), 3);
        // No two adjacent equal names, ever.
        for pair in admin.municipality_names.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn fold_skips_unknown_names_without_breaking_order() {
        let samples = vec![
            (Coord::new(40.0, -3.0), resolution(Some("Madrid"), Some("Madrid"), ResolutionStatus::Resolved)),
            (Coord::new(40.1, -3.1), resolution(None, None, ResolutionStatus::Unknown)),
            (Coord::new(40.2, -3.2), resolution(Some("Madrid"), Some("Madrid"), ResolutionStatus::Resolved)),
        ];
        let admin = fold_segment_samples(0, &samples);
        // The unknown gap does not duplicate Madrid in the names vector,
        assert_eq!(admin.municipality_names, vec!["Madrid"]);
        // but it does show up in the trace.
        assert_eq!(admin.trace.len(), 3);
        assert_eq!(admin.trace[1].status, ResolutionStatus::Unknown);
    }

    #[test]
    fn route_vectors_concatenate_with_dedup_at_the_seam() {
        let segment_a = vec!["Madrid".to_owned(), "Alcorcón".to_owned()];
        let segment_b = vec!["Alcorcón".to_owned(), "Móstoles".to_owned()];
        let vector = concat_adjacent_dedup([segment_a, segment_b].iter());
        assert_eq!(vector, vec!["Madrid", "Alcorcón", "Móstoles"]);
    }

    #[test]
    fn notice_formats_each_fallback_case() {
        let clean = build_notice(&Phase1Stats::default(), &RouteGeometryStats::default());
        assert_eq!(clean, "Municipality fallback warning: none.");

        let geometry = RouteGeometryStats {
            requested: 3,
            fetched: 2,
            fallback_to_straight: 1,
        };
        let with_fallback = build_notice(&Phase1Stats::default(), &geometry);
        assert!(with_fallback.contains("straight-line fallback in 1 segment(s)"));

        let phase1 = Phase1Stats {
            points: 4,
            resolved: 2,
            unknown: 1,
            failed: 1,
        };
        let combined = build_notice(&phase1, &geometry);
        assert!(combined.contains("fallback"));
        assert!(combined.contains("unknown=1, failed=1"));
    }
}
