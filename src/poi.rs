//! POI relevance scoring: filter candidate locations to a corridor around
//! the route and rank them by proximity + category match.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::geo;
use crate::providers::round_to;
use crate::request::{CandidateLocation, Id, Stop};
use crate::segments::{TrafficContext, WeatherContext};

/// Fixed tag-pair table mapping OSM-style tags to a semantic category.
const CATEGORY_TABLE: &[((&str, &str), &str)] = &[
    (("amenity", "fuel"), "fuel"),
    (("amenity", "charging_station"), "charging"),
    (("amenity", "parking"), "parking"),
    (("amenity", "parking_entrance"), "parking"),
    (("amenity", "restaurant"), "food"),
    (("amenity", "fast_food"), "food"),
    (("amenity", "cafe"), "food"),
    (("amenity", "bar"), "food"),
    (("amenity", "pub"), "food"),
    (("amenity", "hospital"), "healthcare"),
    (("amenity", "clinic"), "healthcare"),
    (("amenity", "pharmacy"), "healthcare"),
    (("amenity", "car_repair"), "vehicle_service"),
    (("amenity", "car_wash"), "vehicle_service"),
    (("tourism", "hotel"), "lodging"),
    (("tourism", "motel"), "lodging"),
    (("shop", "supermarket"), "grocery"),
    (("shop", "convenience"), "grocery"),
    (("highway", "rest_area"), "rest_area"),
    (("highway", "services"), "rest_area"),
];

/// A candidate location that made it into a route's corridor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoredLocation {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub semantic_category: String,
    pub distance_to_route_km: f64,
    pub estimated_detour_km: f64,
    pub nearest_segment_index: usize,
    pub relevance_score: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficContext>,
}

/// Derive the semantic category: explicit value first, then the tag table,
/// then `"other"`.
pub fn infer_category(location: &CandidateLocation) -> String {
    if let Some(explicit) = &location.semantic_category {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_lowercase();
        }
    }
    for ((key, value), category) in CATEGORY_TABLE {
        if location.tags.get(*key).map(String::as_str) == Some(*value) {
            return (*category).to_owned();
        }
    }
    "other".to_owned()
}

/// Distance from a point to the route polyline, and the index of the
/// nearest segment.
fn distance_to_route_km(location: &CandidateLocation, stops: &[Stop]) -> Option<(f64, usize)> {
    if stops.len() < 2 {
        return None;
    }
    let point = location.coord();
    let mut best: Option<(f64, usize)> = None;
    for (index, pair) in stops.windows(2).enumerate() {
        let distance = geo::point_to_segment_km(point, pair[0].coord(), pair[1].coord());
        if best.map_or(true, |(best_distance, _)| distance < best_distance) {
            best = Some((distance, index));
        }
    }
    best
}

fn relevance(
    distance_km: f64,
    radius_km: f64,
    category: &str,
    requested: &BTreeSet<String>,
) -> f64 {
    let proximity = (1.0 - distance_km / radius_km).max(0.0);
    let semantic = if requested.is_empty() || requested.contains(category) {
        1.0
    } else {
        0.25
    };
    0.65 * proximity + 0.35 * semantic
}

/// Score `candidates` against one route and keep the top K inside the
/// corridor.
pub fn score_route_locations(
    stops: &[Stop],
    candidates: &[CandidateLocation],
    radius_km: f64,
    requested_categories: &BTreeSet<String>,
    top_k: usize,
) -> Vec<ScoredLocation> {
    if stops.len() < 2 || candidates.is_empty() {
        return Vec::new();
    }

    let mut scored = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        if !candidate.coord().is_valid() {
            continue;
        }
        let (distance_km, nearest_segment_index) =
            match distance_to_route_km(candidate, stops) {
                Some(found) => found,
                None => continue,
            };
        if distance_km > radius_km {
            continue;
        }

        let category = infer_category(candidate);
        let score = relevance(distance_km, radius_km, &category, requested_categories);
        scored.push(ScoredLocation {
            id: candidate
                .id
                .clone()
                .unwrap_or_else(|| Id::Str(format!("loc_{}", index + 1))),
            name: candidate.name.clone(),
            lat: candidate.lat,
            lng: candidate.lng,
            source: Some(
                candidate
                    .source
                    .clone()
                    .unwrap_or_else(|| "candidate_locations".to_owned()),
            ),
            semantic_category: category,
            distance_to_route_km: round_to(distance_km, 3),
            estimated_detour_km: round_to(distance_km * 2.0, 3),
            nearest_segment_index,
            relevance_score: round_to(score, 4),
            tags: candidate.tags.clone(),
            weather: None,
            traffic: None,
        });
    }

    scored.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.distance_to_route_km
                    .partial_cmp(&b.distance_to_route_km)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: &str, lat: f64, lng: f64) -> Stop {
        Stop {
            id: Id::Str(id.to_owned()),
            lat,
            lng,
            demand: None,
        }
    }

    fn candidate(id: &str, lat: f64, lng: f64, tags: &[(&str, &str)]) -> CandidateLocation {
        CandidateLocation {
            id: Some(Id::Str(id.to_owned())),
            name: None,
            lat,
            lng,
            tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            source: None,
            semantic_category: None,
        }
    }

    fn route() -> Vec<Stop> {
        vec![
            stop("depot", 40.0, -3.0),
            stop("c1", 40.0, -2.5),
            stop("depot", 40.0, -3.0),
        ]
    }

    #[test]
    fn category_table_and_fallback() {
        assert_eq!(
            infer_category(&candidate("a", 0.0, 0.0, &[("amenity", "fuel")])),
            "fuel"
        );
        assert_eq!(
            infer_category(&candidate("a", 0.0, 0.0, &[("building", "yes")])),
            "other"
        );
        let mut explicit = candidate("a", 0.0, 0.0, &[]);
        explicit.semantic_category = Some("  Rest_Area ".to_owned());
        assert_eq!(infer_category(&explicit), "rest_area");
    }

    #[test]
    fn corridor_filter_drops_far_candidates() {
        let candidates = vec![
            candidate("near", 40.005, -2.75, &[("amenity", "fuel")]),
            candidate("far", 41.0, -2.75, &[("amenity", "fuel")]),
        ];
        let scored = score_route_locations(&route(), &candidates, 1.2, &BTreeSet::new(), 8);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].id.to_string(), "near");
        assert_eq!(
            scored[0].estimated_detour_km,
            round_to(scored[0].distance_to_route_km * 2.0, 3)
        );
    }

    #[test]
    fn category_match_outranks_distance_tie_goes_to_id() {
        let mut requested = BTreeSet::new();
        requested.insert("fuel".to_owned());
        let candidates = vec![
            candidate("b_station", 40.002, -2.75, &[("amenity", "fuel")]),
            candidate("a_cafe", 40.002, -2.75, &[("amenity", "cafe")]),
            candidate("a_station", 40.002, -2.75, &[("amenity", "fuel")]),
        ];
        let scored = score_route_locations(&route(), &candidates, 1.2, &requested, 8);
        assert_eq!(scored.len(), 3);
        // Both stations beat the cafe; between equal stations the
        // lexicographically smaller id wins.
        assert_eq!(scored[0].id.to_string(), "a_station");
        assert_eq!(scored[1].id.to_string(), "b_station");
        assert_eq!(scored[2].id.to_string(), "a_cafe");
        assert!(scored[0].relevance_score > scored[2].relevance_score);
    }

    #[test]
    fn top_k_truncates_after_sorting() {
        let candidates: Vec<CandidateLocation> = (0..10)
            .map(|i| {
                candidate(
                    &format!("loc{:02}", i),
                    40.001 + i as f64 * 0.001,
                    -2.75,
                    &[],
                )
            })
            .collect();
        let scored = score_route_locations(&route(), &candidates, 1.2, &BTreeSet::new(), 3);
        assert_eq!(scored.len(), 3);
        // Invariant: sorted by (−score, distance, id).
        for pair in scored.windows(2) {
            assert!(
                pair[0].relevance_score > pair[1].relevance_score
                    || (pair[0].relevance_score == pair[1].relevance_score
                        && pair[0].distance_to_route_km <= pair[1].distance_to_route_km)
            );
        }
    }

    #[test]
    fn missing_ids_are_synthesized_from_position() {
        let mut unnamed = candidate("x", 40.002, -2.75, &[]);
        unnamed.id = None;
        let scored = score_route_locations(&route(), &[unnamed], 1.2, &BTreeSet::new(), 8);
        assert_eq!(scored[0].id.to_string(), "loc_1");
    }
}
