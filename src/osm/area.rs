//! Area queries against an Overpass-style endpoint: places of interest
//! within a radius, and province-capital resolution through administrative
//! relations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use hyper::{Body, Request};
use leaky_bucket::RateLimiter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::geo::Coord;
use crate::providers::SharedHttpClient;
use crate::single_flight::SingleFlightCache;
use crate::Result;

/// Default Overpass interpreter endpoint.
pub const DEFAULT_AREA_ENDPOINT: &str = "https://overpass-api.de/api/interpreter";

/// Relation member roles that mark a capital, in pick order.
const CAPITAL_ROLES: &[&str] = &["admin_centre", "capital", "label"];

/// A place of interest returned by an area query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<i64>,
    pub lat: f64,
    pub lng: f64,
    pub osm_ref: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvinceCapital {
    pub province_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    pub status: super::ResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capital_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capital_coordinate: Option<Coord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvinceCapital {
    fn unknown(province_name: &str, country_code: Option<&str>) -> ProvinceCapital {
        ProvinceCapital {
            province_name: province_name.to_owned(),
            country_code: country_code.map(str::to_owned),
            status: super::ResolutionStatus::Unknown,
            capital_name: None,
            capital_coordinate: None,
            source_role: None,
            error: None,
        }
    }

    fn failed(province_name: &str, country_code: Option<&str>, error: String) -> ProvinceCapital {
        ProvinceCapital {
            status: super::ResolutionStatus::Error,
            error: Some(error),
            ..ProvinceCapital::unknown(province_name, country_code)
        }
    }
}

pub struct AreaQueryClient {
    endpoint: String,
    http: SharedHttpClient,
    limiter: RateLimiter,
    timeout: Duration,
    capital_cache: SingleFlightCache<String, ProvinceCapital>,
    external_requests: AtomicU64,
    cache_hits: AtomicU64,
}

impl AreaQueryClient {
    pub fn new(
        endpoint: Option<String>,
        http: SharedHttpClient,
        min_interval_ms: u64,
    ) -> AreaQueryClient {
        AreaQueryClient {
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_AREA_ENDPOINT.to_owned()),
            http,
            limiter: RateLimiter::builder()
                .initial(1)
                .max(1)
                .refill(1)
                .interval(Duration::from_millis(min_interval_ms.max(1)))
                .fair(true)
                .build(),
            timeout: Duration::from_secs(25),
            capital_cache: SingleFlightCache::new(),
            external_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    async fn run_query(&self, query: String) -> Result<Value> {
        self.limiter.acquire_one().await;
        self.external_requests.fetch_add(1, Ordering::Relaxed);

        let body = format!("data={}", urlencode(&query));
        let request = Request::builder()
            .method("POST")
            .uri(&self.endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header(
                "User-Agent",
                concat!("route-enrich/", env!("CARGO_PKG_VERSION")),
            )
            .body(Body::from(body))?;

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| anyhow::format_err!("area query timed out"))??;
        let status = response.status();
        let mut body = response.into_body();
        let mut body_data = Vec::new();
        while let Some(chunk_result) = body.next().await {
            body_data.extend(&chunk_result?[..]);
        }
        if !status.is_success() {
            return Err(anyhow::format_err!("area query failed: HTTP {}", status));
        }
        Ok(serde_json::from_slice(&body_data)?)
    }

    /// Places of interest within `radius_m` of a coordinate, optionally
    /// filtered to the accepted place classes.
    #[instrument(name = "AreaQueryClient::places_within", level = "debug", skip_all)]
    pub async fn places_within(
        &self,
        coord: Coord,
        radius_m: u32,
        accepted_place_classes: &[&str],
    ) -> Result<Vec<Place>> {
        let query = format!(
            "[out:json][timeout:25];node(around:{},{:.6},{:.6})[place];out body;",
            radius_m, coord.lat, coord.lng
        );
        let payload = self.run_query(query).await?;
        Ok(parse_places(&payload, accepted_place_classes))
    }

    /// Resolve the capital of a province through its administrative
    /// relation. Cached by `(country_code, casefolded name)`.
    #[instrument(
        name = "AreaQueryClient::resolve_province_capital",
        level = "debug",
        skip_all,
        fields(province = province_name)
    )]
    pub async fn resolve_province_capital(
        &self,
        province_name: &str,
        country_code: Option<&str>,
    ) -> ProvinceCapital {
        let cache_key = format!(
            "{}|{}",
            country_code.unwrap_or("").to_lowercase(),
            province_name.to_lowercase()
        );
        let mut fetched = false;
        let capital = self
            .capital_cache
            .get_or_fetch(cache_key, || {
                fetched = true;
                self.resolve_capital_uncached(province_name, country_code)
            })
            .await
            .expect("resolve_capital_uncached is infallible");
        if !fetched {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        capital
    }

    async fn resolve_capital_uncached(
        &self,
        province_name: &str,
        country_code: Option<&str>,
    ) -> Result<ProvinceCapital> {
        let query = format!(
            "[out:json][timeout:25];\
             relation[\"boundary\"=\"administrative\"][\"admin_level\"~\"^[4-8]$\"]\
             [\"name\"~\"{}\",i];out body;",
            regex_escape(province_name)
        );
        let relations = match self.run_query(query).await {
            Ok(payload) => payload,
            Err(err) => {
                debug!("province capital relation query failed: {}", err);
                return Ok(ProvinceCapital::failed(
                    province_name,
                    country_code,
                    err.to_string(),
                ));
            }
        };

        let member = match pick_capital_member(&relations, province_name, country_code) {
            Some(member) => member,
            None => return Ok(ProvinceCapital::unknown(province_name, country_code)),
        };

        let node_query = format!("[out:json];node(id:{});out;", member.node_ref);
        let node_payload = match self.run_query(node_query).await {
            Ok(payload) => payload,
            Err(err) => {
                return Ok(ProvinceCapital::failed(
                    province_name,
                    country_code,
                    err.to_string(),
                ));
            }
        };

        match parse_capital_node(&node_payload) {
            Some((name, coord)) => Ok(ProvinceCapital {
                province_name: province_name.to_owned(),
                country_code: country_code.map(str::to_owned),
                status: super::ResolutionStatus::Resolved,
                capital_name: Some(name),
                capital_coordinate: Some(coord),
                source_role: Some(member.role),
                error: None,
            }),
            None => Ok(ProvinceCapital::unknown(province_name, country_code)),
        }
    }

    /// Every resolved capital, for the `province_capitals` report.
    pub async fn capitals_snapshot(&self) -> Vec<(String, ProvinceCapital)> {
        self.capital_cache.resolved_entries().await
    }

    pub fn request_count(&self) -> u64 {
        self.external_requests.load(Ordering::Relaxed)
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

struct CapitalMember {
    node_ref: i64,
    role: String,
}

/// How well a relation name matches the requested province.
fn name_match_rank(candidate: &str, wanted: &str) -> Option<u8> {
    let candidate = candidate.to_lowercase();
    let wanted = wanted.to_lowercase();
    if candidate == wanted {
        Some(0)
    } else if candidate.starts_with(&wanted) || candidate.ends_with(&wanted) {
        Some(1)
    } else if candidate.contains(&wanted) {
        Some(2)
    } else {
        None
    }
}

fn relation_country_matches(tags: &Value, country_code: Option<&str>) -> bool {
    let wanted = match country_code {
        Some(code) if !code.is_empty() => code.to_lowercase(),
        _ => return true,
    };
    // Subnational relations usually carry an ISO3166-2 code prefixed by the
    // country; relations without one are not excluded.
    match tags.get("ISO3166-2").and_then(Value::as_str) {
        Some(code) => code.to_lowercase().starts_with(&wanted),
        None => true,
    }
}

/// Pick the best-matching relation and its first capital-role member.
fn pick_capital_member(
    payload: &Value,
    province_name: &str,
    country_code: Option<&str>,
) -> Option<CapitalMember> {
    let elements = payload.get("elements")?.as_array()?;

    let mut best: Option<(u8, &Value)> = None;
    for element in elements {
        if element.get("type").and_then(Value::as_str) != Some("relation") {
            continue;
        }
        let tags = element.get("tags").cloned().unwrap_or(Value::Null);
        let name = match tags.get("name").and_then(Value::as_str) {
            Some(name) => name,
            None => continue,
        };
        if !relation_country_matches(&tags, country_code) {
            continue;
        }
        if let Some(rank) = name_match_rank(name, province_name) {
            let better = match best {
                Some((best_rank, _)) => rank < best_rank,
                None => true,
            };
            if better {
                best = Some((rank, element));
            }
        }
    }

    let (_, relation) = best?;
    let members = relation.get("members")?.as_array()?;
    for role in CAPITAL_ROLES {
        for member in members {
            if member.get("role").and_then(Value::as_str) == Some(*role)
                && member.get("type").and_then(Value::as_str) == Some("node")
            {
                if let Some(node_ref) = member.get("ref").and_then(Value::as_i64) {
                    return Some(CapitalMember {
                        node_ref,
                        role: (*role).to_owned(),
                    });
                }
            }
        }
    }
    None
}

fn parse_capital_node(payload: &Value) -> Option<(String, Coord)> {
    let node = payload
        .get("elements")?
        .as_array()?
        .iter()
        .find(|element| element.get("type").and_then(Value::as_str) == Some("node"))?;
    let lat = node.get("lat").and_then(Value::as_f64)?;
    let lng = node.get("lon").and_then(Value::as_f64)?;
    let name = node
        .pointer("/tags/name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();
    if name.is_empty() {
        return None;
    }
    Some((name, Coord::new(lat, lng)))
}

fn parse_places(payload: &Value, accepted_place_classes: &[&str]) -> Vec<Place> {
    let elements = match payload.get("elements").and_then(Value::as_array) {
        Some(elements) => elements,
        None => return Vec::new(),
    };

    let mut places = Vec::new();
    for element in elements {
        if element.get("type").and_then(Value::as_str) != Some("node") {
            continue;
        }
        let lat = element.get("lat").and_then(Value::as_f64);
        let lng = element.get("lon").and_then(Value::as_f64);
        let (lat, lng) = match (lat, lng) {
            (Some(lat), Some(lng)) => (lat, lng),
            _ => continue,
        };
        let class = element
            .pointer("/tags/place")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        if class.is_empty() {
            continue;
        }
        if !accepted_place_classes.is_empty()
            && !accepted_place_classes.contains(&class.as_str())
        {
            continue;
        }
        let name = element
            .pointer("/tags/name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        if name.is_empty() {
            continue;
        }
        let population = element
            .pointer("/tags/population")
            .and_then(Value::as_str)
            .and_then(|raw| raw.replace([',', ' '], "").parse::<i64>().ok());
        let osm_ref = element
            .get("id")
            .and_then(Value::as_i64)
            .map(|id| format!("node/{}", id))
            .unwrap_or_default();
        places.push(Place {
            name,
            class,
            population,
            lat,
            lng,
            osm_ref,
        });
    }
    places
}

/// Minimal percent-encoding for a form-urlencoded body.
fn urlencode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b' ' => encoded.push_str("%20"),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Escape a province name for use inside an Overpass regex filter.
fn regex_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if "\\^$.|?*+()[]{}\"".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relations_payload() -> Value {
        json!({
            "elements": [
                {
                    "type": "relation",
                    "id": 1,
                    "tags": {"name": "Provincia de Sevilla", "ISO3166-2": "ES-SE"},
                    "members": [
                        {"type": "way", "ref": 10, "role": "outer"},
                        {"type": "node", "ref": 42, "role": "admin_centre"}
                    ]
                },
                {
                    "type": "relation",
                    "id": 2,
                    "tags": {"name": "Sevilla", "ISO3166-2": "ES-SE"},
                    "members": [
                        {"type": "node", "ref": 99, "role": "label"}
                    ]
                },
                {
                    "type": "relation",
                    "id": 3,
                    "tags": {"name": "Sevilla", "ISO3166-2": "VE-X"},
                    "members": [
                        {"type": "node", "ref": 7, "role": "capital"}
                    ]
                }
            ]
        })
    }

    #[test]
    fn exact_name_match_beats_substring() {
        let member = pick_capital_member(&relations_payload(), "Sevilla", Some("es")).unwrap();
        // Relation 2 matches exactly and in the right country; its label
        // node wins over relation 1's admin_centre.
        assert_eq!(member.node_ref, 99);
        assert_eq!(member.role, "label");
    }

    #[test]
    fn country_filter_excludes_foreign_relations() {
        let member = pick_capital_member(&relations_payload(), "Sevilla", Some("ve")).unwrap();
        assert_eq!(member.node_ref, 7);
        assert_eq!(member.role, "capital");
    }

    #[test]
    fn role_priority_prefers_admin_centre() {
        let payload = json!({
            "elements": [{
                "type": "relation",
                "tags": {"name": "Madrid"},
                "members": [
                    {"type": "node", "ref": 5, "role": "label"},
                    {"type": "node", "ref": 6, "role": "admin_centre"}
                ]
            }]
        });
        let member = pick_capital_member(&payload, "Madrid", None).unwrap();
        assert_eq!(member.node_ref, 6);
        assert_eq!(member.role, "admin_centre");
    }

    #[test]
    fn missing_relation_yields_none() {
        assert!(pick_capital_member(&json!({"elements": []}), "Atlantis", None).is_none());
    }

    #[test]
    fn capital_node_needs_a_name() {
        let named = json!({
            "elements": [{"type": "node", "lat": 37.39, "lon": -5.99, "tags": {"name": "Sevilla"}}]
        });
        let (name, coord) = parse_capital_node(&named).unwrap();
        assert_eq!(name, "Sevilla");
        assert!((coord.lat - 37.39).abs() < 1e-9);

        let unnamed = json!({
            "elements": [{"type": "node", "lat": 37.39, "lon": -5.99}]
        });
        assert!(parse_capital_node(&unnamed).is_none());
    }

    #[test]
    fn places_filter_by_class_and_require_names() {
        let payload = json!({
            "elements": [
                {"type": "node", "id": 1, "lat": 40.0, "lon": -3.0,
                 "tags": {"place": "town", "name": "Alcorcón", "population": "170,000"}},
                {"type": "node", "id": 2, "lat": 40.1, "lon": -3.1,
                 "tags": {"place": "hamlet", "name": "El Soto"}},
                {"type": "node", "id": 3, "lat": 40.2, "lon": -3.2,
                 "tags": {"place": "town"}}
            ]
        });
        let all = parse_places(&payload, &[]);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].population, Some(170_000));
        assert_eq!(all[0].osm_ref, "node/1");

        let towns = parse_places(&payload, &["town"]);
        assert_eq!(towns.len(), 1);
        assert_eq!(towns[0].name, "Alcorcón");
    }

    #[test]
    fn overpass_body_is_form_encoded() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(regex_escape("A (B)"), "A \\(B\\)");
    }
}
