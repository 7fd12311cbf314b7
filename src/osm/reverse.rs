//! Reverse geocoding against an OSM-backed endpoint list.
//!
//! One resolver instance is shared by everything inside a request, so the
//! minimum-interval policy holds across municipality phase 1 and phase 2
//! (and across concurrent route work): successive outbound requests from one
//! instance are spaced by at least `min_interval_ms`, while cache hits pay
//! nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use hyper::{Body, Request};
use leaky_bucket::RateLimiter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::geo::Coord;
use crate::providers::SharedHttpClient;
use crate::single_flight::SingleFlightCache;

/// Default OSM reverse-geocoding endpoint.
pub const DEFAULT_REVERSE_ENDPOINTS: &[&str] =
    &["https://nominatim.openstreetmap.org/reverse"];

/// Municipality-ish address fields, most specific first.
const MUNICIPALITY_FIELDS: &[&str] = &[
    "municipality",
    "city",
    "town",
    "village",
    "city_district",
    "district",
    "borough",
    "suburb",
    "quarter",
    "hamlet",
    "locality",
];

/// Province-ish address fields, most specific first.
const PROVINCE_FIELDS: &[&str] = &["province", "state_district", "state", "county", "region"];

/// Country/state-level fields that mark an answer as administrative-only.
const COARSE_FIELDS: &[&str] = &["country", "state", "region", "continent"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Unknown,
    Error,
}

/// The administrative answer for one coordinate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminResolution {
    pub status: ResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality_source_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    /// The canonical coordinate key this resolution answers for.
    pub address_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osm_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resolver counters for the `lookup_stats` report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupStats {
    pub cache_hits: u64,
    pub external_requests: u64,
    pub errors: u64,
}

pub struct ReverseGeocoder {
    endpoints: Vec<String>,
    http: SharedHttpClient,
    limiter: RateLimiter,
    timeout: Duration,
    address_book: SingleFlightCache<String, AdminResolution>,
    cache_hits: AtomicU64,
    external_requests: AtomicU64,
    errors: AtomicU64,
}

impl ReverseGeocoder {
    pub fn new(
        endpoints: Vec<String>,
        http: SharedHttpClient,
        min_interval_ms: u64,
    ) -> ReverseGeocoder {
        let endpoints = if endpoints.is_empty() {
            DEFAULT_REVERSE_ENDPOINTS.iter().map(|s| (*s).to_owned()).collect()
        } else {
            endpoints
        };
        ReverseGeocoder {
            endpoints,
            http,
            limiter: RateLimiter::builder()
                .initial(1)
                .max(1)
                .refill(1)
                .interval(Duration::from_millis(min_interval_ms.max(1)))
                .fair(true)
                .build(),
            timeout: Duration::from_secs(12),
            address_book: SingleFlightCache::new(),
            cache_hits: AtomicU64::new(0),
            external_requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Resolve a coordinate into its administrative address. Failures come
    /// back as `status: error` entries and are cached like everything else,
    /// so a dead endpoint is not polled per sample.
    #[instrument(name = "ReverseGeocoder::resolve", level = "debug", skip_all)]
    pub async fn resolve(&self, coord: Coord) -> AdminResolution {
        let coord_key = coord.key();
        let mut fetched = false;
        let resolution = self
            .address_book
            .get_or_fetch(coord_key.clone(), || {
                fetched = true;
                self.resolve_uncached(coord, coord_key.clone())
            })
            .await
            .expect("resolve_uncached is infallible");
        if !fetched {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        resolution
    }

    async fn resolve_uncached(
        &self,
        coord: Coord,
        coord_key: String,
    ) -> crate::Result<AdminResolution> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            // The polite-use interval applies to every outbound request,
            // including retries against fallback endpoints.
            self.limiter.acquire_one().await;
            self.external_requests.fetch_add(1, Ordering::Relaxed);
            match self.fetch_endpoint(endpoint, coord).await {
                Ok(payload) => {
                    return Ok(resolution_from_payload(&payload, &coord_key));
                }
                Err(err) => {
                    debug!("reverse geocode via {} failed: {}", endpoint, err);
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    last_error = Some(err.to_string());
                }
            }
        }
        Ok(AdminResolution {
            status: ResolutionStatus::Error,
            municipality_name: None,
            municipality_source_field: None,
            province_name: None,
            country_code: None,
            address_ref: coord_key,
            osm_ref: None,
            resolution_note: None,
            error: last_error.or_else(|| Some("no reverse endpoints configured".to_owned())),
        })
    }

    async fn fetch_endpoint(&self, endpoint: &str, coord: Coord) -> crate::Result<Value> {
        let mut url = Url::parse(endpoint)?;
        url.query_pairs_mut()
            .append_pair("format", "jsonv2")
            .append_pair("lat", &format!("{:.6}", coord.lat))
            .append_pair("lon", &format!("{:.6}", coord.lng))
            .append_pair("zoom", "10")
            .append_pair("addressdetails", "1");

        let request = Request::builder()
            .method("GET")
            .uri(url.as_str())
            .header(
                "User-Agent",
                concat!("route-enrich/", env!("CARGO_PKG_VERSION")),
            )
            .body(Body::empty())?;

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| anyhow::format_err!("timed out"))??;
        let status = response.status();
        let mut body = response.into_body();
        let mut body_data = Vec::new();
        while let Some(chunk_result) = body.next().await {
            body_data.extend(&chunk_result?[..]);
        }
        if !status.is_success() {
            return Err(anyhow::format_err!("HTTP {}", status));
        }
        Ok(serde_json::from_slice(&body_data)?)
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            external_requests: self.external_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Every resolved address-book entry, keyed by coordinate.
    pub async fn address_book_snapshot(&self) -> Vec<(String, AdminResolution)> {
        self.address_book.resolved_entries().await
    }
}

/// Build an [`AdminResolution`] from a reverse-geocoding payload.
pub(crate) fn resolution_from_payload(payload: &Value, coord_key: &str) -> AdminResolution {
    let address = payload.get("address").and_then(Value::as_object);

    let field = |name: &str| -> Option<String> {
        address
            .and_then(|map| map.get(name))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };

    let mut municipality = None;
    let mut source_field = None;
    for candidate in MUNICIPALITY_FIELDS {
        if let Some(value) = field(candidate) {
            municipality = Some(value);
            source_field = Some((*candidate).to_owned());
            break;
        }
    }

    let province = PROVINCE_FIELDS.iter().find_map(|candidate| field(candidate));
    let country_code = field("country_code").map(|c| c.to_lowercase());
    let osm_ref = match (
        payload.get("osm_type").and_then(Value::as_str),
        payload.get("osm_id"),
    ) {
        (Some(osm_type), Some(osm_id)) => Some(format!("{}/{}", osm_type, osm_id)),
        _ => None,
    };

    let has_coarse_admin = COARSE_FIELDS.iter().any(|name| field(name).is_some());
    let (status, resolution_note) = match (&municipality, has_coarse_admin) {
        (Some(_), _) => (ResolutionStatus::Resolved, None),
        (None, true) => (
            ResolutionStatus::Unknown,
            Some("non_municipality_admin_only".to_owned()),
        ),
        (None, false) => (ResolutionStatus::Unknown, None),
    };

    AdminResolution {
        status,
        municipality_name: municipality,
        municipality_source_field: source_field,
        province_name: province,
        country_code,
        address_ref: coord_key.to_owned(),
        osm_ref,
        resolution_note,
        error: None,
    }
}
