//! OSRM client: distance tables for the solver and on-road geometry for
//! municipality tracing.
//!
//! The public OSRM instance is regularly overloaded, so the table lookup
//! retries with escalating sleeps and the callers are expected to fall back
//! to direct distances rather than fail the solve.

use std::time::Duration;

use futures::StreamExt;
use hyper::{Body, Request};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::ProviderError;
use crate::geo::Coord;
use crate::providers::SharedHttpClient;
use crate::Result;

const TABLE_TIMEOUT: Duration = Duration::from_secs(25);
const TABLE_ATTEMPTS: u32 = 3;

pub struct OsrmClient {
    base_url: String,
    http: SharedHttpClient,
}

impl OsrmClient {
    pub fn new(base_url: &str, http: SharedHttpClient) -> OsrmClient {
        OsrmClient {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn coords_path(points: &[Coord]) -> String {
        points
            .iter()
            .map(|p| format!("{},{}", p.lng, p.lat))
            .collect::<Vec<_>>()
            .join(";")
    }

    async fn get_json(&self, endpoint: &str, url: &str) -> Result<Value> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .body(Body::empty())
            .map_err(|err| ProviderError::permanent(endpoint, err.to_string()))?;

        let response = tokio::time::timeout(TABLE_TIMEOUT, self.http.request(request))
            .await
            .map_err(|_| ProviderError::transient(endpoint, "timed out"))?
            .map_err(|err| ProviderError::transient(endpoint, err.to_string()))?;

        let status = response.status();
        let mut body = response.into_body();
        let mut body_data = Vec::new();
        while let Some(chunk_result) = body.next().await {
            let chunk = chunk_result
                .map_err(|err| ProviderError::transient(endpoint, err.to_string()))?;
            body_data.extend(&chunk[..]);
        }

        if status.is_server_error() {
            return Err(
                ProviderError::transient(endpoint, format!("HTTP {}", status)).into()
            );
        }
        if !status.is_success() {
            return Err(
                ProviderError::permanent(endpoint, format!("HTTP {}", status)).into()
            );
        }
        serde_json::from_slice(&body_data).map_err(|err| {
            ProviderError::permanent(endpoint, format!("bad JSON payload: {}", err))
                .into()
        })
    }

    /// Fetch a full distance matrix in kilometers. Unreachable legs come
    /// back as `INFINITY`.
    #[instrument(
        name = "OsrmClient::table_km",
        level = "debug",
        skip_all,
        fields(points = points.len())
    )]
    pub async fn table_km(&self, points: &[Coord]) -> Result<Vec<Vec<f64>>> {
        let url = format!(
            "{}/table/v1/driving/{}?annotations=distance",
            self.base_url,
            Self::coords_path(points)
        );

        let mut last_err = None;
        for attempt in 0..TABLE_ATTEMPTS {
            match self.get_json("osrm.table", &url).await {
                Ok(payload) => return parse_table_km(&payload, points.len()),
                Err(err) => {
                    debug!("OSRM table attempt {} failed: {}", attempt + 1, err);
                    last_err = Some(err);
                    if attempt + 1 < TABLE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            350 * (attempt as u64 + 1),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }

    /// Road polyline between two coordinates, as lat/lng points.
    #[instrument(name = "OsrmClient::route_geometry", level = "debug", skip_all)]
    pub async fn route_geometry(&self, from: Coord, to: Coord) -> Result<Vec<Coord>> {
        let url = format!(
            "{}/route/v1/driving/{}?overview=full&geometries=geojson&steps=false",
            self.base_url,
            Self::coords_path(&[from, to])
        );
        let payload = self.get_json("osrm.route", &url).await?;
        parse_route_geometry(&payload)
    }
}

fn parse_table_km(payload: &Value, expected_len: usize) -> Result<Vec<Vec<f64>>> {
    if payload.get("code").and_then(Value::as_str) != Some("Ok") {
        return Err(
            ProviderError::permanent("osrm.table", "non-Ok table payload").into()
        );
    }
    let rows = payload
        .get("distances")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::permanent("osrm.table", "missing distances"))?;
    if rows.len() != expected_len {
        return Err(ProviderError::permanent(
            "osrm.table",
            format!("expected {} rows, got {}", expected_len, rows.len()),
        )
        .into());
    }

    let mut matrix_km = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row
            .as_array()
            .ok_or_else(|| ProviderError::permanent("osrm.table", "malformed row"))?;
        matrix_km.push(
            row.iter()
                .map(|cell| match cell.as_f64() {
                    Some(meters) => meters / 1000.0,
                    None => f64::INFINITY,
                })
                .collect(),
        );
    }
    Ok(matrix_km)
}

fn parse_route_geometry(payload: &Value) -> Result<Vec<Coord>> {
    let coordinates = payload
        .get("routes")
        .and_then(Value::as_array)
        .and_then(|routes| routes.first())
        .and_then(|route| route.pointer("/geometry/coordinates"))
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::permanent("osrm.route", "missing geometry"))?;

    let mut points = Vec::with_capacity(coordinates.len());
    for pair in coordinates {
        let lng = pair.get(0).and_then(Value::as_f64);
        let lat = pair.get(1).and_then(Value::as_f64);
        match (lat, lng) {
            (Some(lat), Some(lng)) => points.push(Coord::new(lat, lng)),
            _ => {
                return Err(
                    ProviderError::permanent("osrm.route", "malformed coordinate").into()
                )
            }
        }
    }
    if points.len() < 2 {
        return Err(
            ProviderError::permanent("osrm.route", "geometry too short").into()
        );
    }
    Ok(points)
}
