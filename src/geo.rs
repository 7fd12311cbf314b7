//! Geographic primitives: great-circle distances, a local equirectangular
//! frame for point-to-segment math, and arc-length polyline resampling.
//!
//! All distances are kilometers.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used throughout.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lng: f64,
}

impl Coord {
    pub fn new(lat: f64, lng: f64) -> Coord {
        Coord { lat, lng }
    }

    /// Is this a finite coordinate inside the valid lat/lng ranges?
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Canonical cache key: lat/lng rounded to 6 decimals.
    ///
    /// Equality for caching and registry merging always goes through this
    /// key, never through raw float comparison.
    pub fn key(&self) -> String {
        format!("{:.6},{:.6}", self.lat, self.lng)
    }
}

/// Great-circle distance between two coordinates.
pub fn haversine_km(a: Coord, b: Coord) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * h.sqrt().asin()
}

/// Project into a local equirectangular frame anchored at `ref_lat`.
fn to_xy_km(c: Coord, ref_lat: f64) -> (f64, f64) {
    let x = c.lng.to_radians() * EARTH_RADIUS_KM * ref_lat.to_radians().cos();
    let y = c.lat.to_radians() * EARTH_RADIUS_KM;
    (x, y)
}

/// Perpendicular distance from `p` to the segment `a`..`b`.
///
/// The reference latitude is the mean of the three inputs; the projection
/// parameter is clamped to `[0, 1]` so off-end points measure to the nearest
/// endpoint.
pub fn point_to_segment_km(p: Coord, a: Coord, b: Coord) -> f64 {
    let ref_lat = (p.lat + a.lat + b.lat) / 3.0;
    let (px, py) = to_xy_km(p, ref_lat);
    let (ax, ay) = to_xy_km(a, ref_lat);
    let (bx, by) = to_xy_km(b, ref_lat);

    let vx = bx - ax;
    let vy = by - ay;
    let seg_len_sq = vx * vx + vy * vy;
    if seg_len_sq == 0.0 {
        return ((px - ax).powi(2) + (py - ay).powi(2)).sqrt();
    }

    let t = (((px - ax) * vx + (py - ay) * vy) / seg_len_sq).clamp(0.0, 1.0);
    let cx = ax + t * vx;
    let cy = ay + t * vy;
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Linear interpolation in lat/lng space.
///
/// Not a great-circle interpolation; segments are short and every sample is
/// re-resolved afterwards, so the flat approximation holds.
pub fn interpolate(a: Coord, b: Coord, t: f64) -> Coord {
    Coord {
        lat: a.lat + (b.lat - a.lat) * t,
        lng: a.lng + (b.lng - a.lng) * t,
    }
}

/// Arithmetic midpoint of two coordinates.
pub fn midpoint(a: Coord, b: Coord) -> Coord {
    Coord {
        lat: (a.lat + b.lat) / 2.0,
        lng: (a.lng + b.lng) / 2.0,
    }
}

/// Resample a polyline at a uniform arc-length step.
///
/// Returns `N + 1` points where `N = max(1, ceil(total / step_km))`: the
/// first sample is the original start, the last is the original end, and
/// interior samples are found by walking the cumulative arc-length table.
/// A zero-length polyline yields just its two endpoints.
pub fn resample_polyline(points: &[Coord], step_km: f64) -> Vec<Coord> {
    if points.is_empty() {
        return Vec::new();
    }
    if points.len() == 1 {
        return vec![points[0]];
    }

    let mut cumulative = Vec::with_capacity(points.len());
    cumulative.push(0.0);
    let mut total = 0.0;
    for window in points.windows(2) {
        total += haversine_km(window[0], window[1]);
        cumulative.push(total);
    }

    let first = points[0];
    let last = *points.last().expect("polyline has at least two points");
    if total == 0.0 {
        return vec![first, last];
    }

    let step_km = if step_km > 0.0 { step_km } else { total };
    let intervals = ((total / step_km).ceil() as usize).max(1);
    let mut samples = Vec::with_capacity(intervals + 1);
    samples.push(first);

    let mut edge = 0;
    for i in 1..intervals {
        let target = total * (i as f64) / (intervals as f64);
        while edge + 1 < cumulative.len() - 1 && cumulative[edge + 1] < target {
            edge += 1;
        }
        let edge_len = cumulative[edge + 1] - cumulative[edge];
        let t = if edge_len > 0.0 {
            (target - cumulative[edge]) / edge_len
        } else {
            0.0
        };
        samples.push(interpolate(points[edge], points[edge + 1], t));
    }

    samples.push(last);
    samples
}

/// Thin a sample list to at most `max_samples` points, keeping both
/// endpoints and spacing the survivors evenly.
pub fn cap_samples(points: &[Coord], max_samples: usize) -> Vec<Coord> {
    if max_samples == 0 || points.len() <= max_samples {
        return points.to_vec();
    }
    if max_samples == 1 {
        return vec![points[0]];
    }

    let last_index = points.len() - 1;
    let mut selected = Vec::with_capacity(max_samples);
    let mut previous = usize::MAX;
    for i in 0..max_samples {
        let index = (i as f64 * last_index as f64 / (max_samples - 1) as f64).round()
            as usize;
        if index != previous {
            selected.push(points[index]);
            previous = index;
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_reference_leg() {
        // The single-customer scenario: depot (40, -3) to (40.1, -3.1).
        let d = haversine_km(Coord::new(40.0, -3.0), Coord::new(40.1, -3.1));
        assert!((d - 14.04).abs() < 0.1, "got {}", d);
    }

    #[test]
    fn coord_key_rounds_to_six_decimals() {
        let c = Coord::new(40.123_456_789, -3.000_000_4);
        assert_eq!(c.key(), "40.123457,-3.000000");
    }

    #[test]
    fn point_to_segment_handles_degenerate_segment() {
        let p = Coord::new(40.1, -3.0);
        let a = Coord::new(40.0, -3.0);
        let d = point_to_segment_km(p, a, a);
        assert!((d - haversine_km(p, a)).abs() < 0.05);
    }

    #[test]
    fn point_to_segment_clamps_to_endpoints() {
        let a = Coord::new(40.0, -3.0);
        let b = Coord::new(40.0, -2.0);
        // Way past the east end of the segment.
        let p = Coord::new(40.0, -1.0);
        let d = point_to_segment_km(p, a, b);
        assert!((d - haversine_km(p, b)).abs() < 0.5);
    }

    #[test]
    fn resample_keeps_endpoints_and_spacing() {
        let points = vec![Coord::new(40.0, -3.0), Coord::new(40.0, -2.0)];
        let samples = resample_polyline(&points, 20.0);
        // ~85 km of arc at a 20 km step: 5 intervals, 6 samples.
        assert_eq!(samples.len(), 6);
        assert_eq!(samples[0], points[0]);
        assert_eq!(*samples.last().unwrap(), points[1]);
        let spacing = haversine_km(samples[0], samples[1]);
        for pair in samples.windows(2) {
            assert!((haversine_km(pair[0], pair[1]) - spacing).abs() < 0.2);
        }
    }

    #[test]
    fn resample_zero_length_emits_two_endpoints() {
        let p = Coord::new(40.0, -3.0);
        let samples = resample_polyline(&[p, p], 20.0);
        assert_eq!(samples, vec![p, p]);
    }

    #[test]
    fn cap_samples_preserves_endpoints() {
        let points: Vec<Coord> =
            (0..30).map(|i| Coord::new(40.0 + i as f64 * 0.01, -3.0)).collect();
        let capped = cap_samples(&points, 12);
        assert!(capped.len() <= 12);
        assert_eq!(capped[0], points[0]);
        assert_eq!(*capped.last().unwrap(), *points.last().unwrap());
    }
}
