//! Capacitated VRP construction: Clarke-Wright savings over a distance
//! matrix.
//!
//! The solve itself is deliberately plain (a savings merge plus a route
//! selection step); the interesting work happens downstream in the
//! enrichment pipeline. What matters here is the contract: `len(routes) ==
//! vehicles`, `used ≤ capacity` per route, and served/unserved forming a
//! disjoint cover of the customer ids.

use std::collections::{HashMap, HashSet};

use tracing::{instrument, warn};

use crate::geo::{self, Coord};
use crate::osrm::OsrmClient;
use crate::providers::round_to;
use crate::request::{
    DistanceMode, DistanceSource, Id, Route, SolveResponse, SolveSummary, Stop,
};
use crate::Result;

/// A distance matrix plus where it came from.
struct MatrixBuild {
    matrix_km: Vec<Vec<f64>>,
    source: DistanceSource,
    warning: Option<String>,
}

async fn build_matrix(
    points: &[&Stop],
    mode: DistanceMode,
    osrm: Option<&OsrmClient>,
) -> MatrixBuild {
    let direct = || -> Vec<Vec<f64>> {
        points
            .iter()
            .map(|a| {
                points
                    .iter()
                    .map(|b| geo::haversine_km(a.coord(), b.coord()))
                    .collect()
            })
            .collect()
    };

    let osrm = match (mode, osrm) {
        (DistanceMode::Direct, _) | (_, None) => {
            return MatrixBuild {
                matrix_km: direct(),
                source: DistanceSource::Direct,
                warning: None,
            };
        }
        (DistanceMode::Osrm, Some(client)) => client,
    };

    let coords: Vec<Coord> = points.iter().map(|p| p.coord()).collect();
    match osrm.table_km(&coords).await {
        Ok(matrix_km) => {
            // A table that cannot reach any customer from the depot is as
            // good as no table at all.
            let all_unreachable = points.len() > 1
                && (1..points.len()).all(|k| {
                    !matrix_km[0][k].is_finite() || !matrix_km[k][0].is_finite()
                });
            if all_unreachable {
                warn!("OSRM table has no usable legs, using direct distances");
                return MatrixBuild {
                    matrix_km: direct(),
                    source: DistanceSource::DirectFallback,
                    warning: Some(
                        "OSRM table returned no usable legs, using direct distances."
                            .to_owned(),
                    ),
                };
            }
            MatrixBuild {
                matrix_km,
                source: DistanceSource::Osrm,
                warning: None,
            }
        }
        Err(err) => {
            // Keep the solve path available even when public OSRM is
            // overloaded.
            warn!("OSRM table unavailable, using direct distances: {}", err);
            MatrixBuild {
                matrix_km: direct(),
                source: DistanceSource::DirectFallback,
                warning: Some(format!(
                    "OSRM table unavailable, using direct distances. Reason: {}",
                    err
                )),
            }
        }
    }
}

/// One in-progress savings route: an ordered run of customer indices, always
/// implicitly depot-...-depot.
struct CwRoute {
    customers: Vec<usize>,
    demand: i64,
}

/// Clarke-Wright parallel savings merge. `matrix_km` is indexed with the
/// depot at 0 and customer `k` at `k + 1`.
fn clarke_wright_routes(
    demands: &[i64],
    capacity: i64,
    matrix_km: &[Vec<f64>],
) -> Vec<CwRoute> {
    let customer_count = demands.len();
    let mut routes: Vec<Option<CwRoute>> = (0..customer_count)
        .map(|k| {
            Some(CwRoute {
                customers: vec![k],
                demand: demands[k],
            })
        })
        .collect();
    let mut route_of: Vec<usize> = (0..customer_count).collect();

    // Directed savings for every ordered customer pair.
    let mut savings = Vec::with_capacity(customer_count * customer_count);
    for i in 0..customer_count {
        for j in 0..customer_count {
            if i == j {
                continue;
            }
            let s = matrix_km[i + 1][0] + matrix_km[0][j + 1] - matrix_km[i + 1][j + 1];
            if s.is_finite() {
                savings.push((s, i, j));
            }
        }
    }
    savings.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    for (_, i, j) in savings {
        let route_i = route_of[i];
        let route_j = route_of[j];
        if route_i == route_j {
            continue;
        }
        let (demand_i, demand_j) = match (&routes[route_i], &routes[route_j]) {
            (Some(a), Some(b)) => (a.demand, b.demand),
            _ => continue,
        };
        if demand_i + demand_j > capacity {
            continue;
        }

        // `i` must end up at the tail of its route and `j` at the head of
        // the other; an endpoint node on the wrong side gets its route
        // reversed, interior nodes block the merge.
        {
            let r = routes[route_i].as_mut().expect("route_i exists");
            if r.customers.last() != Some(&i) {
                if r.customers.first() == Some(&i) {
                    r.customers.reverse();
                } else {
                    continue;
                }
            }
        }
        {
            let r = routes[route_j].as_mut().expect("route_j exists");
            if r.customers.first() != Some(&j) {
                if r.customers.last() == Some(&j) {
                    r.customers.reverse();
                } else {
                    continue;
                }
            }
        }

        let absorbed = routes[route_j].take().expect("route_j exists");
        let target = routes[route_i].as_mut().expect("route_i exists");
        for &node in &absorbed.customers {
            route_of[node] = route_i;
        }
        target.customers.extend(absorbed.customers);
        target.demand += absorbed.demand;
    }

    routes.into_iter().flatten().collect()
}

fn route_cost(route: &CwRoute, matrix_km: &[Vec<f64>]) -> f64 {
    let mut cost = 0.0;
    let mut previous = 0usize; // depot
    for &customer in &route.customers {
        cost += matrix_km[previous][customer + 1];
        previous = customer + 1;
    }
    cost + matrix_km[previous][0]
}

/// Distance along the emitted stop sequence, with per-leg haversine fallback
/// when the matrix has no finite answer.
fn route_distance_km(
    stops: &[Stop],
    index_by_id: &HashMap<Id, usize>,
    matrix_km: &[Vec<f64>],
) -> f64 {
    let mut total = 0.0;
    for pair in stops.windows(2) {
        let leg = match (index_by_id.get(&pair[0].id), index_by_id.get(&pair[1].id)) {
            (Some(&a), Some(&b)) => matrix_km[a][b],
            _ => f64::INFINITY,
        };
        total += if leg.is_finite() {
            leg
        } else {
            geo::haversine_km(pair[0].coord(), pair[1].coord())
        };
    }
    total
}

/// Solve the capacitated VRP for one request.
#[instrument(
    level = "debug",
    skip_all,
    fields(customers = customers.len(), vehicles = vehicles, capacity = capacity)
)]
pub async fn solve(
    depot: &Stop,
    customers: &[Stop],
    vehicles: i64,
    capacity: i64,
    mode: DistanceMode,
    osrm: Option<&OsrmClient>,
) -> Result<SolveResponse> {
    let vehicles = vehicles.max(1);
    let capacity = capacity.max(1);
    let mut warnings: Vec<String> = Vec::new();

    let eligible: Vec<&Stop> = customers
        .iter()
        .filter(|c| c.demand_or_default() <= capacity)
        .collect();

    let mut points: Vec<&Stop> = Vec::with_capacity(eligible.len() + 1);
    points.push(depot);
    points.extend(eligible.iter().copied());

    let mut build = build_matrix(&points, mode, osrm).await;
    if let Some(warning) = build.warning.take() {
        warnings.push(warning);
    }

    // Customers the matrix cannot reach from the depot (or back) are left
    // unserved rather than poisoning the savings merge.
    let reachable: Vec<&Stop> = eligible
        .iter()
        .enumerate()
        .filter(|(k, _)| {
            build.matrix_km[0][k + 1].is_finite() && build.matrix_km[k + 1][0].is_finite()
        })
        .map(|(_, stop)| *stop)
        .collect();

    if reachable.len() != eligible.len() {
        points = Vec::with_capacity(reachable.len() + 1);
        points.push(depot);
        points.extend(reachable.iter().copied());
        build = build_matrix(&points, mode, osrm).await;
        if let Some(warning) = build.warning.take() {
            warnings.push(warning);
        }
    }

    let index_by_id: HashMap<Id, usize> = points
        .iter()
        .enumerate()
        .map(|(index, stop)| (stop.id.clone(), index))
        .collect();

    let demands: Vec<i64> = reachable.iter().map(|c| c.demand_or_default()).collect();
    let mut cw_routes = if reachable.is_empty() {
        Vec::new()
    } else {
        clarke_wright_routes(&demands, capacity, &build.matrix_km)
    };

    if cw_routes.len() as i64 > vehicles {
        cw_routes.sort_by(|a, b| {
            (b.customers.len(), b.demand)
                .partial_cmp(&(a.customers.len(), a.demand))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    route_cost(a, &build.matrix_km)
                        .partial_cmp(&route_cost(b, &build.matrix_km))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        cw_routes.truncate(vehicles as usize);
    }

    let mut routes = Vec::with_capacity(vehicles as usize);
    let mut served_ids: HashSet<Id> = HashSet::new();
    for vehicle_index in 0..vehicles {
        let (stops, route_served, used) = match cw_routes.get(vehicle_index as usize) {
            Some(cw_route) => {
                let mut stops = Vec::with_capacity(cw_route.customers.len() + 2);
                stops.push(depot.clone());
                for &k in &cw_route.customers {
                    stops.push(reachable[k].clone());
                }
                stops.push(depot.clone());
                let route_served: Vec<Id> = cw_route
                    .customers
                    .iter()
                    .map(|&k| reachable[k].id.clone())
                    .collect();
                (stops, route_served, cw_route.demand)
            }
            None => (vec![depot.clone(), depot.clone()], Vec::new(), 0),
        };

        for id in &route_served {
            served_ids.insert(id.clone());
        }
        routes.push(Route {
            vehicle: vehicle_index + 1,
            capacity,
            used,
            distance_km: round_to(
                route_distance_km(&stops, &index_by_id, &build.matrix_km),
                3,
            ),
            stops,
            served_customer_ids: route_served,
        });
    }

    let unserved: Vec<Id> = customers
        .iter()
        .filter(|c| !served_ids.contains(&c.id))
        .map(|c| c.id.clone())
        .collect();
    let total_distance_km = round_to(routes.iter().map(|r| r.distance_km).sum(), 3);

    warnings.truncate(5);
    Ok(SolveResponse {
        routes,
        unserved_customer_ids: unserved.clone(),
        warnings,
        summary: SolveSummary {
            vehicles,
            customers: customers.len(),
            served: customers.len() - unserved.len(),
            unserved: unserved.len(),
            total_distance_km,
            distance_source: build.source,
        },
        semantic_layer: None,
        semantic_layer_error: None,
        municipality_enrichment_error: None,
        here_prefetch: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: i64, lat: f64, lng: f64, demand: i64) -> Stop {
        Stop {
            id: Id::Int(id),
            lat,
            lng,
            demand: Some(demand),
        }
    }

    fn depot() -> Stop {
        Stop {
            id: Id::Str("depot".to_owned()),
            lat: 40.0,
            lng: -3.0,
            demand: None,
        }
    }

    #[tokio::test]
    async fn single_customer_out_and_back() {
        let customers = vec![stop(1, 40.1, -3.1, 1)];
        let result = solve(&depot(), &customers, 1, 5, DistanceMode::Direct, None)
            .await
            .unwrap();

        assert_eq!(result.routes.len(), 1);
        let route = &result.routes[0];
        assert_eq!(route.used, 1);
        assert_eq!(route.stops.len(), 3);
        assert_eq!(route.stops[0].id, Id::Str("depot".to_owned()));
        assert_eq!(route.stops[1].id, Id::Int(1));
        assert_eq!(route.stops[2].id, Id::Str("depot".to_owned()));
        // Out and back over ~14.04 km each way.
        assert!((route.distance_km - 28.08).abs() < 0.2, "{}", route.distance_km);
        assert!(result.unserved_customer_ids.is_empty());
        assert_eq!(result.summary.distance_source, DistanceSource::Direct);
    }

    #[tokio::test]
    async fn capacity_forces_split_across_vehicles() {
        let depot = Stop {
            id: Id::Str("depot".to_owned()),
            lat: 0.0,
            lng: 0.0,
            demand: None,
        };
        let customers = vec![
            stop(1, 0.0, 1.0, 3),
            stop(2, 1.0, 0.0, 3),
            stop(3, 0.0, -1.0, 3),
            stop(4, -1.0, 0.0, 3),
        ];
        let result = solve(&depot, &customers, 2, 6, DistanceMode::Direct, None)
            .await
            .unwrap();

        assert_eq!(result.routes.len(), 2);
        for route in &result.routes {
            assert!(route.used <= route.capacity);
            assert_eq!(route.served_customer_ids.len(), 2);
            let interior_demand: i64 = route.stops[1..route.stops.len() - 1]
                .iter()
                .map(|s| s.demand_or_default())
                .sum();
            assert_eq!(interior_demand, route.used);
        }
        let total_used: i64 = result.routes.iter().map(|r| r.used).sum();
        assert_eq!(total_used, 12);
        assert!(result.unserved_customer_ids.is_empty());
        assert_eq!(result.summary.served, 4);
    }

    #[tokio::test]
    async fn oversized_demand_is_left_unserved() {
        let customers = vec![stop(1, 40.1, -3.1, 9), stop(2, 40.2, -3.2, 1)];
        let result = solve(&depot(), &customers, 1, 5, DistanceMode::Direct, None)
            .await
            .unwrap();
        assert_eq!(result.unserved_customer_ids, vec![Id::Int(1)]);
        assert_eq!(result.summary.served, 1);
        assert_eq!(result.summary.unserved, 1);
    }

    #[tokio::test]
    async fn more_routes_than_vehicles_keeps_the_fullest() {
        // Three far-apart customers that cannot merge under capacity 2, but
        // only two vehicles.
        let customers = vec![
            stop(1, 41.0, -3.0, 2),
            stop(2, 39.0, -3.0, 2),
            stop(3, 40.0, -2.0, 2),
        ];
        let result = solve(&depot(), &customers, 2, 2, DistanceMode::Direct, None)
            .await
            .unwrap();
        assert_eq!(result.routes.len(), 2);
        assert_eq!(result.summary.served, 2);
        assert_eq!(result.unserved_customer_ids.len(), 1);
        // Union of served and unserved covers every customer exactly once.
        let mut all: Vec<Id> = result
            .routes
            .iter()
            .flat_map(|r| r.served_customer_ids.clone())
            .chain(result.unserved_customer_ids.clone())
            .collect();
        all.sort_by_key(|id| id.to_string());
        assert_eq!(all, vec![Id::Int(1), Id::Int(2), Id::Int(3)]);
    }

    #[tokio::test]
    async fn savings_merge_chains_nearby_customers() {
        // Two customers on the same bearing should ride in one vehicle.
        let customers = vec![stop(1, 40.1, -3.0, 1), stop(2, 40.2, -3.0, 1)];
        let result = solve(&depot(), &customers, 2, 5, DistanceMode::Direct, None)
            .await
            .unwrap();
        let loaded: Vec<&Route> =
            result.routes.iter().filter(|r| !r.served_customer_ids.is_empty()).collect();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].served_customer_ids.len(), 2);
        // The second vehicle idles at the depot.
        let idle = result
            .routes
            .iter()
            .find(|r| r.served_customer_ids.is_empty())
            .unwrap();
        assert_eq!(idle.stops.len(), 2);
        assert_eq!(idle.used, 0);
    }
}
