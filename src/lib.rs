//! VRP solve + route enrichment service.
//!
//! The routing answer itself is cheap; the value (and the risk) is in the
//! enrichment pipeline that decorates each route segment with weather,
//! traffic, administrative geography and nearby points of interest, all
//! fetched from external services with strict quota discipline. Enrichment
//! must never corrupt or drop a routing result that was already computed.

pub use anyhow::Result;

pub mod errors;
pub mod geo;
pub mod merge;
pub mod municipality;
pub mod osm;
pub mod osrm;
pub mod poi;
pub mod prefetch;
pub mod providers;
pub mod request;
pub mod segments;
pub mod semantic;
pub mod server;
pub mod single_flight;
pub mod solver;
pub mod timeutil;
