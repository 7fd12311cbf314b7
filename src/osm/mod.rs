//! Clients for the administrative data source (OSM): reverse geocoding and
//! area queries. Both honor polite-use quotas through a minimum interval
//! between outbound requests and cache aggressively per process.

pub mod area;
pub mod reverse;

pub use area::{AreaQueryClient, Place, ProvinceCapital};
pub use reverse::{AdminResolution, LookupStats, ResolutionStatus, ReverseGeocoder};
