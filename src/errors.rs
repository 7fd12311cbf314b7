//! Tagged error kinds for the enrichment pipeline.
//!
//! The orchestrator isolates failures at the segment or point level, so
//! clients return *tagged* errors instead of opaque ones: the isolation rule
//! is pattern matching, not a catch-all.

use anyhow::Error;
use thiserror::Error;

/// An error from an external provider (weather, traffic, routing, OSM).
#[derive(Debug, Error)]
#[error("{reason} ({endpoint})")]
pub struct ProviderError {
    /// What went wrong, in one short phrase.
    pub reason: String,
    /// Which endpoint we were talking to.
    pub endpoint: String,
    /// How the orchestrator should treat this failure.
    pub kind: ProviderErrorKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// Retriable I/O or 5xx-style failure. Retried within the per-client
    /// budget, then isolated.
    Transient,
    /// Non-retriable failure (4xx, unparseable payload). Cached as a
    /// negative result so we do not ask again.
    Permanent,
    /// The whole-request deadline expired while this call was in flight.
    DeadlineExceeded,
}

impl ProviderError {
    pub fn transient(endpoint: &str, reason: impl Into<String>) -> ProviderError {
        ProviderError {
            reason: reason.into(),
            endpoint: endpoint.to_owned(),
            kind: ProviderErrorKind::Transient,
        }
    }

    pub fn permanent(endpoint: &str, reason: impl Into<String>) -> ProviderError {
        ProviderError {
            reason: reason.into(),
            endpoint: endpoint.to_owned(),
            kind: ProviderErrorKind::Permanent,
        }
    }

    pub fn deadline(endpoint: &str) -> ProviderError {
        ProviderError {
            reason: "deadline exceeded".to_owned(),
            endpoint: endpoint.to_owned(),
            kind: ProviderErrorKind::DeadlineExceeded,
        }
    }
}

/// Extract the short failure phrase for the `errors` list from any error.
///
/// `ProviderError` keeps its `{reason, endpoint}` shape; everything else
/// falls back to the `Display` of the outermost cause.
pub fn short_phrase(err: &Error) -> String {
    match err.downcast_ref::<ProviderError>() {
        Some(provider_err) => provider_err.to_string(),
        None => err.to_string(),
    }
}

/// Display an error plus all the underlying causes.
pub fn display_causes(err: &Error) {
    eprintln!("Error: {}", err);
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {}", cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_formats_reason_and_endpoint() {
        let err = ProviderError::transient("weather.v3", "timed out");
        assert_eq!(err.to_string(), "timed out (weather.v3)");
        assert_eq!(err.kind, ProviderErrorKind::Transient);
    }

    #[test]
    fn short_phrase_unwraps_provider_errors() {
        let err = Error::new(ProviderError::permanent("traffic.v7", "HTTP 403"));
        assert_eq!(short_phrase(&err), "HTTP 403 (traffic.v7)");
    }
}
