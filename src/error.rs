//! Error types for instance discovery

use thiserror::Error;

/// Error from a single discovery attempt.
///
/// All variants are non-fatal to the process: the upstream cache logs them
/// and retries after a backoff, and no error ever reaches a proxy request.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Ambient credential resolution (metadata server token / project ID) failed
    #[error("credential resolution failed: {0}")]
    Credentials(String),

    /// Discovery client setup failed (e.g. TLS backend initialization)
    #[error("discovery client construction failed: {0}")]
    ClientConstruction(String),

    /// A page of the paginated instance listing failed mid-stream
    #[error("instance list page fetch failed: {0}")]
    PageFetch(String),
}
