//! The discovery seam between the upstream cache and the cloud provider

use crate::error::DiscoveryError;

/// Resolves a name-filter prefix into the internal addresses of currently
/// running instances.
///
/// Implementations are pure I/O adapters: no caching, no internal retries
/// (retry policy belongs to the caller), no partial results on failure.
#[async_trait::async_trait]
pub trait EndpointDiscovery: Send + Sync {
    /// List the internal IP addresses of instances whose name starts with
    /// `name_prefix`. An empty prefix matches all instances.
    ///
    /// The call is all-or-nothing: any mid-stream failure discards
    /// addresses gathered so far and returns an error.
    async fn discover(&self, name_prefix: &str) -> Result<Vec<String>, DiscoveryError>;
}
