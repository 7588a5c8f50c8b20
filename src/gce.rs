//! GCE instance discovery over the compute REST API
//!
//! Resolves ambient credentials from the GCE metadata server, then walks
//! the paginated `aggregated/instances` listing and collects the internal
//! IP of every matching instance. Stateless: each call authenticates and
//! lists from scratch, and any mid-stream failure fails the whole call
//! with no partial result.

use crate::discovery::EndpointDiscovery;
use crate::error::DiscoveryError;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_METADATA_BASE: &str = "http://metadata.google.internal";
const DEFAULT_COMPUTE_BASE: &str = "https://compute.googleapis.com";

/// Instance lifecycle status that makes an address eligible
const STATUS_RUNNING: &str = "RUNNING";

/// Discovery client for GCE instance inventory
pub struct GceDiscovery {
    http: reqwest::Client,
    /// When true, only instances with status RUNNING contribute addresses
    running_only: bool,
    metadata_base: String,
    compute_base: String,
}

impl GceDiscovery {
    /// Create a client against the real metadata server and compute API.
    pub fn new(running_only: bool) -> Result<Self, DiscoveryError> {
        Self::with_endpoints(running_only, DEFAULT_METADATA_BASE, DEFAULT_COMPUTE_BASE)
    }

    /// Create a client against alternative API endpoints (tests, emulators).
    pub fn with_endpoints(
        running_only: bool,
        metadata_base: impl Into<String>,
        compute_base: impl Into<String>,
    ) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DiscoveryError::ClientConstruction(e.to_string()))?;

        Ok(Self {
            http,
            running_only,
            metadata_base: metadata_base.into(),
            compute_base: compute_base.into(),
        })
    }

    /// Resolve an access token and project ID from the metadata server.
    async fn resolve_credentials(&self) -> Result<(String, String), DiscoveryError> {
        let credentials = |e: reqwest::Error| DiscoveryError::Credentials(e.to_string());

        let token: TokenResponse = self
            .http
            .get(format!(
                "{}/computeMetadata/v1/instance/service-accounts/default/token",
                self.metadata_base
            ))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(credentials)?
            .error_for_status()
            .map_err(credentials)?
            .json()
            .await
            .map_err(credentials)?;

        let project = self
            .http
            .get(format!(
                "{}/computeMetadata/v1/project/project-id",
                self.metadata_base
            ))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(credentials)?
            .error_for_status()
            .map_err(credentials)?
            .text()
            .await
            .map_err(credentials)?;

        Ok((token.access_token, project))
    }

    /// Fetch one page of the aggregated instance listing.
    async fn fetch_page(
        &self,
        token: &str,
        project: &str,
        name_prefix: &str,
        page_token: Option<&str>,
    ) -> Result<AggregatedListPage, DiscoveryError> {
        let page_fetch = |e: reqwest::Error| DiscoveryError::PageFetch(e.to_string());

        let mut request = self
            .http
            .get(format!(
                "{}/compute/v1/projects/{}/aggregated/instances",
                self.compute_base, project
            ))
            .bearer_auth(token);

        if !name_prefix.is_empty() {
            request = request.query(&[("filter", format!("name = \"{}*\"", name_prefix))]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        request
            .send()
            .await
            .map_err(page_fetch)?
            .error_for_status()
            .map_err(page_fetch)?
            .json()
            .await
            .map_err(page_fetch)
    }
}

#[async_trait::async_trait]
impl EndpointDiscovery for GceDiscovery {
    async fn discover(&self, name_prefix: &str) -> Result<Vec<String>, DiscoveryError> {
        let (token, project) = self.resolve_credentials().await?;

        let mut addresses = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .fetch_page(&token, &project, name_prefix, page_token.as_deref())
                .await?;

            for scope in page.items.values() {
                for instance in &scope.instances {
                    if self.running_only && instance.status.as_deref() != Some(STATUS_RUNNING) {
                        continue;
                    }
                    // Only the first network interface is consulted.
                    if let Some(ip) = instance
                        .network_interfaces
                        .first()
                        .and_then(|nic| nic.network_ip.as_ref())
                    {
                        addresses.push(ip.clone());
                    }
                }
            }

            // An absent or empty next-page token is the terminal signal.
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(project = %project, count = addresses.len(), "Instance listing complete");
        Ok(addresses)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// One page of `aggregated/instances`: instances grouped per zone scope.
/// Scopes without instances carry a warning and no `instances` array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedListPage {
    #[serde(default)]
    items: BTreeMap<String, ScopedInstanceList>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ScopedInstanceList {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    status: Option<String>,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{mock, Matcher};

    // The mockito server is shared across tests, so each test namespaces
    // its endpoints under a unique base path.
    fn client(test_id: &str) -> GceDiscovery {
        let server = mockito::server_url();
        GceDiscovery::with_endpoints(
            true,
            format!("{}/{}", server, test_id),
            format!("{}/{}", server, test_id),
        )
        .unwrap()
    }

    fn mock_credentials(test_id: &str, project: &str) -> (mockito::Mock, mockito::Mock) {
        let token = mock(
            "GET",
            format!(
                "/{}/computeMetadata/v1/instance/service-accounts/default/token",
                test_id
            )
            .as_str(),
        )
        .match_header("Metadata-Flavor", "Google")
        .with_status(200)
        .with_body(r#"{"access_token":"test-token","expires_in":3599,"token_type":"Bearer"}"#)
        .create();

        let project = mock(
            "GET",
            format!("/{}/computeMetadata/v1/project/project-id", test_id).as_str(),
        )
        .match_header("Metadata-Flavor", "Google")
        .with_status(200)
        .with_body(project)
        .create();

        (token, project)
    }

    #[tokio::test]
    async fn test_collects_running_internal_ips() {
        let _creds = mock_credentials("basic", "proj-basic");
        let _list = mock("GET", "/basic/compute/v1/projects/proj-basic/aggregated/instances")
            .match_query(Matcher::UrlEncoded(
                "filter".into(),
                r#"name = "gke-cluster-c5fe837*""#.into(),
            ))
            .with_status(200)
            .with_body(
                r#"{
                    "items": {
                        "zones/us-central1-a": {
                            "instances": [
                                {
                                    "name": "gke-cluster-c5fe837-node-1",
                                    "status": "RUNNING",
                                    "networkInterfaces": [{"networkIP": "10.128.0.3"}]
                                },
                                {
                                    "name": "gke-cluster-c5fe837-node-2",
                                    "status": "STOPPING",
                                    "networkInterfaces": [{"networkIP": "10.128.0.4"}]
                                }
                            ]
                        },
                        "zones/us-central1-b": {
                            "instances": [
                                {
                                    "name": "gke-cluster-c5fe837-node-3",
                                    "status": "RUNNING",
                                    "networkInterfaces": [
                                        {"networkIP": "10.128.0.5"},
                                        {"networkIP": "192.168.0.9"}
                                    ]
                                }
                            ]
                        },
                        "zones/us-central1-c": {
                            "warning": {"code": "NO_RESULTS_ON_PAGE"}
                        }
                    }
                }"#,
            )
            .create();

        let ips = client("basic").discover("gke-cluster-c5fe837").await.unwrap();

        // STOPPING instance excluded; only the first NIC of node-3 used.
        assert_eq!(ips, vec!["10.128.0.3", "10.128.0.5"]);
    }

    #[tokio::test]
    async fn test_follows_pagination_to_done() {
        let _creds = mock_credentials("paged", "proj-paged");
        let _page1 = mock("GET", "/paged/compute/v1/projects/proj-paged/aggregated/instances")
            .match_query(Matcher::UrlEncoded("filter".into(), r#"name = "gke*""#.into()))
            .with_status(200)
            .with_body(
                r#"{
                    "items": {
                        "zones/us-central1-a": {
                            "instances": [
                                {"status": "RUNNING", "networkInterfaces": [{"networkIP": "10.0.0.1"}]}
                            ]
                        }
                    },
                    "nextPageToken": "page-2"
                }"#,
            )
            .create();
        let _page2 = mock("GET", "/paged/compute/v1/projects/proj-paged/aggregated/instances")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("filter".into(), r#"name = "gke*""#.into()),
                Matcher::UrlEncoded("pageToken".into(), "page-2".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{
                    "items": {
                        "zones/us-central1-b": {
                            "instances": [
                                {"status": "RUNNING", "networkInterfaces": [{"networkIP": "10.0.0.2"}]}
                            ]
                        }
                    }
                }"#,
            )
            .create();

        let ips = client("paged").discover("gke").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_credential_failure() {
        let _token = mock(
            "GET",
            "/nocreds/computeMetadata/v1/instance/service-accounts/default/token",
        )
        .with_status(500)
        .create();

        let err = client("nocreds").discover("gke").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Credentials(_)));
    }

    #[tokio::test]
    async fn test_page_failure_discards_partial_results() {
        let _creds = mock_credentials("midfail", "proj-midfail");
        let _page1 = mock(
            "GET",
            "/midfail/compute/v1/projects/proj-midfail/aggregated/instances",
        )
        .match_query(Matcher::UrlEncoded("filter".into(), r#"name = "gke*""#.into()))
        .with_status(200)
        .with_body(
            r#"{
                "items": {
                    "zones/us-central1-a": {
                        "instances": [
                            {"status": "RUNNING", "networkInterfaces": [{"networkIP": "10.0.0.1"}]}
                        ]
                    }
                },
                "nextPageToken": "page-2"
            }"#,
        )
        .create();
        let _page2 = mock(
            "GET",
            "/midfail/compute/v1/projects/proj-midfail/aggregated/instances",
        )
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("filter".into(), r#"name = "gke*""#.into()),
            Matcher::UrlEncoded("pageToken".into(), "page-2".into()),
        ]))
        .with_status(503)
        .create();

        let err = client("midfail").discover("gke").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::PageFetch(_)));
    }

    #[tokio::test]
    async fn test_status_filter_disabled() {
        let _creds = mock_credentials("nofilter", "proj-nofilter");
        let _list = mock(
            "GET",
            "/nofilter/compute/v1/projects/proj-nofilter/aggregated/instances",
        )
        .with_status(200)
        .with_body(
            r#"{
                "items": {
                    "zones/us-central1-a": {
                        "instances": [
                            {"status": "RUNNING", "networkInterfaces": [{"networkIP": "10.0.0.1"}]},
                            {"status": "STOPPING", "networkInterfaces": [{"networkIP": "10.0.0.2"}]}
                        ]
                    }
                }
            }"#,
        )
        .create();

        let server = mockito::server_url();
        let client = GceDiscovery::with_endpoints(
            false,
            format!("{}/nofilter", server),
            format!("{}/nofilter", server),
        )
        .unwrap();

        // Empty prefix sends no filter parameter and matches everything.
        let ips = client.discover("").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
    }
}
