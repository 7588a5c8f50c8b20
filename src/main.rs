//! Operational tool: resolve upstreams against the real GCE API and log
//! the set periodically, for verifying discovery outside the proxy.

use nodegate::cache::UpstreamCache;
use nodegate::config::Config;
use nodegate::gce::GceDiscovery;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nodegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    let discovery = GceDiscovery::new(config.discovery.running_only)?;
    let cache = Arc::new(UpstreamCache::new(
        discovery,
        config.discovery.node_name_prefix.clone(),
        config.cache.cache_config(),
    ));

    info!(
        prefix = %config.discovery.node_name_prefix,
        port = config.cache.service_port,
        "Watching upstreams (Ctrl-C to exit)"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
            _ = poll(&cache) => {}
        }
    }
}

async fn poll<D: nodegate::discovery::EndpointDiscovery>(cache: &UpstreamCache<D>) {
    let upstreams = cache.get_upstreams().await;
    let dials: Vec<&str> = upstreams.iter().map(|u| u.dial()).collect();
    info!(
        upstreams = ?dials,
        age_secs = cache.last_refresh_age().map(|age| age.as_secs()),
        "Current upstream set"
    );
    tokio::time::sleep(Duration::from_secs(30)).await;
}
