//! Upstream cache and refresh state machine
//!
//! Serves the latest known upstream snapshot cheaply while keeping it
//! reasonably fresh via the discovery client. Every proxy request calls
//! [`UpstreamCache::get_upstreams`]; the fast path is a read check with no
//! I/O. When the snapshot goes stale exactly one caller is elected to
//! refresh it (blocking only that caller, retrying discovery failures
//! indefinitely with a fixed backoff) while everyone else keeps serving
//! the previous snapshot.

use crate::discovery::EndpointDiscovery;
use crate::upstream::Upstream;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Configuration for the upstream cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Fixed service port joined with every discovered address
    pub service_port: u16,
    /// Maximum snapshot age before a refresh is triggered
    pub freshness_window: Duration,
    /// Sleep between retries inside a failed refresh session
    pub retry_backoff: Duration,
    /// Minimum continuous observation before a new address is trusted;
    /// `None` disables debouncing and uses every discovered address
    /// immediately
    pub debounce_window: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            service_port: 30080,
            freshness_window: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(60),
            debounce_window: Some(Duration::from_secs(300)),
        }
    }
}

/// Mutable cache state, guarded by a lock that is never held across await
struct CacheState {
    /// Last successfully computed snapshot, replaced wholesale
    snapshot: Arc<Vec<Upstream>>,
    /// Completion time of the last successful refresh; `None` until the
    /// first one, so a cold cache is always stale
    refreshed_at: Option<Instant>,
    /// Instant from which each currently observed address is trusted
    /// (first observation plus the debounce window)
    trusted_at: HashMap<String, Instant>,
    /// Whether a discovery result has been processed before; the first
    /// one trusts its addresses immediately instead of debouncing them
    seeded: bool,
}

impl CacheState {
    fn new() -> Self {
        Self {
            snapshot: Arc::new(Vec::new()),
            refreshed_at: None,
            trusted_at: HashMap::new(),
            seeded: false,
        }
    }

    /// Apply the debounce policy to a discovery result, returning the
    /// addresses that have been observed continuously for at least
    /// `window`. Addresses absent from `observed` lose their tracking
    /// entry and must re-accumulate the full window if they reappear.
    fn debounced(&mut self, observed: &[String], now: Instant, window: Duration) -> Vec<String> {
        // Cold start: trust the very first result immediately so an empty
        // cache does not sit unusable for a whole debounce window.
        let trust_from = if self.seeded { now + window } else { now };
        self.seeded = true;

        for address in observed {
            self.trusted_at.entry(address.clone()).or_insert(trust_from);
        }

        let observed_set: HashSet<&str> = observed.iter().map(String::as_str).collect();
        self.trusted_at.retain(|address, _| observed_set.contains(address.as_str()));

        observed
            .iter()
            .filter(|address| self.trusted_at[address.as_str()] <= now)
            .cloned()
            .collect()
    }
}

/// Clears the refreshing flag when the refresh session ends. Runs on drop,
/// so a refresher whose future is cancelled mid-session (e.g. the proxy
/// request that elected it disconnects) releases the election instead of
/// leaving the flag stuck true.
struct RefreshGuard<'a> {
    refreshing: &'a AtomicBool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.refreshing.store(false, Ordering::Release);
    }
}

/// Cached, periodically refreshed upstream list backed by a discovery
/// client.
///
/// Explicitly constructed and injectable: the proxy integration layer owns
/// one (or several, for independent backends) and hands it by `Arc` to
/// every request path. There is no process-wide singleton.
pub struct UpstreamCache<D> {
    discovery: D,
    node_name_prefix: String,
    config: CacheConfig,
    state: RwLock<CacheState>,
    /// Gate distinguishing "the refresher" from everyone else
    refreshing: AtomicBool,
}

impl<D: EndpointDiscovery> UpstreamCache<D> {
    /// Create a cache with an empty snapshot. The first call to
    /// [`get_upstreams`](Self::get_upstreams) always triggers a refresh.
    pub fn new(discovery: D, node_name_prefix: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            discovery,
            node_name_prefix: node_name_prefix.into(),
            config,
            state: RwLock::new(CacheState::new()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Return the current upstream set, refreshing it first if it is stale
    /// and no other caller is already refreshing.
    ///
    /// Never fails: callers always get some snapshot, possibly stale,
    /// possibly empty before the first successful refresh during a
    /// provider outage. The one caller elected as refresher blocks for
    /// the whole refresh session, including retry backoffs; all others
    /// return immediately.
    pub async fn get_upstreams(&self) -> Arc<Vec<Upstream>> {
        if let Some(snapshot) = self.fresh_snapshot() {
            return snapshot;
        }

        // Elect a single refresher. Losers serve the previous snapshot
        // (stale-while-revalidate) instead of waiting on the winner.
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.snapshot();
        }

        let _guard = RefreshGuard {
            refreshing: &self.refreshing,
        };

        // Another refresher may have finished between the staleness check
        // and winning the flag; don't issue a redundant discovery call.
        match self.fresh_snapshot() {
            Some(snapshot) => snapshot,
            None => self.refresh().await,
        }
    }

    /// The current snapshot, fresh or not, without triggering I/O.
    pub fn snapshot(&self) -> Arc<Vec<Upstream>> {
        Arc::clone(&self.state.read().snapshot)
    }

    /// Time since the last successful refresh, or `None` if there has
    /// never been one. Monitoring hook: a sustained provider outage shows
    /// up here as unbounded growth, not as accumulating failures.
    pub fn last_refresh_age(&self) -> Option<Duration> {
        self.state
            .read()
            .refreshed_at
            .map(|at| Instant::now().duration_since(at))
    }

    fn fresh_snapshot(&self) -> Option<Arc<Vec<Upstream>>> {
        let state = self.state.read();
        let refreshed_at = state.refreshed_at?;
        if Instant::now().duration_since(refreshed_at) < self.config.freshness_window {
            Some(Arc::clone(&state.snapshot))
        } else {
            None
        }
    }

    /// One refresh session: call discovery until it succeeds, sleeping a
    /// fixed backoff between failures. Unbounded by design; the proxy
    /// must keep serving the last good snapshot through an outage, and
    /// only the elected refresher is blocked here.
    async fn refresh(&self) -> Arc<Vec<Upstream>> {
        loop {
            match self.discovery.discover(&self.node_name_prefix).await {
                Ok(endpoints) => {
                    info!(
                        prefix = %self.node_name_prefix,
                        ips = ?endpoints,
                        "Discovered node addresses"
                    );
                    return self.install(endpoints);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_secs = self.config.retry_backoff.as_secs(),
                        "Discovery failed, retrying after backoff"
                    );
                    sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    /// Turn a successful discovery result into the new snapshot. The swap
    /// is wholesale under the write lock; readers never observe a partial
    /// list. Only this path advances the freshness timestamp.
    fn install(&self, endpoints: Vec<String>) -> Arc<Vec<Upstream>> {
        let now = Instant::now();
        let mut state = self.state.write();

        let active = match self.config.debounce_window {
            Some(window) => {
                let active = state.debounced(&endpoints, now, window);
                debug!(active = ?active, "Active addresses after debounce");
                active
            }
            None => endpoints,
        };

        let snapshot: Arc<Vec<Upstream>> = Arc::new(
            active
                .iter()
                .map(|address| Upstream::new(address, self.config.service_port))
                .collect(),
        );
        state.snapshot = Arc::clone(&snapshot);
        state.refreshed_at = Some(now);
        snapshot
    }
}
