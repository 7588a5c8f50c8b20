//! Nodegate - dynamic reverse-proxy upstreams from GCE instance discovery
//!
//! This library keeps a live list of backend targets ("upstreams") for a
//! reverse proxy by:
//! - Querying the GCE instance inventory for machines whose name matches a
//!   configured prefix
//! - Translating their internal IPs into dialable `address:port` targets
//! - Caching the result with a freshness window so the per-request fast
//!   path does no I/O
//! - Electing a single refresher under concurrent callers, with
//!   stale-while-revalidate semantics for everyone else
//! - Retrying failed discovery indefinitely with a fixed backoff, so the
//!   proxy keeps serving the last good snapshot through provider outages
//! - Optionally debouncing newly observed addresses until they have been
//!   seen continuously for a minimum duration (flap suppression)

pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gce;
pub mod upstream;
