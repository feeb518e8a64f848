//! Routing and failover engine.
//!
//! Owns one hash ring and one rate limiter per domain. Rings are immutable
//! snapshots behind atomic references, so routing never takes a lock on the
//! hot path; mutation (init, reload, failure-triggered rebuild) replaces
//! whole snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::algorithms::{local_window, SlidingWindow};
use crate::config::{Config, Node};
use crate::error::{Error, Result};
use crate::health;
use crate::ring::{Bucket, HashRing};

/// Domain entry serving any host the table does not name explicitly.
pub const WILDCARD_DOMAIN: &str = "*";

/// Per-domain routing state.
///
/// The ring is `None` while the domain is degraded (every backend down);
/// the limiter and the rebuild lock live for the life of the table entry.
pub struct DomainRoute {
    domain: String,
    ring: ArcSwapOption<HashRing>,
    limiter: SlidingWindow,
    rebuild: Mutex<()>,
}

impl DomainRoute {
    /// Current ring snapshot, if any backend is alive.
    pub fn ring(&self) -> Option<Arc<HashRing>> {
        self.ring.load_full()
    }

    pub fn limiter(&self) -> &SlidingWindow {
        &self.limiter
    }
}

/// The routing/failover engine.
pub struct Engine {
    table: ArcSwap<HashMap<String, Arc<DomainRoute>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Build the full domain table from configuration and install it.
    ///
    /// Every configured node is probed with a bounded timeout and excluded
    /// when unreachable. If any domain ends up with zero reachable nodes the
    /// whole call fails and the previous table stays installed; the swap at
    /// the end is all-or-nothing, so concurrent routing observes either the
    /// fully-old or fully-new table.
    pub async fn init_nodes(&self, config: &Config) -> Result<()> {
        let mut table = HashMap::new();
        for (domain, nodes) in config.domain_nodes() {
            let buckets = probe_nodes(nodes).await;
            if buckets.is_empty() {
                return Err(Error::DomainUnavailable(domain));
            }
            let ring = HashRing::build(buckets)?;
            let limiter = SlidingWindow::new(
                config.rate_limit.rate_time,
                config.rate_limit.rate_limit,
                local_window,
            )?;
            info!(
                domain = %domain,
                backends = ring.buckets().len(),
                points = ring.len(),
                "routing table built"
            );
            table.insert(
                domain.clone(),
                Arc::new(DomainRoute {
                    domain,
                    ring: ArcSwapOption::from_pointee(ring),
                    limiter,
                    rebuild: Mutex::new(()),
                }),
            );
        }
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Resolve a domain to its routing state, falling back to the wildcard.
    pub fn resolve(&self, domain: &str) -> Result<Arc<DomainRoute>> {
        let table = self.table.load();
        table
            .get(domain)
            .or_else(|| table.get(WILDCARD_DOMAIN))
            .cloned()
            .ok_or(Error::DomainNotMatched)
    }

    /// Pick the backend for `key` in `domain`.
    pub fn route(&self, domain: &str, key: &[u8]) -> Result<String> {
        let route = self.resolve(domain)?;
        let ring = route.ring.load_full().ok_or(Error::NoServiceAlive)?;
        let bucket = ring.hash(key)?;
        Ok(bucket.label.clone())
    }

    /// Admission decision for one request against the domain's limiter.
    pub fn admit(&self, domain: &str) -> Result<bool> {
        Ok(self.resolve(domain)?.limiter.grant())
    }

    /// Handle a live connection refusal against `backend_addr` (`host:port`,
    /// as produced by [`health::authority`]).
    ///
    /// Removes exactly that bucket, re-probes the remainder and installs a
    /// freshly built ring for the one domain. With nothing left alive the
    /// domain degrades (ring becomes `None`) instead of failing globally.
    pub async fn report_failure(&self, domain: &str, backend_addr: &str) {
        let Ok(route) = self.resolve(domain) else {
            return;
        };
        let _guard = route.rebuild.lock().await;

        let Some(ring) = route.ring.load_full() else {
            return;
        };
        // A concurrent report may already have removed this backend.
        if !ring.buckets().iter().any(|b| b.label.contains(backend_addr)) {
            return;
        }
        warn!(
            domain = %route.domain,
            backend = backend_addr,
            "backend connection refused, rebuilding ring"
        );

        let mut alive = Vec::new();
        for bucket in ring.buckets() {
            if bucket.label.contains(backend_addr) {
                continue;
            }
            if health::probe(&bucket.label).await {
                alive.push(bucket.clone());
            } else {
                warn!(domain = %route.domain, backend = %bucket.label, "backend unreachable, excluded");
            }
        }

        match HashRing::build(alive) {
            Ok(next) => {
                info!(
                    domain = %route.domain,
                    backends = next.buckets().len(),
                    "ring rebuilt"
                );
                route.ring.store(Some(Arc::new(next)));
            }
            Err(_) => {
                warn!(domain = %route.domain, "no service alive, domain degraded");
                route.ring.store(None);
            }
        }
    }
}

async fn probe_nodes(nodes: &[Node]) -> Vec<Bucket> {
    let mut buckets = Vec::new();
    for node in nodes {
        if health::probe(&node.url).await {
            info!(node = %node.name, url = %node.url, "backend alive");
            buckets.push(Bucket::new(node.url.clone(), node.weight));
        } else {
            warn!(node = %node.name, url = %node.url, "backend unreachable, excluded");
        }
    }
    buckets
}
