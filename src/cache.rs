use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a forwarded query waits for its upstream answer before the
/// originating client is forgotten.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
/// Cadence of the background eviction sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Pairs in-flight transaction ids with the IPv4 client that sent them.
/// Entries appear when a query is forwarded upstream, disappear when the
/// matching response is delivered, and otherwise age out after the TTL.
///
/// The id space is 16 bits, so two clients can collide on one id; the newer
/// entry wins and the prior client is forgotten.
pub struct CorrelationCache {
    inner: Cache<u16, SocketAddrV4>,
}

impl CorrelationCache {
    pub fn new(ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(u64::from(u16::MAX) + 1)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub fn put(&self, id: u16, client: SocketAddrV4) {
        if self.inner.contains_key(&id) {
            warn!(id, %client, "transaction id collision, prior client forgotten");
        }
        self.inner.insert(id, client);
    }

    /// Non-destructive read; absent or expired entries yield `None`.
    pub fn get(&self, id: u16) -> Option<SocketAddrV4> {
        self.inner.get(&id)
    }

    pub fn remove(&self, id: u16) {
        self.inner.invalidate(&id);
    }

    #[allow(dead_code)]
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

/// Periodically flushes expired entries. Expired ids are already invisible
/// to `get`; the sweep reclaims their memory.
pub fn spawn_sweeper(cache: Arc<CorrelationCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            cache.inner.run_pending_tasks();
            debug!(entries = cache.inner.entry_count(), "correlation cache swept");
        }
    })
}
