//! Read-side balance caching.
//!
//! Balance checks vastly outnumber mutations, so reads can be served from a
//! short-lived per-customer cache. Mutating paths invalidate the customer's
//! entry; callers that cannot tolerate staleness bypass the cache per call.

use crate::error::Result;
use crate::ledger::{FeatureBalance, LedgerManager, LedgerStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-call cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve from cache when fresh, load and fill otherwise.
    #[default]
    Cached,
    /// Always load from the store; the result still fills the cache.
    Bypass,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    loaded_at: Instant,
    rows: Vec<FeatureBalance>,
}

/// TTL cache over a customer's balance rows.
#[derive(Debug, Clone)]
pub struct CachedBalances<L> {
    ledger: LedgerManager<L>,
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl<L: LedgerStore> CachedBalances<L> {
    pub fn new(ledger: LedgerManager<L>, ttl: Duration) -> Self {
        Self {
            ledger,
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ledger(&self) -> &LedgerManager<L> {
        &self.ledger
    }

    /// All balance rows for a customer, honoring the cache mode.
    pub async fn balances(
        &self,
        customer_id: &str,
        mode: CacheMode,
    ) -> Result<Vec<FeatureBalance>> {
        if mode == CacheMode::Cached {
            if let Some(rows) = self.fresh(customer_id) {
                debug!(target: "tollgate::cache", customer_id, "balance cache hit");
                return Ok(rows);
            }
        }
        let rows = self.ledger.store().list_for_customer(customer_id).await?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                customer_id.to_string(),
                CacheEntry { loaded_at: Instant::now(), rows: rows.clone() },
            );
        }
        Ok(rows)
    }

    /// Drop a customer's cached rows. Called after any balance mutation.
    pub fn invalidate(&self, customer_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(customer_id);
        }
    }

    fn fresh(&self, customer_id: &str) -> Option<Vec<FeatureBalance>> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(customer_id)?;
        (entry.loaded_at.elapsed() < self.ttl).then(|| entry.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Entitlement;
    use crate::ledger::test::InMemoryLedgerStore;
    use crate::ledger::BalanceKey;

    fn cache(ttl: Duration) -> CachedBalances<InMemoryLedgerStore> {
        CachedBalances::new(LedgerManager::new(InMemoryLedgerStore::new()), ttl)
    }

    async fn seed(cache: &CachedBalances<InMemoryLedgerStore>) -> BalanceKey {
        let row = FeatureBalance::from_entitlement(
            "cp_1",
            "cus_1",
            &Entitlement::metered("api_calls", 1000),
            None,
            0,
            1_000_000,
        );
        let key = row.key();
        cache.ledger().grant(vec![row]).await.unwrap();
        key
    }

    #[tokio::test]
    async fn cached_reads_survive_store_changes_until_invalidated() {
        let cache = cache(Duration::from_secs(60));
        let key = seed(&cache).await;

        let first = cache.balances("cus_1", CacheMode::Cached).await.unwrap();
        assert_eq!(first[0].balance, 1000);

        cache.ledger().consume(&key, 100, None).await.unwrap();

        // Still the stale snapshot.
        let stale = cache.balances("cus_1", CacheMode::Cached).await.unwrap();
        assert_eq!(stale[0].balance, 1000);

        cache.invalidate("cus_1");
        let fresh = cache.balances("cus_1", CacheMode::Cached).await.unwrap();
        assert_eq!(fresh[0].balance, 900);
    }

    #[tokio::test]
    async fn bypass_always_reads_through() {
        let cache = cache(Duration::from_secs(60));
        let key = seed(&cache).await;

        cache.balances("cus_1", CacheMode::Cached).await.unwrap();
        cache.ledger().consume(&key, 250, None).await.unwrap();

        let rows = cache.balances("cus_1", CacheMode::Bypass).await.unwrap();
        assert_eq!(rows[0].balance, 750);

        // The bypass refilled the cache with the fresh rows.
        let cached = cache.balances("cus_1", CacheMode::Cached).await.unwrap();
        assert_eq!(cached[0].balance, 750);
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let cache = cache(Duration::from_millis(0));
        let key = seed(&cache).await;

        cache.balances("cus_1", CacheMode::Cached).await.unwrap();
        cache.ledger().consume(&key, 10, None).await.unwrap();

        let rows = cache.balances("cus_1", CacheMode::Cached).await.unwrap();
        assert_eq!(rows[0].balance, 990);
    }
}
