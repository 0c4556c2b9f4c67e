//! Egress proxy pool.
//!
//! Holds a short-lived cache of active proxies read from the store, picks one
//! per session, and feeds use outcomes and probe results back to the store.
//! The cache is read-only with respect to proxy state: all counters live in
//! the store and are mutated with increment-style updates, and every mutation
//! invalidates the cache.

pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::models::{FAILURE_THRESHOLD, Proxy, ProxyEndpoint};
use crate::store::ProxyStore;

pub use probe::{HttpProber, ProxyProber};

pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    Best,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

struct CachedProxies {
    proxies: Vec<Proxy>,
    fetched_at: Instant,
}

pub struct ProxyPool {
    store: Arc<dyn ProxyStore>,
    prober: Arc<dyn ProxyProber>,
    cache: RwLock<Option<CachedProxies>>,
    ttl: Duration,
}

impl ProxyPool {
    pub fn new(store: Arc<dyn ProxyStore>, prober: Arc<dyn ProxyProber>) -> Self {
        Self {
            store,
            prober,
            cache: RwLock::new(None),
            ttl: CACHE_TTL,
        }
    }

    /// Pick a proxy for one session. `None` means no active proxy exists.
    pub async fn acquire(
        &self,
        strategy: SelectionStrategy,
    ) -> Result<Option<Proxy>, StoreError> {
        let proxies = self.cached_active().await?;
        let Some(proxy) = select(&proxies, strategy).cloned() else {
            tracing::debug!("No active proxies available");
            return Ok(None);
        };

        self.store.touch_last_used(proxy.id).await?;
        tracing::debug!(
            "Acquired proxy {} ({}) score={:.1}",
            proxy.id,
            proxy.endpoint(),
            proxy.score()
        );
        Ok(Some(proxy))
    }

    /// Report how a borrowed proxy performed.
    pub async fn release(&self, proxy_id: i64, outcome: Outcome) -> Result<(), StoreError> {
        let result = match outcome {
            Outcome::Success => self.store.record_success(proxy_id, None).await,
            Outcome::Failure => self
                .store
                .record_failure(proxy_id, FAILURE_THRESHOLD)
                .await
                .map(|deactivated| {
                    if deactivated {
                        tracing::warn!("Proxy {proxy_id} deactivated after repeated failures");
                    }
                }),
        };
        self.invalidate().await;
        result
    }

    /// Probe every active proxy concurrently; returns the number that passed.
    pub async fn health_check_all(&self) -> Result<usize, StoreError> {
        let proxies = self.store.active_proxies().await?;
        tracing::info!("Health-checking {} active proxies", proxies.len());

        let probes = proxies.iter().map(|proxy| self.probe_one(proxy));
        let results = join_all(probes).await;
        self.invalidate().await;

        let mut healthy = 0;
        for result in results {
            if result? {
                healthy += 1;
            }
        }
        tracing::info!("Health check complete: {healthy} healthy");
        Ok(healthy)
    }

    async fn probe_one(&self, proxy: &Proxy) -> Result<bool, StoreError> {
        let endpoint = proxy.endpoint();
        match self.prober.probe(&endpoint).await {
            Ok(response_time) => {
                self.store
                    .record_success(proxy.id, Some(response_time))
                    .await?;
                Ok(true)
            }
            Err(e) => {
                tracing::debug!("Probe failed for proxy {} ({endpoint}): {e}", proxy.id);
                let deactivated = self
                    .store
                    .record_failure(proxy.id, FAILURE_THRESHOLD)
                    .await?;
                if deactivated {
                    tracing::warn!("Proxy {} ({endpoint}) deactivated", proxy.id);
                }
                Ok(false)
            }
        }
    }

    /// Persist proxies without probing them.
    pub async fn import(&self, endpoints: &[ProxyEndpoint]) -> Result<Vec<Proxy>, StoreError> {
        let mut imported = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            imported.push(self.store.insert_proxy(endpoint).await?);
        }
        self.invalidate().await;
        tracing::info!("Imported {} proxies", imported.len());
        Ok(imported)
    }

    /// Probe candidates and persist only the ones that answer.
    pub async fn discover(
        &self,
        candidates: &[ProxyEndpoint],
    ) -> Result<Vec<Proxy>, StoreError> {
        let probes = candidates
            .iter()
            .map(|endpoint| async move { (endpoint, self.prober.probe(endpoint).await) });
        let results = join_all(probes).await;

        let mut added = Vec::new();
        for (endpoint, result) in results {
            match result {
                Ok(response_time) => {
                    let proxy = self.store.insert_proxy(endpoint).await?;
                    self.store
                        .record_success(proxy.id, Some(response_time))
                        .await?;
                    added.push(Proxy {
                        success_count: proxy.success_count + 1,
                        response_time: Some(response_time),
                        ..proxy
                    });
                }
                Err(e) => tracing::info!("Discarding candidate proxy {endpoint}: {e}"),
            }
        }

        self.invalidate().await;
        tracing::info!(
            "Proxy discovery kept {} of {} candidates",
            added.len(),
            candidates.len()
        );
        Ok(added)
    }

    pub async fn list(&self) -> Result<Vec<Proxy>, StoreError> {
        self.store.all_proxies().await
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn cached_active(&self) -> Result<Vec<Proxy>, StoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.ttl
            {
                return Ok(cached.proxies.clone());
            }
        }

        let proxies = self.store.active_proxies().await?;
        *self.cache.write().await = Some(CachedProxies {
            proxies: proxies.clone(),
            fetched_at: Instant::now(),
        });
        Ok(proxies)
    }
}

/// Pure selection over an ordered proxy list.
pub fn select(proxies: &[Proxy], strategy: SelectionStrategy) -> Option<&Proxy> {
    match strategy {
        SelectionStrategy::Best => {
            let mut best: Option<&Proxy> = None;
            for proxy in proxies {
                // Strict comparison keeps the earliest proxy on ties.
                if best.is_none_or(|b| proxy.score() > b.score()) {
                    best = Some(proxy);
                }
            }
            best
        }
        SelectionStrategy::Random => proxies.choose(&mut rand::rng()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::MockProber;

    fn endpoint(host: &str) -> ProxyEndpoint {
        ProxyEndpoint::parse(&format!("{host}:8080")).unwrap()
    }

    async fn pool_with(hosts: &[&str], prober: MockProber) -> (Arc<MemoryStore>, ProxyPool) {
        let store = Arc::new(MemoryStore::new());
        for host in hosts {
            store.insert_proxy(&endpoint(host)).await.unwrap();
        }
        let pool = ProxyPool::new(store.clone(), Arc::new(prober));
        (store, pool)
    }

    #[tokio::test]
    async fn best_prefers_highest_score_and_first_on_ties() {
        let (store, pool) = pool_with(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], MockProber::new()).await;

        // No history anywhere: all score 50, first in store order wins.
        let picked = pool.acquire(SelectionStrategy::Best).await.unwrap().unwrap();
        assert_eq!(picked.host, "10.0.0.1");

        store.record_success(2, Some(0.5)).await.unwrap();
        pool.invalidate().await;
        let picked = pool.acquire(SelectionStrategy::Best).await.unwrap().unwrap();
        assert_eq!(picked.host, "10.0.0.2");
        assert!(store.proxy(2).unwrap().last_used.is_some());
    }

    #[tokio::test]
    async fn empty_pool_yields_none() {
        let (_store, pool) = pool_with(&[], MockProber::new()).await;
        assert!(pool.acquire(SelectionStrategy::Best).await.unwrap().is_none());
        assert!(pool.acquire(SelectionStrategy::Random).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn random_only_returns_active_proxies() {
        let (store, pool) = pool_with(&["10.0.0.1", "10.0.0.2"], MockProber::new()).await;
        store.deactivate(1).await.unwrap();
        for _ in 0..20 {
            let picked = pool.acquire(SelectionStrategy::Random).await.unwrap().unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires_after_ttl() {
        let (store, pool) = pool_with(&["10.0.0.1"], MockProber::new()).await;
        assert_eq!(pool.cached_active().await.unwrap().len(), 1);

        // Written behind the pool's back: invisible until the TTL lapses.
        store.insert_proxy(&endpoint("10.0.0.9")).await.unwrap();
        assert_eq!(pool.cached_active().await.unwrap().len(), 1);

        tokio::time::advance(CACHE_TTL + Duration::from_secs(1)).await;
        assert_eq!(pool.cached_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn release_records_outcome_and_invalidates() {
        let (store, pool) = pool_with(&["10.0.0.1"], MockProber::new()).await;
        pool.acquire(SelectionStrategy::Best).await.unwrap();

        pool.release(1, Outcome::Success).await.unwrap();
        pool.release(1, Outcome::Failure).await.unwrap();

        let proxy = store.proxy(1).unwrap();
        assert_eq!(proxy.success_count, 1);
        assert_eq!(proxy.failure_count, 1);
        assert!(pool.cache.read().await.is_none());
    }

    #[tokio::test]
    async fn five_failed_probes_deactivate_a_fresh_proxy() {
        let prober = MockProber::new().failing("10.0.0.2");
        let (store, pool) = pool_with(&["10.0.0.1", "10.0.0.2"], prober).await;

        for round in 1..=5 {
            let healthy = pool.health_check_all().await.unwrap();
            assert_eq!(healthy, 1);
            let bad = store.proxy(2).unwrap();
            assert_eq!(bad.failure_count, round);
            assert_eq!(bad.is_active, round < 5);
        }

        let good = store.proxy(1).unwrap();
        assert_eq!(good.success_count, 5);
        assert!(good.response_time.is_some());
        assert_eq!(pool.health_check_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn discover_keeps_only_healthy_candidates() {
        let prober = MockProber::new().failing("10.0.0.7");
        let (store, pool) = pool_with(&[], prober).await;

        let added = pool
            .discover(&[endpoint("10.0.0.6"), endpoint("10.0.0.7")])
            .await
            .unwrap();

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].host, "10.0.0.6");
        assert_eq!(added[0].success_count, 1);
        assert_eq!(store.all_proxies().await.unwrap().len(), 1);
    }
}
