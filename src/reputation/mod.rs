//! Reputation aggregation
//!
//! Fans out one lookup per `(provider, address)` pair. Lookups share a
//! process-wide [`ReputationCache`], a semaphore bounding network calls in
//! flight, and a per-call timeout. A provider that fails or times out
//! contributes nothing for that address; it never fails the job.

pub mod cache;
pub mod providers;

pub use cache::ReputationCache;
pub use providers::{providers_from_config, AbuseIpDb, Blocklist, VirusTotal};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ReputationConfig;
use crate::models::ReputationResult;

/// Errors a provider lookup can end in; all are treated as "no signal"
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider {provider} timed out after {after_ms} ms")]
    Timeout { provider: String, after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// What a provider says about one address
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderVerdict {
    /// Maliciousness score in [0, 100]
    pub score: f64,
    pub is_malicious: bool,
}

/// An external reputation signal source
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    /// Stable name used as the cache key and in `per_source_scores`
    fn name(&self) -> &str;

    async fn fetch(&self, address: IpAddr) -> Result<ProviderVerdict, ProviderError>;
}

/// Outcome of one reputation stage
#[derive(Debug, Clone, Default)]
pub struct ReputationReport {
    /// address -> provider -> result
    pub results: BTreeMap<IpAddr, BTreeMap<String, ReputationResult>>,
    /// Lookups that failed or timed out
    pub failures: usize,
    /// Lookups issued (addresses x providers)
    pub attempted: usize,
}

impl ReputationReport {
    /// Every lookup failed, so scoring must fall back to anomaly signals
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failures >= self.attempted
    }

    pub fn for_address(&self, address: &IpAddr) -> Option<&BTreeMap<String, ReputationResult>> {
        self.results.get(address)
    }
}

pub struct ReputationAggregator {
    providers: Vec<Arc<dyn ReputationProvider>>,
    cache: Arc<ReputationCache>,
    limiter: Arc<Semaphore>,
    call_timeout: Duration,
}

impl ReputationAggregator {
    pub fn new(
        providers: Vec<Arc<dyn ReputationProvider>>,
        cache: Arc<ReputationCache>,
        max_concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        ReputationAggregator {
            providers,
            cache,
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
            call_timeout,
        }
    }

    /// Aggregator with the HTTP providers the configuration enables
    pub fn from_config(
        config: &ReputationConfig,
        cache: Arc<ReputationCache>,
    ) -> Result<Self, ProviderError> {
        Ok(Self::new(
            providers_from_config(config)?,
            cache,
            config.max_concurrency,
            Duration::from_millis(config.provider_timeout_ms),
        ))
    }

    /// Shared cache with the configured TTL
    pub fn cache_from_config(config: &ReputationConfig) -> Arc<ReputationCache> {
        Arc::new(ReputationCache::new(ChronoDuration::seconds(
            config.cache_ttl_seconds,
        )))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn cache(&self) -> &Arc<ReputationCache> {
        &self.cache
    }

    /// Look up every address with every provider and wait for all to settle
    pub async fn lookup(&self, addresses: &BTreeSet<IpAddr>) -> ReputationReport {
        self.cache.evict_expired().await;

        let mut report = ReputationReport::default();
        let mut tasks = JoinSet::new();

        for &address in addresses {
            for provider in &self.providers {
                report.attempted += 1;
                let provider = Arc::clone(provider);
                let cache = Arc::clone(&self.cache);
                let limiter = Arc::clone(&self.limiter);
                let call_timeout = self.call_timeout;

                tasks.spawn(async move {
                    let name = provider.name().to_string();
                    let result = cache
                        .get_or_fetch(&name, address, || {
                            fetch_limited(provider.as_ref(), address, &limiter, call_timeout)
                        })
                        .await;
                    (name, address, result)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, address, Ok(result))) => {
                    report
                        .results
                        .entry(address)
                        .or_default()
                        .insert(result.provider_name.clone(), result);
                }
                Ok((provider, address, Err(e))) => {
                    report.failures += 1;
                    log::warn!("Reputation lookup for {} via {} failed: {}", address, provider, e);
                }
                Err(e) => {
                    report.failures += 1;
                    log::error!("Reputation lookup task failed: {}", e);
                }
            }
        }

        log::info!(
            "Reputation stage: {} lookups, {} failed, {} addresses scored",
            report.attempted,
            report.failures,
            report.results.len()
        );
        report
    }
}

/// Cache-miss path: take a permit, then call the provider under the timeout
async fn fetch_limited(
    provider: &dyn ReputationProvider,
    address: IpAddr,
    limiter: &Semaphore,
    call_timeout: Duration,
) -> Result<ProviderVerdict, ProviderError> {
    let _permit = limiter
        .acquire()
        .await
        .map_err(|_| ProviderError::Unavailable("lookup limiter closed".to_string()))?;

    match tokio::time::timeout(call_timeout, provider.fetch(address)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            provider: provider.name().to_string(),
            after_ms: call_timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed verdict per address, counting calls and tracking peak concurrency
    struct FakeProvider {
        name: &'static str,
        scores: BTreeMap<IpAddr, (f64, bool)>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeProvider {
        fn new(name: &'static str, scores: &[(&str, f64, bool)], delay_ms: u64) -> Self {
            FakeProvider {
                name,
                scores: scores
                    .iter()
                    .map(|(ip, s, m)| (IpAddr::from_str(ip).unwrap(), (*s, *m)))
                    .collect(),
                delay: Duration::from_millis(delay_ms),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReputationProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, address: IpAddr) -> Result<ProviderVerdict, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let (score, is_malicious) = self.scores.get(&address).copied().unwrap_or((0.0, false));
            Ok(ProviderVerdict { score, is_malicious })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ReputationProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn fetch(&self, _address: IpAddr) -> Result<ProviderVerdict, ProviderError> {
            Err(ProviderError::Unavailable("connection refused".to_string()))
        }
    }

    fn addresses(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().map(|ip| IpAddr::from_str(ip).unwrap()).collect()
    }

    fn shared(provider: &Arc<FakeProvider>) -> Arc<dyn ReputationProvider> {
        provider.clone()
    }

    fn cache() -> Arc<ReputationCache> {
        Arc::new(ReputationCache::new(ChronoDuration::hours(24)))
    }

    #[tokio::test]
    async fn test_merges_results_per_address() {
        let good = Arc::new(FakeProvider::new("good", &[("10.0.0.50", 90.0, true)], 0));
        let aggregator = ReputationAggregator::new(
            vec![shared(&good), Arc::new(FailingProvider) as Arc<dyn ReputationProvider>],
            cache(),
            4,
            Duration::from_secs(1),
        );

        let report = aggregator.lookup(&addresses(&["10.0.0.50", "10.0.0.7"])).await;
        assert_eq!(report.attempted, 4);
        assert_eq!(report.failures, 2);
        assert!(!report.all_failed());

        let scores = report.for_address(&IpAddr::from_str("10.0.0.50").unwrap()).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores["good"].score, 90.0);
        assert!(scores["good"].is_malicious);
    }

    #[tokio::test]
    async fn test_cache_idempotent_within_ttl() {
        let provider = Arc::new(FakeProvider::new("counting", &[("1.1.1.1", 40.0, false)], 5));
        let aggregator =
            ReputationAggregator::new(vec![shared(&provider)], cache(), 4, Duration::from_secs(1));
        let set = addresses(&["1.1.1.1", "2.2.2.2"]);

        let first = aggregator.lookup(&set).await;
        let second = aggregator.lookup(&set).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.results, second.results);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_single_flight() {
        let provider = Arc::new(FakeProvider::new("slow", &[("3.3.3.3", 60.0, true)], 50));
        let store = cache();
        let a = ReputationAggregator::new(vec![shared(&provider)], store.clone(), 4, Duration::from_secs(1));
        let b = ReputationAggregator::new(vec![shared(&provider)], store, 4, Duration::from_secs(1));
        let set = addresses(&["3.3.3.3"]);

        let (ra, rb) = tokio::join!(a.lookup(&set), b.lookup(&set));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ra.results, rb.results);
    }

    #[tokio::test]
    async fn test_timeout_is_isolated() {
        let slow = Arc::new(FakeProvider::new("slow", &[("4.4.4.4", 99.0, true)], 2_000));
        let fast = Arc::new(FakeProvider::new("fast", &[("4.4.4.4", 20.0, false)], 0));
        let aggregator = ReputationAggregator::new(
            vec![shared(&slow), shared(&fast)],
            cache(),
            4,
            Duration::from_millis(50),
        );

        let report = aggregator.lookup(&addresses(&["4.4.4.4"])).await;
        assert_eq!(report.failures, 1);
        let scores = report.for_address(&IpAddr::from_str("4.4.4.4").unwrap()).unwrap();
        assert!(scores.contains_key("fast"));
        assert!(!scores.contains_key("slow"));
        // Timeouts are not cached
        assert!(aggregator.cache().get("slow", IpAddr::from_str("4.4.4.4").unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let provider = Arc::new(FakeProvider::new("bounded", &[], 20));
        let aggregator =
            ReputationAggregator::new(vec![shared(&provider)], cache(), 2, Duration::from_secs(5));
        let many: Vec<String> = (1..=10).map(|i| format!("10.1.0.{}", i)).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();

        let report = aggregator.lookup(&addresses(&refs)).await;
        assert_eq!(report.failures, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 10);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_lookup_evicts_stale_entries() {
        let provider = Arc::new(FakeProvider::new("short", &[], 0));
        let store = Arc::new(ReputationCache::new(ChronoDuration::zero()));
        let aggregator = ReputationAggregator::new(
            vec![shared(&provider), Arc::new(FailingProvider) as Arc<dyn ReputationProvider>],
            store.clone(),
            4,
            Duration::from_secs(1),
        );

        aggregator.lookup(&addresses(&["7.7.7.1", "7.7.7.2"])).await;
        // One settled and one empty slot per address
        assert_eq!(store.key_count().await, 4);

        aggregator.lookup(&addresses(&["7.7.7.3"])).await;
        assert_eq!(store.key_count().await, 2);
        assert_eq!(store.len().await, 1);
        assert!(store.get("short", IpAddr::from_str("7.7.7.1").unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_all_failed_is_degraded() {
        let aggregator = ReputationAggregator::new(
            vec![Arc::new(FailingProvider) as Arc<dyn ReputationProvider>],
            cache(),
            4,
            Duration::from_secs(1),
        );
        let report = aggregator.lookup(&addresses(&["5.5.5.5", "6.6.6.6"])).await;
        assert!(report.all_failed());
        assert!(report.results.is_empty());

        let empty = aggregator.lookup(&BTreeSet::new()).await;
        assert!(!empty.all_failed());
    }
}
