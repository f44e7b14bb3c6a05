//! Process-scoped reputation cache
//!
//! Entries are keyed by `(provider, address)`. Each key owns an async mutex
//! that is held across the fetch, so concurrent jobs asking for the same key
//! wait for the first fetch instead of issuing their own. The outer map lock
//! is only held long enough to find or create the key slot. Stale entries and
//! the empty slots failed fetches leave behind are evicted when a lookup
//! starts.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{ProviderError, ProviderVerdict};
use crate::models::ReputationResult;

type CacheKey = (String, IpAddr);
type Slot = Arc<Mutex<Option<ReputationResult>>>;

pub struct ReputationCache {
    ttl: Duration,
    slots: RwLock<HashMap<CacheKey, Slot>>,
}

impl ReputationCache {
    pub fn new(ttl: Duration) -> Self {
        ReputationCache {
            ttl,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn slot(&self, provider: &str, address: IpAddr) -> Slot {
        let key = (provider.to_string(), address);
        if let Some(slot) = self.slots.read().await.get(&key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key).or_default())
    }

    /// Serve a fresh cached result, or run `fetch` while holding the key.
    ///
    /// Failed fetches are not cached; the next caller retries.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        provider: &str,
        address: IpAddr,
        fetch: F,
    ) -> Result<ReputationResult, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProviderVerdict, ProviderError>>,
    {
        let slot = self.slot(provider, address).await;
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref().filter(|r| r.is_fresh()) {
            log::debug!("Reputation cache hit for {} via {}", address, provider);
            return Ok(cached.clone());
        }

        let verdict = fetch().await?;
        let result = ReputationResult {
            source_address: address,
            provider_name: provider.to_string(),
            score: verdict.score.clamp(0.0, 100.0),
            is_malicious: verdict.is_malicious,
            fetched_at: Utc::now(),
            ttl: self.ttl,
        };
        *entry = Some(result.clone());
        Ok(result)
    }

    /// Fresh cached result without fetching
    pub async fn get(&self, provider: &str, address: IpAddr) -> Option<ReputationResult> {
        let slot = self
            .slots
            .read()
            .await
            .get(&(provider.to_string(), address))
            .cloned()?;
        let entry = slot.lock().await;
        entry.as_ref().filter(|r| r.is_fresh()).cloned()
    }

    /// Drop stale and empty entries.
    ///
    /// Slots are handed out only under the map lock, so a slot whose `Arc`
    /// is held solely by the map has no caller waiting on it and can go.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry.as_ref().is_some_and(|r| r.is_fresh_at(now)),
                Err(_) => true,
            }
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            log::debug!("Evicted {} expired reputation entries", evicted);
        }
        evicted
    }

    /// Number of settled entries holding a result
    pub async fn len(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.try_lock().is_ok_and(|entry| entry.is_some()))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys in the map, including empty slots left by failed fetches
    pub async fn key_count(&self) -> usize {
        self.slots.read().await.len()
    }
}
