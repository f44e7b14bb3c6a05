use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Score a single provider reported for a single address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationResult {
    pub source_address: IpAddr,
    pub provider_name: String,
    /// Maliciousness score in [0, 100]
    pub score: f64,
    pub is_malicious: bool,
    pub fetched_at: DateTime<Utc>,
    /// How long the result may be served from cache
    #[serde(with = "ttl_seconds")]
    pub ttl: Duration,
}

impl ReputationResult {
    /// Whether the result is still within its TTL at `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }
}

mod ttl_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(ttl.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(d)?))
    }
}
