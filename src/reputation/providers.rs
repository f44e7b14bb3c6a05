//! HTTP reputation providers

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{ProviderError, ProviderVerdict, ReputationProvider};
use crate::config::{AbuseIpDbConfig, BlocklistConfig, ReputationConfig, VirusTotalConfig};
use crate::normalizer::parse_address;

/// Score above which a keyed provider flags an address malicious
const MALICIOUS_SCORE: f64 = 50.0;

fn http_client() -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("loglens/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Read an API key from config, falling back to an environment variable
fn api_key(configured: &Option<String>, env_var: &str) -> Option<String> {
    configured
        .clone()
        .or_else(|| std::env::var(env_var).ok())
        .filter(|key| !key.trim().is_empty())
}

/// Build the provider set: keyed providers when keys are available, and the
/// public blocklists when no keyed provider could be registered
pub fn providers_from_config(
    config: &ReputationConfig,
) -> Result<Vec<Arc<dyn ReputationProvider>>, ProviderError> {
    let client = http_client()?;
    let mut providers: Vec<Arc<dyn ReputationProvider>> = Vec::new();

    if let Some(key) = api_key(&config.abuseipdb.api_key, "ABUSEIPDB_API_KEY") {
        providers.push(Arc::new(AbuseIpDb::new(client.clone(), key, &config.abuseipdb)));
    }
    if let Some(key) = api_key(&config.virustotal.api_key, "VIRUSTOTAL_API_KEY") {
        providers.push(Arc::new(VirusTotal::new(client.clone(), key, &config.virustotal)));
    }
    if providers.is_empty() || config.blocklist.always_enabled {
        providers.push(Arc::new(Blocklist::new(client, &config.blocklist)));
    }

    let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
    log::info!("Reputation providers: {}", names.join(", "));
    Ok(providers)
}

/// AbuseIPDB v2 `check` endpoint
pub struct AbuseIpDb {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_age_days: u32,
}

impl AbuseIpDb {
    pub fn new(client: reqwest::Client, api_key: String, config: &AbuseIpDbConfig) -> Self {
        AbuseIpDb {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_age_days: config.max_age_days,
        }
    }
}

#[async_trait]
impl ReputationProvider for AbuseIpDb {
    fn name(&self) -> &str {
        "abuseipdb"
    }

    async fn fetch(&self, address: IpAddr) -> Result<ProviderVerdict, ProviderError> {
        let body: Value = self
            .client
            .get(format!("{}/check", self.base_url))
            .query(&[
                ("ipAddress", address.to_string()),
                ("maxAgeInDays", self.max_age_days.to_string()),
            ])
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        abuseipdb_verdict(&body)
    }
}

fn abuseipdb_verdict(body: &Value) -> Result<ProviderVerdict, ProviderError> {
    let score = body
        .pointer("/data/abuseConfidenceScore")
        .and_then(Value::as_f64)
        .ok_or_else(|| ProviderError::InvalidResponse("missing abuseConfidenceScore".to_string()))?;
    Ok(ProviderVerdict {
        score,
        is_malicious: score > MALICIOUS_SCORE,
    })
}

/// VirusTotal v3 IP address report
pub struct VirusTotal {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl VirusTotal {
    pub fn new(client: reqwest::Client, api_key: String, config: &VirusTotalConfig) -> Self {
        VirusTotal {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ReputationProvider for VirusTotal {
    fn name(&self) -> &str {
        "virustotal"
    }

    async fn fetch(&self, address: IpAddr) -> Result<ProviderVerdict, ProviderError> {
        let body: Value = self
            .client
            .get(format!("{}/ip_addresses/{}", self.base_url, address))
            .header("x-apikey", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        virustotal_verdict(&body)
    }
}

fn virustotal_verdict(body: &Value) -> Result<ProviderVerdict, ProviderError> {
    let stats = body
        .pointer("/data/attributes/last_analysis_stats")
        .and_then(Value::as_object)
        .ok_or_else(|| ProviderError::InvalidResponse("missing last_analysis_stats".to_string()))?;

    let count = |key: &str| stats.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let malicious = count("malicious");
    let suspicious = count("suspicious");
    let total: f64 = stats.values().filter_map(Value::as_f64).sum();

    let score = if total > 0.0 {
        ((2.0 * malicious + suspicious) / total * 100.0).min(100.0)
    } else {
        0.0
    };
    Ok(ProviderVerdict {
        score,
        is_malicious: malicious > 0.0 && score > MALICIOUS_SCORE,
    })
}

/// Public IP blocklists, downloaded once per process
pub struct Blocklist {
    client: reqwest::Client,
    urls: Vec<String>,
    listed_score: f64,
    listed: OnceCell<HashSet<IpAddr>>,
}

impl Blocklist {
    pub fn new(client: reqwest::Client, config: &BlocklistConfig) -> Self {
        Blocklist {
            client,
            urls: config.urls.clone(),
            listed_score: config.listed_score,
            listed: OnceCell::new(),
        }
    }

    /// Download every list; fails only when no list could be fetched
    async fn download(&self) -> Result<HashSet<IpAddr>, ProviderError> {
        let mut listed = HashSet::new();
        let mut fetched = 0;
        for url in &self.urls {
            match self.fetch_list(url).await {
                Ok(body) => {
                    let before = listed.len();
                    listed.extend(parse_blocklist(&body));
                    fetched += 1;
                    log::info!("Loaded {} addresses from {}", listed.len() - before, url);
                }
                Err(e) => log::warn!("Failed to download blocklist {}: {}", url, e),
            }
        }
        if fetched == 0 {
            return Err(ProviderError::Unavailable(
                "no blocklist could be downloaded".to_string(),
            ));
        }
        Ok(listed)
    }

    async fn fetch_list(&self, url: &str) -> Result<String, ProviderError> {
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }

    fn verdict(&self, listed: &HashSet<IpAddr>, address: IpAddr) -> ProviderVerdict {
        if listed.contains(&address) {
            ProviderVerdict {
                score: self.listed_score,
                is_malicious: true,
            }
        } else {
            ProviderVerdict {
                score: 0.0,
                is_malicious: false,
            }
        }
    }
}

#[async_trait]
impl ReputationProvider for Blocklist {
    fn name(&self) -> &str {
        "blocklist"
    }

    async fn fetch(&self, address: IpAddr) -> Result<ProviderVerdict, ProviderError> {
        // A failed download leaves the cell empty, so the next lookup retries
        let listed = self.listed.get_or_try_init(|| self.download()).await?;
        Ok(self.verdict(listed, address))
    }
}

/// Addresses from a blocklist body: first token per line, `#` comments skipped
fn parse_blocklist(body: &str) -> impl Iterator<Item = IpAddr> + '_ {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(parse_address)
}
