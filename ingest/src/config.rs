use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Upper bound for `upstream.max_retries`. With the 500ms base delay the last
/// retry already waits over eight minutes.
pub const MAX_RETRIES: u32 = 10;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Invalid origin url {0}: {1}")]
    InvalidOriginUrl(String, url::ParseError),

    #[error("Duplicate project id: {0}")]
    DuplicateProject(u64),

    #[error("Project {0} has no public keys")]
    NoPublicKeys(u64),

    #[error("Upstream queue size cannot be 0")]
    EmptyQueue,

    #[error("Upstream concurrency cannot be 0")]
    NoConcurrency,

    #[error("Upstream max_retries cannot exceed {max}, got {0}", max = MAX_RETRIES)]
    TooManyRetries(u32),

    #[error("Unsupported upstream scheme {0}, only http is supported")]
    UnsupportedUpstreamScheme(String),

    #[error("Empty redis url")]
    EmptyRedisUrl,
}

/// Ingest service configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for store, healthcheck and stats requests
    pub listener: Listener,
    /// Public base url of this service. The request path is appended to it
    /// to record where an event was originally submitted.
    pub origin_url: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Projects and the public keys allowed to submit to them
    pub projects: Vec<ProjectConfig>,
    pub upstream: UpstreamConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        Url::parse(&self.origin_url)
            .map_err(|e| ValidationError::InvalidOriginUrl(self.origin_url.clone(), e))?;

        let mut project_ids = HashSet::new();
        for project in &self.projects {
            if !project_ids.insert(project.id) {
                return Err(ValidationError::DuplicateProject(project.id));
            }
            if project.public_keys.is_empty() {
                return Err(ValidationError::NoPublicKeys(project.id));
            }
        }

        if let CacheConfig::Redis { url, .. } = &self.cache
            && url.is_empty()
        {
            return Err(ValidationError::EmptyRedisUrl);
        }

        self.upstream.validate()
    }
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Duplicate suppression settings.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct DedupConfig {
    /// Width of the counting window. Zero or negative disables deduplication.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    /// Occurrences admitted per window before the rest are ignored.
    #[serde(default = "default_max_cache_uses")]
    pub max_cache_uses: i64,
}

impl DedupConfig {
    /// The counting window, or `None` when deduplication is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        u64::try_from(self.ttl_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Highest occurrence count that is still admitted. The first occurrence
    /// in a window is always admitted, so this is never below 1.
    pub fn threshold(&self) -> i64 {
        self.max_cache_uses.max(1)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            ttl_secs: default_ttl_secs(),
            max_cache_uses: default_max_cache_uses(),
        }
    }
}

fn default_ttl_secs() -> i64 {
    60
}

fn default_max_cache_uses() -> i64 {
    1
}

/// Backing store for occurrence counters
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum CacheConfig {
    Memory {
        #[serde(default = "default_purge_interval_secs")]
        purge_interval_secs: u64,
    },
    Redis {
        url: String,
        #[serde(default)]
        key_prefix: String,
        #[serde(default = "default_cache_timeout_ms")]
        timeout_ms: u64,
    },
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory {
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_purge_interval_secs() -> u64 {
    60
}

fn default_cache_timeout_ms() -> u64 {
    100
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub id: u64,
    pub public_keys: Vec<String>,
}

/// Where admitted events are relayed to
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub url: Url,
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum number of relays in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// How long shutdown waits for queued and in-flight relays
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.scheme() != "http" {
            return Err(ValidationError::UnsupportedUpstreamScheme(
                self.url.scheme().to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(ValidationError::EmptyQueue);
        }
        if self.concurrency == 0 {
            return Err(ValidationError::NoConcurrency);
        }
        if self.max_retries > MAX_RETRIES {
            return Err(ValidationError::TooManyRetries(self.max_retries));
        }
        Ok(())
    }
}

fn default_upstream_timeout_secs() -> u64 {
    10
}

fn default_queue_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_concurrency() -> u32 {
    16
}

fn default_drain_timeout_secs() -> u64 {
    10
}
