//! Admission decision for store requests.
//!
//! A request is first checked against the known projects. Valid requests have
//! their body decoded and grouped, and the occurrence counter for that group
//! is bumped. Occurrences up to the configured threshold are admitted and
//! handed to the delivery queue; the rest of the window is ignored.
//!
//! Failures past validation never reject a submission: when the content can
//! not be grouped or the cache is unreachable the event is admitted with a
//! count of 0.

use crate::auth::SentryAuth;
use crate::body::decode_body;
use crate::cache::{AdmissionCache, CacheError};
use crate::config::DedupConfig;
use crate::delivery::DeliveryQueue;
use crate::errors::{IngestError, Result};
use crate::event::Event;
use crate::grouping::GroupingOracle;
use crate::metrics_defs::{
    CACHE_UNAVAILABLE, EVENTS_IGNORED, EVENTS_PROCESSED, EVENTS_REJECTED, GROUPING_FAILURES,
};
use crate::projects::ProjectValidator;
use crate::stats::{StatsRegister, StatsSnapshot};
use http::Request;
use http::request::Parts;
use hyper::body::Bytes;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    Processed,
    Ignored,
}

impl AdmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionStatus::Processed => "PROCESSED",
            AdmissionStatus::Ignored => "IGNORED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub status: AdmissionStatus,
    /// Occurrences of this content in the current window, this one included.
    /// 0 when nothing was counted.
    pub count: i64,
}

pub struct IngestionController {
    projects: Arc<dyn ProjectValidator>,
    grouping: Arc<dyn GroupingOracle>,
    cache: Arc<dyn AdmissionCache>,
    stats: Arc<dyn StatsRegister>,
    delivery: Arc<dyn DeliveryQueue>,
    dedup: DedupConfig,
    origin_url: String,
}

impl IngestionController {
    pub fn new(
        projects: Arc<dyn ProjectValidator>,
        grouping: Arc<dyn GroupingOracle>,
        cache: Arc<dyn AdmissionCache>,
        stats: Arc<dyn StatsRegister>,
        delivery: Arc<dyn DeliveryQueue>,
        dedup: DedupConfig,
        origin_url: String,
    ) -> Self {
        IngestionController {
            projects,
            grouping,
            cache,
            stats,
            delivery,
            dedup,
            origin_url,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Decides whether a store request is admitted.
    pub async fn ingest(&self, project_id: u64, request: Request<Bytes>) -> Result<Admission> {
        let (parts, body) = request.into_parts();
        self.validate(project_id, &parts).await?;
        Ok(self.admit(project_id, parts, body).await)
    }

    /// Checks the project and public key of a store request.
    ///
    /// Only needs the request head, so callers can reject a submission before
    /// reading its body. Nothing is counted or queued for a rejected request.
    pub async fn validate(&self, project_id: u64, parts: &Parts) -> Result<()> {
        let auth = SentryAuth::from_parts(parts.uri.query(), &parts.headers);
        if !self
            .projects
            .is_valid(project_id, auth.key.as_deref())
            .await
        {
            counter!(EVENTS_REJECTED, "reason" => "invalid_project").increment(1);
            return Err(IngestError::ProjectNotFound(project_id));
        }
        Ok(())
    }

    /// Counts a validated submission and queues it when under the threshold.
    pub async fn admit(&self, project_id: u64, parts: Parts, raw_body: Bytes) -> Admission {
        let body = decode_body(raw_body);
        let count = self.occurrences(project_id, &body).await;

        let status = if count <= self.dedup.threshold() {
            AdmissionStatus::Processed
        } else {
            AdmissionStatus::Ignored
        };

        match status {
            AdmissionStatus::Processed => {
                self.stats.record_processed();
                counter!(EVENTS_PROCESSED).increment(1);

                let event = Event::from_request(project_id, &parts, &self.origin_url, body);
                self.delivery.put(project_id, event);
            }
            AdmissionStatus::Ignored => {
                self.stats.record_ignored();
                counter!(EVENTS_IGNORED).increment(1);
            }
        }

        tracing::debug!(project_id, count, status = status.as_str(), "Event admission");

        Admission { status, count }
    }

    /// Bumps and returns the counter for this content, or 0 when nothing
    /// could be counted.
    async fn occurrences(&self, project_id: u64, body: &[u8]) -> i64 {
        let Some(ttl) = self.dedup.ttl() else {
            return 0;
        };

        let identifier = match self.grouping.hash(body) {
            Ok(identifier) => identifier,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "Failed to group event");
                counter!(GROUPING_FAILURES).increment(1);
                return 0;
            }
        };

        let key = format!("{project_id}{identifier}");
        tracing::debug!(%key, "Admission cache key");

        match self.bump(&key, ttl).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "Admission cache unavailable");
                counter!(CACHE_UNAVAILABLE).increment(1);
                0
            }
        }
    }

    async fn bump(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        if self.cache.get(key).await? == 0 {
            // Racing callers share whichever entry wins
            self.cache.set_if_absent(key, ttl).await?;
        }
        self.cache.increment_and_get(key).await
    }
}
