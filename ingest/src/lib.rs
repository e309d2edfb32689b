pub mod auth;
pub mod body;
pub mod cache;
pub mod clock;
pub mod config;
pub mod controller;
pub mod delivery;
pub mod errors;
pub mod event;
pub mod grouping;
pub mod http;
pub mod metrics_defs;
pub mod projects;
pub mod service;
pub mod stats;

#[cfg(test)]
mod testutils;

use crate::cache::build_cache;
use crate::clock::SystemClock;
use crate::controller::IngestionController;
use crate::delivery::UpstreamDelivery;
use crate::errors::IngestError;
use crate::grouping::EventGrouping;
use crate::projects::StaticProjects;
use crate::service::IngestService;
use crate::stats::AtomicStats;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Serves store requests until `shutdown` resolves, then waits up to
/// `upstream.drain_timeout_secs` for queued events to be relayed.
pub async fn run(
    config: config::Config,
    shutdown: impl Future<Output = ()>,
) -> Result<(), IngestError> {
    config.validate()?;

    let window = config.dedup.ttl().unwrap_or(Duration::ZERO);
    let cache = build_cache(&config.cache, Arc::new(SystemClock), window).await?;

    let (delivery, worker) = UpstreamDelivery::new(&config.upstream);
    let (stop_worker, worker_stopped) = oneshot::channel::<()>();
    let worker_handle = tokio::spawn(worker.run(async move {
        // A dropped sender stops the worker as well
        let _ = worker_stopped.await;
    }));

    let controller = IngestionController::new(
        Arc::new(StaticProjects::new(&config.projects)),
        Arc::new(EventGrouping),
        cache,
        Arc::new(AtomicStats::new()),
        Arc::new(delivery),
        config.dedup,
        config.origin_url.clone(),
    );

    tracing::info!(
        projects = config.projects.len(),
        ttl_secs = config.dedup.ttl_secs,
        max_cache_uses = config.dedup.max_cache_uses,
        upstream = %config.upstream.url,
        "Starting ingest service"
    );

    let service = IngestService::new(Arc::new(controller), config.max_body_bytes);
    let result = tokio::select! {
        result = run_http_service(&config.listener.host, config.listener.port, service) => result,
        () = shutdown => {
            tracing::info!("Shutting down ingest service");
            Ok(())
        }
    };

    let _ = stop_worker.send(());
    let drain_timeout = Duration::from_secs(config.upstream.drain_timeout_secs);
    match timeout(drain_timeout, worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "Delivery worker failed"),
        Err(_) => tracing::warn!(
            ?drain_timeout,
            "Delivery queue not drained in time, dropping remaining events"
        ),
    }

    result
}
