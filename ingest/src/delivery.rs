//! Fire-and-forget relay of admitted events.
//!
//! `UpstreamDelivery::put` never blocks the request path. Events go into a
//! bounded queue and are dropped with a warning when it is full. A single
//! `DeliveryWorker` drains the queue and relays up to `concurrency` events at
//! once, retrying transient failures with exponential backoff. On shutdown the
//! queue is closed and whatever it already holds is still relayed.

use crate::config::UpstreamConfig;
use crate::event::Event;
use crate::http::{send_to_upstream, upstream_request};
use crate::metrics_defs::{
    DELIVERY_DELIVERED, DELIVERY_DROPPED, DELIVERY_DURATION, DELIVERY_ENQUEUED, DELIVERY_FAILED,
};
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use url::Url;

const BASE_DELAY: Duration = Duration::from_millis(500);

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("invalid origin url {0}: {1}")]
    InvalidOriginUrl(String, url::ParseError),

    #[error("failed to build upstream request: {0}")]
    Build(#[from] http::Error),

    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read upstream response: {0}")]
    ResponseBody(String),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("upstream answered {0}")]
    UpstreamStatus(StatusCode),

    #[error("unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),
}

impl DeliveryError {
    pub(crate) fn is_retriable(&self) -> bool {
        match self {
            DeliveryError::Request(_) | DeliveryError::Timeout(_) => true,
            DeliveryError::UpstreamStatus(status) => RETRIABLE_STATUS_CODES.contains(status),
            _ => false,
        }
    }
}

/// Accepts admitted events for asynchronous delivery.
pub trait DeliveryQueue: Send + Sync {
    /// Hands the event over. Returns immediately; delivery failures are
    /// never reported back to the caller.
    fn put(&self, project_id: u64, event: Event);
}

pub struct UpstreamDelivery {
    tx: mpsc::Sender<Event>,
}

impl UpstreamDelivery {
    /// Creates the queue and the worker draining it. The worker does nothing
    /// until `DeliveryWorker::run` is spawned.
    pub fn new(config: &UpstreamConfig) -> (Self, DeliveryWorker) {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let relay = Relay {
            client,
            upstream_url: config.url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            base_delay: BASE_DELAY,
        };

        let worker = DeliveryWorker {
            rx,
            relay,
            permits: Arc::new(Semaphore::new(config.concurrency as usize)),
            concurrency: config.concurrency,
        };

        (UpstreamDelivery { tx }, worker)
    }
}

impl DeliveryQueue for UpstreamDelivery {
    fn put(&self, project_id: u64, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => counter!(DELIVERY_ENQUEUED).increment(1),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(project_id, "Delivery queue full, dropping event");
                counter!(DELIVERY_DROPPED, "reason" => "full").increment(1);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!(project_id, "Delivery worker stopped, dropping event");
                counter!(DELIVERY_DROPPED, "reason" => "closed").increment(1);
            }
        }
    }
}

#[derive(Clone)]
struct Relay {
    client: Client<HttpConnector, Full<Bytes>>,
    upstream_url: Url,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
}

impl Relay {
    async fn deliver(&self, event: &Event) -> Result<StatusCode, DeliveryError> {
        let mut retries = 0;

        loop {
            let request = upstream_request(&self.upstream_url, event)?;

            match send_to_upstream(&self.client, request, self.timeout).await {
                Err(err) if err.is_retriable() && retries < self.max_retries => {
                    let delay = backoff_delay(self.base_delay, retries);
                    tracing::debug!(
                        project_id = event.project_id(),
                        error = %err,
                        ?delay,
                        "Retrying delivery"
                    );
                    sleep(delay).await;
                    retries += 1;
                }
                result => return result,
            }
        }
    }
}

/// Doubles `base` for every retry already made.
fn backoff_delay(base: Duration, retries: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(retries))
}

pub struct DeliveryWorker {
    rx: mpsc::Receiver<Event>,
    relay: Relay,
    permits: Arc<Semaphore>,
    concurrency: u32,
}

impl DeliveryWorker {
    /// Relays queued events until `shutdown` resolves or every
    /// `UpstreamDelivery` handle is dropped.
    ///
    /// Once `shutdown` resolves the queue stops accepting events, but the ones
    /// already queued are relayed. Returns when the last relay has finished.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut closing = false;

        loop {
            let event = tokio::select! {
                event = self.rx.recv() => event,
                () = &mut shutdown, if !closing => {
                    tracing::info!(queued = self.rx.len(), "Draining delivery queue");
                    closing = true;
                    self.rx.close();
                    continue;
                }
            };
            let Some(event) = event else {
                break;
            };

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let relay = self.relay.clone();

            tokio::spawn(async move {
                let start = Instant::now();
                match relay.deliver(&event).await {
                    Ok(status) => {
                        counter!(DELIVERY_DELIVERED).increment(1);
                        tracing::debug!(
                            project_id = event.project_id(),
                            %status,
                            "Event delivered"
                        );
                    }
                    Err(err) => {
                        counter!(DELIVERY_FAILED).increment(1);
                        tracing::error!(
                            project_id = event.project_id(),
                            error = %err,
                            "Failed to deliver event"
                        );
                    }
                }
                histogram!(DELIVERY_DURATION).record(start.elapsed().as_secs_f64());
                drop(permit);
            });
        }

        // Every permit is back once in-flight relays are done
        let _ = self.permits.acquire_many(self.concurrency).await;
        tracing::info!("Delivery queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Headers;
    use crate::testutils::start_upstream;
    use http::Method;
    use tokio::sync::oneshot;

    fn event(project_id: u64) -> Event {
        let mut headers = Headers::new();
        headers.insert("x-sentry-auth".into(), vec!["sentry_key=abc".into()]);
        Event::new(
            project_id,
            Method::POST,
            headers,
            format!("http://localhost:2222/api/{project_id}/store/?sentry_version=7"),
            Bytes::from_static(br#"{"message":"boom"}"#),
        )
    }

    fn config(url: Url, queue_size: usize) -> UpstreamConfig {
        UpstreamConfig {
            url,
            timeout_secs: 5,
            queue_size,
            max_retries: 3,
            concurrency: 2,
            drain_timeout_secs: 10,
        }
    }

    fn relay(url: Url, max_retries: u32) -> Relay {
        Relay {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            upstream_url: url,
            timeout: Duration::from_secs(5),
            max_retries,
            base_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_put_delivers_upstream() {
        let (url, mut received) = start_upstream(vec![]).await;
        let (delivery, worker) = UpstreamDelivery::new(&config(url, 10));
        tokio::spawn(worker.run(std::future::pending()));

        delivery.put(42, event(42));

        let request = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path_and_query, "/api/42/store/?sentry_version=7");
        assert_eq!(request.headers.get("x-sentry-auth").unwrap(), "sentry_key=abc");
        assert_eq!(request.headers.get("via").unwrap(), "1.1 cyclops");
        assert_eq!(request.body.as_ref(), br#"{"message":"boom"}"#);
    }

    #[tokio::test]
    async fn test_put_drops_when_queue_full() {
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        // The worker is never run, so nothing drains the queue
        let (delivery, mut worker) = UpstreamDelivery::new(&config(url, 1));

        delivery.put(1, event(1));
        delivery.put(2, event(2));

        assert_eq!(worker.rx.try_recv().unwrap().project_id(), 1);
        assert!(worker.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_put_after_worker_stopped() {
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        let (delivery, worker) = UpstreamDelivery::new(&config(url, 1));
        drop(worker);

        // Must not panic or block
        delivery.put(1, event(1));
    }

    #[tokio::test]
    async fn test_retries_transient_status() {
        let (url, mut received) = start_upstream(vec![
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ])
        .await;

        let status = relay(url, 3).deliver(&event(7)).await.unwrap();
        assert_eq!(status, StatusCode::OK);

        for _ in 0..3 {
            received.recv().await.unwrap();
        }
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (url, mut received) = start_upstream(vec![StatusCode::BAD_GATEWAY; 5]).await;

        let result = relay(url, 2).deliver(&event(7)).await;
        assert!(matches!(
            result,
            Err(DeliveryError::UpstreamStatus(StatusCode::BAD_GATEWAY))
        ));

        // One attempt plus two retries
        for _ in 0..3 {
            received.recv().await.unwrap();
        }
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (url, mut received) = start_upstream(vec![StatusCode::BAD_REQUEST]).await;

        let result = relay(url, 3).deliver(&event(7)).await;
        assert!(matches!(
            result,
            Err(DeliveryError::UpstreamStatus(StatusCode::BAD_REQUEST))
        ));

        received.recv().await.unwrap();
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_events() {
        let (url, mut received) = start_upstream(vec![]).await;
        let (delivery, worker) = UpstreamDelivery::new(&config(url, 10));

        for project_id in 1..=3 {
            delivery.put(project_id, event(project_id));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(worker.run(async move {
            let _ = shutdown_rx.await;
        }));
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let mut paths: Vec<String> = (0..3)
            .map(|_| received.try_recv().unwrap().path_and_query)
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            [
                "/api/1/store/?sentry_version=7",
                "/api/2/store/?sentry_version=7",
                "/api/3/store/?sentry_version=7",
            ]
        );

        // The queue no longer accepts events
        assert!(delivery.tx.is_closed());
        delivery.put(4, event(4));
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_retrying_relays() {
        let (url, mut received) = start_upstream(vec![StatusCode::SERVICE_UNAVAILABLE]).await;
        let (delivery, worker) = UpstreamDelivery::new(&config(url, 10));

        delivery.put(1, event(1));
        // Already resolved: the queue is closed on the first poll
        let handle = tokio::spawn(worker.run(async {}));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        // The first attempt and the retry both reached the upstream
        received.try_recv().unwrap();
        received.try_recv().unwrap();
        assert!(received.try_recv().is_err());
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(BASE_DELAY, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(BASE_DELAY, 3), Duration::from_secs(4));
        // Saturates instead of overflowing
        assert_eq!(backoff_delay(BASE_DELAY, 40), BASE_DELAY * u32::MAX);
        assert_eq!(backoff_delay(Duration::MAX, 2), Duration::MAX);
    }
}
