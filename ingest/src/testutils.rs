use crate::cache::{AdmissionCache, CacheError};
use crate::delivery::DeliveryQueue;
use crate::event::Event;
use crate::grouping::{GroupingError, GroupingOracle};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

/// A request as seen by the fake upstream.
#[derive(Debug)]
pub struct ReceivedRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Starts an upstream that answers with `statuses` in order, then 200 OK.
/// Every request is recorded before it is answered.
pub async fn start_upstream(
    statuses: Vec<StatusCode>,
) -> (Url, mpsc::UnboundedReceiver<ReceivedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let port = listener.local_addr().unwrap().port();

    let statuses = Arc::new(Mutex::new(VecDeque::from(statuses)));
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let statuses = statuses.clone();
            let tx = tx.clone();

            let service = service_fn(move |req: Request<Incoming>| {
                let statuses = statuses.clone();
                let tx = tx.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let body = body
                        .collect()
                        .await
                        .map(|collected| collected.to_bytes())
                        .unwrap_or_else(|_| Bytes::new());

                    let _ = tx.send(ReceivedRequest {
                        method: parts.method,
                        path_and_query: parts
                            .uri
                            .path_and_query()
                            .map(|pq| pq.to_string())
                            .unwrap_or_default(),
                        headers: parts.headers,
                        body,
                    });

                    let status = statuses.lock().unwrap().pop_front().unwrap_or(StatusCode::OK);
                    let mut response = Response::new(Full::new(Bytes::new()));
                    *response.status_mut() = status;
                    Ok::<_, Infallible>(response)
                }
            });

            tokio::spawn(async move {
                if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    eprintln!("Error serving connection: {:?}", err);
                }
            });
        }
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
    (url, rx)
}

/// Delivery queue that keeps every event it is given.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    events: Mutex<Vec<(u64, Event)>>,
}

impl RecordingDelivery {
    pub fn events(&self) -> Vec<(u64, Event)> {
        self.events.lock().unwrap().clone()
    }
}

impl DeliveryQueue for RecordingDelivery {
    fn put(&self, project_id: u64, event: Event) {
        self.events.lock().unwrap().push((project_id, event));
    }
}

/// Cache whose store is always unreachable.
#[derive(Debug, Default)]
pub struct FailingCache;

#[async_trait]
impl AdmissionCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<i64, CacheError> {
        Err(CacheError::StoreUnavailable("down".into()))
    }

    async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, CacheError> {
        Err(CacheError::StoreUnavailable("down".into()))
    }

    async fn increment_and_get(&self, _key: &str) -> Result<i64, CacheError> {
        Err(CacheError::StoreUnavailable("down".into()))
    }
}

/// Grouping that fails for every payload.
#[derive(Debug, Default)]
pub struct FailingGrouping;

impl GroupingOracle for FailingGrouping {
    fn hash(&self, _body: &[u8]) -> Result<String, GroupingError> {
        Err(GroupingError::NotAnObject)
    }
}
