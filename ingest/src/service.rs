use crate::controller::{Admission, IngestionController};
use crate::errors::{IngestError, Result};
use crate::metrics_defs::{EVENTS_REJECTED, REQUEST_DURATION};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::http::{empty_response, make_error_response, text_response};
use shared::{counter, histogram};
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub const CACHE_COUNT_HEADER: &str = "x-cyclops-cache-count";
pub const STATUS_HEADER: &str = "x-cyclops-status";

/// Store, healthcheck and stats endpoints on a single listener.
#[derive(Clone)]
pub struct IngestService {
    controller: Arc<IngestionController>,
    max_body_bytes: usize,
}

impl IngestService {
    pub fn new(controller: Arc<IngestionController>, max_body_bytes: usize) -> Self {
        IngestService {
            controller,
            max_body_bytes,
        }
    }

    async fn handle<B>(&self, request: Request<B>) -> Response<BoxBody<Bytes, IngestError>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        tracing::info!(method = %request.method(), path = request.uri().path(), "Received request");
        let start = Instant::now();

        let (handler, response) = match Route::from_request(request.method(), request.uri().path())
        {
            Route::Healthcheck => ("healthcheck", text_response(StatusCode::OK, "OK")),
            Route::Stats => (
                "stats",
                text_response(StatusCode::OK, self.controller.stats().to_string()),
            ),
            Route::Store(project_id) => {
                let response = match self.store(project_id, request).await {
                    Ok(admission) => admission_response(admission),
                    Err(err) => {
                        tracing::debug!(error = %err, "Store request rejected");
                        make_error_response(err.status_code())
                    }
                };
                ("store", response)
            }
            Route::NotFound => ("not_found", make_error_response(StatusCode::NOT_FOUND)),
        };

        histogram!(
            REQUEST_DURATION,
            "status" => response.status().as_str().to_string(),
            "handler" => handler
        )
        .record(start.elapsed().as_secs_f64());

        response
    }

    async fn store<B>(&self, project_id: String, request: Request<B>) -> Result<Admission>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let Ok(project_id) = project_id.parse::<u64>() else {
            counter!(EVENTS_REJECTED, "reason" => "invalid_project_id").increment(1);
            return Err(IngestError::InvalidProjectId(project_id));
        };

        let (parts, body) = request.into_parts();
        // Unknown projects and keys are rejected without reading the body
        self.controller.validate(project_id, &parts).await?;

        let body = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|err| {
                counter!(EVENTS_REJECTED, "reason" => "body").increment(1);
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    IngestError::PayloadTooLarge(self.max_body_bytes)
                } else {
                    IngestError::RequestBodyError(err.to_string())
                }
            })?
            .to_bytes();

        Ok(self.controller.admit(project_id, parts, body).await)
    }
}

impl Service<Request<Incoming>> for IngestService {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = IngestError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

enum Route {
    Healthcheck,
    Stats,
    Store(String),
    NotFound,
}

impl Route {
    /// Store requests must match `/<version>/<project_id>/store/` exactly,
    /// trailing slash included.
    fn from_request(method: &Method, path: &str) -> Self {
        let segments: Vec<&str> = path.split('/').collect();

        match (method, segments.as_slice()) {
            (&Method::GET, ["", "healthcheck"] | ["", "healthcheck", ""]) => Route::Healthcheck,
            (&Method::GET, ["", "stats"] | ["", "stats", ""]) => Route::Stats,
            (&Method::POST, ["", version, project_id, "store", ""]) if !version.is_empty() => {
                Route::Store((*project_id).to_string())
            }
            _ => Route::NotFound,
        }
    }
}

fn admission_response(admission: Admission) -> Response<BoxBody<Bytes, IngestError>> {
    let mut response = empty_response(StatusCode::NO_CONTENT);
    let headers = response.headers_mut();
    headers.insert(CACHE_COUNT_HEADER, HeaderValue::from(admission.count));
    headers.insert(
        STATUS_HEADER,
        HeaderValue::from_static(admission.status.as_str()),
    );
    response
}
