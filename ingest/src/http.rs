use crate::delivery::DeliveryError;
use crate::event::Event;
use http::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::Connect;
use shared::http::{add_via_header, strip_hop_by_hop};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

const VIA_NAME: &str = "cyclops";

/// Rebuilds the original store request against the upstream.
///
/// The path and query of the event's origin url are kept and the host is
/// replaced by the upstream's. Original headers are copied except for `Host`,
/// `Content-Length` (the body may have been decoded) and hop-by-hop headers.
pub fn upstream_request(
    upstream_url: &Url,
    event: &Event,
) -> Result<Request<Full<Bytes>>, DeliveryError> {
    let origin = Url::parse(event.origin_url())
        .map_err(|e| DeliveryError::InvalidOriginUrl(event.origin_url().to_string(), e))?;

    if upstream_url.scheme() != "http" {
        return Err(DeliveryError::UnsupportedScheme(
            upstream_url.scheme().to_string(),
        ));
    }

    let mut url = upstream_url.clone();
    url.set_path(origin.path());
    url.set_query(origin.query());

    let mut headers = HeaderMap::new();
    for (name, values) in event.headers() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    strip_hop_by_hop(&mut headers);
    add_via_header(&mut headers, Version::HTTP_11, VIA_NAME);

    let mut request = Request::builder()
        .method(event.method().clone())
        .uri(url.as_str())
        .body(Full::new(event.body().clone()))?;
    *request.headers_mut() = headers;

    Ok(request)
}

/// Sends one request and drains the response.
///
/// `request_timeout` covers the whole exchange, including reading the
/// response body. Non-2xx answers are returned as `UpstreamStatus` errors.
pub async fn send_to_upstream<C>(
    client: &Client<C, Full<Bytes>>,
    request: Request<Full<Bytes>>,
    request_timeout: Duration,
) -> Result<StatusCode, DeliveryError>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let exchange = async {
        let response = client.request(request).await?;
        let status = response.status();
        // Drain the body so the connection can go back to the pool
        response
            .into_body()
            .collect()
            .await
            .map_err(|e| DeliveryError::ResponseBody(e.to_string()))?;
        Ok::<_, DeliveryError>(status)
    };

    let status = timeout(request_timeout, exchange)
        .await
        .map_err(|_| DeliveryError::Timeout(request_timeout))??;

    if status.is_success() {
        Ok(status)
    } else {
        Err(DeliveryError::UpstreamStatus(status))
    }
}
