use http::request::Parts;
use http::{HeaderMap, Method};
use hyper::body::Bytes;
use indexmap::IndexMap;

/// Header name to every value it was sent with, in arrival order.
pub type Headers = IndexMap<String, Vec<String>>;

/// An admitted submission, as handed to the delivery queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    project_id: u64,
    method: Method,
    headers: Headers,
    origin_url: String,
    body: Bytes,
}

impl Event {
    pub fn new(
        project_id: u64,
        method: Method,
        headers: Headers,
        origin_url: String,
        body: Bytes,
    ) -> Self {
        Event {
            project_id,
            method,
            headers,
            origin_url,
            body,
        }
    }

    /// Builds the event for a store request. The origin url is the public
    /// base url followed by the request's path and query.
    pub fn from_request(project_id: u64, parts: &Parts, origin_base: &str, body: Bytes) -> Self {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let origin_url = format!("{}{}", origin_base.trim_end_matches('/'), path_and_query);

        Event::new(
            project_id,
            parts.method.clone(),
            collect_headers(&parts.headers),
            origin_url,
            body,
        )
    }

    pub fn project_id(&self) -> u64 {
        self.project_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn origin_url(&self) -> &str {
        &self.origin_url
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

fn collect_headers(headers: &HeaderMap) -> Headers {
    let mut collected = Headers::new();
    for (name, value) in headers {
        collected
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn test_from_request() {
        let (parts, ()) = Request::builder()
            .method(Method::POST)
            .uri("/api/42/store/?sentry_key=abc")
            .header("content-type", "application/json")
            .header("x-sentry-auth", "sentry_key=abc")
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-forwarded-for", "10.0.0.2")
            .body(())
            .unwrap()
            .into_parts();

        let event = Event::from_request(
            42,
            &parts,
            "http://localhost:2222/",
            Bytes::from_static(b"{}"),
        );

        assert_eq!(event.project_id(), 42);
        assert_eq!(event.method(), &Method::POST);
        assert_eq!(
            event.origin_url(),
            "http://localhost:2222/api/42/store/?sentry_key=abc"
        );
        assert_eq!(event.body().as_ref(), b"{}");

        let names: Vec<&str> = event.headers().keys().map(String::as_str).collect();
        assert_eq!(names, ["content-type", "x-sentry-auth", "x-forwarded-for"]);
        assert_eq!(
            event.headers()["x-forwarded-for"],
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
    }
}
