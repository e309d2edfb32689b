use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::body::Bytes;

/// Store bodies are either plain JSON or base64 encoded JSON. A body that does
/// not decode as base64 is taken to be plain already.
pub fn decode_body(raw: Bytes) -> Bytes {
    match STANDARD.decode(raw.trim_ascii()) {
        Ok(decoded) => Bytes::from(decoded),
        Err(_) => raw,
    }
}
