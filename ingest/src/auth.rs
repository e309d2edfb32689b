//! Sentry client credentials.
//!
//! Clients send the public key either as the `sentry_key` query parameter or
//! inside the `X-Sentry-Auth` header, e.g.
//! `Sentry sentry_version=7, sentry_client=raven-go/1.0, sentry_key=abc`.
//! Header fields override query parameters one field at a time.

use http::HeaderMap;

pub const SENTRY_AUTH_HEADER: &str = "x-sentry-auth";

const AUTH_SCHEME: &str = "sentry ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentryAuth {
    pub key: Option<String>,
    pub secret: Option<String>,
}

impl SentryAuth {
    pub fn from_parts(query: Option<&str>, headers: &HeaderMap) -> Self {
        let mut auth = SentryAuth::default();

        if let Some(query) = query {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match name.as_ref() {
                    "sentry_key" if auth.key.is_none() => auth.key = Some(value.into_owned()),
                    "sentry_secret" if auth.secret.is_none() => {
                        auth.secret = Some(value.into_owned())
                    }
                    _ => {}
                }
            }
        }

        for value in headers.get_all(SENTRY_AUTH_HEADER) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for (name, value) in auth_fields(value) {
                match name {
                    "sentry_key" => auth.key = Some(value.to_string()),
                    "sentry_secret" => auth.secret = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        auth
    }
}

fn auth_fields(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split([',', ';']).filter_map(|item| {
        let item = item.trim();
        let item = match item.get(..AUTH_SCHEME.len()) {
            Some(scheme) if scheme.eq_ignore_ascii_case(AUTH_SCHEME) => {
                item[AUTH_SCHEME.len()..].trim_start()
            }
            _ => item,
        };
        let (name, value) = item.split_once('=')?;
        Some((name.trim(), value.trim().trim_matches('"')))
    })
}
