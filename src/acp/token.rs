//! Token extraction from forward-auth requests.

use axum::http::{header, request::Parts};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

/// Headers carrying the URI of the request being authenticated, in lookup order.
///
/// Traefik sets `X-Forwarded-Uri`, ingress-nginx sets `X-Original-Url`.
const ORIGINAL_URI_HEADERS: [&str; 2] = ["X-Forwarded-Uri", "X-Original-Url"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("missing token source")]
    MissingTokenSource,
}

/// Where to look for a token. Sources are tried in field order.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    /// Scheme the header value must start with, e.g. `Bearer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_auth_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

impl TokenSource {
    /// Tells whether at least one source is configured.
    pub fn is_configured(&self) -> bool {
        [&self.header, &self.query, &self.cookie]
            .into_iter()
            .any(|source| source.as_deref().map_or(false, |s| !s.is_empty()))
    }
}

/// Returns the first non-empty token found in the configured sources.
pub fn extract(req: &Parts, source: &TokenSource) -> Result<String, Error> {
    non_empty(&source.header)
        .and_then(|name| from_header(req, name, source.header_auth_scheme.as_deref()))
        .or_else(|| non_empty(&source.query).and_then(|key| from_query(req, key)))
        .or_else(|| non_empty(&source.cookie).and_then(|name| cookie(req, name)))
        .ok_or(Error::MissingTokenSource)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn from_header(req: &Parts, name: &str, scheme: Option<&str>) -> Option<String> {
    let value = req.headers.get(name)?.to_str().ok()?;
    let token = match scheme.filter(|s| !s.is_empty()) {
        Some(scheme) => value.strip_prefix(scheme)?.strip_prefix(' ')?,
        None => value,
    };
    Some(token.to_string()).filter(|t| !t.is_empty())
}

fn from_query(req: &Parts, key: &str) -> Option<String> {
    let uri = ORIGINAL_URI_HEADERS
        .iter()
        .find_map(|name| req.headers.get(*name)?.to_str().ok())?;
    query_param(uri, key)
}

/// Reads a query parameter from an absolute URL or a path with a query string.
pub(crate) fn query_param(uri: &str, key: &str) -> Option<String> {
    let base = Url::parse("http://localhost").ok()?;
    let url = base.join(uri).ok()?;
    let value = url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned());
    value.filter(|v| !v.is_empty())
}

/// Reads a cookie value from the request's `Cookie` headers.
pub(crate) fn cookie(req: &Parts, name: &str) -> Option<String> {
    req.headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::http::Request;

    use super::*;

    pub(crate) fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/policy@default");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn all_sources() -> TokenSource {
        TokenSource {
            header: Some("Authorization".to_string()),
            header_auth_scheme: Some("Bearer".to_string()),
            query: Some("token".to_string()),
            cookie: Some("session".to_string()),
        }
    }

    #[test]
    fn test_priority() {
        let req = parts(&[
            ("Authorization", "Bearer from-header"),
            ("X-Forwarded-Uri", "/app?token=from-query"),
            ("Cookie", "other=1; session=from-cookie"),
        ]);

        assert_eq!(extract(&req, &all_sources()).unwrap(), "from-header");

        let source = TokenSource {
            header: None,
            header_auth_scheme: None,
            ..all_sources()
        };
        assert_eq!(extract(&req, &source).unwrap(), "from-query");

        let source = TokenSource {
            cookie: Some("session".to_string()),
            ..Default::default()
        };
        assert_eq!(extract(&req, &source).unwrap(), "from-cookie");
    }

    #[test]
    fn test_wrong_scheme_falls_through() {
        let req = parts(&[
            ("Authorization", "Basic dXNlcjpwYXNz"),
            ("Cookie", "session=from-cookie"),
        ]);
        assert_eq!(extract(&req, &all_sources()).unwrap(), "from-cookie");

        let req = parts(&[("Authorization", "Bearerfoo")]);
        assert_eq!(
            extract(&req, &all_sources()).unwrap_err(),
            Error::MissingTokenSource
        );
    }

    #[test]
    fn test_header_without_scheme() {
        let req = parts(&[("X-Api-Key", "secret")]);
        let source = TokenSource {
            header: Some("X-Api-Key".to_string()),
            ..Default::default()
        };
        assert_eq!(extract(&req, &source).unwrap(), "secret");
    }

    #[test]
    fn test_query_from_original_url() {
        let source = TokenSource {
            query: Some("token".to_string()),
            ..Default::default()
        };

        let req = parts(&[("X-Original-Url", "https://app.example.com/path?a=b&token=abc")]);
        assert_eq!(extract(&req, &source).unwrap(), "abc");

        // X-Forwarded-Uri wins over X-Original-Url.
        let req = parts(&[
            ("X-Forwarded-Uri", "/path?token=first"),
            ("X-Original-Url", "https://app.example.com/path?token=second"),
        ]);
        assert_eq!(extract(&req, &source).unwrap(), "first");

        // The forward-auth request's own query is ignored.
        let req = Request::builder()
            .uri("/policy@default?token=own")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert_eq!(
            extract(&req, &source).unwrap_err(),
            Error::MissingTokenSource
        );
    }

    #[test]
    fn test_empty_values_are_missing() {
        let req = parts(&[
            ("Authorization", "Bearer "),
            ("X-Forwarded-Uri", "/path?token="),
            ("Cookie", "session="),
        ]);
        assert_eq!(
            extract(&req, &all_sources()).unwrap_err(),
            Error::MissingTokenSource
        );
        assert!(!TokenSource::default().is_configured());
        assert!(all_sources().is_configured());
    }
}
