//! Remote JSON Web Key Sets, cached per URL.
//!
//! Cached sets expire according to the `Cache-Control: max-age` of the response that carried
//! them. Concurrent lookups needing the same stale set share a single in-flight fetch.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use jsonwebtoken::{
    errors::ErrorKind,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
    DecodingKey,
};
use parking_lot::Mutex;

/// Expiry used when the response carries no usable `max-age`.
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
/// A set is refetched on an unknown `kid` only when it is older than this.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Bound on how long a caller waits for a fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("failed to fetch key set from {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("timed out fetching key set from {0}")]
    Timeout(String),
    #[error("no key with id {0:?}")]
    KeyNotFound(String),
}

type FetchFuture = Shared<BoxFuture<'static, Result<Arc<JwkSet>, Error>>>;

struct CachedSet {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    cache: HashMap<String, CachedSet>,
    in_flight: HashMap<String, FetchFuture>,
}

struct Inner {
    client: reqwest::Client,
    state: Mutex<State>,
}

/// Shared cache of remote key sets.
#[derive(Clone)]
pub struct RemoteKeySets {
    inner: Arc<Inner>,
}

impl Default for RemoteKeySets {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl RemoteKeySets {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns the key identified by `kid` in the set published at `url`.
    pub async fn get_key(&self, url: &str, kid: &str) -> Result<Jwk, Error> {
        let cached = {
            let state = self.inner.state.lock();
            state
                .cache
                .get(url)
                .filter(|set| set.expires_at > Instant::now())
                .map(|set| (set.keys.clone(), set.fetched_at))
        };

        if let Some((keys, fetched_at)) = cached {
            if let Some(key) = keys.find(kid) {
                return Ok(key.clone());
            }
            if fetched_at.elapsed() < MIN_REFRESH_INTERVAL {
                return Err(Error::KeyNotFound(kid.to_string()));
            }
        }

        let keys = self.fetch(url).await?;
        keys.find(kid)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(kid.to_string()))
    }

    /// Fetches the set at `url`, joining a fetch already in flight for it.
    async fn fetch(&self, url: &str) -> Result<Arc<JwkSet>, Error> {
        let fut = {
            let mut state = self.inner.state.lock();
            match state.in_flight.get(url) {
                Some(fut) => fut.clone(),
                None => {
                    let fut = fetch_and_cache(self.inner.clone(), url.to_string())
                        .boxed()
                        .shared();
                    state.in_flight.insert(url.to_string(), fut.clone());
                    fut
                }
            }
        };

        match tokio::time::timeout(FETCH_TIMEOUT, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(url.to_string())),
        }
    }
}

async fn fetch_and_cache(inner: Arc<Inner>, url: String) -> Result<Arc<JwkSet>, Error> {
    let res = fetch_remote(&inner.client, &url).await;

    let mut state = inner.state.lock();
    state.in_flight.remove(&url);
    match res {
        Ok((keys, ttl)) => {
            let keys = Arc::new(keys);
            let now = Instant::now();
            state.cache.insert(
                url,
                CachedSet {
                    keys: keys.clone(),
                    fetched_at: now,
                    expires_at: now + ttl,
                },
            );
            Ok(keys)
        }
        Err(error) => {
            tracing::error!(%url, %error, "failed to fetch key set");
            Err(error)
        }
    }
}

async fn fetch_remote(client: &reqwest::Client, url: &str) -> Result<(JwkSet, Duration), Error> {
    let to_error = |error: reqwest::Error| Error::Fetch {
        url: url.to_string(),
        message: error.to_string(),
    };

    let resp = client
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(to_error)?;

    let ttl = resp
        .headers()
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .and_then(max_age)
        .unwrap_or(DEFAULT_TTL);
    let keys = resp.json::<JwkSet>().await.map_err(to_error)?;

    Ok((keys, ttl))
}

/// Parses the `max-age` directive of a `Cache-Control` header value.
fn max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .filter_map(|directive| directive.trim().split_once('='))
        .find(|(name, _)| name.eq_ignore_ascii_case("max-age"))
        .and_then(|(_, secs)| secs.trim_matches('"').parse().ok())
        .map(Duration::from_secs)
}

/// Builds the verification key of a JWK.
///
/// Symmetric keys carry base64url, usually unpadded, which `DecodingKey::from_jwk` does not
/// accept, so they are decoded here.
pub fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, jsonwebtoken::errors::Error> {
    match &jwk.algorithm {
        AlgorithmParameters::OctetKey(params) => {
            let secret = URL_SAFE_NO_PAD
                .decode(params.value.trim_end_matches('='))
                .or_else(|_| URL_SAFE.decode(&params.value))
                .map_err(|error| jsonwebtoken::errors::Error::from(ErrorKind::Base64(error)))?;
            Ok(DecodingKey::from_secret(&secret))
        }
        _ => DecodingKey::from_jwk(jwk),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        net::{SocketAddr, TcpListener},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use axum::{http::header, routing, Router};
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    use super::*;

    /// JWKS holding one symmetric key per `(kid, secret)` pair.
    pub(crate) fn oct_jwks(keys: &[(&str, &str)]) -> serde_json::Value {
        let keys = keys
            .iter()
            .map(|(kid, secret)| {
                serde_json::json!({
                    "kty": "oct",
                    "kid": kid,
                    "k": URL_SAFE_NO_PAD.encode(secret),
                })
            })
            .collect::<Vec<_>>();
        serde_json::json!({ "keys": keys })
    }

    /// Serves the app built for an ephemeral local address.
    pub(crate) fn serve(app: impl FnOnce(SocketAddr) -> Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app(addr).into_make_service());
        tokio::spawn(server);
        addr
    }

    #[test]
    fn test_decoding_key_unpadded_secret() {
        // 13 bytes encode to base64 with padding, and without it in a JWK.
        let set: JwkSet = serde_json::from_value(oct_jwks(&[("k", "remote-secret")])).unwrap();
        let key = decoding_key(set.find("k").unwrap()).unwrap();

        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &serde_json::json!({ "sub": "me" }),
            &jsonwebtoken::EncodingKey::from_secret(b"remote-secret"),
        )
        .unwrap();
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        assert!(jsonwebtoken::decode::<serde_json::Value>(&token, &key, &validation).is_ok());
    }

    fn counting_jwks_server(cache_control: &'static str) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/jwks",
            routing::get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    (
                        [(header::CACHE_CONTROL, cache_control)],
                        axum::Json(oct_jwks(&[("k1", "secret")])),
                    )
                }
            }),
        );
        let addr = serve(|_| app);
        (format!("http://{}/jwks", addr), hits)
    }

    #[test]
    fn test_max_age() {
        assert_eq!(max_age("public, max-age=120"), Some(Duration::from_secs(120)));
        assert_eq!(max_age("MAX-AGE=5"), Some(Duration::from_secs(5)));
        assert_eq!(max_age("no-store"), None);
        assert_eq!(max_age("max-age=abc"), None);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let (url, hits) = counting_jwks_server("max-age=300");
        let keysets = RemoteKeySets::default();

        let lookups = (0..8).map(|_| {
            let keysets = keysets.clone();
            let url = url.clone();
            tokio::spawn(async move { keysets.get_key(&url, "k1").await })
        });
        for lookup in futures_util::future::join_all(lookups).await {
            assert!(lookup.unwrap().is_ok());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Served from cache.
        keysets.get_key(&url, "k1").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_does_not_refetch_fresh_set() {
        let (url, hits) = counting_jwks_server("max-age=300");
        let keysets = RemoteKeySets::default();

        keysets.get_key(&url, "k1").await.unwrap();
        assert_eq!(
            keysets.get_key(&url, "k2").await.unwrap_err(),
            Error::KeyNotFound("k2".to_string())
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_set_is_refetched() {
        let (url, hits) = counting_jwks_server("max-age=0");
        let keysets = RemoteKeySets::default();

        keysets.get_key(&url, "k1").await.unwrap();
        keysets.get_key(&url, "k1").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_error() {
        let app = Router::new().route(
            "/jwks",
            routing::get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let addr = serve(|_| app);
        let keysets = RemoteKeySets::default();

        let err = keysets
            .get_key(&format!("http://{}/jwks", addr), "k1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }
}
