//! HTTP Digest authentication (RFC 2617, MD5), with `qop=auth` and the legacy mode.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::http::{header, request::Parts};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{basic::DEFAULT_REALM, Decision};

const NONCE_TTL: Duration = Duration::from_secs(5 * 60);
/// Outstanding nonces per handler. The oldest are forgotten first.
const MAX_NONCES: usize = 10_000;

/// Headers carrying the method of the request being authenticated, in lookup order.
const ORIGINAL_METHOD_HEADERS: [&str; 2] = ["X-Forwarded-Method", "X-Original-Method"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("at least one user is required")]
    NoUsers,
    #[error("invalid user entry {0:?}, expected user:realm:secret")]
    InvalidUser(String),
    #[error("duplicate user {0:?} in realm {1:?}")]
    DuplicateUser(String, String),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Entries of the form `user:realm:secret`, where the secret is the hex encoded
    /// MD5 of `user:realm:password` as produced by `htdigest`.
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default)]
    pub strip_authorization_header: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_username_header: Option<String>,
}

pub struct Handler {
    /// `(user, realm)` to HA1.
    users: HashMap<(String, String), String>,
    realm: String,
    strip_authorization_header: bool,
    forward_username_header: Option<String>,
    nonces: Mutex<Nonces>,
}

enum Rejection {
    Invalid,
    StaleNonce,
}

struct NonceState {
    expires_at: Instant,
    /// Highest nonce count accepted so far, 0 until the nonce is first used.
    last_count: u64,
}

/// Issued nonces, bounded to `capacity`.
struct Nonces {
    states: HashMap<String, NonceState>,
    /// Nonces in issue order, which is also expiry order.
    order: VecDeque<String>,
    capacity: usize,
}

impl Nonces {
    fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, nonce: String, now: Instant) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .states
                .get(oldest)
                .map_or(true, |state| state.expires_at <= now);
            if !expired && self.order.len() < self.capacity {
                break;
            }
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
        self.states.insert(
            nonce.clone(),
            NonceState {
                expires_at: now + NONCE_TTL,
                last_count: 0,
            },
        );
        self.order.push_back(nonce);
    }

    fn check(&self, nonce: &str, now: Instant) -> Result<(), Rejection> {
        match self.states.get(nonce) {
            Some(state) if state.expires_at > now => Ok(()),
            Some(_) => Err(Rejection::StaleNonce),
            None => Err(Rejection::Invalid),
        }
    }

    /// Records a use of `nonce` with `count`, which must exceed every count used before.
    fn use_count(&mut self, nonce: &str, count: u64, now: Instant) -> Result<(), Rejection> {
        self.check(nonce, now)?;
        let state = self.states.get_mut(nonce).ok_or(Rejection::Invalid)?;
        if count <= state.last_count {
            return Err(Rejection::Invalid);
        }
        state.last_count = count;
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.states.len()
    }
}

impl Handler {
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.users.is_empty() {
            return Err(Error::NoUsers);
        }

        let mut users = HashMap::with_capacity(config.users.len());
        for entry in &config.users {
            let mut fields = entry.splitn(3, ':');
            let (Some(user), Some(realm), Some(ha1)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::InvalidUser(entry.clone()));
            };
            if user.is_empty() || ha1.is_empty() {
                return Err(Error::InvalidUser(entry.clone()));
            }
            let key = (user.to_string(), realm.to_string());
            if users.insert(key, ha1.to_ascii_lowercase()).is_some() {
                return Err(Error::DuplicateUser(user.to_string(), realm.to_string()));
            }
        }

        Ok(Self {
            users,
            realm: config
                .realm
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_REALM.to_string()),
            strip_authorization_header: config.strip_authorization_header,
            forward_username_header: config.forward_username_header.filter(|h| !h.is_empty()),
            nonces: Mutex::new(Nonces::new(MAX_NONCES)),
        })
    }

    fn issue_nonce(&self) -> String {
        let nonce = hex(&rand::random::<[u8; 16]>());
        self.nonces.lock().insert(nonce.clone(), Instant::now());
        nonce
    }

    fn challenge(&self, stale: bool) -> Decision {
        let mut challenge = format!(
            "Digest realm=\"{}\", qop=\"auth\", algorithm=MD5, nonce=\"{}\"",
            self.realm,
            self.issue_nonce()
        );
        if stale {
            challenge.push_str(", stale=true");
        }
        Decision::unauthorized().header("WWW-Authenticate", &challenge)
    }

    fn authenticate(&self, req: &Parts) -> Result<String, Rejection> {
        let params = req
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Digest "))
            .map(parse_params)
            .ok_or(Rejection::Invalid)?;
        let param = |name: &str| params.get(name).map(String::as_str).ok_or(Rejection::Invalid);

        let user = param("username")?;
        let realm = param("realm")?;
        let nonce = param("nonce")?;
        let uri = param("uri")?;
        let response = param("response")?;

        if realm != self.realm {
            return Err(Rejection::Invalid);
        }
        if original_uri(req).map_or(false, |original| original != uri) {
            return Err(Rejection::Invalid);
        }
        self.nonces.lock().check(nonce, Instant::now())?;

        let ha1 = self
            .users
            .get(&(user.to_string(), realm.to_string()))
            .ok_or(Rejection::Invalid)?;
        let ha2 = md5_hex(&format!("{}:{}", original_method(req), uri));

        // Without qop there is no nonce count: the nonce is good for a single request.
        let (expected, count) = match params.get("qop").map(String::as_str) {
            Some("auth") => {
                let nc = param("nc")?;
                let count = u64::from_str_radix(nc, 16).map_err(|_| Rejection::Invalid)?;
                let cnonce = param("cnonce")?;
                let expected =
                    md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2));
                (expected, count)
            }
            Some(_) => return Err(Rejection::Invalid),
            None => (md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)), 1),
        };

        if !expected.eq_ignore_ascii_case(response) {
            return Err(Rejection::Invalid);
        }
        self.nonces.lock().use_count(nonce, count, Instant::now())?;
        Ok(user.to_string())
    }
}

#[async_trait]
impl super::Handler for Handler {
    async fn verify(&self, req: &Parts) -> Decision {
        let user = match self.authenticate(req) {
            Ok(user) => user,
            Err(Rejection::StaleNonce) => return self.challenge(true),
            Err(Rejection::Invalid) => return self.challenge(false),
        };

        let mut decision = Decision::allow();
        if let Some(name) = &self.forward_username_header {
            decision = decision.header(name, &user);
        }
        if self.strip_authorization_header {
            decision = decision.header("Authorization", "");
        }
        decision
    }
}

fn original_method(req: &Parts) -> &str {
    ORIGINAL_METHOD_HEADERS
        .iter()
        .find_map(|name| req.headers.get(*name)?.to_str().ok())
        .unwrap_or_else(|| req.method.as_str())
}

/// Path and query of the request being authenticated, when the proxy tells it.
fn original_uri(req: &Parts) -> Option<String> {
    let header = |name: &str| req.headers.get(name)?.to_str().ok();
    if let Some(uri) = header("X-Forwarded-Uri") {
        return Some(uri.to_string());
    }
    let url = Url::parse(header("X-Original-Url")?).ok()?;
    Some(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}

/// Parses `key=value` pairs separated by commas. Values may be quoted.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(',') {
                Some(end) => (after[..end].trim(), &after[end..]),
                None => (after.trim(), ""),
            },
        };

        params.insert(key, value.to_string());
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

fn md5_hex(input: &str) -> String {
    hex(&Md5::digest(input.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
