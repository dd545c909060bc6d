//! HTTP Basic authentication.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, request::Parts};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use super::Decision;

pub(crate) const DEFAULT_REALM: &str = "hub";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("at least one user is required")]
    NoUsers,
    #[error("invalid user entry {0:?}, expected user:secret")]
    InvalidUser(String),
    #[error("duplicate user {0:?}")]
    DuplicateUser(String),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Entries of the form `user:secret`.
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
    /// User to SHA3-256 digest of the secret.
    users: HashMap<String, [u8; 32]>,
    challenge: String,
    strip_authorization_header: bool,
    forward_username_header: Option<String>,
}

impl Handler {
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.users.is_empty() {
            return Err(Error::NoUsers);
        }

        let mut users = HashMap::with_capacity(config.users.len());
        for entry in &config.users {
            let (user, secret) = entry
                .split_once(':')
                .filter(|(user, _)| !user.is_empty())
                .ok_or_else(|| Error::InvalidUser(entry.clone()))?;
            if users.insert(user.to_string(), digest(secret)).is_some() {
                return Err(Error::DuplicateUser(user.to_string()));
            }
        }

        let realm = config
            .realm
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REALM.to_string());

        Ok(Self {
            users,
            challenge: format!("Basic realm=\"{}\"", realm),
            strip_authorization_header: config.strip_authorization_header,
            forward_username_header: config.forward_username_header.filter(|h| !h.is_empty()),
        })
    }

    fn authenticate(&self, req: &Parts) -> Option<String> {
        let value = req.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
        let (user, secret) = decoded.split_once(':')?;

        let expected = self.users.get(user)?;
        (*expected == digest(secret)).then(|| user.to_string())
    }
}

#[async_trait]
impl super::Handler for Handler {
    async fn verify(&self, req: &Parts) -> Decision {
        let Some(user) = self.authenticate(req) else {
            return Decision::unauthorized().header("WWW-Authenticate", &self.challenge);
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

fn digest(secret: &str) -> [u8; 32] {
    Sha3_256::digest(secret.as_bytes()).into()
}
