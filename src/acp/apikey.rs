//! API key authentication.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use axum::http::request::Parts;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};

use super::{
    token::{self, TokenSource},
    Decision,
};

/// Metadata entry holding the key ID, always forwardable.
pub const ID_METADATA_KEY: &str = "_id";
/// Metadata entry listing the groups of a key, comma separated.
pub const GROUPS_METADATA_KEY: &str = "groups";

const HASH_LEN: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("a key source (header, query or cookie) is required")]
    MissingKeySource,
    #[error("at least one key is required")]
    NoKeys,
    #[error("key {0:?} has an empty ID or value")]
    EmptyKey(String),
    #[error("duplicate key ID {0:?}")]
    DuplicateId(String),
    #[error("key {0:?} duplicates the value of another key")]
    DuplicateValue(String),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub id: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub key_source: TokenSource,
    #[serde(default)]
    pub keys: Vec<Key>,
    /// Response header name to metadata key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub strip_authorization_header: bool,
}

pub struct Handler {
    source: TokenSource,
    /// Key hash to metadata, including the `_id` entry.
    keys: HashMap<[u8; HASH_LEN], BTreeMap<String, String>>,
    forward_headers: BTreeMap<String, String>,
    strip_authorization_header: bool,
}

impl Handler {
    pub fn new(config: Config) -> Result<Self, Error> {
        if !config.key_source.is_configured() {
            return Err(Error::MissingKeySource);
        }
        if config.keys.is_empty() {
            return Err(Error::NoKeys);
        }

        let mut ids = HashSet::with_capacity(config.keys.len());
        let mut keys = HashMap::with_capacity(config.keys.len());
        for key in config.keys {
            if key.id.is_empty() || key.value.is_empty() {
                return Err(Error::EmptyKey(key.id));
            }
            if !ids.insert(key.id.clone()) {
                return Err(Error::DuplicateId(key.id));
            }

            let mut metadata = key.metadata;
            metadata.insert(ID_METADATA_KEY.to_string(), key.id.clone());
            if keys.insert(hash(&key.value), metadata).is_some() {
                return Err(Error::DuplicateValue(key.id));
            }
        }

        Ok(Self {
            source: config.key_source,
            keys,
            forward_headers: config.forward_headers,
            strip_authorization_header: config.strip_authorization_header,
        })
    }
}

#[async_trait]
impl super::Handler for Handler {
    async fn verify(&self, req: &Parts) -> Decision {
        let Ok(value) = token::extract(req, &self.source) else {
            return Decision::unauthorized();
        };
        let Some(metadata) = self.keys.get(&hash(&value)) else {
            return Decision::unauthorized();
        };

        if let Some(required) = required_groups(req) {
            if !has_any_group(metadata, &required) {
                return Decision::forbidden();
            }
        }

        let mut decision = Decision::allow();
        for (header, key) in &self.forward_headers {
            if let Some(value) = metadata.get(key) {
                decision = decision.header(header, value);
            }
        }
        if self.strip_authorization_header {
            decision = decision.header("Authorization", "");
        }
        decision
    }
}

/// Groups required by the `groups` query parameter of the forward-auth URL, if any.
fn required_groups(req: &Parts) -> Option<Vec<String>> {
    let query = req.uri.query()?;
    let groups = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k == "groups")
        .flat_map(|(_, v)| {
            v.split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    (!groups.is_empty()).then_some(groups)
}

fn has_any_group(metadata: &BTreeMap<String, String>, required: &[String]) -> bool {
    metadata
        .get(GROUPS_METADATA_KEY)
        .map(|groups| {
            groups
                .split(',')
                .map(str::trim)
                .any(|group| required.iter().any(|r| r == group))
        })
        .unwrap_or(false)
}

fn hash(value: &str) -> [u8; HASH_LEN] {
    let mut hasher = Shake256::default();
    hasher.update(value.as_bytes());
    let mut out = [0u8; HASH_LEN];
    hasher.finalize_xof().read(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use axum::http::{Request, StatusCode};

    use super::*;
    use crate::acp::{token::tests::parts, Handler as _};

    fn config() -> Config {
        Config {
            key_source: TokenSource {
                header: Some("Authorization".to_string()),
                header_auth_scheme: Some("Bearer".to_string()),
                query: Some("api-key".to_string()),
                ..Default::default()
            },
            keys: vec![
                Key {
                    id: "ci".to_string(),
                    value: "ci-key".to_string(),
                    metadata: BTreeMap::from([
                        ("team".to_string(), "platform".to_string()),
                        ("groups".to_string(), "dev, ops".to_string()),
                    ]),
                },
                Key {
                    id: "bot".to_string(),
                    value: "bot-key".to_string(),
                    metadata: BTreeMap::new(),
                },
            ],
            forward_headers: BTreeMap::from([
                ("X-Key-Id".to_string(), "_id".to_string()),
                ("X-Team".to_string(), "team".to_string()),
            ]),
            strip_authorization_header: false,
        }
    }

    #[tokio::test]
    async fn test_verify() {
        let handler = Handler::new(config()).unwrap();

        let decision = handler
            .verify(&parts(&[("Authorization", "Bearer ci-key")]))
            .await;
        assert_eq!(decision.status, StatusCode::OK);
        assert_eq!(decision.headers["x-key-id"], "ci");
        assert_eq!(decision.headers["x-team"], "platform");

        let decision = handler
            .verify(&parts(&[("X-Forwarded-Uri", "/?api-key=bot-key")]))
            .await;
        assert_eq!(decision.status, StatusCode::OK);
        assert_eq!(decision.headers["x-key-id"], "bot");
        assert!(decision.headers.get("x-team").is_none());

        let decision = handler
            .verify(&parts(&[("Authorization", "Bearer nope")]))
            .await;
        assert_eq!(decision.status, StatusCode::UNAUTHORIZED);

        let decision = handler.verify(&parts(&[])).await;
        assert_eq!(decision.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_groups() {
        let handler = Handler::new(config()).unwrap();
        let request = |uri: &str, key: &str| {
            Request::builder()
                .uri(uri)
                .header("Authorization", format!("Bearer {}", key))
                .body(())
                .unwrap()
                .into_parts()
                .0
        };

        let req = request("/policy@default?groups=ops", "ci-key");
        assert_eq!(handler.verify(&req).await.status, StatusCode::OK);

        let req = request("/policy@default?groups=admin,dev", "ci-key");
        assert_eq!(handler.verify(&req).await.status, StatusCode::OK);

        let req = request("/policy@default?groups=admin", "ci-key");
        assert_eq!(handler.verify(&req).await.status, StatusCode::FORBIDDEN);

        let req = request("/policy@default?groups=ops", "bot-key");
        assert_eq!(handler.verify(&req).await.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_construction_errors() {
        let mut no_source = config();
        no_source.key_source = TokenSource::default();
        assert_eq!(Handler::new(no_source).err(), Some(Error::MissingKeySource));

        let mut no_keys = config();
        no_keys.keys.clear();
        assert_eq!(Handler::new(no_keys).err(), Some(Error::NoKeys));

        let mut duplicate_id = config();
        duplicate_id.keys[1].id = "ci".to_string();
        assert_eq!(
            Handler::new(duplicate_id).err(),
            Some(Error::DuplicateId("ci".to_string()))
        );

        let mut duplicate_value = config();
        duplicate_value.keys[1].value = "ci-key".to_string();
        assert_eq!(
            Handler::new(duplicate_value).err(),
            Some(Error::DuplicateValue("bot".to_string()))
        );
    }
}
