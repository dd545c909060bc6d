//! Access control policies and the forward-auth handlers serving them.

pub mod apikey;
pub mod basic;
pub mod claims;
pub mod digest;
pub mod jwt;
pub mod keys;
pub mod oidc;
pub mod switcher;
pub mod token;
pub mod watcher;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    http::{header::HeaderName, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::acp::AccessControlPolicySpec;

use self::keys::RemoteKeySets;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no authentication method configured")]
    NoAuthMethod,
    #[error("more than one authentication method configured")]
    MultipleAuthMethods,
    #[error("secret {secret} has no key {key:?}")]
    MissingSecret { secret: String, key: String },
    #[error("secret {secret} key {key:?} is not valid UTF-8")]
    InvalidSecret { secret: String, key: String },
    #[error("JWT: {0}")]
    Jwt(#[from] jwt::Error),
    #[error("basic auth: {0}")]
    Basic(#[from] basic::Error),
    #[error("digest auth: {0}")]
    Digest(#[from] digest::Error),
    #[error("API key: {0}")]
    ApiKey(#[from] apikey::Error),
    #[error("OIDC: {0}")]
    Oidc(#[from] oidc::Error),
}

/// Canonical name of a policy: `name@namespace`, with an empty namespace meaning `default`.
pub fn canonical_name(name: &str, namespace: &str) -> String {
    let namespace = if namespace.is_empty() {
        "default"
    } else {
        namespace
    };
    format!("{}@{}", name, namespace)
}

/// Canonical name of a policy referenced from an object in `default_namespace`.
///
/// A reference is either `name` or `name@namespace`.
pub fn canonical_policy_name(reference: &str, default_namespace: &str) -> String {
    match reference.split_once('@') {
        Some((name, namespace)) => canonical_name(name, namespace),
        None => canonical_name(reference, default_namespace),
    }
}

/// Reference to a key of a Kubernetes Secret.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    /// Defaults to the namespace of the policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub key: String,
}

impl SecretKeyRef {
    /// `namespace@name` of the referenced secret.
    pub fn secret_id(&self, policy_namespace: &str) -> String {
        let namespace = self.namespace.as_deref().unwrap_or(policy_namespace);
        format!("{}@{}", namespace, self.name)
    }
}

/// Resolves referenced credential material.
pub trait SecretGetter {
    /// Returns the value stored under `key` in the secret identified by `namespace@name`.
    fn get_value(&self, secret_id: &str, key: &str) -> Option<Vec<u8>>;
}

/// A validated policy configuration: exactly one authentication method.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Config {
    Jwt(jwt::Config),
    BasicAuth(basic::Config),
    DigestAuth(digest::Config),
    ApiKey(apikey::Config),
    Oidc(oidc::Config),
    OidcGoogle(oidc::GoogleConfig),
}

impl TryFrom<AccessControlPolicySpec> for Config {
    type Error = Error;

    fn try_from(spec: AccessControlPolicySpec) -> Result<Self, Self::Error> {
        let mut configs = Vec::with_capacity(1);
        configs.extend(spec.jwt.map(Self::Jwt));
        configs.extend(spec.basic_auth.map(Self::BasicAuth));
        configs.extend(spec.digest_auth.map(Self::DigestAuth));
        configs.extend(spec.api_key.map(Self::ApiKey));
        configs.extend(spec.oidc.map(Self::Oidc));
        configs.extend(spec.oidc_google.map(Self::OidcGoogle));

        match configs.len() {
            0 => Err(Error::NoAuthMethod),
            1 => Ok(configs.remove(0)),
            _ => Err(Error::MultipleAuthMethods),
        }
    }
}

impl Config {
    /// Names of the headers the handler may set on a successful response, sorted.
    pub fn forward_header_names(&self) -> Vec<String> {
        let (mut names, strip): (Vec<String>, bool) = match self {
            Self::Jwt(c) => (
                c.forward_headers.keys().cloned().collect(),
                c.strip_authorization_header,
            ),
            Self::BasicAuth(c) => (
                c.forward_username_header.iter().cloned().collect(),
                c.strip_authorization_header,
            ),
            Self::DigestAuth(c) => (
                c.forward_username_header.iter().cloned().collect(),
                c.strip_authorization_header,
            ),
            Self::ApiKey(c) => (
                c.forward_headers.keys().cloned().collect(),
                c.strip_authorization_header,
            ),
            Self::Oidc(c) => (c.forward_headers.keys().cloned().collect(), false),
            Self::OidcGoogle(c) => (c.forward_headers.keys().cloned().collect(), false),
        };
        if strip {
            names.push("Authorization".to_string());
        }
        names.sort();
        names.dedup();
        names
    }

    /// Secrets the configuration depends on.
    pub fn secret_refs(&self) -> Vec<&SecretKeyRef> {
        match self {
            Self::Jwt(c) => c.signing_secret_ref.iter().collect(),
            Self::Oidc(c) => c.client_secret_ref.iter().collect(),
            Self::OidcGoogle(c) => c.client_secret_ref.iter().collect(),
            Self::BasicAuth(_) | Self::DigestAuth(_) | Self::ApiKey(_) => Vec::new(),
        }
    }

    /// Replaces secret references with the values they point to.
    pub fn resolve_secrets(
        &mut self,
        policy_namespace: &str,
        secrets: &dyn SecretGetter,
    ) -> Result<(), Error> {
        let (secret_ref, target) = match self {
            Self::Jwt(c) => (c.signing_secret_ref.take(), &mut c.signing_secret),
            Self::Oidc(c) => (c.client_secret_ref.take(), &mut c.client_secret),
            Self::OidcGoogle(c) => (c.client_secret_ref.take(), &mut c.client_secret),
            Self::BasicAuth(_) | Self::DigestAuth(_) | Self::ApiKey(_) => return Ok(()),
        };
        let Some(secret_ref) = secret_ref else {
            return Ok(());
        };

        let secret = secret_ref.secret_id(policy_namespace);
        let value = secrets
            .get_value(&secret, &secret_ref.key)
            .ok_or_else(|| Error::MissingSecret {
                secret: secret.clone(),
                key: secret_ref.key.clone(),
            })?;
        let value = String::from_utf8(value).map_err(|_| Error::InvalidSecret {
            secret,
            key: secret_ref.key.clone(),
        })?;
        *target = Some(value);
        Ok(())
    }
}

/// Outcome of a forward-auth check: a status code and the headers to hand back to the proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Decision {
    pub fn allow() -> Self {
        Self::with_status(StatusCode::OK)
    }

    pub fn unauthorized() -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED)
    }

    pub fn forbidden() -> Self {
        Self::with_status(StatusCode::FORBIDDEN)
    }

    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header. Names or values that are not valid HTTP are logged and skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(%name, "skipping invalid response header"),
        }
        self
    }
}

impl IntoResponse for Decision {
    fn into_response(self) -> Response {
        (self.status, self.headers).into_response()
    }
}

/// A forward-auth handler built from one policy.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn verify(&self, req: &Parts) -> Decision;
}

/// Builds the handler for a configuration whose secrets are already resolved.
pub fn build_handler(
    policy_name: &str,
    config: Config,
    keysets: &RemoteKeySets,
) -> Result<Arc<dyn Handler>, Error> {
    let handler: Arc<dyn Handler> = match config {
        Config::Jwt(c) => Arc::new(jwt::Handler::new(c, keysets.clone())?),
        Config::BasicAuth(c) => Arc::new(basic::Handler::new(c)?),
        Config::DigestAuth(c) => Arc::new(digest::Handler::new(c)?),
        Config::ApiKey(c) => Arc::new(apikey::Handler::new(c)?),
        Config::Oidc(c) => Arc::new(oidc::Handler::new(policy_name, c, keysets.clone())?),
        Config::OidcGoogle(c) => Arc::new(oidc::Handler::google(policy_name, c, keysets.clone())?),
    };
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;

    impl SecretGetter for HashMap<(String, String), Vec<u8>> {
        fn get_value(&self, secret_id: &str, key: &str) -> Option<Vec<u8>> {
            self.get(&(secret_id.to_string(), key.to_string())).cloned()
        }
    }

    #[test]
    fn test_canonical_policy_name() {
        assert_eq!(canonical_policy_name("my-policy", "test"), "my-policy@test");
        assert_eq!(canonical_policy_name("my-policy@other", "test"), "my-policy@other");
        assert_eq!(canonical_policy_name("my-policy", ""), "my-policy@default");
        assert_eq!(canonical_policy_name("my-policy@", "test"), "my-policy@default");
    }

    #[test]
    fn test_config_requires_exactly_one_method() {
        let err = Config::try_from(AccessControlPolicySpec::default()).unwrap_err();
        assert!(matches!(err, Error::NoAuthMethod));

        let spec = AccessControlPolicySpec {
            jwt: Some(jwt::Config::default()),
            basic_auth: Some(basic::Config::default()),
            ..Default::default()
        };
        assert!(matches!(
            Config::try_from(spec).unwrap_err(),
            Error::MultipleAuthMethods
        ));

        let spec = AccessControlPolicySpec {
            digest_auth: Some(digest::Config::default()),
            ..Default::default()
        };
        assert!(matches!(Config::try_from(spec).unwrap(), Config::DigestAuth(_)));
    }

    #[test]
    fn test_forward_header_names() {
        let config = Config::Jwt(jwt::Config {
            forward_headers: BTreeMap::from([
                ("X-Group".to_string(), "grp".to_string()),
                ("X-Email".to_string(), "email".to_string()),
            ]),
            strip_authorization_header: true,
            ..Default::default()
        });
        assert_eq!(
            config.forward_header_names(),
            vec!["Authorization", "X-Email", "X-Group"]
        );

        let config = Config::BasicAuth(basic::Config {
            forward_username_header: Some("User".to_string()),
            ..Default::default()
        });
        assert_eq!(config.forward_header_names(), vec!["User"]);
    }

    #[test]
    fn test_resolve_secrets() {
        let secrets = HashMap::from([(
            ("team@auth".to_string(), "key".to_string()),
            b"bibi".to_vec(),
        )]);

        let mut config = Config::Jwt(jwt::Config {
            signing_secret_ref: Some(SecretKeyRef {
                name: "auth".to_string(),
                namespace: None,
                key: "key".to_string(),
            }),
            ..Default::default()
        });
        assert_eq!(config.secret_refs().len(), 1);
        config.resolve_secrets("team", &secrets).unwrap();
        match &config {
            Config::Jwt(c) => {
                assert_eq!(c.signing_secret.as_deref(), Some("bibi"));
                assert!(c.signing_secret_ref.is_none());
            }
            other => panic!("unexpected config {other:?}"),
        }

        let mut config = Config::Jwt(jwt::Config {
            signing_secret_ref: Some(SecretKeyRef {
                name: "auth".to_string(),
                namespace: Some("elsewhere".to_string()),
                key: "key".to_string(),
            }),
            ..Default::default()
        });
        assert!(matches!(
            config.resolve_secrets("team", &secrets).unwrap_err(),
            Error::MissingSecret { .. }
        ));
    }

    #[test]
    fn test_decision_skips_invalid_headers() {
        let decision = Decision::allow()
            .header("X-Ok", "yes")
            .header("Bad Header", "value")
            .header("X-Bad-Value", "line\nbreak");
        assert_eq!(decision.headers.len(), 1);
        assert_eq!(decision.headers["x-ok"], "yes");
    }
}
