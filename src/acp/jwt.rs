//! JSON Web Token verification.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use axum::http::request::Parts;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{jwk::JwkSet, Algorithm, DecodingKey, Validation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    claims::{self, Expr},
    keys::{self, RemoteKeySets},
    token::{self, TokenSource},
    Decision, SecretKeyRef,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("one of signingSecret, publicKey, jwksFile or jwksUrl is required")]
    MissingSigningMaterial,
    #[error("signing secret is not valid base64: {0}")]
    SigningSecretEncoding(#[source] base64::DecodeError),
    #[error("invalid public key: {0}")]
    PublicKey(#[source] jsonwebtoken::errors::Error),
    #[error("failed to read JWKS file {path}: {source}")]
    ReadJwksFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JWKS: {0}")]
    Jwks(#[source] serde_json::Error),
    #[error("invalid claims expression: {0}")]
    Claims(#[from] claims::Error),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    /// Secret holding the signing secret, resolved before the handler is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret_ref: Option<SecretKeyRef>,
    #[serde(default)]
    pub signing_secret_base64_encoded: bool,
    /// PEM encoded RSA, EC or Ed25519 public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Path to a JWKS file, or the JWKS itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub strip_authorization_header: bool,
    /// Response header name to claim path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
    /// Query parameter of the original request that may carry the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_query_key: Option<String>,
    /// Predicate the claims must satisfy, see [`claims`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,
}

pub struct Handler {
    source: TokenSource,
    secret: Option<DecodingKey>,
    public_key: Option<DecodingKey>,
    jwks: Option<JwkSet>,
    jwks_url: Option<String>,
    keysets: RemoteKeySets,
    claims: Option<Expr>,
    forward_headers: BTreeMap<String, String>,
    strip_authorization_header: bool,
}

impl Handler {
    pub fn new(config: Config, keysets: RemoteKeySets) -> Result<Self, Error> {
        let secret = match config.signing_secret.filter(|s| !s.is_empty()) {
            Some(secret) if config.signing_secret_base64_encoded => Some(
                DecodingKey::from_secret(
                    &STANDARD
                        .decode(secret.trim())
                        .map_err(Error::SigningSecretEncoding)?,
                ),
            ),
            Some(secret) => Some(DecodingKey::from_secret(secret.as_bytes())),
            None => None,
        };

        let public_key = config
            .public_key
            .filter(|k| !k.trim().is_empty())
            .map(|pem| parse_public_key(pem.as_bytes()))
            .transpose()?;

        let jwks = config
            .jwks_file
            .filter(|f| !f.trim().is_empty())
            .map(|file| load_jwks(&file))
            .transpose()?;

        let jwks_url = config.jwks_url.filter(|u| !u.is_empty());

        if secret.is_none() && public_key.is_none() && jwks.is_none() && jwks_url.is_none() {
            return Err(Error::MissingSigningMaterial);
        }

        let claims = config
            .claims
            .filter(|c| !c.trim().is_empty())
            .map(|c| Expr::parse(&c))
            .transpose()?;

        Ok(Self {
            source: TokenSource {
                header: Some("Authorization".to_string()),
                header_auth_scheme: Some("Bearer".to_string()),
                query: config.token_query_key,
                cookie: None,
            },
            secret,
            public_key,
            jwks,
            jwks_url,
            keysets,
            claims,
            forward_headers: config.forward_headers,
            strip_authorization_header: config.strip_authorization_header,
        })
    }

    async fn decoding_key(&self, alg: Algorithm, kid: Option<&str>) -> Option<DecodingKey> {
        let static_key = if is_hmac(alg) {
            self.secret.clone()
        } else {
            self.public_key.clone()
        };
        if static_key.is_some() {
            return static_key;
        }

        let kid = kid?;
        if let Some(jwk) = self.jwks.as_ref().and_then(|set| set.find(kid)) {
            return keys::decoding_key(jwk).ok();
        }
        let url = self.jwks_url.as_deref()?;
        match self.keysets.get_key(url, kid).await {
            Ok(jwk) => keys::decoding_key(&jwk).ok(),
            Err(error) => {
                tracing::debug!(%url, %kid, %error, "key lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl super::Handler for Handler {
    async fn verify(&self, req: &Parts) -> Decision {
        let Ok(token) = token::extract(req, &self.source) else {
            return Decision::unauthorized();
        };
        let Ok(header) = jsonwebtoken::decode_header(&token) else {
            return Decision::unauthorized();
        };
        let Some(key) = self.decoding_key(header.alg, header.kid.as_deref()).await else {
            return Decision::unauthorized();
        };

        let claims = match jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &key,
            &validation(header.alg),
        ) {
            Ok(data) => data.claims,
            Err(error) => {
                tracing::debug!(%error, "rejecting token");
                return Decision::unauthorized();
            }
        };

        if let Some(expr) = &self.claims {
            if !expr.eval(&claims) {
                return Decision::forbidden();
            }
        }

        let mut decision = Decision::allow();
        for (header, path) in &self.forward_headers {
            if let Some(value) = claims::lookup(&claims, path) {
                decision = decision.header(header, &claims::to_header_value(value));
            }
        }
        if self.strip_authorization_header {
            decision = decision.header("Authorization", "");
        }
        decision
    }
}

/// Validation of registered claims: `exp` and `nbf` when present, without leeway.
pub(crate) fn validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.leeway = 0;
    validation.required_spec_claims = HashSet::new();
    validation.validate_nbf = true;
    validation
}

fn is_hmac(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

fn parse_public_key(pem: &[u8]) -> Result<DecodingKey, Error> {
    DecodingKey::from_rsa_pem(pem)
        .or_else(|_| DecodingKey::from_ec_pem(pem))
        .or_else(|_| DecodingKey::from_ed_pem(pem))
        .map_err(Error::PublicKey)
}

fn load_jwks(file: &str) -> Result<JwkSet, Error> {
    let content = if file.trim_start().starts_with('{') {
        file.to_string()
    } else {
        std::fs::read_to_string(file).map_err(|source| Error::ReadJwksFile {
            path: file.to_string(),
            source,
        })?
    };
    serde_json::from_str(&content).map_err(Error::Jwks)
}
