//! OpenID Connect authorization code flow, as a forward-auth handler.
//!
//! A request without a valid session is redirected to the provider. The provider sends the
//! browser back to the redirect URL, where the code is exchanged for an ID token which becomes
//! the session cookie.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use axum::http::{request::Parts, StatusCode};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use url::Url;

use super::{
    claims::{self, Expr},
    jwt,
    keys::{self, RemoteKeySets},
    token, Decision, SecretKeyRef,
};

pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";

const DEFAULT_SCOPE: &str = "openid";
const STATE_COOKIE_MAX_AGE: u64 = 10 * 60;
/// Bound on each call to the provider.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("issuer is required")]
    MissingIssuer,
    #[error("clientId is required")]
    MissingClientId,
    #[error("clientSecret or clientSecretRef is required")]
    MissingClientSecret,
    #[error("redirectUrl is required")]
    MissingRedirectUrl,
    #[error("invalid claims expression: {0}")]
    Claims(#[from] claims::Error),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
enum FlowError {
    #[error("provider discovery failed: {0}")]
    Discovery(#[source] reqwest::Error),
    #[error("code exchange failed: {0}")]
    Exchange(#[source] reqwest::Error),
    #[error("ID token has no key ID")]
    MissingKeyId,
    #[error(transparent)]
    Keys(#[from] keys::Error),
    #[error("invalid ID token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub issuer: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<SecretKeyRef>,
    /// Absolute URL, or a path on the host of the protected request.
    pub redirect_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Extra parameters sent to the authorization endpoint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie_name: Option<String>,
    /// Response header name to claim path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,
}

/// Sign in with Google, restricted to a set of e-mail addresses.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<SecretKeyRef>,
    pub redirect_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie_name: Option<String>,
    /// Allowed addresses. Entries starting with `@` allow a whole domain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Discovery {
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

pub struct Handler {
    issuer: String,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    scope: String,
    auth_params: BTreeMap<String, String>,
    cookie_name: String,
    forward_headers: BTreeMap<String, String>,
    claims: Option<Expr>,
    allowed_emails: Option<Vec<String>>,
    http: reqwest::Client,
    keysets: RemoteKeySets,
    discovery: OnceCell<Discovery>,
}

impl Handler {
    pub fn new(policy_name: &str, config: Config, keysets: RemoteKeySets) -> Result<Self, Error> {
        if config.issuer.is_empty() {
            return Err(Error::MissingIssuer);
        }
        let claims = config
            .claims
            .filter(|c| !c.trim().is_empty())
            .map(|c| Expr::parse(&c))
            .transpose()?;
        let scope = if config.scopes.is_empty() {
            DEFAULT_SCOPE.to_string()
        } else {
            config.scopes.join(" ")
        };

        Self::build(
            policy_name,
            Common {
                issuer: config.issuer,
                client_id: config.client_id,
                client_secret: config.client_secret,
                redirect_url: config.redirect_url,
                scope,
                auth_params: config.auth_params,
                session_cookie_name: config.session_cookie_name,
                forward_headers: config.forward_headers,
                claims,
                allowed_emails: None,
            },
            keysets,
        )
    }

    pub fn google(
        policy_name: &str,
        config: GoogleConfig,
        keysets: RemoteKeySets,
    ) -> Result<Self, Error> {
        Self::build(
            policy_name,
            Common {
                issuer: GOOGLE_ISSUER.to_string(),
                client_id: config.client_id,
                client_secret: config.client_secret,
                redirect_url: config.redirect_url,
                scope: "openid email".to_string(),
                auth_params: config.auth_params,
                session_cookie_name: config.session_cookie_name,
                forward_headers: config.forward_headers,
                claims: None,
                allowed_emails: Some(config.emails),
            },
            keysets,
        )
    }

    fn build(policy_name: &str, common: Common, keysets: RemoteKeySets) -> Result<Self, Error> {
        if common.client_id.is_empty() {
            return Err(Error::MissingClientId);
        }
        let client_secret = common
            .client_secret
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingClientSecret)?;
        if common.redirect_url.is_empty() {
            return Err(Error::MissingRedirectUrl);
        }

        let cookie_name = common
            .session_cookie_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("hub-session-{}", policy_name.replace('@', "-")));

        Ok(Self {
            issuer: common.issuer,
            client_id: common.client_id,
            client_secret,
            redirect_url: common.redirect_url,
            scope: common.scope,
            auth_params: common.auth_params,
            cookie_name,
            forward_headers: common.forward_headers,
            claims: common.claims,
            allowed_emails: common.allowed_emails,
            http: http_client(PROVIDER_TIMEOUT)?,
            keysets,
            discovery: OnceCell::new(),
        })
    }

    fn state_cookie_name(&self) -> String {
        format!("{}-state", self.cookie_name)
    }

    async fn discovery(&self) -> Result<&Discovery, FlowError> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/.well-known/openid-configuration",
                    self.issuer.trim_end_matches('/')
                );
                self.http
                    .get(url)
                    .send()
                    .await
                    .and_then(|resp| resp.error_for_status())
                    .map_err(FlowError::Discovery)?
                    .json::<Discovery>()
                    .await
                    .map_err(FlowError::Discovery)
            })
            .await
    }

    /// Verifies an ID token and returns its claims.
    async fn validate(
        &self,
        id_token: &str,
        discovery: &Discovery,
    ) -> Result<serde_json::Value, FlowError> {
        let header = jsonwebtoken::decode_header(id_token)?;
        let kid = header.kid.as_deref().ok_or(FlowError::MissingKeyId)?;
        let jwk = self.keysets.get_key(&discovery.jwks_uri, kid).await?;
        let key = keys::decoding_key(&jwk)?;

        let mut validation = jwt::validation(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);
        let data = jsonwebtoken::decode::<serde_json::Value>(id_token, &key, &validation)?;
        Ok(data.claims)
    }

    fn authorize(&self, claims: &serde_json::Value) -> Decision {
        if let Some(allowed) = &self.allowed_emails {
            if !email_verified(claims) {
                return Decision::forbidden();
            }
            let email = claims.get("email").and_then(|e| e.as_str()).unwrap_or_default();
            if !email_allowed(email, allowed) {
                return Decision::forbidden();
            }
        }
        if let Some(expr) = &self.claims {
            if !expr.eval(claims) {
                return Decision::forbidden();
            }
        }

        let mut decision = Decision::allow();
        for (header, path) in &self.forward_headers {
            if let Some(value) = claims::lookup(claims, path) {
                decision = decision.header(header, &claims::to_header_value(value));
            }
        }
        decision
    }

    fn redirect_to_provider(
        &self,
        original: &Url,
        redirect_uri: &Url,
        discovery: &Discovery,
    ) -> Decision {
        let Ok(mut location) = Url::parse(&discovery.authorization_endpoint) else {
            tracing::error!(
                endpoint = %discovery.authorization_endpoint,
                "invalid authorization endpoint"
            );
            return Decision::with_status(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let nonce = random_hex();
        let state = format!("{}:{}", nonce, URL_SAFE_NO_PAD.encode(original.as_str()));
        {
            let mut query = location.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri.as_str())
                .append_pair("scope", &self.scope)
                .append_pair("state", &state);
            for (key, value) in &self.auth_params {
                query.append_pair(key, value);
            }
        }

        Decision::with_status(StatusCode::FOUND)
            .header("Location", location.as_str())
            .header(
                "Set-Cookie",
                &format!(
                    "{}={}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Lax",
                    self.state_cookie_name(),
                    nonce,
                    STATE_COOKIE_MAX_AGE
                ),
            )
    }

    async fn callback(
        &self,
        req: &Parts,
        original: &Url,
        redirect_uri: &Url,
        discovery: &Discovery,
    ) -> Decision {
        let param = |name: &str| {
            original
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let (Some(code), Some(state)) = (param("code"), param("state")) else {
            return Decision::unauthorized();
        };

        let Some((nonce, target)) = state.split_once(':') else {
            return Decision::unauthorized();
        };
        if token::cookie(req, &self.state_cookie_name()).as_deref() != Some(nonce) {
            return Decision::unauthorized();
        }
        let Some(target) = URL_SAFE_NO_PAD
            .decode(target)
            .ok()
            .and_then(|t| String::from_utf8(t).ok())
        else {
            return Decision::unauthorized();
        };

        let id_token = match self.exchange(&code, redirect_uri, discovery).await {
            Ok(id_token) => id_token,
            Err(error) => {
                tracing::error!(issuer = %self.issuer, %error, "OIDC callback failed");
                return Decision::unauthorized();
            }
        };
        if let Err(error) = self.validate(&id_token, discovery).await {
            tracing::debug!(%error, "rejecting ID token");
            return Decision::unauthorized();
        }

        Decision::with_status(StatusCode::FOUND)
            .header("Location", &target)
            .header(
                "Set-Cookie",
                &format!(
                    "{}={}; Path=/; HttpOnly; Secure; SameSite=Lax",
                    self.cookie_name, id_token
                ),
            )
            .header(
                "Set-Cookie",
                &format!("{}=; Path=/; Max-Age=0", self.state_cookie_name()),
            )
    }

    async fn exchange(
        &self,
        code: &str,
        redirect_uri: &Url,
        discovery: &Discovery,
    ) -> Result<String, FlowError> {
        let resp = self
            .http
            .post(&discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(FlowError::Exchange)?
            .json::<TokenResponse>()
            .await
            .map_err(FlowError::Exchange)?;
        Ok(resp.id_token)
    }
}

/// Fields shared by the generic and Google flavours.
struct Common {
    issuer: String,
    client_id: String,
    client_secret: Option<String>,
    redirect_url: String,
    scope: String,
    auth_params: BTreeMap<String, String>,
    session_cookie_name: Option<String>,
    forward_headers: BTreeMap<String, String>,
    claims: Option<Expr>,
    allowed_emails: Option<Vec<String>>,
}

#[async_trait]
impl super::Handler for Handler {
    async fn verify(&self, req: &Parts) -> Decision {
        let Some(original) = original_url(req) else {
            return Decision::unauthorized();
        };
        let discovery = match self.discovery().await {
            Ok(discovery) => discovery,
            Err(error) => {
                tracing::error!(issuer = %self.issuer, %error, "OIDC discovery failed");
                return Decision::with_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let Ok(redirect_uri) = original.join(&self.redirect_url) else {
            return Decision::with_status(StatusCode::INTERNAL_SERVER_ERROR);
        };

        if original.host_str() == redirect_uri.host_str() && original.path() == redirect_uri.path()
        {
            return self.callback(req, &original, &redirect_uri, discovery).await;
        }

        if let Some(id_token) = token::cookie(req, &self.cookie_name) {
            match self.validate(&id_token, discovery).await {
                Ok(claims) => return self.authorize(&claims),
                Err(error) => tracing::debug!(%error, "session rejected"),
            }
        }

        self.redirect_to_provider(&original, &redirect_uri, discovery)
    }
}

/// Rebuilds the URL of the protected request from proxy headers.
fn original_url(req: &Parts) -> Option<Url> {
    let header = |name: &str| req.headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(host) = header("X-Forwarded-Host") {
        let proto = header("X-Forwarded-Proto").unwrap_or("https");
        let uri = header("X-Forwarded-Uri").unwrap_or("/");
        return Url::parse(&format!("{}://{}", proto, host))
            .and_then(|base| base.join(uri))
            .ok();
    }
    header("X-Original-Url").and_then(|url| Url::parse(url).ok())
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(Error::HttpClient)
}

/// Tells whether the provider vouches for the `email` claim.
fn email_verified(claims: &serde_json::Value) -> bool {
    match claims.get("email_verified") {
        Some(serde_json::Value::Bool(verified)) => *verified,
        Some(serde_json::Value::String(verified)) => verified == "true",
        _ => false,
    }
}

fn email_allowed(email: &str, allowed: &[String]) -> bool {
    if email.is_empty() {
        return false;
    }
    allowed.iter().any(|entry| match entry.strip_prefix('@') {
        Some(domain) => email
            .rsplit_once('@')
            .map_or(false, |(_, d)| d.eq_ignore_ascii_case(domain)),
        None => entry.eq_ignore_ascii_case(email),
    })
}

fn random_hex() -> String {
    rand::random::<[u8; 16]>()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{routing, Form, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::acp::{
        jwt::tests::{now, sign},
        keys::tests::{oct_jwks, serve},
        token::tests::parts,
        Handler as _,
    };

    const KEY_SECRET: &str = "provider-secret";

    fn id_token(issuer: &str, claims: serde_json::Value) -> String {
        let mut claims = claims;
        claims["iss"] = json!(issuer);
        claims["aud"] = json!("my-client");
        claims["exp"] = json!(now() + 60);
        sign(&claims, KEY_SECRET, Some("k1"))
    }

    /// Provider whose token endpoint accepts the code `good-code`.
    fn provider() -> String {
        let addr = serve(|addr: SocketAddr| {
            let issuer = format!("http://{}", addr);
            let discovery = json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{}/authorize", issuer),
                "token_endpoint": format!("{}/token", issuer),
                "jwks_uri": format!("{}/jwks", issuer),
            });
            Router::new()
                .route(
                    "/.well-known/openid-configuration",
                    routing::get(move || async move { Json(discovery) }),
                )
                .route(
                    "/jwks",
                    routing::get(|| async { Json(oct_jwks(&[("k1", KEY_SECRET)])) }),
                )
                .route(
                    "/token",
                    routing::post(move |Form(form): Form<BTreeMap<String, String>>| async move {
                        if form.get("code").map(String::as_str) != Some("good-code")
                            || form.get("client_secret").map(String::as_str) != Some("shh")
                        {
                            return Err(StatusCode::BAD_REQUEST);
                        }
                        let token = id_token(&issuer, json!({ "email": "jane@example.com" }));
                        Ok(Json(json!({ "id_token": token })))
                    }),
                )
        });
        format!("http://{}", addr)
    }

    fn config(issuer: &str) -> Config {
        Config {
            issuer: issuer.to_string(),
            client_id: "my-client".to_string(),
            client_secret: Some("shh".to_string()),
            redirect_url: "/callback".to_string(),
            forward_headers: BTreeMap::from([("X-Email".to_string(), "email".to_string())]),
            ..Default::default()
        }
    }

    fn handler(issuer: &str) -> Handler {
        Handler::new("sso@default", config(issuer), RemoteKeySets::default()).unwrap()
    }

    const APP: [(&str, &str); 2] = [
        ("X-Forwarded-Host", "app.example.com"),
        ("X-Forwarded-Proto", "https"),
    ];

    #[tokio::test]
    async fn test_redirects_without_session() {
        let issuer = provider();
        let handler = handler(&issuer);

        let req = parts(&[APP[0], APP[1], ("X-Forwarded-Uri", "/dashboard?tab=1")]);
        let decision = handler.verify(&req).await;
        assert_eq!(decision.status, StatusCode::FOUND);

        let location = Url::parse(decision.headers["location"].to_str().unwrap()).unwrap();
        assert_eq!(location.as_str().split('?').next().unwrap(), format!("{}/authorize", issuer));
        let query: BTreeMap<_, _> = location.query_pairs().into_owned().collect();
        assert_eq!(query["client_id"], "my-client");
        assert_eq!(query["redirect_uri"], "https://app.example.com/callback");
        assert_eq!(query["scope"], "openid");

        let state_cookie = decision.headers["set-cookie"].to_str().unwrap();
        let nonce = query["state"].split_once(':').unwrap().0;
        assert!(state_cookie.starts_with(&format!("hub-session-sso-default-state={};", nonce)));
    }

    #[tokio::test]
    async fn test_session_cookie() {
        let issuer = provider();
        let handler = handler(&issuer);

        let token = id_token(&issuer, json!({ "email": "jane@example.com" }));
        let cookie = format!("hub-session-sso-default={}", token);
        let req = parts(&[APP[0], ("Cookie", cookie.as_str())]);
        let decision = handler.verify(&req).await;
        assert_eq!(decision.status, StatusCode::OK);
        assert_eq!(decision.headers["x-email"], "jane@example.com");

        // Audience mismatch sends the user back to the provider.
        let mut claims = json!({ "iss": issuer, "aud": "other", "exp": now() + 60 });
        claims["email"] = json!("jane@example.com");
        let foreign = sign(&claims, KEY_SECRET, Some("k1"));
        let cookie = format!("hub-session-sso-default={}", foreign);
        let req = parts(&[APP[0], ("Cookie", cookie.as_str())]);
        assert_eq!(handler.verify(&req).await.status, StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_claims_predicate() {
        let issuer = provider();
        let handler = Handler::new(
            "sso@default",
            Config {
                claims: Some("Equals(grp, admin)".to_string()),
                ..config(&issuer)
            },
            RemoteKeySets::default(),
        )
        .unwrap();

        let token = id_token(&issuer, json!({ "grp": "dev" }));
        let cookie = format!("hub-session-sso-default={}", token);
        let req = parts(&[APP[0], ("Cookie", cookie.as_str())]);
        assert_eq!(handler.verify(&req).await.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_callback() {
        let issuer = provider();
        let handler = handler(&issuer);

        let state = format!(
            "n0nce:{}",
            URL_SAFE_NO_PAD.encode("https://app.example.com/dashboard")
        );
        let uri = format!("/callback?code=good-code&state={}", state);
        let req = parts(&[
            APP[0],
            ("X-Forwarded-Uri", uri.as_str()),
            ("Cookie", "hub-session-sso-default-state=n0nce"),
        ]);
        let decision = handler.verify(&req).await;
        assert_eq!(decision.status, StatusCode::FOUND);
        assert_eq!(decision.headers["location"], "https://app.example.com/dashboard");
        let cookies: Vec<_> = decision
            .headers
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(cookies[0].starts_with("hub-session-sso-default=ey"));
        assert!(cookies[1].starts_with("hub-session-sso-default-state=;"));

        // State that does not match the cookie is refused.
        let req = parts(&[
            APP[0],
            ("X-Forwarded-Uri", uri.as_str()),
            ("Cookie", "hub-session-sso-default-state=other"),
        ]);
        assert_eq!(handler.verify(&req).await.status, StatusCode::UNAUTHORIZED);

        // Bad code.
        let uri = format!("/callback?code=bad-code&state={}", state);
        let req = parts(&[
            APP[0],
            ("X-Forwarded-Uri", uri.as_str()),
            ("Cookie", "hub-session-sso-default-state=n0nce"),
        ]);
        assert_eq!(handler.verify(&req).await.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_google_emails() {
        let issuer = provider();
        let mut handler = Handler::google(
            "google@default",
            GoogleConfig {
                client_id: "my-client".to_string(),
                client_secret: Some("shh".to_string()),
                redirect_url: "/callback".to_string(),
                emails: vec!["jane@example.com".to_string(), "@corp.example".to_string()],
                ..Default::default()
            },
            RemoteKeySets::default(),
        )
        .unwrap();
        assert_eq!(handler.issuer, GOOGLE_ISSUER);
        handler.issuer = issuer.clone();

        for (email, status) in [
            ("jane@example.com", StatusCode::OK),
            ("bob@corp.example", StatusCode::OK),
            ("bob@example.com", StatusCode::FORBIDDEN),
        ] {
            let token = id_token(&issuer, json!({ "email": email, "email_verified": true }));
            let cookie = format!("hub-session-google-default={}", token);
            let req = parts(&[APP[0], ("Cookie", cookie.as_str())]);
            assert_eq!(handler.verify(&req).await.status, status, "{}", email);
        }

        for claims in [
            json!({ "email": "jane@example.com", "email_verified": false }),
            json!({ "email": "jane@example.com", "email_verified": "false" }),
            json!({ "email": "jane@example.com" }),
        ] {
            let token = id_token(&issuer, claims.clone());
            let cookie = format!("hub-session-google-default={}", token);
            let req = parts(&[APP[0], ("Cookie", cookie.as_str())]);
            assert_eq!(
                handler.verify(&req).await.status,
                StatusCode::FORBIDDEN,
                "{}",
                claims
            );
        }
    }

    #[test]
    fn test_email_verified() {
        assert!(email_verified(&json!({ "email_verified": true })));
        assert!(email_verified(&json!({ "email_verified": "true" })));
        assert!(!email_verified(&json!({ "email_verified": false })));
        assert!(!email_verified(&json!({ "email_verified": 1 })));
        assert!(!email_verified(&json!({})));
    }

    #[tokio::test]
    async fn test_unresponsive_provider() {
        let addr = serve(|_: SocketAddr| {
            Router::new().route(
                "/.well-known/openid-configuration",
                routing::get(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Json(json!({}))
                }),
            )
        });
        let mut handler = handler(&format!("http://{}", addr));
        handler.http = http_client(Duration::from_millis(200)).unwrap();

        let decision = tokio::time::timeout(Duration::from_secs(5), handler.verify(&parts(&APP)))
            .await
            .expect("provider call is bounded");
        assert_eq!(decision.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_construction_errors() {
        let keysets = RemoteKeySets::default();
        let base = config("https://issuer.example.com");

        let err = Handler::new("p@d", Config { issuer: String::new(), ..base.clone() }, keysets.clone());
        assert!(matches!(err.err(), Some(Error::MissingIssuer)));

        let err = Handler::new("p@d", Config { client_id: String::new(), ..base.clone() }, keysets.clone());
        assert!(matches!(err.err(), Some(Error::MissingClientId)));

        let err = Handler::new("p@d", Config { client_secret: None, ..base.clone() }, keysets.clone());
        assert!(matches!(err.err(), Some(Error::MissingClientSecret)));

        let err = Handler::new("p@d", Config { redirect_url: String::new(), ..base }, keysets);
        assert!(matches!(err.err(), Some(Error::MissingRedirectUrl)));
    }
}
