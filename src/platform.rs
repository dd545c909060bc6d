//! Client of the Hub platform API.

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use url::Url;

use crate::types::{
    acp::AccessControlPolicySpec,
    edge_ingress::{EdgeIngressAcp, EdgeIngressService},
};

/// Header carrying the version of the object a write is based on.
const LAST_KNOWN_VERSION_HEADER: &str = "Last-Known-Version";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("platform conflict: a more recent version of this resource is available")]
    VersionConflict,
    #[error("resource not found on the platform")]
    NotFound,
    #[error("platform returned {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("platform request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid platform URL: {0}")]
    Url(#[from] url::ParseError),
}

/// An AccessControlPolicy as known by the platform.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Acp {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub spec: AccessControlPolicySpec,
}

/// An EdgeIngress as known by the platform.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngress {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    pub service: EdgeIngressService,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp: Option<EdgeIngressAcp>,
    /// Public domain assigned by the platform.
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub status: String,
}

/// Request body for creating or updating an EdgeIngress.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressRequest {
    pub name: String,
    pub namespace: String,
    pub service: EdgeIngressService,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp: Option<EdgeIngressAcp>,
}

/// Wildcard certificate for the domains served by the platform, PEM encoded.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub certificate: String,
    pub private_key: String,
}

#[async_trait]
pub trait Client: Send + Sync {
    async fn get_acps(&self) -> Result<Vec<Acp>, Error>;
    async fn create_acp(&self, acp: &Acp) -> Result<Acp, Error>;
    async fn update_acp(&self, last_known_version: &str, acp: &Acp) -> Result<Acp, Error>;
    async fn delete_acp(
        &self,
        last_known_version: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), Error>;

    async fn get_edge_ingresses(&self) -> Result<Vec<EdgeIngress>, Error>;
    async fn create_edge_ingress(&self, req: &EdgeIngressRequest) -> Result<EdgeIngress, Error>;
    async fn update_edge_ingress(
        &self,
        last_known_version: &str,
        req: &EdgeIngressRequest,
    ) -> Result<EdgeIngress, Error>;
    async fn delete_edge_ingress(
        &self,
        last_known_version: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), Error>;

    async fn get_certificate(&self) -> Result<Certificate, Error>;
}

/// Hex encoded SHA3-256 of the JSON form of a spec.
///
/// Objects written by the agent from platform state carry this hash in their status, so that
/// the admission webhook can tell them apart from user changes.
pub fn spec_hash<T: Serialize>(spec: &T) -> Result<String, serde_json::Error> {
    let serialized = serde_json::to_vec(spec)?;
    Ok(Sha3_256::digest(serialized)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// [`Client`] over HTTP.
pub struct HttpClient {
    base_url: Url,
    token: SecretString,
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: Url, token: SecretString) -> Self {
        Self {
            base_url,
            token,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{}/{}", base, path.trim_start_matches('/')))?)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, Error> {
        Ok(self
            .http
            .request(method, self.url(path)?)
            .bearer_auth(self.token.expose_secret()))
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, Error> {
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn send_empty(&self, req: reqwest::RequestBuilder) -> Result<(), Error> {
        check(req.send().await?).await?;
        Ok(())
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::CONFLICT => return Err(Error::VersionConflict),
        StatusCode::NOT_FOUND => return Err(Error::NotFound),
        _ => {}
    }

    #[derive(Deserialize)]
    struct ApiError {
        #[serde(default)]
        message: String,
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(Error::Api { status, message })
}

fn object_path(collection: &str, name: &str, namespace: &str) -> String {
    format!("{}/{}@{}", collection, name, namespace)
}

#[async_trait]
impl Client for HttpClient {
    async fn get_acps(&self) -> Result<Vec<Acp>, Error> {
        self.send(self.request(reqwest::Method::GET, "acps")?).await
    }

    async fn create_acp(&self, acp: &Acp) -> Result<Acp, Error> {
        self.send(self.request(reqwest::Method::POST, "acps")?.json(acp))
            .await
    }

    async fn update_acp(&self, last_known_version: &str, acp: &Acp) -> Result<Acp, Error> {
        let path = object_path("acps", &acp.name, &acp.namespace);
        let req = self
            .request(reqwest::Method::PUT, &path)?
            .header(LAST_KNOWN_VERSION_HEADER, last_known_version)
            .json(acp);
        self.send(req).await
    }

    async fn delete_acp(
        &self,
        last_known_version: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        let path = object_path("acps", name, namespace);
        let req = self
            .request(reqwest::Method::DELETE, &path)?
            .header(LAST_KNOWN_VERSION_HEADER, last_known_version);
        self.send_empty(req).await
    }

    async fn get_edge_ingresses(&self) -> Result<Vec<EdgeIngress>, Error> {
        self.send(self.request(reqwest::Method::GET, "edge-ingresses")?)
            .await
    }

    async fn create_edge_ingress(&self, req: &EdgeIngressRequest) -> Result<EdgeIngress, Error> {
        self.send(
            self.request(reqwest::Method::POST, "edge-ingresses")?
                .json(req),
        )
        .await
    }

    async fn update_edge_ingress(
        &self,
        last_known_version: &str,
        req: &EdgeIngressRequest,
    ) -> Result<EdgeIngress, Error> {
        let path = object_path("edge-ingresses", &req.name, &req.namespace);
        let builder = self
            .request(reqwest::Method::PUT, &path)?
            .header(LAST_KNOWN_VERSION_HEADER, last_known_version)
            .json(req);
        self.send(builder).await
    }

    async fn delete_edge_ingress(
        &self,
        last_known_version: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        let path = object_path("edge-ingresses", name, namespace);
        let req = self
            .request(reqwest::Method::DELETE, &path)?
            .header(LAST_KNOWN_VERSION_HEADER, last_known_version);
        self.send_empty(req).await
    }

    async fn get_certificate(&self) -> Result<Certificate, Error> {
        self.send(
            self.request(reqwest::Method::GET, "wildcard-certificate")?
                .header(header::ACCEPT, "application/json"),
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, net::SocketAddr};

    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode as AxumStatus},
        routing, Json, Router,
    };
    use parking_lot::Mutex;

    use super::*;
    use crate::acp::{basic, keys::tests::serve};

    /// In-memory platform.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub(crate) acps: Mutex<Vec<Acp>>,
        pub(crate) edge_ingresses: Mutex<Vec<EdgeIngress>>,
        pub(crate) certificate: Certificate,
        /// Versions of deleted objects, keyed by `name@namespace`.
        pub(crate) deleted: Mutex<HashMap<String, String>>,
    }

    fn bump(version: &str) -> String {
        (version.parse::<u64>().unwrap_or_default() + 1).to_string()
    }

    #[async_trait]
    impl Client for FakeClient {
        async fn get_acps(&self) -> Result<Vec<Acp>, Error> {
            Ok(self.acps.lock().clone())
        }

        async fn create_acp(&self, acp: &Acp) -> Result<Acp, Error> {
            let mut acps = self.acps.lock();
            if acps
                .iter()
                .any(|a| a.name == acp.name && a.namespace == acp.namespace)
            {
                return Err(Error::VersionConflict);
            }
            let created = Acp {
                version: "1".to_string(),
                ..acp.clone()
            };
            acps.push(created.clone());
            Ok(created)
        }

        async fn update_acp(&self, last_known_version: &str, acp: &Acp) -> Result<Acp, Error> {
            let mut acps = self.acps.lock();
            let existing = acps
                .iter_mut()
                .find(|a| a.name == acp.name && a.namespace == acp.namespace)
                .ok_or(Error::VersionConflict)?;
            if existing.version != last_known_version {
                return Err(Error::VersionConflict);
            }
            *existing = Acp {
                version: bump(&existing.version),
                ..acp.clone()
            };
            Ok(existing.clone())
        }

        async fn delete_acp(
            &self,
            last_known_version: &str,
            name: &str,
            namespace: &str,
        ) -> Result<(), Error> {
            let mut acps = self.acps.lock();
            let before = acps.len();
            acps.retain(|a| !(a.name == name && a.namespace == namespace));
            if acps.len() == before {
                return Err(Error::NotFound);
            }
            self.deleted.lock().insert(
                format!("{}@{}", name, namespace),
                last_known_version.to_string(),
            );
            Ok(())
        }

        async fn get_edge_ingresses(&self) -> Result<Vec<EdgeIngress>, Error> {
            Ok(self.edge_ingresses.lock().clone())
        }

        async fn create_edge_ingress(
            &self,
            req: &EdgeIngressRequest,
        ) -> Result<EdgeIngress, Error> {
            let created = EdgeIngress {
                name: req.name.clone(),
                namespace: req.namespace.clone(),
                version: "1".to_string(),
                service: req.service.clone(),
                acp: req.acp.clone(),
                domain: format!("{}-{}.hub.example.com", req.name, req.namespace),
                status: "up".to_string(),
            };
            self.edge_ingresses.lock().push(created.clone());
            Ok(created)
        }

        async fn update_edge_ingress(
            &self,
            last_known_version: &str,
            req: &EdgeIngressRequest,
        ) -> Result<EdgeIngress, Error> {
            let mut edge_ingresses = self.edge_ingresses.lock();
            let existing = edge_ingresses
                .iter_mut()
                .find(|e| e.name == req.name && e.namespace == req.namespace)
                .ok_or(Error::VersionConflict)?;
            if existing.version != last_known_version {
                return Err(Error::VersionConflict);
            }
            existing.version = bump(&existing.version);
            existing.service = req.service.clone();
            existing.acp = req.acp.clone();
            Ok(existing.clone())
        }

        async fn delete_edge_ingress(
            &self,
            _last_known_version: &str,
            name: &str,
            namespace: &str,
        ) -> Result<(), Error> {
            let mut edge_ingresses = self.edge_ingresses.lock();
            let before = edge_ingresses.len();
            edge_ingresses.retain(|e| !(e.name == name && e.namespace == namespace));
            if edge_ingresses.len() == before {
                return Err(Error::NotFound);
            }
            Ok(())
        }

        async fn get_certificate(&self) -> Result<Certificate, Error> {
            Ok(self.certificate.clone())
        }
    }

    fn client(addr: SocketAddr) -> HttpClient {
        HttpClient::new(
            Url::parse(&format!("http://{}/agent/", addr)).unwrap(),
            SecretString::new("t0ken".to_string()),
        )
    }

    #[tokio::test]
    async fn test_http_client() {
        let addr = serve(|_| {
            Router::new()
                .route(
                    "/agent/acps",
                    routing::get(|headers: HeaderMap| async move {
                        assert_eq!(headers["authorization"], "Bearer t0ken");
                        Json(serde_json::json!([{
                            "name": "basic",
                            "namespace": "default",
                            "version": "3",
                            "basicAuth": { "users": ["jane:pw"] },
                        }]))
                    }),
                )
                .route(
                    "/agent/acps/:id",
                    routing::put(
                        |Path(id): Path<String>, headers: HeaderMap, Json(acp): Json<Acp>| async move {
                            assert_eq!(id, "basic@default");
                            if headers[LAST_KNOWN_VERSION_HEADER] != "3" {
                                return Err(AxumStatus::CONFLICT);
                            }
                            Ok(Json(Acp {
                                version: "4".to_string(),
                                ..acp
                            }))
                        },
                    )
                    .delete(|| async {
                        (
                            AxumStatus::INTERNAL_SERVER_ERROR,
                            Json(serde_json::json!({ "message": "boom" })),
                        )
                    }),
                )
        });
        let client = client(addr);

        let acps = client.get_acps().await.unwrap();
        assert_eq!(acps.len(), 1);
        assert_eq!(acps[0].version, "3");
        assert_eq!(
            acps[0].spec.basic_auth,
            Some(basic::Config {
                users: vec!["jane:pw".to_string()],
                ..Default::default()
            })
        );

        let updated = client.update_acp("3", &acps[0]).await.unwrap();
        assert_eq!(updated.version, "4");

        let err = client.update_acp("2", &acps[0]).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict));
        assert_eq!(
            err.to_string(),
            "platform conflict: a more recent version of this resource is available"
        );

        let err = client
            .delete_acp("3", "basic", "default")
            .await
            .unwrap_err();
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_spec_hash_is_stable() {
        let spec = AccessControlPolicySpec {
            basic_auth: Some(basic::Config {
                users: vec!["jane:pw".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(spec_hash(&spec).unwrap(), spec_hash(&spec.clone()).unwrap());
        assert_eq!(spec_hash(&spec).unwrap().len(), 64);
        assert_ne!(
            spec_hash(&spec).unwrap(),
            spec_hash(&AccessControlPolicySpec::default()).unwrap()
        );
    }
}
