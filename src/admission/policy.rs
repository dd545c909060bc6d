use async_trait::async_trait;
use kube::Api;

use crate::{
    acp,
    types::acp::AccessControlPolicy,
    util::{self, CallError},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("policy {0} not found")]
    NotFound(String),
    #[error("failed to get policy {name}: {source}")]
    Get {
        name: String,
        #[source]
        source: CallError,
    },
    #[error("invalid policy {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: acp::Error,
    },
}

/// Looks up policies by canonical name.
#[async_trait]
pub trait PolicyGetter: Send + Sync {
    async fn get_config(&self, canonical_name: &str) -> Result<acp::Config, Error>;
}

/// Headers forwarded by a policy. A missing policy forwards none.
pub async fn forward_headers(
    policies: &dyn PolicyGetter,
    canonical_name: &str,
) -> Result<Vec<String>, Error> {
    match policies.get_config(canonical_name).await {
        Ok(config) => Ok(config.forward_header_names()),
        Err(Error::NotFound(_)) => {
            tracing::warn!(policy = %canonical_name, "policy not found");
            Ok(Vec::new())
        }
        Err(error) => Err(error),
    }
}

/// [`PolicyGetter`] reading AccessControlPolicy objects from the cluster.
pub struct KubePolicyGetter {
    kube_client: kube::Client,
}

impl KubePolicyGetter {
    pub fn new(kube_client: kube::Client) -> Self {
        Self { kube_client }
    }
}

#[async_trait]
impl PolicyGetter for KubePolicyGetter {
    async fn get_config(&self, canonical_name: &str) -> Result<acp::Config, Error> {
        let (name, namespace) = canonical_name
            .split_once('@')
            .unwrap_or((canonical_name, "default"));
        let api = Api::<AccessControlPolicy>::namespaced(self.kube_client.clone(), namespace);

        let policy = match util::with_timeout(api.get(name)).await {
            Ok(policy) => policy,
            Err(CallError::Kubernetes(error)) if util::is_not_found(&error) => {
                return Err(Error::NotFound(canonical_name.to_string()))
            }
            Err(source) => {
                return Err(Error::Get {
                    name: canonical_name.to_string(),
                    source,
                })
            }
        };

        acp::Config::try_from(policy.spec).map_err(|source| Error::Invalid {
            name: canonical_name.to_string(),
            source,
        })
    }
}
