//! ForwardAuth Middlewares wiring Traefik to the auth server.
//!
//! One Middleware exists per (policy, namespace) pair, named after the policy. They are
//! labelled with a digest of the policy they serve, kept up to date with its forwarded headers
//! and deleted once it is gone.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, ResourceExt,
};
use sha3::{Digest, Sha3_256};

use crate::{
    types::{
        traefik::{ForwardAuth, Middleware, MiddlewareSpec},
        FIELD_MANAGER, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE,
    },
    util::{self, CallError},
};

/// Label carrying [`policy_label`] of the policy a Middleware serves.
pub const POLICY_LABEL_KEY: &str = "hub.traefik.io/access-control-policy";
/// Annotation carrying the canonical name of the policy a Middleware serves.
pub const POLICY_ANNOTATION_KEY: &str = "hub.traefik.io/access-control-policy";

/// Hex digits of the policy digest kept in labels.
const POLICY_DIGEST_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to get Middleware {namespace}/{name}: {source}")]
    Get {
        namespace: String,
        name: String,
        #[source]
        source: CallError,
    },
    #[error("failed to write Middleware {namespace}/{name}: {source}")]
    Write {
        namespace: String,
        name: String,
        #[source]
        source: CallError,
    },
    #[error("failed to list Middlewares: {0}")]
    List(#[source] CallError),
    #[error("Middleware {namespace}/{name} already serves policy {existing}, not {desired}")]
    PolicyConflict {
        namespace: String,
        name: String,
        existing: String,
        desired: String,
    },
    #[error("failed to delete Middleware {namespace}/{name}: {source}")]
    Delete {
        namespace: String,
        name: String,
        #[source]
        source: CallError,
    },
}

/// Middleware CRUD.
#[async_trait]
pub trait MiddlewareStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Middleware>, Error>;
    async fn create(&self, middleware: &Middleware) -> Result<(), Error>;
    async fn update(&self, middleware: &Middleware) -> Result<(), Error>;
    /// Every Middleware managed by the agent, across namespaces.
    async fn list_managed(&self) -> Result<Vec<Middleware>, Error>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Value of [`POLICY_LABEL_KEY`] for a canonical policy name: a truncated SHA3-256 digest, which
/// fits the label length limit whatever the policy name.
pub fn policy_label(canonical_policy: &str) -> String {
    Sha3_256::digest(canonical_policy.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()[..POLICY_DIGEST_LEN]
        .to_string()
}

/// Name of the Middleware serving a canonical policy.
///
/// Distinct policies may share a name (`a-b@c` and `a@b-c`); [`upsert`] refuses to overwrite
/// the Middleware of another policy.
pub fn middleware_name(canonical_policy: &str) -> String {
    format!("zz-{}", canonical_policy.replace('@', "-"))
}

/// Builds the ForwardAuth Middleware for a policy in `namespace`.
pub fn forward_auth_middleware(
    namespace: &str,
    canonical_policy: &str,
    auth_url: String,
    auth_response_headers: Vec<String>,
) -> Middleware {
    let mut middleware = Middleware::new(
        &middleware_name(canonical_policy),
        MiddlewareSpec {
            forward_auth: Some(ForwardAuth {
                address: auth_url,
                auth_response_headers,
                trust_forward_header: None,
            }),
        },
    );
    middleware.metadata.namespace = Some(namespace.to_string());
    middleware.metadata.labels = Some(BTreeMap::from([
        (
            MANAGED_BY_LABEL_KEY.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        ),
        (
            POLICY_LABEL_KEY.to_string(),
            policy_label(canonical_policy),
        ),
    ]));
    middleware.metadata.annotations = Some(BTreeMap::from([(
        POLICY_ANNOTATION_KEY.to_string(),
        canonical_policy.to_string(),
    )]));
    middleware
}

fn served_policy(middleware: &Middleware) -> Option<&String> {
    middleware.annotations().get(POLICY_ANNOTATION_KEY)
}

/// Creates the Middleware if absent, updates it if it differs, does nothing otherwise.
///
/// Fails when the existing Middleware serves another policy.
pub async fn upsert(store: &dyn MiddlewareStore, desired: &Middleware) -> Result<(), Error> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    match store.get(&namespace, &name).await? {
        Some(existing)
            if served_policy(&existing).is_some()
                && served_policy(&existing) != served_policy(desired) =>
        {
            Err(Error::PolicyConflict {
                namespace,
                name,
                existing: served_policy(&existing).cloned().unwrap_or_default(),
                desired: served_policy(desired).cloned().unwrap_or_default(),
            })
        }
        None => {
            tracing::debug!(%namespace, %name, "creating Middleware");
            store.create(desired).await
        }
        Some(existing)
            if existing.spec != desired.spec
                || existing.labels() != desired.labels()
                || served_policy(&existing) != served_policy(desired) =>
        {
            tracing::debug!(%namespace, %name, "updating Middleware");
            let mut updated = desired.clone();
            updated.metadata.resource_version = existing.metadata.resource_version;
            store.update(&updated).await
        }
        Some(_) => Ok(()),
    }
}

/// Sets the forwarded headers of the Middlewares serving `policies`, a map of canonical policy
/// names to the headers they forward. Returns how many Middlewares were updated.
///
/// A failed update is logged and does not stop the others.
pub async fn refresh_headers(
    store: &dyn MiddlewareStore,
    policies: &HashMap<String, Vec<String>>,
) -> Result<usize, Error> {
    if policies.is_empty() {
        return Ok(0);
    }
    let by_label = policies
        .iter()
        .map(|(policy, headers)| (policy_label(policy), (policy, headers)))
        .collect::<HashMap<_, _>>();

    let mut updated = 0;
    for middleware in store.list_managed().await? {
        let Some((policy, headers)) = middleware
            .labels()
            .get(POLICY_LABEL_KEY)
            .and_then(|label| by_label.get(label))
            .copied()
        else {
            continue;
        };
        let Some(forward_auth) = &middleware.spec.forward_auth else {
            continue;
        };
        if forward_auth.auth_response_headers == *headers {
            continue;
        }

        let namespace = middleware.namespace().unwrap_or_default();
        let mut desired = forward_auth_middleware(
            &namespace,
            policy,
            forward_auth.address.clone(),
            headers.clone(),
        );
        desired.metadata.resource_version = middleware.metadata.resource_version.clone();
        match store.update(&desired).await {
            Ok(()) => updated += 1,
            Err(error) => tracing::error!(%error, %policy, "failed to refresh Middleware"),
        }
    }
    Ok(updated)
}

/// Deletes the Middlewares serving policies that are not in `live_policies` (canonical names).
pub async fn delete_orphans(
    store: &dyn MiddlewareStore,
    live_policies: &HashSet<String>,
) -> Result<usize, Error> {
    let live_labels = live_policies
        .iter()
        .map(|policy| policy_label(policy))
        .collect::<HashSet<_>>();

    let mut deleted = 0;
    for middleware in store.list_managed().await? {
        let orphan = middleware
            .labels()
            .get(POLICY_LABEL_KEY)
            .map(|label| !live_labels.contains(label))
            .unwrap_or(false);
        if !orphan {
            continue;
        }
        let namespace = middleware.namespace().unwrap_or_default();
        let name = middleware.name_any();
        match store.delete(&namespace, &name).await {
            Ok(()) => deleted += 1,
            Err(error) => tracing::error!(%error, "failed to delete orphan Middleware"),
        }
    }
    Ok(deleted)
}

/// [`MiddlewareStore`] backed by the cluster.
#[derive(Clone)]
pub struct KubeMiddlewareStore {
    kube_client: kube::Client,
}

impl KubeMiddlewareStore {
    pub fn new(kube_client: kube::Client) -> Self {
        Self { kube_client }
    }

    fn api(&self, namespace: &str) -> Api<Middleware> {
        Api::namespaced(self.kube_client.clone(), namespace)
    }
}

#[async_trait]
impl MiddlewareStore for KubeMiddlewareStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Middleware>, Error> {
        util::with_timeout(self.api(namespace).get_opt(name))
            .await
            .map_err(|source| Error::Get {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })
    }

    async fn create(&self, middleware: &Middleware) -> Result<(), Error> {
        let namespace = middleware.namespace().unwrap_or_default();
        util::with_timeout(
            self.api(&namespace)
                .create(&PostParams::default(), middleware),
        )
        .await
        .map(|_| ())
        .map_err(|source| Error::Write {
            namespace,
            name: middleware.name_any(),
            source,
        })
    }

    async fn update(&self, middleware: &Middleware) -> Result<(), Error> {
        let namespace = middleware.namespace().unwrap_or_default();
        let name = middleware.name_any();
        let mut applied = middleware.clone();
        applied.metadata.resource_version = None;
        applied.metadata.managed_fields = None;
        util::with_timeout(self.api(&namespace).patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&applied),
        ))
        .await
        .map(|_| ())
        .map_err(|source| Error::Write {
            namespace,
            name,
            source,
        })
    }

    async fn list_managed(&self) -> Result<Vec<Middleware>, Error> {
        let params = ListParams::default().labels(&format!(
            "{}={}",
            MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE
        ));
        util::with_timeout(Api::<Middleware>::all(self.kube_client.clone()).list(&params))
            .await
            .map(|list| list.items)
            .map_err(Error::List)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match util::with_timeout(self.api(namespace).delete(name, &DeleteParams::default())).await
        {
            Ok(_) => Ok(()),
            Err(CallError::Kubernetes(error)) if util::is_not_found(&error) => Ok(()),
            Err(source) => Err(Error::Delete {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            }),
        }
    }
}
