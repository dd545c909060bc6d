//! Periodic reconciliation of hub resources from the platform state.

pub mod acp;
pub mod edge_ingress;

use std::{collections::BTreeMap, fmt::Debug, future::Future, sync::Arc, time::Duration};

use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use stopper::Stopper;

use crate::{
    config::ControllerConfig,
    platform::{self, Client},
    types::{self, FIELD_MANAGER},
    util::{self, with_timeout, CallError},
};

/// Bound of one reconciliation pass: platform calls and the Kubernetes writes following them.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("platform: {0}")]
    Platform(#[from] platform::Error),
    #[error(transparent)]
    Kubernetes(#[from] CallError),
    #[error("failed to serialize object: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("reconciliation timed out after {0:?}")]
    Timeout(Duration),
}

pub struct ReconcilerContext {
    pub client: kube::Client,
    pub platform: Arc<dyn Client>,
    pub config: ControllerConfig,
}

/// A write converging one object.
#[derive(Clone, Debug, PartialEq)]
pub enum Action<K> {
    Create(K),
    /// Replaces the spec and status of an existing object.
    Update(K),
    Delete { name: String, namespace: String },
}

/// Computes the actions turning `existing` into `desired`.
///
/// Objects are matched by namespace and name. `up_to_date(existing, desired)` tells whether a
/// matched object can be left alone. Unmatched objects are deleted only when the agent manages
/// them.
pub fn plan<K, F>(desired: Vec<K>, existing: &[K], up_to_date: F) -> Vec<Action<K>>
where
    K: Resource,
    F: Fn(&K, &K) -> bool,
{
    let mut current: BTreeMap<(String, String), &K> = existing
        .iter()
        .map(|object| ((object.namespace().unwrap_or_default(), object.name_any()), object))
        .collect();

    let mut actions = Vec::new();
    for object in desired {
        let key = (object.namespace().unwrap_or_default(), object.name_any());
        match current.remove(&key) {
            None => actions.push(Action::Create(object)),
            Some(existing) if !up_to_date(existing, &object) => actions.push(Action::Update(object)),
            Some(_) => {}
        }
    }

    actions.extend(
        current
            .into_iter()
            .filter(|(_, object)| types::is_managed(object.labels()))
            .map(|((namespace, name), _)| Action::Delete { name, namespace }),
    );
    actions
}

fn status_of<K: Serialize>(object: &K) -> Result<serde_json::Value, Error> {
    let value = serde_json::to_value(object).map_err(Error::Serialize)?;
    Ok(value
        .get("status")
        .cloned()
        .unwrap_or(serde_json::Value::Null))
}

/// Performs one action.
///
/// The status is written before the spec on updates so that the hub webhook sees the hash of the
/// new spec and lets the change through without calling back the platform.
pub async fn apply<K>(client: &kube::Client, action: Action<K>) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    match action {
        Action::Create(object) => {
            let namespace = object.namespace().unwrap_or_default();
            let api = Api::<K>::namespaced(client.clone(), &namespace);
            let status = status_of(&object)?;
            let created = with_timeout(api.create(&PostParams::default(), &object)).await?;
            with_timeout(api.patch_status(
                &created.name_any(),
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": status })),
            ))
            .await?;
            tracing::info!(%kind, name = %created.name_any(), %namespace, "created");
        }
        Action::Update(mut object) => {
            let namespace = object.namespace().unwrap_or_default();
            let name = object.name_any();
            let api = Api::<K>::namespaced(client.clone(), &namespace);
            let status = status_of(&object)?;
            with_timeout(api.patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": status })),
            ))
            .await?;
            object.meta_mut().managed_fields = None;
            with_timeout(api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            ))
            .await?;
            tracing::info!(%kind, %name, %namespace, "updated");
        }
        Action::Delete { name, namespace } => {
            let api = Api::<K>::namespaced(client.clone(), &namespace);
            match with_timeout(api.delete(&name, &DeleteParams::default())).await {
                Ok(_) => tracing::info!(%kind, %name, %namespace, "deleted"),
                Err(CallError::Kubernetes(error)) if util::is_not_found(&error) => {}
                Err(error) => return Err(error.into()),
            }
        }
    }
    Ok(())
}

/// Creates or replaces an object owned by the agent with server-side apply.
pub async fn server_side_apply<K>(client: &kube::Client, object: &K) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let namespace = object.namespace().unwrap_or_default();
    let api = Api::<K>::namespaced(client.clone(), &namespace);
    with_timeout(api.patch(
        &object.name_any(),
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    ))
    .await?;
    Ok(())
}

/// Runs `reconcile` every `interval` until `stopper` fires. Failed passes are logged and retried
/// on the next tick.
pub async fn run_periodically<F, Fut>(
    name: &'static str,
    interval: Duration,
    stopper: Stopper,
    mut reconcile: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while stopper.stop_future(ticker.tick()).await.is_some() {
        let res = match tokio::time::timeout(BATCH_TIMEOUT, reconcile()).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(BATCH_TIMEOUT)),
        };
        match res {
            Ok(()) => tracing::debug!(reconciler = name, "reconciled"),
            Err(error) => tracing::error!(reconciler = name, %error, "reconcile failed"),
        }
    }
    tracing::info!(reconciler = name, "reconciler stopped");
}
