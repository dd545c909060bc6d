//! Keeps the objects derived from AccessControlPolicies in line with them.
//!
//! Traefik Middlewares are rewritten when the headers their policy forwards change and deleted
//! once the policy is gone. Ingresses referencing a changed policy are annotated so that the
//! webhook reviews them again, which refreshes their Nginx and HAProxy annotations.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use futures_util::StreamExt;
use kube::{
    api::{ListParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::ApiResource,
    runtime::{watcher, WatchStreamExt},
    Api, ResourceExt,
};
use serde_json::json;
use stopper::Stopper;

use super::{
    middleware::{self, MiddlewareStore},
    ACP_ANNOTATION,
};
use crate::{acp, types::acp::AccessControlPolicy, util};

/// Annotation set on Ingresses to have the webhook review them again.
pub const LAST_PATCH_REQUESTED_ANNOTATION: &str = "hub.traefik.io/last-patch-requested-at";

/// Live policies and the headers they forward.
#[derive(Debug, Default)]
struct PolicyTracker {
    live: HashSet<String>,
    /// Forwarded headers of the live policies with a valid configuration.
    headers: HashMap<String, Vec<String>>,
}

/// What a policy event requires.
#[derive(Debug, Default, PartialEq, Eq)]
struct Changes {
    /// Policies whose Middlewares may forward stale headers, with the headers they should forward.
    refresh: HashMap<String, Vec<String>>,
    /// Policies whose forwarded headers changed since they were last seen.
    changed: Vec<String>,
}

impl PolicyTracker {
    fn applied(&mut self, policy: &AccessControlPolicy) -> Changes {
        let previous = self.headers.get(&canonical(policy)).cloned();
        let mut changes = Changes::default();
        self.record(policy, previous.as_ref(), &mut changes);
        changes
    }

    fn deleted(&mut self, policy: &AccessControlPolicy) {
        let name = canonical(policy);
        self.live.remove(&name);
        self.headers.remove(&name);
    }

    fn restarted(&mut self, policies: &[AccessControlPolicy]) -> Changes {
        let previous = std::mem::take(&mut self.headers);
        self.live.clear();
        let mut changes = Changes::default();
        for policy in policies {
            self.record(policy, previous.get(&canonical(policy)), &mut changes);
        }
        changes.changed.sort();
        changes
    }

    fn record(
        &mut self,
        policy: &AccessControlPolicy,
        previous: Option<&Vec<String>>,
        changes: &mut Changes,
    ) {
        let name = canonical(policy);
        self.live.insert(name.clone());

        let headers = match acp::Config::try_from(policy.spec.clone()) {
            Ok(config) => config.forward_header_names(),
            Err(error) => {
                tracing::warn!(policy = %name, %error, "ignoring invalid AccessControlPolicy");
                self.headers.remove(&name);
                return;
            }
        };
        if previous != Some(&headers) {
            if previous.is_some() {
                changes.changed.push(name.clone());
            }
            changes.refresh.insert(name.clone(), headers.clone());
        }
        self.headers.insert(name, headers);
    }
}

fn canonical(policy: &AccessControlPolicy) -> String {
    acp::canonical_name(&policy.name_any(), &policy.namespace().unwrap_or_default())
}

/// Tells whether an Ingress of `namespace` carrying `annotations` is protected by
/// `canonical_policy`.
pub fn references_policy(
    annotations: &BTreeMap<String, String>,
    namespace: &str,
    canonical_policy: &str,
) -> bool {
    annotations
        .get(ACP_ANNOTATION)
        .filter(|reference| !reference.is_empty())
        .map(|reference| acp::canonical_policy_name(reference, namespace) == canonical_policy)
        .unwrap_or(false)
}

/// Resources the reviewers handle. Each entry lists versions of the same stored objects by
/// preference, and only the first served one is listed.
const REVIEWED_KINDS: [&[(&str, &str, &str)]; 3] = [
    &[
        ("networking.k8s.io", "v1", "Ingress"),
        ("networking.k8s.io", "v1beta1", "Ingress"),
        ("extensions", "v1beta1", "Ingress"),
    ],
    &[("traefik.io", "v1alpha1", "IngressRoute")],
    &[("traefik.containo.us", "v1alpha1", "IngressRoute")],
];

/// Annotates the Ingresses and IngressRoutes protected by one of `policies` so that they get
/// reviewed again. Returns how many objects were annotated.
async fn request_reviews(
    kube_client: &kube::Client,
    policies: &[String],
) -> Result<usize, util::CallError> {
    let mut requested = 0;
    for versions in REVIEWED_KINDS {
        for &(group, version, kind) in versions {
            let group_version = format!("{group}/{version}");
            match util::is_api_served(kube_client, &group_version, kind).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    tracing::error!(%group_version, kind, %error, "failed to discover API");
                    continue;
                }
            }
            let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
            requested += request_reviews_of(kube_client, &resource, policies).await?;
            break;
        }
    }
    Ok(requested)
}

async fn request_reviews_of(
    kube_client: &kube::Client,
    resource: &ApiResource,
    policies: &[String],
) -> Result<usize, util::CallError> {
    let objects = util::with_timeout(
        Api::<DynamicObject>::all_with(kube_client.clone(), resource).list(&ListParams::default()),
    )
    .await?
    .items;

    let patch = json!({
        "metadata": {
            "annotations": { LAST_PATCH_REQUESTED_ANNOTATION: Utc::now().to_rfc3339() }
        }
    });
    let mut requested = 0;
    for object in objects {
        let namespace = object
            .namespace()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| "default".to_string());
        let referenced = policies
            .iter()
            .any(|policy| references_policy(object.annotations(), &namespace, policy));
        if !referenced {
            continue;
        }

        let name = object.name_any();
        let kind = &resource.kind;
        let api = Api::<DynamicObject>::namespaced_with(kube_client.clone(), &namespace, resource);
        match util::with_timeout(api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
        {
            Ok(_) => requested += 1,
            Err(error) => {
                tracing::error!(%namespace, %name, %kind, %error, "failed to request review")
            }
        }
    }
    Ok(requested)
}

/// Applies what a policy event requires to the Middlewares and Ingresses.
async fn propagate(kube_client: &kube::Client, store: &dyn MiddlewareStore, changes: Changes) {
    match middleware::refresh_headers(store, &changes.refresh).await {
        Ok(0) => {}
        Ok(updated) => tracing::info!(updated, "refreshed Middlewares of changed policies"),
        Err(error) => tracing::error!(%error, "failed to refresh Middlewares"),
    }
    if changes.changed.is_empty() {
        return;
    }
    match request_reviews(kube_client, &changes.changed).await {
        Ok(requested) => {
            tracing::info!(policies = ?changes.changed, requested, "requested Ingress reviews")
        }
        Err(error) => tracing::error!(%error, "failed to list reviewed resources"),
    }
}

/// Follows AccessControlPolicies until stopped, propagating their changes and deleting the
/// Middlewares of deleted ones.
pub async fn run(kube_client: kube::Client, store: impl MiddlewareStore, stopper: Stopper) {
    let api = Api::<AccessControlPolicy>::all(kube_client.clone());
    let mut tracker = PolicyTracker::default();

    let events =
        watcher(api, watcher::Config::default()).backoff(util::watch_backoff());
    let mut events = Box::pin(stopper.stop_stream(events));

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(%error, "AccessControlPolicy watch failed");
                continue;
            }
        };
        let changes = match event {
            watcher::Event::Applied(policy) => tracker.applied(&policy),
            watcher::Event::Deleted(policy) => {
                tracker.deleted(&policy);
                Changes::default()
            }
            watcher::Event::Restarted(policies) => tracker.restarted(&policies),
        };
        propagate(&kube_client, &store, changes).await;

        match middleware::delete_orphans(&store, &tracker.live).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "deleted Middlewares of removed policies"),
            Err(error) => tracing::error!(%error, "failed to clean up Middlewares"),
        }
    }
    tracing::info!("AccessControlPolicy sync stopped");
}
