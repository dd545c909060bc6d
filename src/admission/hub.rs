//! Forwards changes of hub resources made in the cluster to the platform.
//!
//! Objects written by the agent itself from platform state are let through without a platform
//! call: they are created with the managed-by label, and updated only once their status carries
//! the hash of the new spec.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use json_patch::Patch;
use kube::{
    core::{
        admission::{AdmissionRequest, AdmissionResponse, Operation},
        DynamicObject,
    },
    ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use super::Error;
use crate::{
    acp,
    platform::{self, Client},
    types::{
        self,
        acp::{AccessControlPolicy, AccessControlPolicyStatus},
        edge_ingress::{EdgeIngress, EdgeIngressStatus},
        HUB_GROUP,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HubKind {
    AccessControlPolicy,
    EdgeIngress,
}

impl HubKind {
    fn of(req: &AdmissionRequest<DynamicObject>) -> Option<Self> {
        if req.kind.group != HUB_GROUP || req.kind.version != "v1alpha1" {
            return None;
        }
        match req.kind.kind.as_str() {
            "AccessControlPolicy" => Some(Self::AccessControlPolicy),
            "EdgeIngress" => Some(Self::EdgeIngress),
            _ => None,
        }
    }
}

pub struct HubReviewer {
    platform: Arc<dyn Client>,
}

fn parse<K: DeserializeOwned>(object: Option<&DynamicObject>) -> Result<K, Error> {
    let object = object.ok_or(Error::MissingObject)?;
    let value = serde_json::to_value(object).map_err(Error::InvalidObject)?;
    serde_json::from_value(value).map_err(Error::InvalidObject)
}

/// A patch setting the status of the object.
fn status_patch(status: impl Serialize) -> Result<Patch, Error> {
    serde_json::from_value(serde_json::json!([{
        "op": "add",
        "path": "/status",
        "value": status,
    }]))
    .map_err(Error::BuildPatch)
}

fn hash(spec: &impl Serialize) -> Result<String, Error> {
    platform::spec_hash(spec).map_err(Error::InvalidObject)
}

fn synced_from_platform(
    req: &AdmissionRequest<DynamicObject>,
    labels: &BTreeMap<String, String>,
    status_hash: Option<&String>,
    spec_hash: &str,
) -> bool {
    let created_by_agent = matches!(req.operation, Operation::Create) && types::is_managed(labels);
    created_by_agent || status_hash.map(String::as_str) == Some(spec_hash)
}

impl HubReviewer {
    pub fn new(platform: Arc<dyn Client>) -> Self {
        Self { platform }
    }

    pub async fn review(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, Error> {
        let resp = AdmissionResponse::from(req);
        let Some(kind) = HubKind::of(req) else {
            return Ok(resp.deny(format!(
                "unsupported resource {}/{} {}",
                req.kind.group, req.kind.version, req.kind.kind
            )));
        };
        if matches!(req.operation, Operation::Connect) {
            return Ok(resp.deny("CONNECT operation is not supported"));
        }

        let patch = match kind {
            HubKind::AccessControlPolicy => self.review_acp(req).await?,
            HubKind::EdgeIngress => self.review_edge_ingress(req).await?,
        };
        match patch {
            Some(patch) => resp.with_patch(patch).map_err(Error::SerializePatch),
            None => Ok(resp),
        }
    }

    async fn review_acp(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Option<Patch>, Error> {
        if matches!(req.operation, Operation::Delete) {
            let old: AccessControlPolicy = parse(req.old_object.as_ref())?;
            let version = old
                .status
                .as_ref()
                .and_then(|s| s.version.clone())
                .unwrap_or_default();
            let namespace = old.metadata.namespace.clone().unwrap_or_default();
            return match self
                .platform
                .delete_acp(&version, &old.name_any(), &namespace)
                .await
            {
                Ok(()) | Err(platform::Error::NotFound) => Ok(None),
                Err(error) => Err(error.into()),
            };
        }

        let policy: AccessControlPolicy = parse(req.object.as_ref())?;
        acp::Config::try_from(policy.spec.clone()).map_err(Error::InvalidPolicy)?;

        let spec_hash = hash(&policy.spec)?;
        let status_hash = policy.status.as_ref().and_then(|s| s.spec_hash.as_ref());
        if synced_from_platform(req, policy.labels(), status_hash, &spec_hash) {
            tracing::debug!(name = %policy.name_any(), "policy written by the agent, skipping");
            return Ok(None);
        }

        let payload = platform::Acp {
            name: policy.name_any(),
            namespace: policy.namespace().unwrap_or_default(),
            version: String::new(),
            spec: policy.spec.clone(),
        };
        let synced = match req.operation {
            Operation::Create => self.platform.create_acp(&payload).await?,
            _ => {
                let old: AccessControlPolicy = parse(req.old_object.as_ref())?;
                let version = old
                    .status
                    .as_ref()
                    .and_then(|s| s.version.clone())
                    .unwrap_or_default();
                self.platform.update_acp(&version, &payload).await?
            }
        };

        status_patch(AccessControlPolicyStatus {
            version: Some(synced.version),
            spec_hash: Some(spec_hash),
        })
        .map(Some)
    }

    async fn review_edge_ingress(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<Option<Patch>, Error> {
        if matches!(req.operation, Operation::Delete) {
            let old: EdgeIngress = parse(req.old_object.as_ref())?;
            let version = old
                .status
                .as_ref()
                .and_then(|s| s.version.clone())
                .unwrap_or_default();
            let namespace = old.metadata.namespace.clone().unwrap_or_default();
            return match self
                .platform
                .delete_edge_ingress(&version, &old.name_any(), &namespace)
                .await
            {
                Ok(()) | Err(platform::Error::NotFound) => Ok(None),
                Err(error) => Err(error.into()),
            };
        }

        let edge_ingress: EdgeIngress = parse(req.object.as_ref())?;
        let spec_hash = hash(&edge_ingress.spec)?;
        let status_hash = edge_ingress.status.as_ref().and_then(|s| s.spec_hash.as_ref());
        if synced_from_platform(req, edge_ingress.labels(), status_hash, &spec_hash) {
            tracing::debug!(name = %edge_ingress.name_any(), "EdgeIngress written by the agent, skipping");
            return Ok(None);
        }

        let payload = platform::EdgeIngressRequest {
            name: edge_ingress.name_any(),
            namespace: edge_ingress.namespace().unwrap_or_default(),
            service: edge_ingress.spec.service.clone(),
            acp: edge_ingress.spec.acp.clone(),
        };
        let synced = match req.operation {
            Operation::Create => self.platform.create_edge_ingress(&payload).await?,
            _ => {
                let old: EdgeIngress = parse(req.old_object.as_ref())?;
                let version = old
                    .status
                    .as_ref()
                    .and_then(|s| s.version.clone())
                    .unwrap_or_default();
                self.platform.update_edge_ingress(&version, &payload).await?
            }
        };

        status_patch(edge_ingress_status(&synced, spec_hash)).map(Some)
    }
}

/// Status of an EdgeIngress mirroring the platform state.
pub fn edge_ingress_status(synced: &platform::EdgeIngress, spec_hash: String) -> EdgeIngressStatus {
    let domain = Some(synced.domain.clone()).filter(|d| !d.is_empty());
    EdgeIngressStatus {
        version: Some(synced.version.clone()),
        synced_at: Some(Utc::now()),
        url: domain.as_ref().map(|d| format!("https://{}", d)),
        domain,
        connection: Some(synced.status.clone()).filter(|s| !s.is_empty()),
        spec_hash: Some(spec_hash),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        admission::ingress::tests::request,
        platform::tests::FakeClient,
        types::{MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE},
    };

    const ACP_KIND: (&str, &str, &str) = ("hub.traefik.io", "v1alpha1", "AccessControlPolicy");
    const EDGE_INGRESS_KIND: (&str, &str, &str) = ("hub.traefik.io", "v1alpha1", "EdgeIngress");

    fn policy(status: Value) -> Value {
        json!({
            "apiVersion": "hub.traefik.io/v1alpha1",
            "kind": "AccessControlPolicy",
            "metadata": { "name": "whoami", "namespace": "test" },
            "spec": { "basicAuth": { "users": ["jane:pw"] } },
            "status": status,
        })
    }

    /// Status set by the patch of an allowed response.
    fn patched_status(resp: AdmissionResponse) -> Value {
        assert!(resp.allowed, "{}", resp.result.message);
        let patch: Value = serde_json::from_slice(&resp.patch.unwrap()).unwrap();
        assert_eq!(patch[0]["path"], "/status");
        patch[0]["value"].clone()
    }

    #[tokio::test]
    async fn test_acp_lifecycle() {
        let platform = Arc::new(FakeClient::default());
        let reviewer = HubReviewer::new(platform.clone());

        let created = policy(json!({}));
        let resp = reviewer
            .review(&request("CREATE", ACP_KIND, Some(created.clone()), None))
            .await
            .unwrap();
        let status = patched_status(resp);
        assert_eq!(status["version"], "1");
        assert_eq!(platform.acps.lock().len(), 1);

        // Written back by the agent: no platform call.
        let synced = policy(status.clone());
        let resp = reviewer
            .review(&request("UPDATE", ACP_KIND, Some(synced.clone()), Some(synced.clone())))
            .await
            .unwrap();
        assert!(resp.allowed);
        assert!(resp.patch.is_none());

        // User change.
        let mut changed = synced.clone();
        changed["spec"]["basicAuth"]["users"] = json!(["jane:pw", "john:pw"]);
        let resp = reviewer
            .review(&request("UPDATE", ACP_KIND, Some(changed.clone()), Some(synced.clone())))
            .await
            .unwrap();
        assert_eq!(patched_status(resp)["version"], "2");

        // Stale version.
        let err = reviewer
            .review(&request("UPDATE", ACP_KIND, Some(changed.clone()), Some(synced)))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "platform conflict: a more recent version of this resource is available"
        );

        let resp = reviewer
            .review(&request("DELETE", ACP_KIND, None, Some(changed)))
            .await
            .unwrap();
        assert!(resp.allowed);
        assert!(platform.acps.lock().is_empty());
    }

    #[tokio::test]
    async fn test_created_by_agent_is_skipped() {
        let platform = Arc::new(FakeClient::default());
        let reviewer = HubReviewer::new(platform.clone());
        let mut object = policy(json!({}));
        object["metadata"]["labels"] = json!({ MANAGED_BY_LABEL_KEY: MANAGED_BY_LABEL_VALUE });

        let resp = reviewer
            .review(&request("CREATE", ACP_KIND, Some(object.clone()), None))
            .await
            .unwrap();
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
        assert!(platform.acps.lock().is_empty());

        // The label alone does not exempt later changes: the platform gets called, and knows
        // nothing of this policy yet.
        let err = reviewer
            .review(&request("UPDATE", ACP_KIND, Some(object.clone()), Some(object)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Platform(platform::Error::VersionConflict)));
    }

    #[tokio::test]
    async fn test_invalid_policy_is_rejected() {
        let reviewer = HubReviewer::new(Arc::new(FakeClient::default()));
        let mut object = policy(json!({}));
        object["spec"] = json!({});
        let err = reviewer
            .review(&request("CREATE", ACP_KIND, Some(object), None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn test_edge_ingress_created() {
        let platform = Arc::new(FakeClient::default());
        let reviewer = HubReviewer::new(platform.clone());
        let object = json!({
            "apiVersion": "hub.traefik.io/v1alpha1",
            "kind": "EdgeIngress",
            "metadata": { "name": "whoami", "namespace": "test" },
            "spec": { "service": { "name": "whoami", "port": 80 } },
        });

        let resp = reviewer
            .review(&request("CREATE", EDGE_INGRESS_KIND, Some(object.clone()), None))
            .await
            .unwrap();
        let status = patched_status(resp);
        assert_eq!(status["domain"], "whoami-test.hub.example.com");
        assert_eq!(status["url"], "https://whoami-test.hub.example.com");
        assert_eq!(platform.edge_ingresses.lock().len(), 1);

        let mut synced = object;
        synced["status"] = status;
        let resp = reviewer
            .review(&request("DELETE", EDGE_INGRESS_KIND, None, Some(synced)))
            .await
            .unwrap();
        assert!(resp.allowed);
        assert!(platform.edge_ingresses.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported() {
        let reviewer = HubReviewer::new(Arc::new(FakeClient::default()));

        let resp = reviewer
            .review(&request("CONNECT", ACP_KIND, Some(policy(json!({}))), None))
            .await
            .unwrap();
        assert!(!resp.allowed);

        let resp = reviewer
            .review(&request(
                "CREATE",
                ("hub.traefik.io", "v1alpha1", "APIAccess"),
                Some(policy(json!({}))),
                None,
            ))
            .await
            .unwrap();
        assert!(!resp.allowed);
    }
}
