use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Service exposed by an EdgeIngress.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressService {
    pub name: String,
    pub port: i32,
}

/// Reference to the AccessControlPolicy protecting an EdgeIngress.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressAcp {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// EdgeIngress exposes a Service on the internet through the platform.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "hub.traefik.io",
    version = "v1alpha1",
    kind = "EdgeIngress",
    shortname = "ei",
    namespaced,
    status = "EdgeIngressStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressSpec {
    pub service: EdgeIngressService,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp: Option<EdgeIngressAcp>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    /// Hash of the spec the version refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}
