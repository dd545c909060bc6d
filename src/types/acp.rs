use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::acp::{apikey, basic, digest, jwt, oidc};

/// AccessControlPolicy defines an authentication scheme served by the auth server at
/// `/<name>@<namespace>`. Exactly one of the fields must be set.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "hub.traefik.io",
    version = "v1alpha1",
    kind = "AccessControlPolicy",
    shortname = "acp",
    namespaced,
    status = "AccessControlPolicyStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<jwt::Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<basic::Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_auth: Option<digest::Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<apikey::Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<oidc::Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_google: Option<oidc::GoogleConfig>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlPolicyStatus {
    /// Version of the policy on the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Hash of the spec the version refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}
