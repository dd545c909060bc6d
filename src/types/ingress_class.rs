use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Hub flavoured IngressClass, used on clusters where the stock resource is not served.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(group = "hub.traefik.io", version = "v1alpha1", kind = "IngressClass")]
#[serde(rename_all = "camelCase")]
pub struct IngressClassSpec {
    /// Controller type, e.g. `traefik.io/ingress-controller`.
    pub controller: String,
}

/// Subset of the legacy `networking.k8s.io/v1beta1` IngressClass spec the agent reads.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIngressClassSpec {
    #[serde(default)]
    pub controller: Option<String>,
}
