//! What the reviewers share: kind recognition, ownership resolution and patch building.

use std::collections::BTreeMap;

use json_patch::Patch;
use kube::{
    core::{admission::AdmissionRequest, DynamicObject, GroupVersionKind},
    ResourceExt,
};
use serde::Deserialize;
use serde_json::Value;

use super::{Error, ACP_ANNOTATION};
use crate::{acp, ingclass::IngressClasses};

/// Legacy annotation selecting the controller of an ingress.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

pub const DEFAULT_ANNOTATION_TRAEFIK: &str = "traefik";
pub const DEFAULT_ANNOTATION_NGINX: &str = "nginx";
pub const DEFAULT_ANNOTATION_HAPROXY: &str = "haproxy";

const DEFAULT_ANNOTATION_VALUES: [&str; 3] = [
    DEFAULT_ANNOTATION_TRAEFIK,
    DEFAULT_ANNOTATION_NGINX,
    DEFAULT_ANNOTATION_HAPROXY,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Ingress,
    IngressRoute,
}

impl Kind {
    pub fn of(gvk: &GroupVersionKind) -> Option<Self> {
        match (gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()) {
            ("networking.k8s.io", "v1" | "v1beta1", "Ingress")
            | ("extensions", "v1beta1", "Ingress") => Some(Self::Ingress),
            ("traefik.containo.us" | "traefik.io", "v1alpha1", "IngressRoute") => {
                Some(Self::IngressRoute)
            }
            _ => None,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct IngressSpec {
    #[serde(default)]
    ingress_class_name: Option<String>,
    #[serde(default)]
    rules: Vec<IngressRule>,
}

#[derive(Deserialize, Default)]
struct IngressRule {
    #[serde(default)]
    http: Option<HttpIngressRuleValue>,
}

#[derive(Deserialize, Default)]
struct HttpIngressRuleValue {
    #[serde(default)]
    paths: Vec<Value>,
}

fn ingress_spec(object: &DynamicObject) -> Result<IngressSpec, Error> {
    match object.data.get("spec") {
        Some(spec) => serde_json::from_value(spec.clone()).map_err(Error::InvalidObject),
        None => Ok(IngressSpec::default()),
    }
}

/// The object a request is about: the new one, or the old one on deletion.
pub fn object(req: &AdmissionRequest<DynamicObject>) -> Result<&DynamicObject, Error> {
    req.object
        .as_ref()
        .or(req.old_object.as_ref())
        .ok_or(Error::MissingObject)
}

/// Namespace of the object a request is about.
pub fn namespace(req: &AdmissionRequest<DynamicObject>) -> String {
    req.namespace
        .clone()
        .or_else(|| object(req).ok().and_then(|o| o.namespace()))
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Key under which the routes of the object are accounted: `name@namespace`.
pub fn resource_id(req: &AdmissionRequest<DynamicObject>) -> String {
    let name = if req.name.is_empty() {
        object(req).map(|o| o.name_any()).unwrap_or_default()
    } else {
        req.name.clone()
    };
    format!("{}@{}", name, namespace(req))
}

/// Tells whether an Ingress belongs to the controller of type `controller_type`, whose
/// default `kubernetes.io/ingress.class` value is `default_annotation`.
pub fn is_owned_by(
    classes: &IngressClasses,
    object: &DynamicObject,
    controller_type: &str,
    default_annotation: &str,
) -> Result<bool, Error> {
    let spec = ingress_spec(object)?;
    if let Some(class_name) = spec.ingress_class_name.filter(|name| !name.is_empty()) {
        return Ok(classes.get_controller(&class_name)? == controller_type);
    }

    if let Some(value) = object.annotations().get(INGRESS_CLASS_ANNOTATION) {
        return annotation_owned_by(classes, value, controller_type, default_annotation);
    }

    Ok(classes.get_default_controller()? == controller_type)
}

/// Resolves ownership from a `kubernetes.io/ingress.class` annotation value.
pub fn annotation_owned_by(
    classes: &IngressClasses,
    value: &str,
    controller_type: &str,
    default_annotation: &str,
) -> Result<bool, Error> {
    if value == default_annotation {
        return Ok(true);
    }
    if DEFAULT_ANNOTATION_VALUES.contains(&value) {
        return Ok(false);
    }
    Ok(classes.get_controller(value)? == controller_type)
}

/// Number of routes an Ingress declares. An Ingress without any path counts as one.
pub fn count_routes(object: &DynamicObject) -> Result<usize, Error> {
    let routes = ingress_spec(object)?
        .rules
        .iter()
        .map(|rule| match &rule.http {
            Some(http) if !http.paths.is_empty() => http.paths.len(),
            _ => 1,
        })
        .sum::<usize>();
    Ok(routes.max(1))
}

/// Canonical policies referenced by the old and the new object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRefs {
    pub old: Option<String>,
    pub new: Option<String>,
}

impl PolicyRefs {
    /// `None` when neither the old nor the new object references a policy.
    pub fn of(req: &AdmissionRequest<DynamicObject>) -> Option<Self> {
        let namespace = namespace(req);
        let reference = |object: Option<&DynamicObject>| {
            object
                .and_then(|o| o.annotations().get(ACP_ANNOTATION).cloned())
                .filter(|value| !value.is_empty())
                .map(|value| acp::canonical_policy_name(&value, &namespace))
        };
        let refs = Self {
            old: reference(req.old_object.as_ref()),
            new: reference(req.object.as_ref()),
        };
        if refs.old.is_none() && refs.new.is_none() {
            None
        } else {
            Some(refs)
        }
    }
}

/// A patch replacing the whole field at `path`.
pub fn replace_patch(path: &str, value: impl serde::Serialize) -> Result<Patch, Error> {
    serde_json::from_value(serde_json::json!([{
        "op": "replace",
        "path": path,
        "value": value,
    }]))
    .map_err(Error::BuildPatch)
}

/// A patch replacing the annotations of `object` if they differ from `annotations`.
pub fn annotations_patch(
    object: &DynamicObject,
    annotations: BTreeMap<String, String>,
) -> Result<Option<Patch>, Error> {
    if object.annotations() == &annotations {
        return Ok(None);
    }
    replace_patch("/metadata/annotations", annotations).map(Some)
}

/// Sets `key` to `value`, or removes it when `value` is empty.
pub fn set_or_remove(annotations: &mut BTreeMap<String, String>, key: &str, value: String) {
    if value.is_empty() {
        annotations.remove(key);
    } else {
        annotations.insert(key.to_string(), value);
    }
}

/// Base URL of the auth server endpoint serving a policy.
pub fn auth_url(agent_address: &str, canonical_policy: &str) -> String {
    format!("{}/{}", agent_address.trim_end_matches('/'), canonical_policy)
}
