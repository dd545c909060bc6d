use std::sync::Arc;

use async_trait::async_trait;
use json_patch::Patch;
use kube::{
    core::{admission::AdmissionRequest, DynamicObject},
    ResourceExt,
};
use serde_json::{Map, Value};

use super::{
    ingress::{self, Kind, PolicyRefs},
    middleware::{self, MiddlewareStore},
    policy::{self, PolicyGetter},
    Error, Reviewer,
};
use crate::{
    ingclass::{IngressClasses, CONTROLLER_TYPE_TRAEFIK},
    quota::Quotas,
};

/// Reviewer wiring Traefik IngressRoutes to the auth server through a ForwardAuth Middleware
/// referenced from every route.
pub struct IngressRouteReviewer {
    agent_address: String,
    classes: IngressClasses,
    policies: Arc<dyn PolicyGetter>,
    middlewares: Arc<dyn MiddlewareStore>,
    quotas: Quotas,
}

impl IngressRouteReviewer {
    pub fn new(
        agent_address: String,
        classes: IngressClasses,
        policies: Arc<dyn PolicyGetter>,
        middlewares: Arc<dyn MiddlewareStore>,
        quotas: Quotas,
    ) -> Self {
        Self {
            agent_address,
            classes,
            policies,
            middlewares,
            quotas,
        }
    }
}

fn routes(object: &DynamicObject) -> Result<Vec<Value>, Error> {
    match object.data.pointer("/spec/routes") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(routes) => serde_json::from_value(routes.clone()).map_err(Error::InvalidObject),
    }
}

/// Tells whether a route middleware entry points at `name` in `namespace`, the namespace of
/// the IngressRoute. Entries without a namespace live in the namespace of the IngressRoute.
fn is_ref(entry: &Value, name: &str, namespace: &str) -> bool {
    let entry_namespace = entry
        .get("namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty())
        .unwrap_or(namespace);
    entry.get("name").and_then(Value::as_str) == Some(name) && entry_namespace == namespace
}

/// Removes the reference to `stale` and appends one to `current` on every route.
fn rewire_routes(
    routes: &mut [Value],
    namespace: &str,
    stale: Option<&str>,
    current: Option<&str>,
) {
    for route in routes.iter_mut() {
        let Some(route) = route.as_object_mut() else {
            continue;
        };
        let had_middlewares = route.contains_key("middlewares");
        let mut refs = route
            .get("middlewares")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some(stale) = stale {
            refs.retain(|entry| !is_ref(entry, stale, namespace));
        }
        if let Some(current) = current {
            if !refs
                .iter()
                .any(|entry| is_ref(entry, current, namespace))
            {
                let mut entry = Map::new();
                entry.insert("name".to_string(), Value::from(current));
                entry.insert("namespace".to_string(), Value::from(namespace));
                refs.push(Value::Object(entry));
            }
        }

        if refs.is_empty() && !had_middlewares {
            continue;
        }
        route.insert("middlewares".to_string(), Value::Array(refs));
    }
}

#[async_trait]
impl Reviewer for IngressRouteReviewer {
    fn name(&self) -> &'static str {
        "ingressroute"
    }

    fn can_review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<bool, Error> {
        if Kind::of(&req.kind) != Some(Kind::IngressRoute) {
            return Ok(false);
        }
        match ingress::object(req)?
            .annotations()
            .get(ingress::INGRESS_CLASS_ANNOTATION)
        {
            Some(value) => ingress::annotation_owned_by(
                &self.classes,
                value,
                CONTROLLER_TYPE_TRAEFIK,
                ingress::DEFAULT_ANNOTATION_TRAEFIK,
            ),
            None => Ok(true),
        }
    }

    async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Option<Patch>, Error> {
        let Some(refs) = PolicyRefs::of(req) else {
            return Ok(None);
        };
        let object = req.object.as_ref().ok_or(Error::MissingObject)?;
        let namespace = ingress::namespace(req);
        let resource_id = ingress::resource_id(req);
        let current = routes(object)?;
        let mut routes = current.clone();

        let stale = refs
            .old
            .as_ref()
            .filter(|old| refs.new.as_ref() != Some(*old))
            .map(|old| middleware::middleware_name(old));

        let Some(policy) = &refs.new else {
            rewire_routes(&mut routes, &namespace, stale.as_deref(), None);
            self.quotas.tx(&resource_id, 0)?.commit();
            return patch_if_changed(&current, routes);
        };

        let reservation = self.quotas.tx(&resource_id, routes.len().max(1))?;

        let headers = policy::forward_headers(self.policies.as_ref(), policy).await?;
        let desired = middleware::forward_auth_middleware(
            &namespace,
            policy,
            ingress::auth_url(&self.agent_address, policy),
            headers,
        );
        middleware::upsert(self.middlewares.as_ref(), &desired).await?;

        let name = middleware::middleware_name(policy);
        rewire_routes(&mut routes, &namespace, stale.as_deref(), Some(&name));

        let patch = patch_if_changed(&current, routes)?;
        reservation.commit();
        Ok(patch)
    }
}

fn patch_if_changed(current: &[Value], routes: Vec<Value>) -> Result<Option<Patch>, Error> {
    if current == routes.as_slice() {
        return Ok(None);
    }
    ingress::replace_patch("/spec/routes", routes).map(Some)
}
