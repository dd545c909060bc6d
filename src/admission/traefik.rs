//! Reviewer wiring Traefik ingresses to the auth server through a ForwardAuth Middleware,
//! appended to the `router.middlewares` annotation.

use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use json_patch::Patch;
use kube::{
    core::{admission::AdmissionRequest, DynamicObject},
    ResourceExt,
};

use super::{
    ingress::{self, Kind, PolicyRefs},
    middleware::{self, MiddlewareStore},
    policy::{self, PolicyGetter},
    Error, Reviewer,
};
use crate::ingclass::{IngressClasses, CONTROLLER_TYPE_TRAEFIK};

pub const MIDDLEWARES_ANNOTATION: &str = "traefik.ingress.kubernetes.io/router.middlewares";

/// Reviewer wiring Traefik ingresses to the auth server through a ForwardAuth Middleware.
pub struct TraefikReviewer {
    agent_address: String,
    classes: IngressClasses,
    policies: Arc<dyn PolicyGetter>,
    middlewares: Arc<dyn MiddlewareStore>,
}

impl TraefikReviewer {
    pub fn new(
        agent_address: String,
        classes: IngressClasses,
        policies: Arc<dyn PolicyGetter>,
        middlewares: Arc<dyn MiddlewareStore>,
    ) -> Self {
        Self {
            agent_address,
            classes,
            policies,
            middlewares,
        }
    }
}

/// Reference to a Middleware from the router middlewares annotation.
fn middleware_ref(namespace: &str, canonical_policy: &str) -> String {
    format!(
        "{}-{}@kubernetescrd",
        namespace,
        middleware::middleware_name(canonical_policy)
    )
}

#[async_trait]
impl Reviewer for TraefikReviewer {
    fn name(&self) -> &'static str {
        "traefik"
    }

    fn can_review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<bool, Error> {
        if Kind::of(&req.kind) != Some(Kind::Ingress) {
            return Ok(false);
        }
        ingress::is_owned_by(
            &self.classes,
            ingress::object(req)?,
            CONTROLLER_TYPE_TRAEFIK,
            ingress::DEFAULT_ANNOTATION_TRAEFIK,
        )
    }

    async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Option<Patch>, Error> {
        let Some(refs) = PolicyRefs::of(req) else {
            return Ok(None);
        };
        let object = req.object.as_ref().ok_or(Error::MissingObject)?;
        let namespace = ingress::namespace(req);
        let mut annotations = object.annotations().clone();

        let mut middlewares = annotations
            .get(MIDDLEWARES_ANNOTATION)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if let Some(old) = refs.old.as_ref().filter(|old| refs.new.as_ref() != Some(*old)) {
            let stale = middleware_ref(&namespace, old);
            middlewares.retain(|m| *m != stale);
        }

        if let Some(policy) = &refs.new {
            let headers = policy::forward_headers(self.policies.as_ref(), policy).await?;
            let desired = middleware::forward_auth_middleware(
                &namespace,
                policy,
                ingress::auth_url(&self.agent_address, policy),
                headers,
            );
            middleware::upsert(self.middlewares.as_ref(), &desired).await?;

            let reference = middleware_ref(&namespace, policy);
            if !middlewares.contains(&reference) {
                middlewares.push(reference);
            }
        }

        let middlewares = middlewares.into_iter().unique().join(",");
        ingress::set_or_remove(&mut annotations, MIDDLEWARES_ANNOTATION, middlewares);
        ingress::annotations_patch(object, annotations)
    }
}
