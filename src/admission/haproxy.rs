//! Reviewer wiring HAProxy ingresses to the auth server through the `auth-url` and
//! `auth-headers` annotations.

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
    policy::{self, PolicyGetter},
    Error, Reviewer,
};
use crate::ingclass::{IngressClasses, CONTROLLER_TYPE_HAPROXY};

pub const AUTH_URL_ANNOTATION: &str = "haproxy-ingress.github.io/auth-url";
pub const AUTH_HEADERS_ANNOTATION: &str = "haproxy-ingress.github.io/auth-headers";

/// Reviewer wiring HAProxy ingresses to the auth server.
pub struct HaproxyReviewer {
    agent_address: String,
    classes: IngressClasses,
    policies: Arc<dyn PolicyGetter>,
}

impl HaproxyReviewer {
    pub fn new(
        agent_address: String,
        classes: IngressClasses,
        policies: Arc<dyn PolicyGetter>,
    ) -> Self {
        Self {
            agent_address,
            classes,
            policies,
        }
    }
}

#[async_trait]
impl Reviewer for HaproxyReviewer {
    fn name(&self) -> &'static str {
        "haproxy"
    }

    fn can_review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<bool, Error> {
        if Kind::of(&req.kind) != Some(Kind::Ingress) {
            return Ok(false);
        }
        ingress::is_owned_by(
            &self.classes,
            ingress::object(req)?,
            CONTROLLER_TYPE_HAPROXY,
            ingress::DEFAULT_ANNOTATION_HAPROXY,
        )
    }

    async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Option<Patch>, Error> {
        let Some(refs) = PolicyRefs::of(req) else {
            return Ok(None);
        };
        let object = req.object.as_ref().ok_or(Error::MissingObject)?;
        let mut annotations = object.annotations().clone();

        let (auth_url, auth_headers) = match refs.new {
            Some(policy) => {
                let headers = policy::forward_headers(self.policies.as_ref(), &policy).await?;
                (ingress::auth_url(&self.agent_address, &policy), auth_headers_value(&headers))
            }
            None => (String::new(), String::new()),
        };
        ingress::set_or_remove(&mut annotations, AUTH_URL_ANNOTATION, auth_url);
        ingress::set_or_remove(&mut annotations, AUTH_HEADERS_ANNOTATION, auth_headers);

        ingress::annotations_patch(object, annotations)
    }
}

/// `auth-headers` value copying each header from the auth response.
fn auth_headers_value(headers: &[String]) -> String {
    headers
        .iter()
        .map(|header| format!("{}:req.auth_response_header.{}", header, header.to_lowercase()))
        .join(",")
}
