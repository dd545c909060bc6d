//! Admission webhook: wires ingresses to the auth server and forwards hub resources to the
//! platform.

pub mod haproxy;
pub mod hub;
pub mod ingress;
pub mod ingress_route;
pub mod middleware;
pub mod nginx;
pub mod policy;
pub mod policy_sync;
pub mod traefik;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract, response, routing, Router};
use json_patch::Patch;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation, SerializePatchError},
    DynamicObject,
};
use tower_http::trace::TraceLayer;

use crate::{ingclass, platform, quota::Quotas};

/// Annotation referencing the AccessControlPolicy protecting an ingress.
pub const ACP_ANNOTATION: &str = "hub.traefik.io/access-control-policy";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to resolve IngressClass: {0}")]
    IngressClass(#[from] ingclass::Error),
    #[error(transparent)]
    Quota(#[from] crate::quota::Error),
    #[error(transparent)]
    Policy(#[from] policy::Error),
    #[error(transparent)]
    Middleware(#[from] middleware::Error),
    #[error(transparent)]
    Platform(#[from] platform::Error),
    #[error("invalid object: {0}")]
    InvalidObject(#[source] serde_json::Error),
    #[error("invalid AccessControlPolicy: {0}")]
    InvalidPolicy(#[source] crate::acp::Error),
    #[error("admission request carries no object")]
    MissingObject,
    #[error("failed to build patch: {0}")]
    BuildPatch(#[source] serde_json::Error),
    #[error("failed to serialize patch: {0}")]
    SerializePatch(#[source] SerializePatchError),
}

/// Decides whether and how an ingress gets wired to the auth server, for one ingress
/// controller.
#[async_trait]
pub trait Reviewer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tells whether the object of the request belongs to this reviewer's controller.
    fn can_review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<bool, Error>;

    /// Computes the patch wiring the object. `None` when nothing has to change.
    async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Option<Patch>, Error>;
}

struct State {
    reviewers: Vec<Arc<dyn Reviewer>>,
    quotas: Quotas,
    hub: Option<hub::HubReviewer>,
}

/// Builds the webhook router. Hub resources are only accepted when `hub` is set.
pub fn create_app(
    reviewers: Vec<Arc<dyn Reviewer>>,
    quotas: Quotas,
    hub: Option<hub::HubReviewer>,
) -> Router {
    let state = Arc::new(State {
        reviewers,
        quotas,
        hub,
    });
    Router::new()
        .route("/ping", routing::get(ping))
        .route("/ingress", routing::post(ingress_handler))
        .route("/hub", routing::post(hub_handler))
        .layer(extract::Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn ping() -> &'static str {
    "ok"
}

type ReviewResponse = response::Json<AdmissionReview<DynamicObject>>;

fn into_request(
    review: AdmissionReview<DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, ReviewResponse> {
    match review.try_into() {
        Ok(req) => Ok(req),
        Err(error) => {
            tracing::error!(%error, "invalid request");
            Err(response::Json(
                AdmissionResponse::invalid(error.to_string()).into_review(),
            ))
        }
    }
}

async fn ingress_handler(
    extract::Extension(state): extract::Extension<Arc<State>>,
    extract::Json(review): extract::Json<AdmissionReview<DynamicObject>>,
) -> ReviewResponse {
    let req = match into_request(review) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let resp = match review_ingress(&state, &req).await {
        Ok(resp) => resp,
        Err(error) => {
            tracing::error!(%req.name, ?req.namespace, kind = %req.kind.kind, %error, "failed to review");
            AdmissionResponse::from(&req).deny(error.to_string())
        }
    };
    response::Json(resp.into_review())
}

async fn review_ingress(
    state: &State,
    req: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, Error> {
    let resp = AdmissionResponse::from(req);
    if ingress::Kind::of(&req.kind).is_none() {
        return Ok(resp.deny(format!(
            "unsupported resource {}/{} {}",
            req.kind.group, req.kind.version, req.kind.kind
        )));
    }

    match req.operation {
        Operation::Connect => return Ok(resp.deny("CONNECT operation is not supported")),
        Operation::Delete => {
            state.quotas.tx(&ingress::resource_id(req), 0)?.commit();
            return Ok(resp);
        }
        Operation::Create | Operation::Update => {}
    }

    for reviewer in &state.reviewers {
        if !reviewer.can_review(req)? {
            continue;
        }
        tracing::debug!(reviewer = reviewer.name(), %req.name, ?req.namespace, "reviewing");
        return match reviewer.review(req).await? {
            Some(patch) => resp.with_patch(patch).map_err(Error::SerializePatch),
            None => Ok(resp),
        };
    }

    tracing::debug!(%req.name, ?req.namespace, "no reviewer owns the object, skipping");
    Ok(resp)
}

async fn hub_handler(
    extract::Extension(state): extract::Extension<Arc<State>>,
    extract::Json(review): extract::Json<AdmissionReview<DynamicObject>>,
) -> ReviewResponse {
    let req = match into_request(review) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let resp = match &state.hub {
        Some(hub) => match hub.review(&req).await {
            Ok(resp) => resp,
            Err(error) => {
                tracing::error!(%req.name, ?req.namespace, kind = %req.kind.kind, %error, "failed to review hub resource");
                AdmissionResponse::from(&req).deny(error.to_string())
            }
        },
        None => AdmissionResponse::from(&req).deny("platform is not configured"),
    };
    response::Json(resp.into_review())
}
