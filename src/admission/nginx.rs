//! Reviewer wiring Nginx ingresses to the auth server through `auth-url` and a managed
//! `configuration-snippet` block.

use std::sync::Arc;

use async_trait::async_trait;
use json_patch::Patch;
use kube::{
    core::{admission::AdmissionRequest, DynamicObject},
    ResourceExt,
};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    ingress::{self, Kind, PolicyRefs},
    policy::{self, PolicyGetter},
    Error, Reviewer,
};
use crate::{
    ingclass::{IngressClasses, CONTROLLER_TYPE_NGINX},
    quota::Quotas,
};

pub const AUTH_URL_ANNOTATION: &str = "nginx.ingress.kubernetes.io/auth-url";
pub const CONFIGURATION_SNIPPET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/configuration-snippet";

const SNIPPET_START: &str = "##hub-snippet-start";
const SNIPPET_END: &str = "##hub-snippet-end";

static MANAGED_SNIPPET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^(.*)(##hub-snippet-start.*##hub-snippet-end)(.*)$")
        .expect("managed snippet pattern is valid")
});

pub struct NginxReviewer {
    agent_address: String,
    classes: IngressClasses,
    policies: Arc<dyn PolicyGetter>,
    quotas: Quotas,
}

impl NginxReviewer {
    pub fn new(
        agent_address: String,
        classes: IngressClasses,
        policies: Arc<dyn PolicyGetter>,
        quotas: Quotas,
    ) -> Self {
        Self {
            agent_address,
            classes,
            policies,
            quotas,
        }
    }

    /// Managed snippet for a policy. A missing policy yields a snippet rejecting every request.
    async fn snippet(&self, canonical_policy: &str) -> Result<String, Error> {
        match self.policies.get_config(canonical_policy).await {
            Ok(config) => Ok(managed_snippet(&config.forward_header_names())),
            Err(policy::Error::NotFound(_)) => {
                tracing::warn!(policy = %canonical_policy, "policy not found, denying all traffic");
                Ok(wrap_snippet("return 404;"))
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl Reviewer for NginxReviewer {
    fn name(&self) -> &'static str {
        "nginx"
    }

    fn can_review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<bool, Error> {
        if Kind::of(&req.kind) != Some(Kind::Ingress) {
            return Ok(false);
        }
        ingress::is_owned_by(
            &self.classes,
            ingress::object(req)?,
            CONTROLLER_TYPE_NGINX,
            ingress::DEFAULT_ANNOTATION_NGINX,
        )
    }

    async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Option<Patch>, Error> {
        let Some(refs) = PolicyRefs::of(req) else {
            return Ok(None);
        };
        let object = req.object.as_ref().ok_or(Error::MissingObject)?;
        let resource_id = ingress::resource_id(req);
        let mut annotations = object.annotations().clone();

        let Some(policy) = refs.new else {
            tracing::debug!(%resource_id, "policy removed, cleaning up");
            annotations.remove(AUTH_URL_ANNOTATION);
            let snippet = merge_snippet(
                annotations
                    .get(CONFIGURATION_SNIPPET_ANNOTATION)
                    .map(String::as_str)
                    .unwrap_or_default(),
                "",
            );
            ingress::set_or_remove(&mut annotations, CONFIGURATION_SNIPPET_ANNOTATION, snippet);
            self.quotas.tx(&resource_id, 0)?.commit();
            return ingress::annotations_patch(object, annotations);
        };

        let reservation = self
            .quotas
            .tx(&resource_id, ingress::count_routes(object)?)?;

        let snippet = self.snippet(&policy).await?;
        annotations.insert(
            AUTH_URL_ANNOTATION.to_string(),
            ingress::auth_url(&self.agent_address, &policy),
        );
        let merged = merge_snippet(
            annotations
                .get(CONFIGURATION_SNIPPET_ANNOTATION)
                .map(String::as_str)
                .unwrap_or_default(),
            &snippet,
        );
        ingress::set_or_remove(&mut annotations, CONFIGURATION_SNIPPET_ANNOTATION, merged);

        let patch = ingress::annotations_patch(object, annotations)?;
        reservation.commit();
        Ok(patch)
    }
}

fn wrap_snippet(body: &str) -> String {
    format!("{}\n{}\n{}", SNIPPET_START, body, SNIPPET_END)
}

/// Managed snippet copying each forwarded header from the auth response to the upstream
/// request.
fn managed_snippet(headers: &[String]) -> String {
    let body = headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            format!(
                "auth_request_set $value_{i} $upstream_http_{}; proxy_set_header {header} $value_{i};",
                header.replace('-', "_"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    wrap_snippet(&body)
}

/// Replaces the managed block of `old` with `new`, keeping the text around it byte for byte.
///
/// Without a managed block in `old`, `new` is put in front of it. Removing the block also
/// removes the line break that joined it to the rest.
pub fn merge_snippet(old: &str, new: &str) -> String {
    if let Some(captures) = MANAGED_SNIPPET.captures(old) {
        let mut before = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let mut after = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
        if new.is_empty() {
            if (before.is_empty() || before.ends_with('\n')) && after.starts_with('\n') {
                after = &after[1..];
            } else if after.is_empty() {
                before = before.strip_suffix('\n').unwrap_or(before);
            }
        }
        return format!("{}{}{}", before, new, after);
    }

    match (new.is_empty(), old.is_empty()) {
        (true, _) => old.to_string(),
        (false, true) => new.to_string(),
        (false, false) => format!("{}\n{}", new, old),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde_json::{json, Value};

    use super::*;
    use crate::{
        acp::{self, jwt},
        admission::{
            ingress::tests::{apply, classes, ingress, request, INGRESS_V1},
            policy::tests::FakePolicies,
            ACP_ANNOTATION,
        },
    };

    fn reviewer(quotas: Quotas) -> NginxReviewer {
        let config = acp::Config::Jwt(jwt::Config {
            signing_secret: Some("secret".to_string()),
            forward_headers: BTreeMap::from([(
                "X-Header".to_string(),
                "claimsToForward".to_string(),
            )]),
            ..Default::default()
        });
        NginxReviewer::new(
            "http://agent".to_string(),
            classes(&[("nginx", CONTROLLER_TYPE_NGINX, true)]),
            Arc::new(FakePolicies(HashMap::from([(
                "my-policy@test".to_string(),
                config,
            )]))),
            quotas,
        )
    }

    fn patched_annotations(patch: &Patch) -> Value {
        serde_json::to_value(patch).unwrap()[0]["value"].clone()
    }

    #[tokio::test]
    async fn test_review_adds_auth_wiring() {
        let quotas = Quotas::new(10);
        let reviewer = reviewer(quotas.clone());
        let object = ingress(
            json!({ ACP_ANNOTATION: "my-policy" }),
            json!({ "rules": [{ "http": { "paths": [{ "path": "/" }, { "path": "/api" }] } }] }),
        );
        let req = request("CREATE", INGRESS_V1, Some(object.clone()), None);
        assert!(reviewer.can_review(&req).unwrap());

        let patch = reviewer.review(&req).await.unwrap().unwrap();
        assert_eq!(
            patched_annotations(&patch),
            json!({
                ACP_ANNOTATION: "my-policy",
                AUTH_URL_ANNOTATION: "http://agent/my-policy@test",
                CONFIGURATION_SNIPPET_ANNOTATION: "##hub-snippet-start\nauth_request_set $value_0 $upstream_http_X_Header; proxy_set_header X-Header $value_0;\n##hub-snippet-end",
            })
        );
        assert_eq!(quotas.used_by("whoami@test"), 2);

        // Replaying against the patched object is a no-op.
        let patched = apply(&object, &patch);
        let req = request("UPDATE", INGRESS_V1, Some(patched.clone()), Some(patched));
        assert!(reviewer.review(&req).await.unwrap().is_none());
        assert_eq!(quotas.used_by("whoami@test"), 2);
    }

    #[tokio::test]
    async fn test_review_without_policy_annotation() {
        let reviewer = reviewer(Quotas::new(10));
        let object = ingress(json!({}), json!({}));
        let req = request("UPDATE", INGRESS_V1, Some(object.clone()), Some(object));
        assert!(reviewer.review(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_review_missing_policy_fails_closed() {
        let reviewer = reviewer(Quotas::new(10));
        let object = ingress(json!({ ACP_ANNOTATION: "unknown" }), json!({}));
        let req = request("CREATE", INGRESS_V1, Some(object), None);

        let patch = reviewer.review(&req).await.unwrap().unwrap();
        assert_eq!(
            patched_annotations(&patch)[CONFIGURATION_SNIPPET_ANNOTATION],
            "##hub-snippet-start\nreturn 404;\n##hub-snippet-end"
        );
    }

    #[tokio::test]
    async fn test_review_quota_exceeded() {
        let quotas = Quotas::new(1);
        let reviewer = reviewer(quotas.clone());
        let object = ingress(
            json!({ ACP_ANNOTATION: "my-policy" }),
            json!({ "rules": [{ "host": "a" }, { "host": "b" }] }),
        );
        let req = request("CREATE", INGRESS_V1, Some(object), None);

        assert!(matches!(
            reviewer.review(&req).await,
            Err(Error::Quota(_))
        ));
        assert_eq!(quotas.used(), 0);
    }

    #[tokio::test]
    async fn test_review_policy_removed() {
        let quotas = Quotas::new(10);
        let reviewer = reviewer(quotas.clone());
        quotas.tx("whoami@test", 1).unwrap().commit();

        let old = ingress(
            json!({
                ACP_ANNOTATION: "my-policy",
                AUTH_URL_ANNOTATION: "http://agent/my-policy@test",
                CONFIGURATION_SNIPPET_ANNOTATION: "more_set_headers \"A: b\";\n##hub-snippet-start\nx\n##hub-snippet-end",
            }),
            json!({}),
        );
        let new = ingress(
            json!({
                AUTH_URL_ANNOTATION: "http://agent/my-policy@test",
                CONFIGURATION_SNIPPET_ANNOTATION: "more_set_headers \"A: b\";\n##hub-snippet-start\nx\n##hub-snippet-end",
            }),
            json!({}),
        );
        let req = request("UPDATE", INGRESS_V1, Some(new), Some(old));

        let patch = reviewer.review(&req).await.unwrap().unwrap();
        assert_eq!(
            patched_annotations(&patch),
            json!({ CONFIGURATION_SNIPPET_ANNOTATION: "more_set_headers \"A: b\";" })
        );
        assert_eq!(quotas.used_by("whoami@test"), 0);
    }

    #[test]
    fn test_merge_snippet() {
        let block = "##hub-snippet-start\nnew\n##hub-snippet-end";

        // No previous content.
        assert_eq!(merge_snippet("", block), block);
        // Unmanaged content only.
        assert_eq!(
            merge_snippet("proxy_buffering off;", block),
            format!("{}\nproxy_buffering off;", block)
        );
        // Managed block in the middle: surrounding bytes are preserved.
        let old = "before;\n##hub-snippet-start\nold\n##hub-snippet-end\n  after;";
        assert_eq!(
            merge_snippet(old, block),
            "before;\n##hub-snippet-start\nnew\n##hub-snippet-end\n  after;"
        );
        // Managed block alone.
        assert_eq!(
            merge_snippet("##hub-snippet-start\nold\n##hub-snippet-end", block),
            block
        );
        // Removal.
        assert_eq!(
            merge_snippet("##hub-snippet-start\nold\n##hub-snippet-end", ""),
            ""
        );
        assert_eq!(merge_snippet("keep;", ""), "keep;");
    }

    #[test]
    fn test_merge_snippet_removal_keeps_user_text() {
        let block = "##hub-snippet-start\nold\n##hub-snippet-end";

        let added = merge_snippet("  proxy_buffering off;  \n", block);
        assert_eq!(merge_snippet(&added, ""), "  proxy_buffering off;  \n");

        assert_eq!(
            merge_snippet(&format!("  before;\n{}\n\tafter;\n", block), ""),
            "  before;\n\tafter;\n"
        );
        assert_eq!(
            merge_snippet(&format!("more_set_headers \"A: b\";\n{}", block), ""),
            "more_set_headers \"A: b\";"
        );
        assert_eq!(
            merge_snippet(&format!("a; {} b;", block), ""),
            "a;  b;"
        );
    }

    #[test]
    fn test_managed_snippet() {
        assert_eq!(
            managed_snippet(&["X-Id".to_string(), "Authorization".to_string()]),
            "##hub-snippet-start\n\
             auth_request_set $value_0 $upstream_http_X_Id; proxy_set_header X-Id $value_0;\n\
             auth_request_set $value_1 $upstream_http_Authorization; proxy_set_header Authorization $value_1;\n\
             ##hub-snippet-end"
        );
    }
}
