use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::{
    api::{
        core::v1::Secret,
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ByteString,
};
use kube::{api::ListParams, Api, Resource, ResourceExt};

use super::{Action, Error, ReconcilerContext};
use crate::{
    acp::canonical_name,
    admission::{hub::edge_ingress_status, ACP_ANNOTATION},
    platform,
    types::{
        self,
        edge_ingress::{EdgeIngress, EdgeIngressSpec},
    },
    util::with_timeout,
};

/// The EdgeIngress mirroring a platform edge ingress.
pub fn desired(edge_ingress: &platform::EdgeIngress) -> Result<EdgeIngress, serde_json::Error> {
    let mut object = EdgeIngress::new(
        &edge_ingress.name,
        EdgeIngressSpec {
            service: edge_ingress.service.clone(),
            acp: edge_ingress.acp.clone(),
        },
    );
    object.metadata.namespace = Some(edge_ingress.namespace.clone());
    object.metadata.labels = Some(types::managed_labels());
    object.status = Some(edge_ingress_status(
        edge_ingress,
        platform::spec_hash(&object.spec)?,
    ));
    Ok(object)
}

fn up_to_date(existing: &EdgeIngress, desired: &EdgeIngress) -> bool {
    let synced = |object: &EdgeIngress| {
        object.status.as_ref().map(|status| {
            (
                status.version.clone(),
                status.domain.clone(),
                status.connection.clone(),
            )
        })
    };
    existing.spec == desired.spec && synced(existing) == synced(desired)
}

pub fn plan(
    edge_ingresses: &[platform::EdgeIngress],
    existing: &[EdgeIngress],
) -> Result<Vec<Action<EdgeIngress>>, serde_json::Error> {
    let desired = edge_ingresses
        .iter()
        .map(desired)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(super::plan(desired, existing, up_to_date))
}

/// The Ingress routing the domain of an EdgeIngress to its service, through the hub ingress
/// class. `None` until the platform assigned a domain.
pub fn build_ingress(
    edge_ingress: &EdgeIngress,
    ingress_class: &str,
    certificate_secret: &str,
) -> Option<Ingress> {
    let domain = edge_ingress.status.as_ref()?.domain.clone()?;
    let namespace = edge_ingress.namespace().unwrap_or_default();

    let mut annotations = BTreeMap::new();
    if let Some(acp) = &edge_ingress.spec.acp {
        let acp_namespace = acp.namespace.as_deref().unwrap_or(&namespace);
        annotations.insert(
            ACP_ANNOTATION.to_string(),
            canonical_name(&acp.name, acp_namespace),
        );
    }

    let service = &edge_ingress.spec.service;
    Some(Ingress {
        metadata: ObjectMeta {
            name: Some(edge_ingress.name_any()),
            namespace: Some(namespace),
            labels: Some(types::managed_labels()),
            annotations: Some(annotations),
            owner_references: edge_ingress.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(ingress_class.to_string()),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![domain.clone()]),
                secret_name: Some(certificate_secret.to_string()),
            }]),
            rules: Some(vec![IngressRule {
                host: Some(domain),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: Some("Prefix".to_string()),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(service.port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

/// The TLS secret holding the wildcard certificate of the platform domains.
pub fn certificate_secret(
    namespace: &str,
    name: &str,
    certificate: &platform::Certificate,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(types::managed_labels()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (
                "tls.crt".to_string(),
                ByteString(certificate.certificate.as_bytes().to_vec()),
            ),
            (
                "tls.key".to_string(),
                ByteString(certificate.private_key.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}

/// Converges EdgeIngresses, then the certificate secrets and Ingresses derived from them.
///
/// Every object is written independently: a failure is logged and does not stop the others.
pub async fn reconcile(ctx: &ReconcilerContext) -> Result<(), Error> {
    let edge_ingresses = ctx.platform.get_edge_ingresses().await?;
    let api = Api::<EdgeIngress>::all(ctx.client.clone());
    let existing = with_timeout(api.list(&ListParams::default())).await?.items;

    for action in plan(&edge_ingresses, &existing).map_err(Error::Serialize)? {
        if let Err(error) = super::apply(&ctx.client, action).await {
            tracing::error!(%error, "failed to reconcile EdgeIngress");
        }
    }

    let namespaces = edge_ingresses
        .iter()
        .map(|edge_ingress| edge_ingress.namespace.as_str())
        .collect::<BTreeSet<_>>();
    if !namespaces.is_empty() {
        let certificate = ctx.platform.get_certificate().await?;
        for namespace in namespaces {
            let secret =
                certificate_secret(namespace, &ctx.config.certificate_secret_name, &certificate);
            if let Err(error) = super::server_side_apply(&ctx.client, &secret).await {
                tracing::error!(%namespace, %error, "failed to apply certificate secret");
            }
        }
    }

    // Listed again to get the uid of the objects just created.
    let current = with_timeout(api.list(&ListParams::default())).await?.items;
    for edge_ingress in &current {
        let Some(ingress) = build_ingress(
            edge_ingress,
            &ctx.config.hub_ingress_class,
            &ctx.config.certificate_secret_name,
        ) else {
            tracing::debug!(name = %edge_ingress.name_any(), "EdgeIngress has no domain yet");
            continue;
        };
        if let Err(error) = super::server_side_apply(&ctx.client, &ingress).await {
            tracing::error!(name = %edge_ingress.name_any(), namespace = ?edge_ingress.namespace(), %error, "failed to apply Ingress");
        }
    }
    Ok(())
}
