//! Cache of IngressClasses, answering which controller owns a class.
//!
//! Classes come from three sources: the stock `networking.k8s.io/v1` resource, the legacy
//! `networking.k8s.io/v1beta1` one (read as a dynamic object, the cluster may not serve it)
//! and the hub CRD. All are folded into one [`IngressClassInfo`] keyed by UID.

use std::{collections::HashMap, sync::Arc};

use futures_util::{stream, StreamExt};
use k8s_openapi::api::networking::v1::IngressClass;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::ApiResource,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use parking_lot::RwLock;
use stopper::Stopper;

use crate::types::ingress_class::{IngressClass as HubIngressClass, LegacyIngressClassSpec};

pub const CONTROLLER_TYPE_TRAEFIK: &str = "traefik.io/ingress-controller";
pub const CONTROLLER_TYPE_NGINX: &str = "k8s.io/ingress-nginx";
pub const CONTROLLER_TYPE_HAPROXY: &str = "haproxy-ingress.github.io/controller";

pub const DEFAULT_CLASS_ANNOTATION_KEY: &str = "ingressclass.kubernetes.io/is-default-class";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("IngressClass {0:?} not found")]
    NotFound(String),
    #[error("multiple default IngressClasses found")]
    MultipleDefaults,
}

/// What the agent knows about an IngressClass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressClassInfo {
    pub name: String,
    pub controller: String,
    pub is_default: bool,
}

/// An IngressClass as delivered by one of the watchers.
#[derive(Clone, Debug)]
pub enum IngressClassObject {
    V1(IngressClass),
    V1Beta1(DynamicObject),
    Hub(HubIngressClass),
}

impl IngressClassObject {
    fn uid(&self) -> Option<String> {
        match self {
            Self::V1(ic) => ic.uid(),
            Self::V1Beta1(ic) => ic.uid(),
            Self::Hub(ic) => ic.uid(),
        }
    }

    /// Translates the object into the cached record. `None` means the payload is unusable.
    fn info(&self) -> Option<IngressClassInfo> {
        let (name, controller, annotations) = match self {
            Self::V1(ic) => (
                ic.name_any(),
                ic.spec.as_ref().and_then(|spec| spec.controller.clone()),
                ic.annotations(),
            ),
            Self::V1Beta1(ic) => {
                if ic.types.as_ref().map(|t| t.kind.as_str()) != Some("IngressClass") {
                    return None;
                }
                let spec: LegacyIngressClassSpec = match ic.data.get("spec") {
                    Some(spec) => serde_json::from_value(spec.clone()).ok()?,
                    None => Default::default(),
                };
                (ic.name_any(), spec.controller, ic.annotations())
            }
            Self::Hub(ic) => (
                ic.name_any(),
                Some(ic.spec.controller.clone()),
                ic.annotations(),
            ),
        };

        Some(IngressClassInfo {
            name,
            controller: controller.unwrap_or_default(),
            is_default: annotations
                .get(DEFAULT_CLASS_ANNOTATION_KEY)
                .map(|value| value == "true")
                .unwrap_or(false),
        })
    }
}

/// Concurrent IngressClass cache.
#[derive(Clone, Debug, Default)]
pub struct IngressClasses {
    classes: Arc<RwLock<HashMap<String, IngressClassInfo>>>,
}

impl IngressClasses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(&self, object: IngressClassObject) {
        self.upsert(object);
    }

    pub fn on_update(&self, object: IngressClassObject) {
        self.upsert(object);
    }

    pub fn on_delete(&self, object: IngressClassObject) {
        let Some(uid) = object.uid() else {
            tracing::error!(?object, "IngressClass without UID, ignoring deletion");
            return;
        };
        self.classes.write().remove(&uid);
    }

    fn upsert(&self, object: IngressClassObject) {
        let (Some(uid), Some(info)) = (object.uid(), object.info()) else {
            tracing::error!(?object, "unusable IngressClass payload, ignoring");
            return;
        };
        tracing::debug!(name = %info.name, controller = %info.controller, default = info.is_default, "IngressClass updated");
        self.classes.write().insert(uid, info);
    }

    /// Replaces every class coming from one source kind with a fresh listing.
    fn restart(&self, objects: Vec<IngressClassObject>, is_same_source: impl Fn(&str) -> bool) {
        let mut fresh = Vec::with_capacity(objects.len());
        for object in objects {
            match (object.uid(), object.info()) {
                (Some(uid), Some(info)) => fresh.push((uid, info)),
                _ => tracing::error!(?object, "unusable IngressClass payload, ignoring"),
            }
        }

        let mut classes = self.classes.write();
        classes.retain(|uid, _| !is_same_source(uid));
        classes.extend(fresh);
    }

    /// Returns the controller type of the named class.
    pub fn get_controller(&self, name: &str) -> Result<String, Error> {
        self.classes
            .read()
            .values()
            .find(|info| info.name == name)
            .map(|info| info.controller.clone())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Returns the controller type of the default class, or an empty string when there is
    /// none.
    pub fn get_default_controller(&self) -> Result<String, Error> {
        let classes = self.classes.read();
        let mut defaults = classes.values().filter(|info| info.is_default);
        match (defaults.next(), defaults.next()) {
            (None, _) => Ok(String::new()),
            (Some(info), None) => Ok(info.controller.clone()),
            (Some(_), Some(_)) => Err(Error::MultipleDefaults),
        }
    }

    /// Watches every IngressClass source served by the cluster until stopped.
    pub async fn watch(self, client: kube::Client, stopper: Stopper) {
        let legacy_ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "networking.k8s.io",
            "v1beta1",
            "IngressClass",
        ));

        let mut sources = Vec::new();

        let v1_api = Api::<IngressClass>::all(client.clone());
        sources.push(
            watcher(v1_api, watcher::Config::default())
                .backoff(crate::util::watch_backoff())
                .map(|event| (Source::V1, event.map(|e| map_event(e, IngressClassObject::V1))))
                .boxed(),
        );

        match crate::util::is_api_served(&client, "networking.k8s.io/v1beta1", "IngressClass").await
        {
            Ok(true) => {
                let legacy_api = Api::<DynamicObject>::all_with(client.clone(), &legacy_ar);
                sources.push(
                    watcher(legacy_api, watcher::Config::default())
                        .backoff(crate::util::watch_backoff())
                        .map(|event| {
                            (
                                Source::V1Beta1,
                                event.map(|e| map_event(e, IngressClassObject::V1Beta1)),
                            )
                        })
                        .boxed(),
                );
            }
            Ok(false) => tracing::debug!("legacy IngressClass API not served, skipping"),
            Err(error) => tracing::error!(%error, "failed to discover legacy IngressClass API"),
        }

        match crate::util::is_api_served(&client, "hub.traefik.io/v1alpha1", "IngressClass").await {
            Ok(true) => {
                let hub_api = Api::<HubIngressClass>::all(client);
                sources.push(
                    watcher(hub_api, watcher::Config::default())
                        .backoff(crate::util::watch_backoff())
                        .map(|event| (Source::Hub, event.map(|e| map_event(e, IngressClassObject::Hub))))
                        .boxed(),
                );
            }
            Ok(false) => tracing::debug!("hub IngressClass API not served, skipping"),
            Err(error) => tracing::error!(%error, "failed to discover hub IngressClass API"),
        }

        // UIDs seen per source, so a relist only drops the classes of its own source.
        let mut seen: HashMap<String, Source> = HashMap::new();

        let mut events = stream::select_all(sources);
        while let Some(Some((source, event))) = stopper.stop_future(events.next()).await {
            match event {
                Ok(ClassEvent::Applied(object)) => {
                    if let Some(uid) = object.uid() {
                        seen.insert(uid, source);
                    }
                    self.on_update(object);
                }
                Ok(ClassEvent::Deleted(object)) => {
                    if let Some(uid) = object.uid() {
                        seen.remove(&uid);
                    }
                    self.on_delete(object);
                }
                Ok(ClassEvent::Restarted(objects)) => {
                    let stale: Vec<String> = seen
                        .iter()
                        .filter(|(_, s)| **s == source)
                        .map(|(uid, _)| uid.clone())
                        .collect();
                    for uid in &stale {
                        seen.remove(uid);
                    }
                    for uid in objects.iter().filter_map(IngressClassObject::uid) {
                        seen.insert(uid, source);
                    }
                    self.restart(objects, |uid| stale.iter().any(|s| s == uid));
                }
                Err(error) => tracing::error!(%error, ?source, "IngressClass watch failed"),
            }
        }
        tracing::info!("IngressClass watcher stopped");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    V1,
    V1Beta1,
    Hub,
}

enum ClassEvent {
    Applied(IngressClassObject),
    Deleted(IngressClassObject),
    Restarted(Vec<IngressClassObject>),
}

fn map_event<K>(event: watcher::Event<K>, wrap: fn(K) -> IngressClassObject) -> ClassEvent {
    match event {
        watcher::Event::Applied(object) => ClassEvent::Applied(wrap(object)),
        watcher::Event::Deleted(object) => ClassEvent::Deleted(wrap(object)),
        watcher::Event::Restarted(objects) => {
            ClassEvent::Restarted(objects.into_iter().map(wrap).collect())
        }
    }
}
