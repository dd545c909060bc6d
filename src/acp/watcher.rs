//! Keeps the auth server routing table in sync with AccessControlPolicies and the Secrets they
//! reference.
//!
//! Events only update the cached state and request a refresh. Refresh requests are coalesced
//! through a channel of capacity one, and the [`Rebuilder`] only rebuilds the router when the
//! resolved configuration set actually changed.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    body::Body,
    http::Request,
    routing, Router,
};
use futures_util::{stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use parking_lot::RwLock;
use sha3::{Digest, Sha3_256};
use stopper::Stopper;
use tokio::sync::mpsc;

use super::{
    build_handler, canonical_name, keys::RemoteKeySets, switcher::HandlerSwitcher, Config,
    SecretGetter, SecretKeyRef,
};
use crate::types::acp::{AccessControlPolicy, AccessControlPolicySpec};

#[derive(Debug, Clone, PartialEq)]
struct PolicyEntry {
    namespace: String,
    spec: AccessControlPolicySpec,
}

#[derive(Debug, Default)]
struct State {
    /// Canonical policy name to policy.
    policies: BTreeMap<String, PolicyEntry>,
    /// `namespace@name` to secret data, for referenced secrets only.
    secrets: HashMap<String, BTreeMap<String, Vec<u8>>>,
    /// `namespace@name` to the number of policies referencing the secret.
    secret_refs: HashMap<String, usize>,
}

impl State {
    /// Returns the secrets `entry` starts referencing that are not cached.
    fn add_refs(&mut self, entry: &PolicyEntry) -> Vec<String> {
        let mut missing = Vec::new();
        for id in secret_ids(entry) {
            let count = self.secret_refs.entry(id.clone()).or_default();
            *count += 1;
            if *count == 1 && !self.secrets.contains_key(&id) {
                missing.push(id);
            }
        }
        missing
    }

    fn remove_refs(&mut self, entry: &PolicyEntry) {
        for id in secret_ids(entry) {
            if let Some(count) = self.secret_refs.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    self.secret_refs.remove(&id);
                    self.secrets.remove(&id);
                }
            }
        }
    }

    fn is_referenced(&self, secret_id: &str) -> bool {
        self.secret_refs.contains_key(secret_id)
    }
}

impl SecretGetter for State {
    fn get_value(&self, secret_id: &str, key: &str) -> Option<Vec<u8>> {
        self.secrets.get(secret_id)?.get(key).cloned()
    }
}

fn secret_ids(entry: &PolicyEntry) -> Vec<String> {
    let spec = &entry.spec;
    let refs: [Option<&SecretKeyRef>; 3] = [
        spec.jwt.as_ref().and_then(|c| c.signing_secret_ref.as_ref()),
        spec.oidc.as_ref().and_then(|c| c.client_secret_ref.as_ref()),
        spec.oidc_google
            .as_ref()
            .and_then(|c| c.client_secret_ref.as_ref()),
    ];
    refs.into_iter()
        .flatten()
        .map(|r| r.secret_id(&entry.namespace))
        .collect()
}

fn secret_id(secret: &Secret) -> String {
    format!(
        "{}@{}",
        secret.namespace().unwrap_or_default(),
        secret.name_any()
    )
}

fn secret_data(secret: &Secret) -> BTreeMap<String, Vec<u8>> {
    let mut data: BTreeMap<String, Vec<u8>> = secret
        .string_data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
        .collect();
    for (k, v) in secret.data.iter().flatten() {
        data.insert(k.clone(), v.0.clone());
    }
    data
}

/// Receives policy and secret events.
#[derive(Clone)]
pub struct Watcher {
    state: Arc<RwLock<State>>,
    refresh: mpsc::Sender<()>,
}

/// Rebuilds the routing table on refresh requests.
pub struct Rebuilder {
    state: Arc<RwLock<State>>,
    refresh: mpsc::Receiver<()>,
    switcher: HandlerSwitcher,
    keysets: RemoteKeySets,
    last_hash: Option<Vec<u8>>,
}

pub fn new(switcher: HandlerSwitcher, keysets: RemoteKeySets) -> (Watcher, Rebuilder) {
    let state = Arc::new(RwLock::new(State::default()));
    let (tx, rx) = mpsc::channel(1);
    (
        Watcher {
            state: state.clone(),
            refresh: tx,
        },
        Rebuilder {
            state,
            refresh: rx,
            switcher,
            keysets,
            last_hash: None,
        },
    )
}

impl Watcher {
    fn request_refresh(&self) {
        // A full channel already holds a pending refresh.
        let _ = self.refresh.try_send(());
    }

    /// Records an applied policy. Returns the secrets it references that must be fetched, as
    /// they were not cached.
    pub fn on_policy_applied(&self, policy: &AccessControlPolicy) -> Vec<String> {
        let namespace = policy.namespace().unwrap_or_default();
        let name = canonical_name(&policy.name_any(), &namespace);
        let entry = PolicyEntry {
            namespace,
            spec: policy.spec.clone(),
        };

        let missing = {
            let mut state = self.state.write();
            if state.policies.get(&name) == Some(&entry) {
                return Vec::new();
            }
            let missing = state.add_refs(&entry);
            if let Some(old) = state.policies.insert(name, entry) {
                state.remove_refs(&old);
            }
            missing
        };
        self.request_refresh();
        missing
    }

    pub fn on_policy_deleted(&self, policy: &AccessControlPolicy) {
        let name = canonical_name(&policy.name_any(), &policy.namespace().unwrap_or_default());
        {
            let mut state = self.state.write();
            let Some(old) = state.policies.remove(&name) else {
                return;
            };
            state.remove_refs(&old);
        }
        self.request_refresh();
    }

    /// Replaces the known policies. Returns the referenced secrets that must be fetched.
    pub fn restart_policies(&self, policies: Vec<AccessControlPolicy>) -> Vec<String> {
        let mut missing = Vec::new();
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.policies.clear();
            state.secret_refs.clear();
            for policy in policies {
                let namespace = policy.namespace().unwrap_or_default();
                let name = canonical_name(&policy.name_any(), &namespace);
                let entry = PolicyEntry {
                    namespace,
                    spec: policy.spec,
                };
                missing.extend(state.add_refs(&entry));
                state.policies.insert(name, entry);
            }
            let secret_refs = &state.secret_refs;
            state.secrets.retain(|id, _| secret_refs.contains_key(id));
        }
        self.request_refresh();
        missing
    }

    /// Caches the secret if a policy references it. Others are ignored.
    pub fn on_secret_applied(&self, secret: &Secret) {
        let id = secret_id(secret);
        {
            let mut state = self.state.write();
            if !state.is_referenced(&id) {
                return;
            }
            let data = secret_data(secret);
            if state.secrets.get(&id) == Some(&data) {
                return;
            }
            state.secrets.insert(id, data);
        }
        self.request_refresh();
    }

    pub fn on_secret_deleted(&self, secret: &Secret) {
        let id = secret_id(secret);
        let referenced = {
            let mut state = self.state.write();
            state.secrets.remove(&id).is_some() && state.is_referenced(&id)
        };
        if referenced {
            self.request_refresh();
        }
    }

    pub fn restart_secrets(&self, secrets: Vec<Secret>) {
        {
            let mut state = self.state.write();
            let referenced = secrets
                .iter()
                .map(|secret| (secret_id(secret), secret))
                .filter(|(id, _)| state.is_referenced(id))
                .map(|(id, secret)| (id, secret_data(secret)))
                .collect();
            state.secrets = referenced;
        }
        self.request_refresh();
    }

    /// Fetches secrets that became referenced before their watch event was kept.
    async fn fetch_secrets(&self, client: &kube::Client, ids: Vec<String>) {
        for id in ids {
            let Some((namespace, name)) = id.split_once('@') else {
                continue;
            };
            let api = Api::<Secret>::namespaced(client.clone(), namespace);
            match crate::util::with_timeout(api.get_opt(name)).await {
                Ok(Some(secret)) => self.on_secret_applied(&secret),
                Ok(None) => tracing::debug!(secret = %id, "referenced secret does not exist"),
                Err(error) => {
                    tracing::error!(secret = %id, %error, "failed to fetch referenced secret")
                }
            }
        }
    }

    /// Feeds cluster events into the watcher until stopped.
    pub async fn watch(self, client: kube::Client, stopper: Stopper) {
        enum Event {
            Policy(watcher::Event<AccessControlPolicy>),
            Secret(watcher::Event<Secret>),
        }

        let policies = watcher(
            Api::<AccessControlPolicy>::all(client.clone()),
            watcher::Config::default(),
        )
        .backoff(crate::util::watch_backoff())
        .map(|event| event.map(Event::Policy))
        .boxed();
        let secrets = watcher(Api::<Secret>::all(client.clone()), watcher::Config::default())
            .backoff(crate::util::watch_backoff())
            .map(|event| event.map(Event::Secret))
            .boxed();

        let mut events = stream::select(policies, secrets);
        while let Some(Some(event)) = stopper.stop_future(events.next()).await {
            let missing = match event {
                Ok(Event::Policy(watcher::Event::Applied(policy))) => {
                    self.on_policy_applied(&policy)
                }
                Ok(Event::Policy(watcher::Event::Deleted(policy))) => {
                    self.on_policy_deleted(&policy);
                    Vec::new()
                }
                Ok(Event::Policy(watcher::Event::Restarted(policies))) => {
                    self.restart_policies(policies)
                }
                Ok(Event::Secret(watcher::Event::Applied(secret))) => {
                    self.on_secret_applied(&secret);
                    Vec::new()
                }
                Ok(Event::Secret(watcher::Event::Deleted(secret))) => {
                    self.on_secret_deleted(&secret);
                    Vec::new()
                }
                Ok(Event::Secret(watcher::Event::Restarted(secrets))) => {
                    self.restart_secrets(secrets);
                    Vec::new()
                }
                Err(error) => {
                    tracing::error!(%error, "policy watch failed");
                    Vec::new()
                }
            };
            self.fetch_secrets(&client, missing).await;
        }
        tracing::info!("policy watcher stopped");
    }
}

impl Rebuilder {
    pub async fn run(mut self, stopper: Stopper) {
        while let Some(Some(())) = stopper.stop_future(self.refresh.recv()).await {
            self.rebuild();
        }
        tracing::info!("policy rebuilder stopped");
    }

    /// Rebuilds the router if the resolved configurations changed. Returns whether it did.
    pub fn rebuild(&mut self) -> bool {
        let configs = self.resolve();

        let hash = match serde_json::to_vec(&configs) {
            Ok(serialized) => Sha3_256::digest(serialized).to_vec(),
            Err(error) => {
                tracing::error!(%error, "failed to hash policy configurations");
                return false;
            }
        };
        if self.last_hash.as_ref() == Some(&hash) {
            return false;
        }

        let count = configs.len();
        self.switcher
            .update_handler(build_router(configs, &self.keysets));
        self.last_hash = Some(hash);
        tracing::info!(policies = count, "policy router rebuilt");
        true
    }

    /// Validated configurations with their secrets resolved. Invalid policies are skipped.
    fn resolve(&self) -> BTreeMap<String, Config> {
        let state = self.state.read();
        state
            .policies
            .iter()
            .filter_map(|(name, entry)| {
                let resolved = Config::try_from(entry.spec.clone()).and_then(|mut config| {
                    config.resolve_secrets(&entry.namespace, &*state)?;
                    Ok(config)
                });
                match resolved {
                    Ok(config) => Some((name.clone(), config)),
                    Err(error) => {
                        tracing::error!(policy = %name, %error, "skipping invalid policy");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Builds a router serving each policy at `/<canonical name>`.
///
/// Policies whose handler cannot be built are logged and left out.
pub fn build_router(configs: BTreeMap<String, Config>, keysets: &RemoteKeySets) -> Router {
    let mut router = Router::new();
    for (name, config) in configs {
        let handler = match build_handler(&name, config, keysets) {
            Ok(handler) => handler,
            Err(error) => {
                tracing::error!(policy = %name, %error, "failed to build policy handler");
                continue;
            }
        };
        router = router.route(
            &format!("/{}", name),
            routing::any(move |req: Request<Body>| {
                let handler = handler.clone();
                async move {
                    let (parts, _) = req.into_parts();
                    handler.verify(&parts).await
                }
            }),
        );
    }
    router
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::http::StatusCode;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use tower::ServiceExt;

    use super::*;
    use crate::acp::{basic, jwt};

    fn basic_policy(name: &str, namespace: &str, users: &[&str]) -> AccessControlPolicy {
        let mut policy = AccessControlPolicy::new(
            name,
            AccessControlPolicySpec {
                basic_auth: Some(basic::Config {
                    users: users.iter().map(|u| u.to_string()).collect(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        policy.metadata.namespace = Some(namespace.to_string());
        policy
    }

    fn jwt_policy_with_secret_ref(name: &str, secret: &str) -> AccessControlPolicy {
        let mut policy = AccessControlPolicy::new(
            name,
            AccessControlPolicySpec {
                jwt: Some(jwt::Config {
                    signing_secret_ref: Some(SecretKeyRef {
                        name: secret.to_string(),
                        namespace: None,
                        key: "key".to_string(),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        policy.metadata.namespace = Some("default".to_string());
        policy
    }

    fn secret(name: &str, value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "key".to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn setup() -> (Watcher, Rebuilder, HandlerSwitcher) {
        let switcher = HandlerSwitcher::default();
        let (watcher, rebuilder) = new(switcher.clone(), RemoteKeySets::default());
        (watcher, rebuilder, switcher)
    }

    async fn status(switcher: &HandlerSwitcher, path: &str) -> StatusCode {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        switcher.serve(req).await.status()
    }

    #[tokio::test]
    async fn test_rebuild_only_on_change() {
        let (watcher, mut rebuilder, switcher) = setup();

        watcher.on_policy_applied(&basic_policy("basic", "team", &["jane:pw"]));
        assert!(rebuilder.rebuild());
        assert_eq!(
            status(&switcher, "/basic@team").await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status(&switcher, "/other@team").await, StatusCode::NOT_FOUND);

        // Same content: no rebuild.
        watcher.restart_policies(vec![basic_policy("basic", "team", &["jane:pw"])]);
        assert!(!rebuilder.rebuild());

        watcher.on_policy_applied(&basic_policy("basic", "team", &["jane:other"]));
        assert!(rebuilder.rebuild());

        watcher.on_policy_deleted(&basic_policy("basic", "team", &[]));
        assert!(rebuilder.rebuild());
        assert_eq!(status(&switcher, "/basic@team").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_policy_does_not_affect_others() {
        let (watcher, mut rebuilder, switcher) = setup();

        watcher.on_policy_applied(&basic_policy("good", "default", &["jane:pw"]));
        watcher.on_policy_applied(&basic_policy("bad", "default", &["no-colon"]));
        let mut empty = basic_policy("empty", "default", &[]);
        empty.spec.basic_auth = None;
        watcher.on_policy_applied(&empty);

        assert!(rebuilder.rebuild());
        assert_eq!(
            status(&switcher, "/good@default").await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status(&switcher, "/bad@default").await, StatusCode::NOT_FOUND);
        assert_eq!(
            status(&switcher, "/empty@default").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_refresh_requests_coalesce() {
        let (watcher, mut rebuilder, _switcher) = setup();

        for i in 0..10 {
            watcher.on_policy_applied(&basic_policy(&format!("p{}", i), "default", &["a:b"]));
        }
        assert!(rebuilder.refresh.try_recv().is_ok());
        assert!(rebuilder.refresh.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_secret_refs() {
        let (watcher, mut rebuilder, switcher) = setup();

        // Unreferenced secrets are neither cached nor trigger a refresh.
        watcher.on_secret_applied(&secret("jwt-key", "bibi"));
        assert!(rebuilder.refresh.try_recv().is_err());
        assert!(rebuilder.state.read().secrets.is_empty());

        // Missing secret material: the policy is skipped and the secret is to be fetched.
        assert_eq!(
            watcher.on_policy_applied(&jwt_policy_with_secret_ref("api", "missing")),
            vec!["default@missing".to_string()]
        );
        assert!(rebuilder.rebuild());
        assert_eq!(status(&switcher, "/api@default").await, StatusCode::NOT_FOUND);
        assert_eq!(rebuilder.state.read().secret_refs["default@missing"], 1);

        assert_eq!(
            watcher.on_policy_applied(&jwt_policy_with_secret_ref("api", "jwt-key")),
            vec!["default@jwt-key".to_string()]
        );
        watcher.on_secret_applied(&secret("jwt-key", "bibi"));
        assert!(rebuilder.rebuild());
        assert_eq!(
            status(&switcher, "/api@default").await,
            StatusCode::UNAUTHORIZED
        );
        {
            let state = rebuilder.state.read();
            assert!(!state.secret_refs.contains_key("default@missing"));
            assert_eq!(state.secret_refs["default@jwt-key"], 1);
        }

        // Rotating a referenced secret requests a refresh and changes the router.
        let _ = rebuilder.refresh.try_recv();
        watcher.on_secret_applied(&secret("jwt-key", "rotated"));
        assert!(rebuilder.refresh.try_recv().is_ok());
        assert!(rebuilder.rebuild());

        watcher.on_secret_deleted(&secret("jwt-key", ""));
        assert!(rebuilder.rebuild());
        assert_eq!(status(&switcher, "/api@default").await, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_only_referenced_secrets_cached() {
        let (watcher, rebuilder, _switcher) = setup();

        watcher.restart_policies(vec![jwt_policy_with_secret_ref("api", "jwt-key")]);
        watcher.restart_secrets(vec![secret("jwt-key", "bibi"), secret("unrelated", "x")]);
        {
            let state = rebuilder.state.read();
            assert_eq!(state.secrets.len(), 1);
            assert!(state.secrets.contains_key("default@jwt-key"));
        }

        // Already cached: nothing to fetch.
        assert!(watcher
            .on_policy_applied(&jwt_policy_with_secret_ref("other", "jwt-key"))
            .is_empty());

        // Dropped once no policy references it.
        watcher.on_policy_deleted(&jwt_policy_with_secret_ref("api", "jwt-key"));
        assert!(rebuilder.state.read().secrets.contains_key("default@jwt-key"));
        watcher.on_policy_deleted(&jwt_policy_with_secret_ref("other", "jwt-key"));
        assert!(rebuilder.state.read().secrets.is_empty());

        // A relist keeps only what the remaining policies reference.
        watcher.restart_policies(vec![jwt_policy_with_secret_ref("api", "jwt-key")]);
        watcher.on_secret_applied(&secret("jwt-key", "bibi"));
        assert_eq!(
            watcher.restart_policies(vec![jwt_policy_with_secret_ref("api", "rotated-key")]),
            vec!["default@rotated-key".to_string()]
        );
        assert!(rebuilder.state.read().secrets.is_empty());
    }

    #[tokio::test]
    async fn test_router_serves_handlers() {
        let configs = BTreeMap::from([(
            "jwt@default".to_string(),
            Config::Jwt(jwt::Config {
                signing_secret: Some("bibi".to_string()),
                ..Default::default()
            }),
        )]);
        let router = build_router(configs, &RemoteKeySets::default());

        let token = jwt::tests::sign(&serde_json::json!({}), "bibi", None);
        let req = Request::builder()
            .uri("/jwt@default")
            .header("Authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
