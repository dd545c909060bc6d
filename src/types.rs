pub mod acp;
pub mod edge_ingress;
pub mod ingress_class;
pub mod testcase;
pub mod traefik;

/// Label put on every object the agent creates so it can find and garbage collect them.
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = "traefik-hub";

/// Group of every custom resource owned by the agent.
pub const HUB_GROUP: &str = "hub.traefik.io";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "hub-agent.traefik.io";

/// Labels marking an object as created by the agent.
pub fn managed_labels() -> std::collections::BTreeMap<String, String> {
    std::collections::BTreeMap::from([(
        MANAGED_BY_LABEL_KEY.to_string(),
        MANAGED_BY_LABEL_VALUE.to_string(),
    )])
}

/// Tells whether an object carries the managed-by label of the agent.
pub fn is_managed(labels: &std::collections::BTreeMap<String, String>) -> bool {
    labels.get(MANAGED_BY_LABEL_KEY).map(String::as_str) == Some(MANAGED_BY_LABEL_VALUE)
}
