use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

fn default_webhook_listen_addr() -> String {
    "[::]:8443".to_string()
}

fn default_auth_server_listen_addr() -> String {
    "[::]:80".to_string()
}

fn default_max_routes() -> usize {
    100
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_hub_ingress_class() -> String {
    "traefik-hub".to_string()
}

fn default_certificate_secret_name() -> String {
    "hub-certificate".to_string()
}

/// Access to the platform API.
#[derive(Deserialize, Clone, Debug)]
pub struct PlatformConfig {
    pub platform_url: Url,
    pub platform_token: SecretString,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    /// Certificate path for HTTPS
    pub cert_path: PathBuf,
    /// Certificate key path for HTTPS
    pub key_path: PathBuf,

    #[serde(default = "default_webhook_listen_addr")]
    pub listen_addr: String,

    /// Base URL of the auth server, as reachable from the ingress controllers
    pub agent_address: String,

    /// Maximum number of routes the agent may protect across the cluster
    #[serde(default = "default_max_routes")]
    pub max_routes: usize,

    /// Hub resources are rejected unless both are set
    #[serde(default)]
    pub platform_url: Option<Url>,
    #[serde(default)]
    pub platform_token: Option<SecretString>,
}

impl WebhookConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONF_").from_env()
    }

    pub fn platform(&self) -> Option<PlatformConfig> {
        Some(PlatformConfig {
            platform_url: self.platform_url.clone()?,
            platform_token: self.platform_token.clone()?,
        })
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct AuthServerConfig {
    #[serde(default = "default_auth_server_listen_addr")]
    pub listen_addr: String,
}

impl AuthServerConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONF_").from_env()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ControllerConfig {
    pub platform_url: Url,
    pub platform_token: SecretString,

    /// Seconds between two reconciliations with the platform
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// IngressClass of the Ingresses generated for EdgeIngresses
    #[serde(default = "default_hub_ingress_class")]
    pub hub_ingress_class: String,

    /// Name of the TLS secret holding the platform wildcard certificate
    #[serde(default = "default_certificate_secret_name")]
    pub certificate_secret_name: String,
}

impl ControllerConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONF_").from_env()
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_webhook_config_defaults() {
        let config: WebhookConfig = envy::from_iter(vars(&[
            ("CERT_PATH", "/tls/tls.crt"),
            ("KEY_PATH", "/tls/tls.key"),
            ("AGENT_ADDRESS", "http://hub-agent-auth-server.hub"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "[::]:8443");
        assert_eq!(config.max_routes, 100);
        assert!(config.platform().is_none());
    }

    #[test]
    fn test_webhook_config_platform() {
        let config: WebhookConfig = envy::from_iter(vars(&[
            ("CERT_PATH", "/tls/tls.crt"),
            ("KEY_PATH", "/tls/tls.key"),
            ("AGENT_ADDRESS", "http://hub-agent-auth-server.hub"),
            ("MAX_ROUTES", "5"),
            ("PLATFORM_URL", "https://platform.example.com/agent/"),
            ("PLATFORM_TOKEN", "t0ken"),
        ]))
        .unwrap();
        assert_eq!(config.max_routes, 5);
        let platform = config.platform().unwrap();
        assert_eq!(platform.platform_url.as_str(), "https://platform.example.com/agent/");
        assert_eq!(platform.platform_token.expose_secret(), "t0ken");
    }

    #[test]
    fn test_controller_config_defaults() {
        let config: ControllerConfig = envy::from_iter(vars(&[
            ("PLATFORM_URL", "https://platform.example.com/agent/"),
            ("PLATFORM_TOKEN", "t0ken"),
        ]))
        .unwrap();
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.hub_ingress_class, "traefik-hub");
        assert_eq!(config.certificate_secret_name, "hub-certificate");
    }
}
