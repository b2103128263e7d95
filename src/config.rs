use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Routing and provisioning configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the traffic listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plain HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS port (default: 443, set to 0 to disable)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Port for the loopback control API
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Local endpoint that CONNECT requests are tunneled to
    #[serde(default = "default_ssh_forward")]
    pub ssh_forward: String,

    /// Fallback TLS certificate file (PEM), used when the settings store
    /// carries no certificate
    pub tls_cert: Option<String>,

    /// Fallback TLS private key file (PEM)
    pub tls_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Domain suffix for platform-assigned virtual hosts
    /// (`<app>.<box>.<domain>`)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Settings-store key holding the box identity name
    #[serde(default = "default_node_name_key")]
    pub node_name_key: String,

    /// Application serving unmatched hosts
    #[serde(default = "default_backend_app")]
    pub default_backend_app: String,

    /// Port of the default backend container
    #[serde(default = "default_backend_port")]
    pub default_backend_port: u16,

    /// Port application containers serve HTTP on
    #[serde(default = "default_backend_port")]
    pub app_port: u16,

    /// Applications eligible for macvlan provisioning; each one is only
    /// routed while its feature flag is set in the settings store
    #[serde(default = "default_managed_apps")]
    pub managed_apps: Vec<String>,

    /// Docker network that application containers are attached to
    #[serde(default = "default_docker_network")]
    pub docker_network: String,

    /// Path of the static 502 error page
    #[serde(default = "default_error_page")]
    pub error_page: String,

    /// How often IP change monitors re-resolve external IPs, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub monitor_poll_interval_ms: u64,

    /// Base URL of the settings store; when unset, the store is located
    /// through the container directory under `settings_app`
    pub settings_endpoint: Option<String>,

    /// Container name of the settings store service
    #[serde(default = "default_settings_app")]
    pub settings_app: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_control_port() -> u16 {
    81
}

fn default_ssh_forward() -> String {
    "127.0.0.1:22".to_string()
}

fn default_domain() -> String {
    "protonet.info".to_string()
}

fn default_node_name_key() -> String {
    "ptw/node_name".to_string()
}

fn default_backend_app() -> String {
    "soul-nginx".to_string()
}

fn default_backend_port() -> u16 {
    80
}

fn default_managed_apps() -> Vec<String> {
    vec!["gitlab".to_string()]
}

fn default_docker_network() -> String {
    "protonet".to_string()
}

fn default_error_page() -> String {
    "/502.html".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_settings_app() -> String {
    "skvs".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("default server config is valid")
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        toml::from_str("").expect("default gateway config is valid")
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

impl GatewayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").expect("empty config parses");
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(config.server.control_port, 81);
        assert_eq!(config.server.ssh_forward, "127.0.0.1:22");
        assert_eq!(config.gateway.domain, "protonet.info");
        assert_eq!(config.gateway.managed_apps, vec!["gitlab"]);
        assert_eq!(config.gateway.docker_network, "protonet");
        assert_eq!(config.gateway.error_page, "/502.html");
        assert_eq!(config.gateway.poll_interval(), Duration::from_secs(1));
        assert!(config.gateway.settings_endpoint.is_none());
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
            [server]
            bind = "127.0.0.1"
            http_port = 8080
            https_port = 0
            control_port = 8081
            ssh_forward = "127.0.0.1:2222"
            tls_cert = "/data/ssl/pem"
            tls_key = "/data/ssl/key"

            [gateway]
            domain = "example.org"
            managed_apps = ["gitlab", "wiki"]
            monitor_poll_interval_ms = 250
            settings_endpoint = "http://127.0.0.1:9000"
        "#;

        let config: Config = toml::from_str(toml_str).expect("config parses");
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.https_port, 0);
        assert_eq!(config.server.tls_cert.as_deref(), Some("/data/ssl/pem"));
        assert_eq!(config.gateway.domain, "example.org");
        assert_eq!(config.gateway.managed_apps.len(), 2);
        assert_eq!(config.gateway.poll_interval(), Duration::from_millis(250));
        assert_eq!(
            config.gateway.settings_endpoint.as_deref(),
            Some("http://127.0.0.1:9000")
        );
    }
}
