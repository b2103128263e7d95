//! Error taxonomy for the gateway core
//!
//! Collaborator failures are wrapped with enough context (which application,
//! which operation) to be actionable by whoever triggered the operation.
//! Backend connectivity failures never surface here; the proxy converts those
//! to 502 responses per request.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The container directory has no container with the application's name.
    #[error("found no container named '{app}'")]
    ContainerNotFound { app: String },

    /// The container exists but is not attached to the platform network.
    #[error("the '{app}' container doesn't belong to the network '{network}'")]
    NotOnNetwork { app: String, network: String },

    /// The Docker API call itself failed.
    #[error("docker lookup for '{app}' failed: {source}")]
    Directory {
        app: String,
        #[source]
        source: bollard::errors::Error,
    },

    /// The settings store has no value under the given key.
    #[error("settings store has no value for key '{key}'")]
    SettingsMiss { key: String },

    /// The settings store request failed.
    #[error("settings store request for key '{key}' failed: {reason}")]
    Settings { key: String, reason: String },

    /// No OS-level interface with this name exists.
    #[error("interface '{name}' not found")]
    InterfaceNotFound { name: String },

    /// An interface must carry exactly one IPv4 address to be routable.
    #[error("interface '{name}' has {count} IPv4 addresses, expected exactly one")]
    AmbiguousAddress { name: String, count: usize },

    /// No default outbound interface to bind macvlan devices to.
    #[error("no default outbound interface found")]
    NoDefaultInterface,

    /// A netlink operation failed.
    #[error("netlink {op} for '{name}' failed: {reason}")]
    Netlink {
        op: &'static str,
        name: String,
        reason: String,
    },

    /// A stored or generated MAC address could not be parsed.
    #[error("invalid MAC address '{mac}' for app '{app}'")]
    InvalidMac { app: String, mac: String },

    /// The backend URL assembled for an application was not a valid URI.
    #[error("invalid backend URL '{url}' for app '{app}'")]
    BackendUrl { app: String, url: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_app_and_operation() {
        let err = GatewayError::ContainerNotFound {
            app: "gitlab".into(),
        };
        assert!(err.to_string().contains("gitlab"));

        let err = GatewayError::AmbiguousAddress {
            name: "app_gitlab0".into(),
            count: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("app_gitlab0"));
        assert!(msg.contains('3'));
    }
}
