//! Container directory collaborator
//!
//! Maps an application name to the internal IP of its container on the
//! platform network. The Docker daemon is the authoritative source.

use crate::error::GatewayError;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::Docker;
use std::collections::HashMap;
use tracing::debug;

#[async_trait]
pub trait ContainerDirectory: Send + Sync {
    /// Resolve the internal IP of the container running `app`
    async fn lookup_internal_ip(&self, app: &str) -> Result<String, GatewayError>;
}

/// Container directory backed by the Docker API
pub struct DockerDirectory {
    client: Docker,
    network: String,
}

impl DockerDirectory {
    /// Connect to the Docker daemon via its default socket
    pub async fn new(network: impl Into<String>) -> anyhow::Result<Self> {
        let client = Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("Cannot connect to Docker socket: {}", e))?;

        client.ping().await.map_err(|e| {
            anyhow::anyhow!("Docker daemon is not responding: {}", e)
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            network: network.into(),
        })
    }
}

#[async_trait]
impl ContainerDirectory for DockerDirectory {
    async fn lookup_internal_ip(&self, app: &str) -> Result<String, GatewayError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![app.to_string()]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| GatewayError::Directory {
                app: app.to_string(),
                source: e,
            })?;

        let id = containers
            .first()
            .and_then(|c| c.id.clone())
            .ok_or_else(|| GatewayError::ContainerNotFound {
                app: app.to_string(),
            })?;

        let detail = self
            .client
            .inspect_container(&id, None)
            .await
            .map_err(|e| GatewayError::Directory {
                app: app.to_string(),
                source: e,
            })?;

        let ip = detail
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .and_then(|networks| networks.get(&self.network))
            .and_then(|net| net.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        match ip {
            Some(ip) => {
                debug!(app, %ip, network = %self.network, "Resolved container IP");
                Ok(ip)
            }
            None => Err(GatewayError::NotOnNetwork {
                app: app.to_string(),
                network: self.network.clone(),
            }),
        }
    }
}
