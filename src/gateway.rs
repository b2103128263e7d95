//! The gateway context object
//!
//! Owns the routing table, the default fallback proxy, and the collaborators,
//! and exposes the operations the frontend and control API consume. One
//! instance per process, explicitly constructed and passed by reference;
//! there is no package-level state.

use crate::config::Config;
use crate::directory::ContainerDirectory;
use crate::error::GatewayError;
use crate::inventory::AppInventory;
use crate::netif::{LinkController, VirtualInterfaceManager};
use crate::proxy::SwitchingProxy;
use crate::routing::{RoutingConfig, RoutingTable};
use crate::settings::SettingsStore;
use hyper::body::Bytes;
use hyper::Uri;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

pub struct Gateway {
    table: Arc<RoutingTable>,
    default_proxy: Arc<SwitchingProxy>,
    interfaces: Arc<VirtualInterfaceManager>,
    inventory: Arc<dyn AppInventory>,
}

impl Gateway {
    /// Build the gateway context: load the error page, resolve the default
    /// backend, and assemble the routing table. Any failure here is fatal,
    /// the frontend has no degraded mode.
    pub async fn new(
        config: &Config,
        directory: Arc<dyn ContainerDirectory>,
        store: Arc<dyn SettingsStore>,
        links: Arc<dyn LinkController>,
        inventory: Arc<dyn AppInventory>,
    ) -> anyhow::Result<Arc<Self>> {
        let error_page = tokio::fs::read(&config.gateway.error_page)
            .await
            .map(Bytes::from)
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to read error page '{}': {}",
                    config.gateway.error_page,
                    e
                )
            })?;

        let default_ip = directory
            .lookup_internal_ip(&config.gateway.default_backend_app)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to resolve default backend: {}", e))?;
        let default_url = format!(
            "http://{}:{}/",
            default_ip, config.gateway.default_backend_port
        );
        let default_backend: Uri = default_url
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid default backend URL '{}': {}", default_url, e))?;
        info!(
            app = %config.gateway.default_backend_app,
            backend = %default_backend,
            "Default backend resolved"
        );
        let default_proxy = Arc::new(SwitchingProxy::new(default_backend, error_page.clone()));

        let interfaces = Arc::new(VirtualInterfaceManager::new(links, Arc::clone(&store)));

        let routing_config = RoutingConfig {
            domain: config.gateway.domain.clone(),
            node_name_key: config.gateway.node_name_key.clone(),
            app_port: config.gateway.app_port,
            poll_interval: config.gateway.poll_interval(),
        };

        let table = RoutingTable::new(
            directory,
            Arc::clone(&interfaces),
            Arc::clone(&inventory),
            store,
            routing_config,
            error_page,
        );

        Ok(Arc::new(Self {
            table,
            default_proxy,
            interfaces,
            inventory,
        }))
    }

    /// Trigger a full routing reload; returns the new route count
    pub async fn reload(&self) -> Result<usize, GatewayError> {
        self.table.reload().await
    }

    /// The proxy serving `host`: the matched route, or the default backend
    pub fn route(&self, host: &str) -> Arc<SwitchingProxy> {
        self.table
            .match_host(host)
            .unwrap_or_else(|| Arc::clone(&self.default_proxy))
    }

    pub fn match_host(&self, host: &str) -> Option<Arc<SwitchingProxy>> {
        self.table.match_host(host)
    }

    pub fn route_count(&self) -> usize {
        self.table.route_count()
    }

    /// Current external IP of an application's macvlan interface
    pub async fn external_ip(&self, app: &str) -> Result<Ipv4Addr, GatewayError> {
        self.interfaces.external_ip(app).await
    }

    /// Provision an application's macvlan interface
    pub async fn create_interface(&self, app: &str) -> Result<(), GatewayError> {
        self.interfaces.ensure_interface(app).await
    }

    /// Remove an application's macvlan interface
    pub async fn delete_interface(&self, app: &str) -> Result<(), GatewayError> {
        self.interfaces.delete_interface(app).await
    }

    /// Applications currently eligible for macvlan provisioning
    pub async fn managed_apps(&self) -> Vec<String> {
        self.inventory.list_managed_apps().await
    }

    /// Stop background monitors; called once on shutdown
    pub async fn shutdown(&self) {
        self.table.stop_monitors().await;
    }
}
