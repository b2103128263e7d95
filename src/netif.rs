//! Virtual network interface lifecycle
//!
//! Every managed application gets a macvlan interface on the host's default
//! outbound device, giving its container a routable IP on the physical
//! segment. Interfaces are addressed by MAC, so each application's MAC is
//! generated once and persisted in the settings store; it must not silently
//! change across restarts or interface recreation.
//!
//! The netlink plumbing sits behind [`LinkController`] so the manager's logic
//! stays testable without root privileges.

use crate::error::GatewayError;
use crate::settings::SettingsStore;
use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::RouteAttribute;
use netlink_packet_route::AddressFamily;
use rtnetlink::Handle;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, error, info};

const MACVLAN_MODE_BRIDGE: u32 = 4;

/// Derive the OS-level interface name for an application.
/// Deterministic and stable across calls.
pub fn interface_name(app: &str) -> String {
    format!("app_{}0", app)
}

/// Generate a MAC address from three random bytes under a fixed
/// vendor-style prefix
pub fn generate_mac() -> String {
    let bytes: [u8; 3] = rand::random();
    format!("00:11:22:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for slot in &mut out {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// OS-level link operations needed by the manager
#[async_trait]
pub trait LinkController: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, GatewayError>;

    /// Create a macvlan device with the given MAC, bound to the host's
    /// default outbound interface, and bring it up
    async fn create_macvlan(&self, name: &str, mac: [u8; 6]) -> Result<(), GatewayError>;

    async fn ipv4_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, GatewayError>;

    async fn delete(&self, name: &str) -> Result<(), GatewayError>;
}

/// [`LinkController`] backed by rtnetlink
pub struct NetlinkController;

impl NetlinkController {
    pub fn new() -> Self {
        Self
    }

    fn connect(op: &'static str, name: &str) -> Result<Handle, GatewayError> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| GatewayError::Netlink {
                op,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn link_index(
        handle: &Handle,
        op: &'static str,
        name: &str,
    ) -> Result<Option<u32>, GatewayError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
            Err(e) => Err(GatewayError::Netlink {
                op,
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Interface index of the default IPv4 route's output device
    async fn default_interface_index(handle: &Handle) -> Result<u32, GatewayError> {
        let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();
        loop {
            let route = routes.try_next().await.map_err(|e| GatewayError::Netlink {
                op: "route list",
                name: "default".to_string(),
                reason: e.to_string(),
            })?;
            let Some(route) = route else {
                return Err(GatewayError::NoDefaultInterface);
            };
            if route.header.destination_prefix_length != 0 {
                continue;
            }
            for attr in &route.attributes {
                if let RouteAttribute::Oif(index) = attr {
                    return Ok(*index);
                }
            }
        }
    }
}

impl Default for NetlinkController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkController for NetlinkController {
    async fn exists(&self, name: &str) -> Result<bool, GatewayError> {
        let handle = Self::connect("link get", name)?;
        Ok(Self::link_index(&handle, "link get", name).await?.is_some())
    }

    async fn create_macvlan(&self, name: &str, mac: [u8; 6]) -> Result<(), GatewayError> {
        let handle = Self::connect("link add", name)?;
        let parent = Self::default_interface_index(&handle).await?;

        let mut req = handle
            .link()
            .add()
            .macvlan(name.to_string(), parent, MACVLAN_MODE_BRIDGE);
        req.message_mut()
            .attributes
            .push(LinkAttribute::Address(mac.to_vec()));
        req.execute().await.map_err(|e| GatewayError::Netlink {
            op: "link add",
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let index = Self::link_index(&handle, "link add", name)
            .await?
            .ok_or_else(|| GatewayError::InterfaceNotFound {
                name: name.to_string(),
            })?;

        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| GatewayError::Netlink {
                op: "link up",
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn ipv4_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, GatewayError> {
        let handle = Self::connect("address list", name)?;
        let index = Self::link_index(&handle, "address list", name)
            .await?
            .ok_or_else(|| GatewayError::InterfaceNotFound {
                name: name.to_string(),
            })?;

        let mut stream = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut addresses = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(|e| GatewayError::Netlink {
            op: "address list",
            name: name.to_string(),
            reason: e.to_string(),
        })? {
            if msg.header.family != AddressFamily::Inet {
                continue;
            }
            for attr in &msg.attributes {
                if let AddressAttribute::Address(IpAddr::V4(ip)) = attr {
                    addresses.push(*ip);
                }
            }
        }

        Ok(addresses)
    }

    async fn delete(&self, name: &str) -> Result<(), GatewayError> {
        let handle = Self::connect("link del", name)?;
        let index = Self::link_index(&handle, "link del", name)
            .await?
            .ok_or_else(|| GatewayError::InterfaceNotFound {
                name: name.to_string(),
            })?;

        handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| GatewayError::Netlink {
                op: "link del",
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Creates, discovers, and tears down per-application macvlan interfaces
pub struct VirtualInterfaceManager {
    links: Arc<dyn LinkController>,
    store: Arc<dyn SettingsStore>,
}

impl VirtualInterfaceManager {
    pub fn new(links: Arc<dyn LinkController>, store: Arc<dyn SettingsStore>) -> Self {
        Self { links, store }
    }

    /// Create the application's macvlan interface if it doesn't exist yet.
    ///
    /// A partially created interface is not rolled back on failure; the
    /// error is surfaced and the OS state left for inspection.
    pub async fn ensure_interface(&self, app: &str) -> Result<(), GatewayError> {
        let name = interface_name(app);
        if self.links.exists(&name).await? {
            debug!(interface = %name, "Interface already exists");
            return Ok(());
        }

        let mac = self.app_mac(app).await;
        let mac_bytes = parse_mac(&mac).ok_or_else(|| GatewayError::InvalidMac {
            app: app.to_string(),
            mac: mac.clone(),
        })?;

        info!(app, interface = %name, mac = %mac, "Creating macvlan interface");
        self.links.create_macvlan(&name, mac_bytes).await
    }

    /// Resolve the single IPv4 address bound to the application's interface.
    /// Zero or multiple addresses is an ambiguous configuration, not
    /// something to resolve silently.
    pub async fn external_ip(&self, app: &str) -> Result<Ipv4Addr, GatewayError> {
        let name = interface_name(app);
        let addresses = self.links.ipv4_addresses(&name).await?;
        match addresses.as_slice() {
            [ip] => Ok(*ip),
            _ => Err(GatewayError::AmbiguousAddress {
                name,
                count: addresses.len(),
            }),
        }
    }

    /// Remove the application's OS-level interface. Absence is surfaced as
    /// an error, not swallowed.
    pub async fn delete_interface(&self, app: &str) -> Result<(), GatewayError> {
        self.links.delete(&interface_name(app)).await
    }

    /// The application's stable MAC: read from the settings store, or
    /// generated and persisted on first use. A failed persist is logged but
    /// does not block interface creation.
    async fn app_mac(&self, app: &str) -> String {
        let key = format!("apps/{}/mac", app);
        match self.store.get(&key).await {
            Ok(mac) => mac,
            Err(_) => {
                let mac = generate_mac();
                if let Err(e) = self.store.set(&key, &mac).await {
                    error!(app, error = %e, "Failed to persist MAC address");
                }
                mac
            }
        }
    }
}
