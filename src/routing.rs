//! The concurrent routing table and its IP change monitors
//!
//! One process-wide [`RoutingTable`] maps virtual host strings to shared
//! [`SwitchingProxy`] instances. Reads go through a shared lock and always
//! observe the snapshot of the most recently completed reload; reloads are
//! all-or-nothing and publish a complete replacement map in one in-memory
//! swap. Every slow step (directory queries, interface provisioning, IP
//! resolution) happens before the write lock is taken.
//!
//! Each published application is watched by one IP change monitor. Monitors
//! form a generation: stopped as a group, awaited to completion, and only
//! then replaced, so a stale monitor can never fire a reload after its
//! snapshot has been superseded.

use crate::directory::ContainerDirectory;
use crate::error::GatewayError;
use crate::inventory::AppInventory;
use crate::netif::VirtualInterfaceManager;
use crate::proxy::SwitchingProxy;
use crate::settings::SettingsStore;
use hyper::body::Bytes;
use hyper::Uri;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Routing-relevant configuration, extracted so tests can run with
/// accelerated clocks
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Domain suffix of platform-assigned virtual hosts
    pub domain: String,
    /// Settings-store key holding the box identity name
    pub node_name_key: String,
    /// Port application containers serve HTTP on
    pub app_port: u16,
    /// Interval between external-IP polls
    pub poll_interval: Duration,
}

/// One generation of monitors: a stop broadcast plus the handles to await
struct MonitorGeneration {
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl MonitorGeneration {
    /// Broadcast the stop signal and block until every monitor has exited
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("All IP change monitors stopped");
    }
}

/// Decrements the running-monitor count when a monitor task exits,
/// whichever way it exits
struct MonitorGuard(Arc<AtomicUsize>);

impl MonitorGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct RoutingTable {
    routes: RwLock<HashMap<String, Arc<SwitchingProxy>>>,
    /// Current monitor generation; the async lock also serializes reloads
    generation: Mutex<Option<MonitorGeneration>>,
    running_monitors: Arc<AtomicUsize>,
    directory: Arc<dyn ContainerDirectory>,
    interfaces: Arc<VirtualInterfaceManager>,
    inventory: Arc<dyn AppInventory>,
    store: Arc<dyn SettingsStore>,
    config: RoutingConfig,
    error_page: Bytes,
}

impl RoutingTable {
    pub fn new(
        directory: Arc<dyn ContainerDirectory>,
        interfaces: Arc<VirtualInterfaceManager>,
        inventory: Arc<dyn AppInventory>,
        store: Arc<dyn SettingsStore>,
        config: RoutingConfig,
        error_page: Bytes,
    ) -> Arc<Self> {
        Arc::new(Self {
            routes: RwLock::new(HashMap::new()),
            generation: Mutex::new(None),
            running_monitors: Arc::new(AtomicUsize::new(0)),
            directory,
            interfaces,
            inventory,
            store,
            config,
            error_page,
        })
    }

    /// Look up the proxy for a host in the current snapshot.
    /// Never blocks longer than acquiring the shared read lock.
    pub fn match_host(&self, host: &str) -> Option<Arc<SwitchingProxy>> {
        self.routes.read().get(host).cloned()
    }

    /// Number of entries in the current snapshot
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Number of monitor tasks currently alive
    pub fn running_monitors(&self) -> usize {
        self.running_monitors.load(Ordering::SeqCst)
    }

    /// Rebuild the routing table from live platform state and publish it.
    ///
    /// All-or-nothing: any failure aborts the whole reload and the previous
    /// snapshot stays active. On success the old monitor generation is
    /// stopped and awaited before the swap, then one monitor per application
    /// is started for the new snapshot. Returns the published entry count.
    pub async fn reload(self: &Arc<Self>) -> Result<usize, GatewayError> {
        // Taking the generation lock up front also serializes reloads.
        let mut generation = self.generation.lock().await;

        let box_name = self.store.get(&self.config.node_name_key).await?;
        let apps = self.inventory.list_managed_apps().await;

        let mut new_map = HashMap::new();
        for app in &apps {
            let internal_ip = self.directory.lookup_internal_ip(app).await?;

            self.interfaces.ensure_interface(app).await?;
            let external_ip = self.interfaces.external_ip(app).await?;

            let url = format!("http://{}:{}/", internal_ip, self.config.app_port);
            let backend: Uri = url.parse().map_err(|_| GatewayError::BackendUrl {
                app: app.clone(),
                url: url.clone(),
            })?;
            let proxy = Arc::new(SwitchingProxy::new(backend, self.error_page.clone()));

            let virtual_host = format!("{}.{}.{}", app, box_name, self.config.domain);
            info!(host = %virtual_host, backend = %internal_ip, "Routing entry");
            new_map.insert(virtual_host, Arc::clone(&proxy));
            info!(host = %external_ip, backend = %internal_ip, "Routing entry");
            new_map.insert(external_ip.to_string(), proxy);
        }

        // Point of no return: stop the old generation to completion, swap
        // the snapshot, then start the new generation.
        if let Some(old) = generation.take() {
            old.stop().await;
        }

        let count = new_map.len();
        *self.routes.write() = new_map;
        *generation = Some(self.start_monitors(&apps));

        Ok(count)
    }

    /// Stop the current monitor generation, e.g. on shutdown
    pub async fn stop_monitors(&self) {
        let mut generation = self.generation.lock().await;
        if let Some(old) = generation.take() {
            old.stop().await;
        }
    }

    fn start_monitors(self: &Arc<Self>, apps: &[String]) -> MonitorGeneration {
        let (stop_tx, stop_rx) = watch::channel(false);

        let handles = apps
            .iter()
            .map(|app| {
                let table = Arc::clone(self);
                let app = app.clone();
                let stop = stop_rx.clone();
                info!(app = %app, "Added IP change monitor");
                tokio::spawn(monitor_external_ip(table, app, stop))
            })
            .collect();

        MonitorGeneration { stop_tx, handles }
    }
}

/// Watch one application's external IP and request a reload when it moves.
///
/// Resolution failures terminate this monitor only; siblings keep running.
/// At most one reload is triggered per monitor, after which it retires and
/// waits to be replaced by the generation the reload starts.
async fn monitor_external_ip(table: Arc<RoutingTable>, app: String, mut stop: watch::Receiver<bool>) {
    let _guard = MonitorGuard::enter(&table.running_monitors);

    let baseline = match table.interfaces.external_ip(&app).await {
        Ok(ip) => ip,
        Err(e) => {
            error!(app = %app, error = %e, "Failed to get external IP, app will not be monitored");
            return;
        }
    };

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!(app = %app, "Stopped IP change monitor");
                    return;
                }
            }
            _ = tokio::time::sleep(table.config.poll_interval) => {
                let current = match table.interfaces.external_ip(&app).await {
                    Ok(ip) => ip,
                    Err(e) => {
                        error!(app = %app, error = %e, "Failed to get external IP, app will not be monitored");
                        return;
                    }
                };

                if current != baseline {
                    info!(app = %app, old = %baseline, new = %current, "External IP changed, reloading routes");
                    let trigger = Arc::clone(&table);
                    tokio::spawn(async move {
                        if let Err(e) = trigger.reload().await {
                            error!(error = %e, "Reload triggered by IP change failed");
                        }
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netif::{interface_name, LinkController};
    use crate::settings::MemorySettingsStore;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    struct FakeDirectory {
        ips: parking_lot::Mutex<HashMap<String, String>>,
    }

    impl FakeDirectory {
        fn new(entries: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                ips: parking_lot::Mutex::new(
                    entries
                        .iter()
                        .map(|(a, ip)| (a.to_string(), ip.to_string()))
                        .collect(),
                ),
            })
        }

        fn remove(&self, app: &str) {
            self.ips.lock().remove(app);
        }
    }

    #[async_trait]
    impl ContainerDirectory for FakeDirectory {
        async fn lookup_internal_ip(&self, app: &str) -> Result<String, GatewayError> {
            self.ips
                .lock()
                .get(app)
                .cloned()
                .ok_or_else(|| GatewayError::ContainerNotFound {
                    app: app.to_string(),
                })
        }
    }

    #[derive(Default)]
    struct FakeLinks {
        devices: parking_lot::Mutex<HashMap<String, Vec<Ipv4Addr>>>,
    }

    impl FakeLinks {
        fn set_address(&self, name: &str, addr: Ipv4Addr) {
            self.devices.lock().insert(name.to_string(), vec![addr]);
        }
    }

    #[async_trait]
    impl LinkController for FakeLinks {
        async fn exists(&self, name: &str) -> Result<bool, GatewayError> {
            Ok(self.devices.lock().contains_key(name))
        }

        async fn create_macvlan(&self, name: &str, _mac: [u8; 6]) -> Result<(), GatewayError> {
            // a fresh device comes up with one address already assigned
            self.devices
                .lock()
                .insert(name.to_string(), vec![Ipv4Addr::new(192, 168, 1, 50)]);
            Ok(())
        }

        async fn ipv4_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, GatewayError> {
            self.devices
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::InterfaceNotFound {
                    name: name.to_string(),
                })
        }

        async fn delete(&self, name: &str) -> Result<(), GatewayError> {
            self.devices.lock().remove(name);
            Ok(())
        }
    }

    struct Fixture {
        table: Arc<RoutingTable>,
        directory: Arc<FakeDirectory>,
        links: Arc<FakeLinks>,
    }

    fn fixture(apps: &[(&str, &str)]) -> Fixture {
        let directory = FakeDirectory::new(apps);
        let links = Arc::new(FakeLinks::default());
        let store = Arc::new(MemorySettingsStore::new());
        store.insert("ptw/node_name", "mybox");

        let interfaces = Arc::new(VirtualInterfaceManager::new(
            links.clone(),
            store.clone(),
        ));
        let inventory = Arc::new(crate::inventory::StaticInventory::new(
            apps.iter().map(|(a, _)| a.to_string()).collect(),
        ));

        let config = RoutingConfig {
            domain: "protonet.info".to_string(),
            node_name_key: "ptw/node_name".to_string(),
            app_port: 80,
            poll_interval: Duration::from_millis(10),
        };

        let table = RoutingTable::new(
            directory.clone(),
            interfaces,
            inventory,
            store,
            config,
            Bytes::from_static(b"<html>502</html>"),
        );

        Fixture {
            table,
            directory,
            links,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_reload_publishes_two_keys_per_app() {
        let fx = fixture(&[("gitlab", "10.42.0.3"), ("wiki", "10.42.0.4")]);
        fx.links
            .set_address("app_gitlab0", Ipv4Addr::new(192, 168, 1, 10));
        fx.links
            .set_address("app_wiki0", Ipv4Addr::new(192, 168, 1, 11));

        let count = fx.table.reload().await.unwrap();
        assert_eq!(count, 4);
        assert_eq!(fx.table.route_count(), 4);

        let by_name = fx
            .table
            .match_host("gitlab.mybox.protonet.info")
            .expect("virtual host routed");
        let by_ip = fx.table.match_host("192.168.1.10").expect("IP routed");
        assert!(Arc::ptr_eq(&by_name, &by_ip));
        assert_eq!(by_name.backend().to_string(), "http://10.42.0.3:80/");

        fx.table.stop_monitors().await;
    }

    #[tokio::test]
    async fn test_match_host_misses_unknown_hosts() {
        let fx = fixture(&[("gitlab", "10.42.0.3")]);
        fx.links
            .set_address("app_gitlab0", Ipv4Addr::new(192, 168, 1, 10));
        fx.table.reload().await.unwrap();

        assert!(fx.table.match_host("unknown.example.org").is_none());
        assert!(fx.table.match_host("").is_none());

        fx.table.stop_monitors().await;
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let fx = fixture(&[("gitlab", "10.42.0.3"), ("wiki", "10.42.0.4")]);
        fx.links
            .set_address("app_gitlab0", Ipv4Addr::new(192, 168, 1, 10));
        fx.links
            .set_address("app_wiki0", Ipv4Addr::new(192, 168, 1, 11));
        fx.table.reload().await.unwrap();

        // second app's container disappears: the whole reload must abort
        fx.directory.remove("wiki");
        let err = fx.table.reload().await.unwrap_err();
        assert!(matches!(err, GatewayError::ContainerNotFound { .. }));

        // old snapshot still fully active, including the doomed app
        assert_eq!(fx.table.route_count(), 4);
        assert!(fx.table.match_host("wiki.mybox.protonet.info").is_some());
        assert!(fx.table.match_host("192.168.1.11").is_some());

        fx.table.stop_monitors().await;
    }

    #[tokio::test]
    async fn test_reload_creates_missing_interfaces() {
        let fx = fixture(&[("gitlab", "10.42.0.3")]);
        // no interface seeded: reload must provision one

        let count = fx.table.reload().await.unwrap();
        assert_eq!(count, 2);
        assert!(fx
            .links
            .exists(&interface_name("gitlab"))
            .await
            .unwrap());

        fx.table.stop_monitors().await;
    }

    #[tokio::test]
    async fn test_monitor_generations_never_overlap() {
        let fx = fixture(&[("gitlab", "10.42.0.3"), ("wiki", "10.42.0.4")]);
        fx.links
            .set_address("app_gitlab0", Ipv4Addr::new(192, 168, 1, 10));
        fx.links
            .set_address("app_wiki0", Ipv4Addr::new(192, 168, 1, 11));

        fx.table.reload().await.unwrap();
        assert!(
            wait_until(|| fx.table.running_monitors() == 2, Duration::from_secs(1)).await,
            "expected one monitor per app"
        );

        // several generations in a row: the count must never accumulate
        for _ in 0..3 {
            fx.table.reload().await.unwrap();
            // the old generation was awaited before the new one spawned, so
            // at no point can more than one generation be alive
            assert!(fx.table.running_monitors() <= 2);
            assert!(
                wait_until(|| fx.table.running_monitors() == 2, Duration::from_secs(1)).await
            );
        }

        fx.table.stop_monitors().await;
        assert_eq!(fx.table.running_monitors(), 0);
    }

    #[tokio::test]
    async fn test_ip_change_triggers_one_reload() {
        let fx = fixture(&[("gitlab", "10.42.0.3")]);
        fx.links
            .set_address("app_gitlab0", Ipv4Addr::new(192, 168, 1, 10));
        fx.table.reload().await.unwrap();
        assert!(fx.table.match_host("192.168.1.10").is_some());

        fx.links
            .set_address("app_gitlab0", Ipv4Addr::new(192, 168, 1, 99));

        let table = fx.table.clone();
        assert!(
            wait_until(
                move || table.match_host("192.168.1.99").is_some(),
                Duration::from_secs(2)
            )
            .await,
            "monitor should have republished the routing table"
        );
        assert!(fx.table.match_host("192.168.1.10").is_none());

        // the replacement generation keeps watching
        assert!(
            wait_until(|| fx.table.running_monitors() == 1, Duration::from_secs(1)).await
        );

        fx.table.stop_monitors().await;
    }

    #[tokio::test]
    async fn test_monitor_with_unresolvable_ip_retires_alone() {
        let fx = fixture(&[("gitlab", "10.42.0.3"), ("wiki", "10.42.0.4")]);
        fx.links
            .set_address("app_gitlab0", Ipv4Addr::new(192, 168, 1, 10));
        fx.links
            .set_address("app_wiki0", Ipv4Addr::new(192, 168, 1, 11));
        fx.table.reload().await.unwrap();
        assert!(
            wait_until(|| fx.table.running_monitors() == 2, Duration::from_secs(1)).await
        );

        // one interface disappears; its monitor logs and exits, the sibling stays
        fx.links.delete("app_wiki0").await.unwrap();
        assert!(
            wait_until(|| fx.table.running_monitors() == 1, Duration::from_secs(2)).await,
            "monitor with failing resolution should retire"
        );
        assert_eq!(fx.table.route_count(), 4, "routes untouched by monitor death");

        fx.table.stop_monitors().await;
    }
}
