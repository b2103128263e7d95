//! Application inventory
//!
//! Which applications get a macvlan interface and a routing entry is
//! currently derived from per-app feature flags in the settings store. The
//! trait exists so the list can become fully dynamic once an app installer
//! provides one.

use crate::settings::SettingsStore;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait AppInventory: Send + Sync {
    /// Names of the applications currently eligible for macvlan provisioning
    async fn list_managed_apps(&self) -> Vec<String>;
}

/// Inventory derived from feature flags: a candidate app is managed while
/// `<app>/enabled` has a value in the settings store.
pub struct FlagInventory {
    store: Arc<dyn SettingsStore>,
    candidates: Vec<String>,
}

impl FlagInventory {
    pub fn new(store: Arc<dyn SettingsStore>, candidates: Vec<String>) -> Self {
        Self { store, candidates }
    }
}

#[async_trait]
impl AppInventory for FlagInventory {
    async fn list_managed_apps(&self) -> Vec<String> {
        let mut result = Vec::new();
        for app in &self.candidates {
            if self.store.get(&format!("{}/enabled", app)).await.is_ok() {
                result.push(app.clone());
            }
        }
        result
    }
}

/// Fixed application list, for tests and single-purpose deployments
pub struct StaticInventory {
    apps: Vec<String>,
}

impl StaticInventory {
    pub fn new(apps: Vec<String>) -> Self {
        Self { apps }
    }
}

#[async_trait]
impl AppInventory for StaticInventory {
    async fn list_managed_apps(&self) -> Vec<String> {
        self.apps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;

    #[tokio::test]
    async fn test_flag_inventory_filters_by_flag() {
        let store = Arc::new(MemorySettingsStore::new());
        store.insert("gitlab/enabled", "true");

        let inventory = FlagInventory::new(
            store,
            vec!["gitlab".to_string(), "wiki".to_string()],
        );

        assert_eq!(inventory.list_managed_apps().await, vec!["gitlab"]);
    }

    #[tokio::test]
    async fn test_static_inventory() {
        let inventory = StaticInventory::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(inventory.list_managed_apps().await, vec!["a", "b"]);
    }
}
