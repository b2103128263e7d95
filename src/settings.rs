//! Persistent settings store collaborator
//!
//! The platform keeps small pieces of configuration (box identity, per-app
//! MAC addresses, TLS material) in a key-value service. The gateway only
//! needs get/set of opaque string values, so that is the whole trait.

use crate::error::GatewayError;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fetch the value stored under `key`
    async fn get(&self, key: &str) -> Result<String, GatewayError>;

    /// Store `value` under `key`, overwriting any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError>;
}

/// HTTP client for the platform's key-value service
///
/// Keys map to URL paths below the base endpoint; values travel as raw
/// request/response bodies. A 404 means the key has no value.
pub struct HttpSettingsStore {
    base: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpSettingsStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            base: endpoint.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/{}", self.base, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl SettingsStore for HttpSettingsStore {
    async fn get(&self, key: &str) -> Result<String, GatewayError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(self.key_url(key))
            .body(Full::new(Bytes::new()))
            .map_err(|e| GatewayError::Settings {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| GatewayError::Settings {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(GatewayError::SettingsMiss {
                key: key.to_string(),
            }),
            status if status.is_success() => {
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| GatewayError::Settings {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?
                    .to_bytes();
                String::from_utf8(body.to_vec()).map_err(|e| GatewayError::Settings {
                    key: key.to_string(),
                    reason: format!("value is not valid UTF-8: {}", e),
                })
            }
            status => Err(GatewayError::Settings {
                key: key.to_string(),
                reason: format!("unexpected status {}", status),
            }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        let req = Request::builder()
            .method(Method::PUT)
            .uri(self.key_url(key))
            .body(Full::new(Bytes::from(value.to_string())))
            .map_err(|e| GatewayError::Settings {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| GatewayError::Settings {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Settings {
                key: key.to_string(),
                reason: format!("unexpected status {}", response.status()),
            });
        }

        debug!(key, "Settings value stored");
        Ok(())
    }
}

/// In-memory settings store for tests and local development
#[derive(Default)]
pub struct MemorySettingsStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value, e.g. for test setup
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: &str) -> Result<String, GatewayError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::SettingsMiss {
                key: key.to_string(),
            })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
