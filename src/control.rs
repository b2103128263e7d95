//! Loopback control API
//!
//! Thin HTTP surface over the [`Gateway`] operations: trigger a routing
//! reload, query an application's external IP, and manage macvlan
//! interfaces. Bound to loopback only; it carries no authentication.

use crate::gateway::Gateway;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

pub struct ControlServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control endpoint listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let gw = Arc::clone(&gateway);
                                    async move { handle_control_request(req, gw).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// App name from a `/apps/{app}/macvlan` path
fn macvlan_app(path: &str) -> Option<&str> {
    path.strip_prefix("/apps/")
        .and_then(|rest| rest.strip_suffix("/macvlan"))
        .filter(|app| !app.is_empty() && !app.contains('/'))
}

async fn handle_control_request(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Control API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Rebuild the routing table from live platform state
        (&Method::POST, "/reload-proxies") => match gateway.reload().await {
            Ok(count) => {
                info!(routes = count, "Routing table reloaded via control API");
                json_response(
                    StatusCode::OK,
                    serde_json::json!({ "routes": count }).to_string(),
                )
            }
            Err(e) => {
                error!(error = %e, "Reload via control API failed");
                response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },

        // Applications eligible for macvlan provisioning
        (&Method::GET, "/apps/") => {
            let apps = gateway.managed_apps().await;
            match serde_json::to_string(&apps) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }

        (&Method::GET, path) => match macvlan_app(path) {
            Some(app) => match gateway.external_ip(app).await {
                Ok(ip) => response(StatusCode::OK, ip.to_string()),
                Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            None => response(StatusCode::NOT_FOUND, "not found"),
        },

        (&Method::POST, path) => match macvlan_app(path) {
            Some(app) => match gateway.create_interface(app).await {
                Ok(()) => response(StatusCode::CREATED, ""),
                Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            None => response(StatusCode::NOT_FOUND, "not found"),
        },

        (&Method::DELETE, path) => match macvlan_app(path) {
            Some(app) => match gateway.delete_interface(app).await {
                Ok(()) => response(StatusCode::OK, ""),
                Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            None => response(StatusCode::NOT_FOUND, "not found"),
        },

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macvlan_app_extraction() {
        assert_eq!(macvlan_app("/apps/gitlab/macvlan"), Some("gitlab"));
        assert_eq!(macvlan_app("/apps//macvlan"), None);
        assert_eq!(macvlan_app("/apps/a/b/macvlan"), None);
        assert_eq!(macvlan_app("/apps/gitlab"), None);
        assert_eq!(macvlan_app("/reload-proxies"), None);
    }
}
