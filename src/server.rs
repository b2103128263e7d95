//! The public gateway frontend
//!
//! Listeners for plain HTTP and TLS traffic. Each request is dispatched by
//! its Host to the routing table, falling back to the default backend;
//! CONNECT requests are never proxied as HTTP but spliced into a raw tunnel
//! to a fixed local SSH endpoint, independent of the routing table.

use crate::gateway::Gateway;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

pub struct GatewayFrontend {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    ssh_forward: String,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl GatewayFrontend {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        ssh_forward: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            ssh_forward,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let ssh_forward = self.ssh_forward.clone();
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, gateway, ssh_forward, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, gateway, ssh_forward, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway frontend shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    ssh_forward: String,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        let ssh_forward = ssh_forward.clone();
        async move { handle_request(req, gateway, ssh_forward, addr, is_tls).await }
    });

    // serve_connection_with_upgrades keeps WebSocket and CONNECT upgrades
    // working over HTTP/1.1
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    ssh_forward: String,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, &ssh_forward).await);
    }

    let proxy = match extract_hostname(&req) {
        Some(host) => gateway.route(&host),
        // hostless requests land on the default backend
        None => gateway.route(""),
    };

    Ok(proxy.handle(req, client_addr, is_tls).await)
}

/// Splice a CONNECT request into a raw bidirectional tunnel to the local
/// SSH endpoint. The requested authority is ignored by design.
async fn handle_connect(
    req: Request<Incoming>,
    ssh_forward: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut upstream = match TcpStream::connect(ssh_forward).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(target = %ssh_forward, error = %e, "Failed to connect to SSH");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(
                    Full::new(Bytes::from_static(b"Failed to connect to SSH"))
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid response builder");
        }
    };

    debug!(target = %ssh_forward, "CONNECT tunnel opened");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((to_upstream, to_client)) => {
                        debug!(to_upstream, to_client, "CONNECT tunnel closed");
                    }
                    Err(e) => {
                        debug!(error = %e, "CONNECT tunnel closed with error");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to upgrade CONNECT request");
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Hostname a request should be routed by: the URI authority for
/// absolute-form requests, otherwise the Host header, port stripped,
/// lowercased
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_lowercase());
    }

    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(':').next())
        .filter(|h| !h.is_empty())
        .map(|h| h.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: &str) -> Request<()> {
        Request::builder()
            .uri("/")
            .header("Host", host)
            .body(())
            .expect("valid test request")
    }

    #[test]
    fn test_extract_hostname_strips_port_and_case() {
        let req = request_with_host("GitLab.MyBox.protonet.info:8080");
        assert_eq!(
            extract_hostname(&req).as_deref(),
            Some("gitlab.mybox.protonet.info")
        );

        let req = request_with_host("192.168.1.10");
        assert_eq!(extract_hostname(&req).as_deref(), Some("192.168.1.10"));
    }

    #[test]
    fn test_extract_hostname_prefers_uri_authority() {
        let req = Request::builder()
            .uri("http://gitlab.mybox.protonet.info/path")
            .header("Host", "other.example.org")
            .body(())
            .expect("valid test request");
        assert_eq!(
            extract_hostname(&req).as_deref(),
            Some("gitlab.mybox.protonet.info")
        );
    }

    #[test]
    fn test_extract_hostname_missing() {
        let req = Request::builder().uri("/").body(()).expect("valid test request");
        assert_eq!(extract_hostname(&req), None);
    }
}
