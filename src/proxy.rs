//! The dual-protocol switching proxy
//!
//! A [`SwitchingProxy`] is bound to one fixed upstream base URL and forwards
//! one request at a time, choosing the transport per request: WebSocket
//! upgrades are relayed as a raw bidirectional byte stream, everything else
//! goes through HTTP reverse-proxying with correct hop-by-hop and forwarding
//! header handling. Instances are immutable after construction and safe to
//! share across any number of concurrent requests.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Identity the gateway announces in the `Server` response header
pub const SERVER_IDENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Entry appended to the `Via` header on forwarded requests
const VIA_IDENT: &str = concat!("1.1 ", env!("CARGO_PKG_NAME"));

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

// http://www.w3.org/Protocols/rfc2616/rfc2616-sec13.html
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The forwarding strategy selected for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Http,
    WebSocket,
}

/// A request is a WebSocket upgrade iff `Upgrade` equals `websocket` and
/// `Connection` contains `upgrade`, both case-insensitively.
pub fn forward_mode<B>(req: &Request<B>) -> ForwardMode {
    let upgrade_is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let connection_has_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    if upgrade_is_websocket && connection_has_upgrade {
        ForwardMode::WebSocket
    } else {
        ForwardMode::Http
    }
}

/// Join the backend's path prefix with the request path
fn join_paths(base: &str, request: &str) -> String {
    let base = base.trim_end_matches('/');
    let request = request.trim_start_matches('/');
    if request.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else {
        format!("{}/{}", base, request)
    }
}

/// A backend-bound handler forwarding HTTP requests and WebSocket upgrades
/// to one fixed upstream URL
pub struct SwitchingProxy {
    backend: Uri,
    client: Client<HttpConnector, Incoming>,
    error_page: Bytes,
}

impl SwitchingProxy {
    /// Create a proxy bound to `backend`, e.g. `http://10.42.0.3:80/`.
    /// `error_page` is the HTML body served with 502 responses.
    pub fn new(backend: Uri, error_page: Bytes) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            backend,
            client,
            error_page,
        }
    }

    pub fn backend(&self) -> &Uri {
        &self.backend
    }

    /// Forward one request, dispatching on the upgrade predicate
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        match forward_mode(&req) {
            ForwardMode::WebSocket => self.forward_websocket(req).await,
            ForwardMode::Http => self.forward_http(req, client_addr, is_tls).await,
        }
    }

    /// 502 with the static error page. Backend failures are surfaced
    /// immediately, never retried.
    fn bad_gateway(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header(header::CONTENT_TYPE, "text/html")
            .header(header::SERVER, HeaderValue::from_static(SERVER_IDENT))
            .body(
                Full::new(self.error_page.clone())
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("valid response with StatusCode enum and static headers")
    }

    /// Rewrite the request URI onto the backend, keeping query and the
    /// original Host header
    fn backend_uri(&self, inbound: &Uri) -> Option<Uri> {
        let joined = join_paths(self.backend.path(), inbound.path());
        let path_and_query = match inbound.query() {
            Some(q) => format!("{}?{}", joined, q),
            None => joined,
        };

        Uri::builder()
            .scheme(self.backend.scheme()?.clone())
            .authority(self.backend.authority()?.clone())
            .path_and_query(path_and_query)
            .build()
            .ok()
    }

    async fn forward_http(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let (mut parts, body) = req.into_parts();

        let uri = match self.backend_uri(&parts.uri) {
            Some(uri) => uri,
            None => {
                error!(backend = %self.backend, "Backend URL is missing scheme or authority");
                return self.bad_gateway();
            }
        };
        debug!(method = %parts.method, uri = %uri, "Forwarding request");
        parts.uri = uri;

        for name in HOP_BY_HOP_HEADERS {
            parts.headers.remove(name);
        }

        // This gateway is the first trusted hop; forwarding headers are
        // overwritten, not appended to.
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
        let proto = if is_tls { "https" } else { "http" };
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        parts
            .headers
            .append(header::VIA, HeaderValue::from_static(VIA_IDENT));

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                for name in HOP_BY_HOP_HEADERS {
                    parts.headers.remove(name);
                }
                parts
                    .headers
                    .insert(header::SERVER, HeaderValue::from_static(SERVER_IDENT));
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                error!(backend = %self.backend, error = %e, "Proxying to backend failed");
                self.bad_gateway()
            }
        }
    }

    fn connect_addr(&self) -> Option<String> {
        let host = self.backend.host()?;
        let port = self.backend.port_u16().unwrap_or(80);
        Some(format!("{}:{}", host, port))
    }

    /// Relay a WebSocket upgrade: replay the handshake against the backend
    /// over raw TCP, then pipe bytes both ways until either side closes.
    async fn forward_websocket(
        &self,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some(addr) = self.connect_addr() else {
            error!(backend = %self.backend, "Backend URL is missing a host");
            return self.bad_gateway();
        };

        let mut backend_stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(backend = %addr, error = %e, "Failed to connect to backend for upgrade");
                return self.bad_gateway();
            }
        };

        let raw_request = build_upgrade_request(&req, &addr, self.backend.path());
        if let Err(e) = backend_stream.write_all(&raw_request).await {
            error!(backend = %addr, error = %e, "Failed to send upgrade request to backend");
            return self.bad_gateway();
        }

        // Read the backend's handshake response up to the header terminator;
        // anything past it already belongs to the tunneled stream.
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = match backend_stream.read(&mut chunk).await {
                Ok(0) => {
                    error!(backend = %addr, "Backend closed connection before responding to upgrade");
                    return self.bad_gateway();
                }
                Ok(n) => n,
                Err(e) => {
                    error!(backend = %addr, error = %e, "Failed to read upgrade response from backend");
                    return self.bad_gateway();
                }
            };
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_header_end(&buf) {
                break end;
            }
            if buf.len() > 16 * 1024 {
                error!(backend = %addr, "Upgrade response headers exceed 16 KiB");
                return self.bad_gateway();
            }
        };

        let Some((status, response_headers)) = parse_upgrade_response(&buf[..header_end]) else {
            error!(backend = %addr, "Failed to parse backend upgrade response");
            return self.bad_gateway();
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(backend = %addr, status = %status, "Backend rejected upgrade request");
            // Relay the backend's non-101 verdict
            let mut response = Response::builder().status(status);
            for (name, value) in &response_headers {
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .expect("valid response builder");
        }

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            // Framing headers are hyper's business on this side
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");

        let leftover = buf[header_end..].to_vec();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    if !leftover.is_empty() {
                        if let Err(e) = client.write_all(&leftover).await {
                            debug!(error = %e, "Failed to flush buffered backend bytes");
                            return;
                        }
                    }
                    match tokio::io::copy_bidirectional(&mut client, &mut backend_stream).await {
                        Ok((to_backend, to_client)) => {
                            debug!(to_backend, to_client, "WebSocket relay closed normally");
                        }
                        Err(e) => {
                            debug!(error = %e, "WebSocket relay closed with error");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// Index just past the `\r\n\r\n` header terminator, if present
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Serialize the client's upgrade request for replay against the backend.
/// All headers pass through untouched except Host, which targets the backend.
fn build_upgrade_request<B>(req: &Request<B>, backend_authority: &str, backend_path: &str) -> Vec<u8> {
    let joined = join_paths(backend_path, req.uri().path());
    let target = match req.uri().query() {
        Some(q) => format!("{}?{}", joined, q),
        None => joined,
    };

    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), target);
    for (name, value) in req.headers() {
        if name == header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("Host: {}\r\n", backend_authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's handshake response status line and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_headers(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/ws");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).expect("valid test request")
    }

    #[test]
    fn test_websocket_predicate() {
        // mixed case and a Connection list still count
        let req = request_with_headers(&[
            ("Upgrade", "WebSocket"),
            ("Connection", "Keep-Alive, Upgrade"),
        ]);
        assert_eq!(forward_mode(&req), ForwardMode::WebSocket);

        // Upgrade alone is not enough
        let req = request_with_headers(&[("Upgrade", "websocket"), ("Connection", "close")]);
        assert_eq!(forward_mode(&req), ForwardMode::Http);

        // Connection: upgrade with a non-websocket protocol is not ours
        let req = request_with_headers(&[("Upgrade", "h2c"), ("Connection", "upgrade")]);
        assert_eq!(forward_mode(&req), ForwardMode::Http);

        let req = request_with_headers(&[]);
        assert_eq!(forward_mode(&req), ForwardMode::Http);
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/api"), "/api");
        assert_eq!(join_paths("/", "/"), "/");
        assert_eq!(join_paths("/prefix/", "/v1/x"), "/prefix/v1/x");
        assert_eq!(join_paths("/prefix", ""), "/prefix");
    }

    #[test]
    fn test_backend_uri_rewrite() {
        let proxy = SwitchingProxy::new(
            "http://10.0.0.5:80/".parse().expect("valid uri"),
            Bytes::from_static(b"<html>502</html>"),
        );

        let uri = proxy
            .backend_uri(&"/a/b?x=1".parse().expect("valid uri"))
            .expect("rewritten uri");
        assert_eq!(uri.to_string(), "http://10.0.0.5:80/a/b?x=1");
    }

    #[test]
    fn test_upgrade_request_targets_backend_host() {
        let req = request_with_headers(&[
            ("Host", "gitlab.mybox.protonet.info"),
            ("Upgrade", "websocket"),
            ("Connection", "upgrade"),
        ]);
        let raw = build_upgrade_request(&req, "10.0.0.5:80", "/");
        let text = String::from_utf8(raw).expect("ascii request");

        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.5:80\r\n"));
        assert!(!text.contains("gitlab.mybox.protonet.info"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).expect("parses");
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Upgrade" && v == "websocket"));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 101 X\r\n\r\nrest"), Some(18));
        assert_eq!(find_header_end(b"HTTP/1.1 101 X\r\n"), None);
    }
}
