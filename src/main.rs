use hostgate::config::Config;
use hostgate::control::ControlServer;
use hostgate::directory::{ContainerDirectory, DockerDirectory};
use hostgate::gateway::Gateway;
use hostgate::inventory::FlagInventory;
use hostgate::netif::NetlinkController;
use hostgate::server::GatewayFrontend;
use hostgate::settings::{HttpSettingsStore, SettingsStore};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Wire up the collaborators
    let directory: Arc<dyn ContainerDirectory> =
        Arc::new(DockerDirectory::new(config.gateway.docker_network.clone()).await?);

    let settings_endpoint = match &config.gateway.settings_endpoint {
        Some(endpoint) => endpoint.clone(),
        None => {
            // The settings store runs as a platform container itself
            let ip = directory
                .lookup_internal_ip(&config.gateway.settings_app)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to locate settings store: {}", e))?;
            format!("http://{}", ip)
        }
    };
    info!(endpoint = %settings_endpoint, "Using settings store");
    let store: Arc<dyn SettingsStore> = Arc::new(HttpSettingsStore::new(settings_endpoint));

    let inventory = Arc::new(FlagInventory::new(
        Arc::clone(&store),
        config.gateway.managed_apps.clone(),
    ));

    let gateway = Gateway::new(
        &config,
        directory,
        Arc::clone(&store),
        Arc::new(NetlinkController::new()),
        inventory,
    )
    .await?;

    // Publish the first snapshot before accepting traffic
    let count = gateway
        .reload()
        .await
        .map_err(|e| anyhow::anyhow!("Initial routing reload failed: {}", e))?;
    info!(routes = count, "Routing table loaded");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Plain HTTP frontend
    let http_handle = if config.server.http_port > 0 {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP bind address: {}", e))?;
        let frontend = GatewayFrontend::new(
            addr,
            Arc::clone(&gateway),
            config.server.ssh_forward.clone(),
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = frontend.run().await {
                error!(error = %e, "HTTP frontend error");
            }
        }))
    } else {
        None
    };

    // TLS frontend
    let https_handle = if config.server.https_port > 0 {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.https_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTPS bind address: {}", e))?;
        let acceptor = build_tls_acceptor(&store, &config).await?;
        let frontend = GatewayFrontend::new(
            addr,
            Arc::clone(&gateway),
            config.server.ssh_forward.clone(),
            shutdown_rx.clone(),
        )
        .with_tls(acceptor);
        Some(tokio::spawn(async move {
            if let Err(e) = frontend.run().await {
                error!(error = %e, "HTTPS frontend error");
            }
        }))
    } else {
        None
    };

    // Loopback control API
    let control_addr: SocketAddr = format!("127.0.0.1:{}", config.server.control_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid control bind address: {}", e))?;
    let control = ControlServer::new(control_addr, Arc::clone(&gateway), shutdown_rx.clone());
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control.run().await {
            error!(error = %e, "Control server error");
        }
    });

    // Wait for shutdown (SIGINT/SIGTERM) or a reload request (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading routes...");
                    match gateway.reload().await {
                        Ok(count) => info!(routes = count, "Routing table reloaded"),
                        Err(e) => error!(error = %e, "Failed to reload routing table"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and stop background monitors
    let _ = shutdown_tx.send(true);
    gateway.shutdown().await;

    // Wait for listeners to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        let _ = control_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting gateway"
    );
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        control_port = config.server.control_port,
        ssh_forward = %config.server.ssh_forward,
        "Listener configuration"
    );
    info!(
        domain = %config.gateway.domain,
        default_backend = %config.gateway.default_backend_app,
        docker_network = %config.gateway.docker_network,
        managed_apps = ?config.gateway.managed_apps,
        poll_interval_ms = config.gateway.monitor_poll_interval_ms,
        "Gateway configuration"
    );
}

/// Build the TLS acceptor. Certificate material priority: settings store,
/// configured files, generated self-signed.
async fn build_tls_acceptor(
    store: &Arc<dyn SettingsStore>,
    config: &Config,
) -> anyhow::Result<TlsAcceptor> {
    let (certs, key) = match (store.get("ssl/pem").await, store.get("ssl/key").await) {
        (Ok(pem), Ok(key)) => {
            info!("Loaded TLS certificate from settings store");
            let certs = parse_certs(&mut pem.as_bytes())?;
            let key = parse_key(&mut key.as_bytes())?;
            (certs, key)
        }
        _ => match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                info!(cert = %cert_path, key = %key_path, "Loading TLS certificate from files");
                (load_certs(cert_path)?, load_key(key_path)?)
            }
            _ => {
                warn!("No TLS certificate in settings store or config, generating self-signed");
                generate_self_signed_cert()?
            }
        },
    };

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn parse_certs(reader: &mut dyn std::io::BufRead) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }

    Ok(certs)
}

fn parse_key(reader: &mut dyn std::io::BufRead) -> anyhow::Result<PrivateKeyDer<'static>> {
    loop {
        match rustls_pemfile::read_one(reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in PEM data")
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    parse_certs(&mut BufReader::new(file))
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    parse_key(&mut BufReader::new(file))
}

fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
