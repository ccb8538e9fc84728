use issuer_proxy::admin::{AdminServer, PKG_NAME, VERSION};
use issuer_proxy::config::Config;
use issuer_proxy::discovery::DiscoveryEngine;
use issuer_proxy::forward::HttpForwarder;
use issuer_proxy::proxy::{DispatchSettings, Dispatcher, ProxyServer};
use issuer_proxy::store::RoutingStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
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
                .add_directive("issuer_proxy=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // TLS is on unless explicitly disabled; missing material is fatal
    let tls_acceptor = if config.server.tls_enabled() {
        let acceptor = build_tls_acceptor(&config)?;
        Some(acceptor)
    } else {
        warn!("TLS disabled by configuration (server.tls = false), serving plain HTTP only");
        None
    };

    let store = Arc::new(RoutingStore::open(&config.store.path).await);

    let discovery = DiscoveryEngine::from_config(&config.discovery, &config.upstream)
        .map_err(|e| anyhow::anyhow!("Failed to create discovery client: {}", e))?;
    let forwarder = HttpForwarder::from_config(&config.upstream)
        .map_err(|e| anyhow::anyhow!("Failed to create backend client: {}", e))?;

    if config.upstream.accept_invalid_certs {
        warn!("Backend certificate verification is disabled");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(discovery),
        Arc::new(forwarder),
        DispatchSettings::from_config(&config),
    ));

    info!(admin_url = %dispatcher.settings().admin_url, "Admin console available");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create HTTP proxy server (if port > 0)
    let http_port = config.server.http_port();
    let http_proxy_handle = if http_port > 0 {
        let http_addr = bind_addr(&config.server.bind, http_port)?;
        let http_proxy = ProxyServer::new(http_addr, Arc::clone(&dispatcher), shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = http_proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }))
    } else {
        None
    };

    // Create HTTPS proxy server (if TLS enabled and port > 0)
    let https_port = config.server.https_port();
    let https_proxy_handle = match tls_acceptor {
        Some(acceptor) if https_port > 0 => {
            let https_addr = bind_addr(&config.server.bind, https_port)?;
            let https_proxy =
                ProxyServer::new(https_addr, Arc::clone(&dispatcher), shutdown_rx.clone()).with_tls(acceptor);

            Some(tokio::spawn(async move {
                if let Err(e) = https_proxy.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }))
        }
        _ => None,
    };

    if http_proxy_handle.is_none() && https_proxy_handle.is_none() {
        anyhow::bail!("No proxy listener enabled; set server.http_port or enable server.tls");
    }

    // Admin listener is always loopback-only and plain HTTP
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = bind_addr("127.0.0.1", config.server.admin_port)?;
        let admin_server = AdminServer::new(admin_addr, Arc::clone(&store), shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or routing table reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

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
                    info!(path = %store.path().display(), "Received SIGHUP, reloading routing table...");
                    match store.reload().await {
                        Ok(route_count) => info!(route_count, "Routing table reloaded"),
                        Err(e) => error!(error = %e, "Failed to reload routing table, keeping current routes"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_proxy_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_proxy_handle {
            let _ = handle.await;
        }
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port).parse().map_err(|e| {
        error!(bind = %host, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", host, port, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting issuer proxy");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        admin_port = config.server.admin_port,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        admin_hostname = %config.admin.hostname,
        loopback_only = config.admin.loopback_only,
        "Admin API settings"
    );
    info!(
        ports = ?config.discovery.ports,
        probe_timeout_ms = config.discovery.probe_timeout_ms,
        scheme = %config.discovery.scheme,
        host = %config.discovery.host,
        strategy = ?config.discovery.strategy,
        "Discovery settings"
    );
    info!(
        store = %config.store.path.display(),
        request_timeout_secs = config.server.request_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        "Request handling settings"
    );
}

fn build_tls_acceptor(config: &Config) -> anyhow::Result<TlsAcceptor> {
    let cert_path = &config.server.tls_cert;
    let key_path = &config.server.tls_key;

    // Both ring and aws-lc may be linked through dependencies; pick one explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}
