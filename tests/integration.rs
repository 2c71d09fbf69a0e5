//! Integration tests for Vhostgate

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Response, StatusCode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use vhostgate::acme::Http01Challenges;
use vhostgate::config::ServerConfig;
use vhostgate::dispatcher::{PortGroup, PortGroupDispatcher};
use vhostgate::error::GatewayError;
use vhostgate::gateway::{Gateway, ListenerKind};
use vhostgate::manager::{CertificateManager, ManagerConfig, PrimaryTls};
use vhostgate::registry::SiteRegistry;
use vhostgate::virtual_server::{
    empty_body, handler, ResponseWriter, SiteRequest, UpgradeSocket, UpgradedIo, VirtualServer,
};

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Write a raw request and read until the server closes the connection
async fn exchange<S>(stream: &mut S, request: &[u8]) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).into_owned()
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    Ok(exchange(&mut stream, request.as_bytes()).await)
}

fn text_site(text: &'static str) -> impl Fn(&VirtualServer) -> Option<vhostgate::virtual_server::RequestHandler> + Send + Sync + 'static {
    move |_server: &VirtualServer| {
        Some(handler(move |_req: SiteRequest, res: ResponseWriter| async move {
            res.send_text(StatusCode::OK, text);
        }))
    }
}

/// Bind a by-host dispatcher for every site registered on `port`
async fn start_dispatcher(
    registry: &SiteRegistry,
    port: u16,
    max_body_bytes: usize,
) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let groups = registry.group_by_port();
    let group = PortGroup::by_host(port, true, &groups[&port], registry);

    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let bound = PortGroupDispatcher::new(addr, group, shutdown_rx)
        .with_max_body_bytes(max_body_bytes)
        .bind()
        .await
        .unwrap();
    tokio::spawn(bound.serve());

    assert!(wait_for_port(port, Duration::from_secs(5)).await);
    shutdown_tx
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_routes_by_host_header() {
    let port = 31001;
    let mut registry = SiteRegistry::new(port, false);
    registry.register("example.com", text_site("main site")).unwrap();
    registry.register("api.example.com", text_site("api site")).unwrap();

    let _shutdown = start_dispatcher(&registry, port, 1024).await;

    let response = http_get_with_host(port, "/", "example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("main site"));
    assert!(response.to_lowercase().contains("x-request-id:"));

    let response = http_get_with_host(port, "/", "API.example.com:31001").await.unwrap();
    assert!(response.contains("api site"));

    let response = http_get_with_host(port, "/", "unknown.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("Site not found"));
    assert!(response.to_lowercase().contains("x-gateway-error: site_not_found"));
}

#[tokio::test]
async fn test_www_alias_redirects_to_root() {
    let port = 31002;
    let mut registry = SiteRegistry::new(port, false);
    registry.register("example.com", text_site("main site")).unwrap();
    registry.register("www.other.com", text_site("www handler")).unwrap();

    let _shutdown = start_dispatcher(&registry, port, 1024).await;

    let response = http_get_with_host(port, "/docs?page=2", "www.example.com")
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 301"));
    assert!(response
        .to_lowercase()
        .contains("location: https://example.com:31002/docs?page=2"));

    // A handler registered under www is never served directly
    let response = http_get_with_host(port, "/", "www.other.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 301"));
    assert!(!response.contains("www handler"));
}

#[tokio::test]
async fn test_listener_priority_and_fallback() {
    let port = 31003;
    let mut registry = SiteRegistry::new(port, false);
    registry
        .register("app.example.com", |server: &VirtualServer| {
            server.on_request(|req: SiteRequest, res: ResponseWriter| async move {
                if req.uri().path() == "/live" {
                    res.send_text(StatusCode::OK, "first listener");
                }
            });
            server.on_request(|req: SiteRequest, res: ResponseWriter| async move {
                if req.uri().path().starts_with("/live") {
                    res.send_text(StatusCode::OK, "second listener");
                }
            });
            Some(handler(|_req: SiteRequest, res: ResponseWriter| async move {
                res.send_text(StatusCode::OK, "fallback handler");
            }))
        })
        .unwrap();

    let _shutdown = start_dispatcher(&registry, port, 1024).await;

    let response = http_get_with_host(port, "/live", "app.example.com").await.unwrap();
    assert!(response.contains("first listener"));
    assert!(!response.contains("second listener"));

    let response = http_get_with_host(port, "/live/feed", "app.example.com").await.unwrap();
    assert!(response.contains("second listener"));

    let response = http_get_with_host(port, "/other", "app.example.com").await.unwrap();
    assert!(response.contains("fallback handler"));
}

#[tokio::test]
async fn test_request_body_limit() {
    let port = 31004;
    let mut registry = SiteRegistry::new(port, false);
    registry
        .register("upload.example.com", |_server: &VirtualServer| {
            Some(handler(|req: SiteRequest, res: ResponseWriter| async move {
                let size = req.body().len().to_string();
                res.send_text(StatusCode::OK, size);
            }))
        })
        .unwrap();

    let _shutdown = start_dispatcher(&registry, port, 16).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = "POST / HTTP/1.1\r\nHost: upload.example.com\r\nContent-Length: 8\r\nConnection: close\r\n\r\n12345678";
    let response = exchange(&mut stream, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("8"));

    let body = "x".repeat(100);
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: upload.example.com\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = exchange(&mut stream, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 413"));
    assert!(response.to_lowercase().contains("x-gateway-error: payload_too_large"));
}

// ============================================================================
// Upgrades
// ============================================================================

fn upgrade_registry(port: u16) -> SiteRegistry {
    let mut registry = SiteRegistry::new(port, false);
    registry
        .register("chat.example.com", |server: &VirtualServer| {
            server.on_upgrade(|head, socket: UpgradeSocket| async move {
                let protocol = head
                    .headers()
                    .get(hyper::header::UPGRADE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_lowercase();

                if protocol == "websocket" {
                    socket.accept_websocket(&head, |_io: UpgradedIo| async move {});
                    return;
                }

                let response = Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(hyper::header::UPGRADE, "echo")
                    .header(hyper::header::CONNECTION, "Upgrade")
                    .body(empty_body())
                    .unwrap();
                socket.accept(response, |mut io: UpgradedIo| async move {
                    let mut buf = [0u8; 5];
                    if io.read_exact(&mut buf).await.is_ok() {
                        let _ = io.write_all(&buf).await;
                        let _ = io.shutdown().await;
                    }
                });
            });
            None
        })
        .unwrap();
    registry.register("static.example.com", text_site("static")).unwrap();
    registry
}

#[tokio::test]
async fn test_upgrade_delivers_buffered_bytes() {
    let port = 31011;
    let registry = upgrade_registry(port);
    let _shutdown = start_dispatcher(&registry, port, 1024).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = "GET /chat HTTP/1.1\r\nHost: chat.example.com\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\nhello";
    let response = exchange(&mut stream, request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.ends_with("hello"));
}

#[tokio::test]
async fn test_websocket_handshake() {
    let port = 31012;
    let registry = upgrade_registry(port);
    let _shutdown = start_dispatcher(&registry, port, 1024).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = "GET /ws HTTP/1.1\r\nHost: chat.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    let response = exchange(&mut stream, request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response
        .to_lowercase()
        .contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo="));
}

#[tokio::test]
async fn test_unclaimed_upgrades_close_the_connection() {
    let port = 31013;
    let registry = upgrade_registry(port);
    let _shutdown = start_dispatcher(&registry, port, 1024).await;

    // Unknown host
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = "GET / HTTP/1.1\r\nHost: nowhere.example.com\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";
    let response = exchange(&mut stream, request.as_bytes()).await;
    assert!(response.is_empty());

    // Known host without upgrade listeners
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = "GET / HTTP/1.1\r\nHost: static.example.com\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";
    let response = exchange(&mut stream, request.as_bytes()).await;
    assert!(response.is_empty());

    // WebSocket without a key is destroyed by the site
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = "GET / HTTP/1.1\r\nHost: chat.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
    let response = exchange(&mut stream, request.as_bytes()).await;
    assert!(response.is_empty());
}

// ============================================================================
// TLS gateway
// ============================================================================

struct StaticCertificateManager {
    tls_config: Arc<rustls::ServerConfig>,
    seen: parking_lot::Mutex<Option<ManagerConfig>>,
}

impl CertificateManager for StaticCertificateManager {
    fn init(&self, config: &ManagerConfig) -> anyhow::Result<PrimaryTls> {
        *self.seen.lock() = Some(config.clone());
        Ok(PrimaryTls {
            tls_config: Arc::clone(&self.tls_config),
            challenges: Http01Challenges::new(),
        })
    }
}

struct FailingCertificateManager;

impl CertificateManager for FailingCertificateManager {
    fn init(&self, _config: &ManagerConfig) -> anyhow::Result<PrimaryTls> {
        anyhow::bail!("account registration refused")
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn single_cert_config(names: &[&str]) -> (Arc<rustls::ServerConfig>, CertificateDer<'static>) {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let generated = rcgen::generate_simple_self_signed(names).unwrap();
    let cert = generated.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();
    (Arc::new(config), cert)
}

/// Write `<store>/live/<domain>/{privkey,cert,chain}.pem` and return the certificate
fn write_store_certificate(store: &Path, domain: &str) -> CertificateDer<'static> {
    let generated = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
    let dir = store.join("live").join(domain);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("privkey.pem"), generated.key_pair.serialize_pem()).unwrap();
    std::fs::write(dir.join("cert.pem"), generated.cert.pem()).unwrap();
    std::fs::write(dir.join("chain.pem"), "").unwrap();
    generated.cert.der().clone()
}

async fn https_get(
    port: u16,
    server_name: &str,
    roots: &[CertificateDer<'static>],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut root_store = rustls::RootCertStore::empty();
    for root in roots {
        root_store.add(root.clone())?;
    }
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    let name = ServerName::try_from(server_name.to_string())?;
    let mut tls = connector.connect(name, stream).await?;

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        server_name
    );
    Ok(exchange(&mut tls, request.as_bytes()).await)
}

fn tls_config(primary_port: u16, store: &Path) -> ServerConfig {
    ServerConfig {
        hostname: "127.0.0.1".to_string(),
        default_port: primary_port,
        acme_http_port: 0,
        cert_store: Some(store.to_string_lossy().into_owned()),
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn test_gateway_serves_primary_and_sni_ports() {
    let primary_port = 31101;
    let sni_port = 31102;
    let store = tempfile::tempdir().unwrap();

    let (primary_tls, primary_cert) =
        single_cert_config(&["example.com", "www.example.com", "api.example.com"]);
    let secure_cert = write_store_certificate(store.path(), "secure.example.com");
    let roots = vec![primary_cert, secure_cert];

    let config = tls_config(primary_port, store.path());
    let mut registry = SiteRegistry::from_config(&config);
    registry.register("example.com", text_site("main site")).unwrap();
    registry.register("api.example.com", text_site("api site")).unwrap();
    registry
        .register("secure.example.com:31102", text_site("secure site"))
        .unwrap();
    registry
        .register("nocert.example.com:31102", text_site("nocert site"))
        .unwrap();

    let manager = Arc::new(StaticCertificateManager {
        tls_config: primary_tls,
        seen: parking_lot::Mutex::new(None),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = Gateway::new(config, registry)
        .with_certificate_manager(manager.clone())
        .start(shutdown_rx)
        .await
        .unwrap();

    assert!(running.failures().is_empty());
    assert_eq!(running.listeners().len(), 2);
    assert_eq!(
        running.listener_for("api.example.com").unwrap().kind,
        ListenerKind::PrimaryTls
    );
    assert_eq!(
        running.listener_for("secure.example.com").unwrap().kind,
        ListenerKind::SniTls
    );
    assert_eq!(
        running.url_for("www.example.com").unwrap(),
        "https://example.com:31101"
    );

    let seen = manager.seen.lock().clone().unwrap();
    let subjects: Vec<&str> = seen.subjects.iter().map(|s| s.subject.as_str()).collect();
    assert_eq!(
        subjects,
        vec!["example.com", "api.example.com", "secure.example.com", "nocert.example.com"]
    );

    let response = https_get(primary_port, "example.com", &roots).await.unwrap();
    assert!(response.contains("main site"));

    let response = https_get(primary_port, "api.example.com", &roots).await.unwrap();
    assert!(response.contains("api site"));

    let response = https_get(sni_port, "secure.example.com", &roots).await.unwrap();
    assert!(response.contains("secure site"));

    // No certificate on disk: handshake fails, the port keeps serving others
    assert!(https_get(sni_port, "nocert.example.com", &roots).await.is_err());
    let response = https_get(sni_port, "secure.example.com", &roots).await.unwrap();
    assert!(response.contains("secure site"));

    let _ = shutdown_tx.send(true);
    running.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_gateway_manager_failure_aborts_startup() {
    let store = tempfile::tempdir().unwrap();
    let config = tls_config(31111, store.path());
    let mut registry = SiteRegistry::from_config(&config);
    registry.register("example.com", text_site("main site")).unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = Gateway::new(config, registry)
        .with_certificate_manager(Arc::new(FailingCertificateManager))
        .start(shutdown_rx)
        .await;

    match result {
        Err(GatewayError::CertificateManager(e)) => {
            assert!(e.to_string().contains("account registration refused"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("gateway started without a certificate manager"),
    }
    assert!(TcpStream::connect("127.0.0.1:31111").await.is_err());
}

#[tokio::test]
async fn test_gateway_sni_bind_failure_keeps_primary_serving() {
    let primary_port = 31121;
    let sni_port = 31122;
    let store = tempfile::tempdir().unwrap();

    let (primary_tls, primary_cert) = single_cert_config(&["example.com", "www.example.com"]);
    write_store_certificate(store.path(), "secure.example.com");

    let config = tls_config(primary_port, store.path());
    let mut registry = SiteRegistry::from_config(&config);
    registry.register("example.com", text_site("main site")).unwrap();
    registry
        .register("secure.example.com:31122", text_site("secure site"))
        .unwrap();

    let _blocker = std::net::TcpListener::bind(("127.0.0.1", sni_port)).unwrap();

    let manager = Arc::new(StaticCertificateManager {
        tls_config: primary_tls,
        seen: parking_lot::Mutex::new(None),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = Gateway::new(config, registry)
        .with_certificate_manager(manager)
        .start(shutdown_rx)
        .await
        .unwrap();

    assert_eq!(running.failures().len(), 1);
    let failure = &running.failures()[0];
    assert_eq!(failure.port, sni_port);
    assert_eq!(failure.domains[0].as_str(), "secure.example.com");
    assert!(matches!(failure.error, GatewayError::ListenerBind { .. }));

    assert_eq!(running.listeners().len(), 1);
    assert_eq!(running.listeners()[0].kind, ListenerKind::PrimaryTls);
    assert!(running.listener_for("secure.example.com").is_none());

    let response = https_get(primary_port, "example.com", &[primary_cert])
        .await
        .unwrap();
    assert!(response.contains("main site"));

    let _ = shutdown_tx.send(true);
    running.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_gateway_rejects_registry_built_for_other_mode() {
    let store = tempfile::tempdir().unwrap();
    let config = tls_config(31131, store.path());

    // Local registry handed to a TLS gateway
    let mut registry = SiteRegistry::new(31131, true);
    registry.register("example.com", text_site("main site")).unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = Gateway::new(config.clone(), registry)
        .with_certificate_manager(Arc::new(FailingCertificateManager))
        .start(shutdown_rx.clone())
        .await;
    match result {
        Err(GatewayError::RegistryMismatch { registry, config }) => {
            assert!(registry.starts_with("local mode"));
            assert!(config.starts_with("TLS mode"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("gateway started with a mismatched registry"),
    }

    // Same mode, different default port
    let registry = SiteRegistry::new(443, false);
    let result = Gateway::new(config, registry)
        .with_certificate_manager(Arc::new(FailingCertificateManager))
        .start(shutdown_rx)
        .await;
    assert!(matches!(result, Err(GatewayError::RegistryMismatch { .. })));
    assert!(TcpStream::connect("127.0.0.1:31131").await.is_err());
}

// ============================================================================
// Local mode
// ============================================================================

#[tokio::test]
async fn test_local_mode_assigns_sequential_ports() {
    let config = ServerConfig {
        hostname: "127.0.0.1".to_string(),
        local: true,
        min_local_port: 31201,
        max_local_port: Some(31299),
        ..ServerConfig::default()
    };

    let mut registry = SiteRegistry::from_config(&config);
    registry.register("example.com", text_site("main site")).unwrap();
    registry.register("blog.example.com", text_site("blog site")).unwrap();
    registry.register("other.org", text_site("other site")).unwrap();

    // Occupy the second port; the other sites must still come up
    let _blocker = std::net::TcpListener::bind("127.0.0.1:31202").unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = Gateway::new(config, registry)
        .start(shutdown_rx)
        .await
        .unwrap();

    let ports: Vec<(String, u16)> = running
        .local_assignments()
        .iter()
        .map(|a| (a.domain.to_string(), a.port))
        .collect();
    assert_eq!(
        ports,
        vec![
            ("example.com".to_string(), 31201),
            ("blog.example.com".to_string(), 31202),
            ("other.org".to_string(), 31203)
        ]
    );

    assert_eq!(running.failures().len(), 1);
    assert_eq!(running.failures()[0].port, 31202);
    assert!(running
        .listeners()
        .iter()
        .all(|l| l.kind == ListenerKind::Plain));

    assert_eq!(running.url_for("example.com").unwrap(), "http://localhost:31201");
    assert_eq!(running.url_for("www.example.com").unwrap(), "http://localhost:31201");
    assert_eq!(running.url_for("other.org").unwrap(), "http://localhost:31203");

    // Each local port serves its site regardless of Host
    let response = http_get_with_host(31201, "/", "localhost:31201").await.unwrap();
    assert!(response.contains("main site"));
    let response = http_get_with_host(31203, "/", "localhost").await.unwrap();
    assert!(response.contains("other site"));

    let _ = shutdown_tx.send(true);
    running.shutdown(Duration::from_secs(2)).await;

    assert!(TcpStream::connect("127.0.0.1:31201").await.is_err());
}
