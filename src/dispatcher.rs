//! Per-port dispatch: one listener per port group, routing each request to a site
//!
//! A by-host group picks the site from the `Host` header and answers `www.` names with
//! a 301 to the bare host. A direct group (local mode) hands every request on its port
//! to a single site. Bodies are buffered up to the configured limit before the site
//! sees them, and upgrade requests are passed to the site's upgrade listeners.

use crate::error::{error_response, site_not_found, GatewayError, GatewayErrorCode};
use crate::registry::{Domain, RegisteredSite, SiteRegistry};
use crate::virtual_server::{
    full_body, RequestHandler, ResponseWriter, SiteMode, SiteRequest, SiteResponse,
    UpgradeOutcome, VirtualServer,
};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Default request body limit (10 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Connection details attached to every request as an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub is_tls: bool,
}

/// One assembled site: its virtual server and how it answers requests
pub struct Route {
    domain: Domain,
    server: VirtualServer,
    mode: SiteMode,
    handler: Option<RequestHandler>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("domain", &self.domain)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Route {
    /// Create the site's virtual server and invoke its factory. Runs once per root domain.
    pub fn assemble(site: &RegisteredSite) -> Arc<Route> {
        let server = VirtualServer::new(site.domain.clone());
        let handler = (site.factory)(&server);
        let mode = SiteMode::classify(server.has_listeners(), handler.is_some());

        if mode == SiteMode::Both {
            server.set_fallback(handler.clone());
        }

        info!(domain = %site.domain, port = site.port, mode = ?mode, "Site initialized");

        Arc::new(Route {
            domain: site.domain.clone(),
            server,
            mode,
            handler,
        })
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn server(&self) -> &VirtualServer {
        &self.server
    }

    pub fn mode(&self) -> SiteMode {
        self.mode
    }

    pub async fn dispatch(&self, req: SiteRequest) -> SiteResponse {
        match self.mode {
            SiteMode::HandlerBased => {
                let writer = ResponseWriter::new();
                if let Some(handler) = &self.handler {
                    handler(req, writer.clone()).await;
                }
                writer.take().unwrap_or_else(site_not_found)
            }
            SiteMode::ListenerBased | SiteMode::Both => self.server.process_request(req).await,
        }
    }
}

#[derive(Debug)]
pub enum Routing {
    /// Route by Host header / SNI name; aliases point at their root's route
    ByHost(HashMap<Domain, Arc<Route>>),
    /// Every request goes to a single site (local mode)
    Direct(Arc<Route>),
}

/// All sites sharing one listening port
#[derive(Debug)]
pub struct PortGroup {
    port: u16,
    is_primary: bool,
    routing: Routing,
}

impl PortGroup {
    /// Assemble every site on `port`, invoking each factory once
    pub fn by_host(
        port: u16,
        is_primary: bool,
        sites: &[RegisteredSite],
        registry: &SiteRegistry,
    ) -> Self {
        let mut routes = HashMap::new();
        for site in sites {
            let route = Route::assemble(site);
            for alias in registry.aliases_for(&site.domain) {
                routes.insert(alias, Arc::clone(&route));
            }
            routes.insert(site.domain.clone(), route);
        }

        Self {
            port,
            is_primary,
            routing: Routing::ByHost(routes),
        }
    }

    pub fn direct(port: u16, site: &RegisteredSite) -> Self {
        Self {
            port,
            is_primary: false,
            routing: Routing::Direct(Route::assemble(site)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.routing, Routing::Direct(_))
    }

    pub fn route(&self, host: Option<&Domain>) -> Option<&Arc<Route>> {
        match &self.routing {
            Routing::ByHost(routes) => host.and_then(|h| routes.get(h)),
            Routing::Direct(route) => Some(route),
        }
    }

    /// Distinct routes, one per root domain
    pub fn routes(&self) -> Vec<Arc<Route>> {
        match &self.routing {
            Routing::ByHost(routes) => {
                let mut unique: Vec<Arc<Route>> = routes
                    .iter()
                    .filter(|(name, route)| *name == route.domain())
                    .map(|(_, route)| Arc::clone(route))
                    .collect();
                unique.sort_by(|a, b| a.domain().cmp(b.domain()));
                unique
            }
            Routing::Direct(route) => vec![Arc::clone(route)],
        }
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.routes().iter().map(|r| r.domain().clone()).collect()
    }
}

/// Real listener for one port group
pub struct PortGroupDispatcher {
    bind_addr: SocketAddr,
    group: Arc<PortGroup>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    max_body_bytes: usize,
}

impl PortGroupDispatcher {
    pub fn new(bind_addr: SocketAddr, group: PortGroup, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            group: Arc::new(group),
            shutdown_rx,
            tls_acceptor: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_tls_config(self, config: Arc<ServerConfig>) -> Self {
        self.with_tls(TlsAcceptor::from(config))
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn group(&self) -> &Arc<PortGroup> {
        &self.group
    }

    /// Bind the port and attach every virtual server to it
    pub async fn bind(self) -> Result<BoundDispatcher, GatewayError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| GatewayError::ListenerBind {
                addr: self.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| GatewayError::ListenerBind {
            addr: self.bind_addr,
            source,
        })?;

        for route in self.group.routes() {
            route.server().attach(local_addr);
        }

        Ok(BoundDispatcher {
            listener,
            local_addr,
            group: self.group,
            shutdown_rx: self.shutdown_rx,
            tls_acceptor: self.tls_acceptor,
            max_body_bytes: self.max_body_bytes,
        })
    }

    pub async fn run(self) -> Result<(), GatewayError> {
        self.bind().await?.serve().await;
        Ok(())
    }
}

pub struct BoundDispatcher {
    listener: TcpListener,
    local_addr: SocketAddr,
    group: Arc<PortGroup>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    max_body_bytes: usize,
}

struct DispatchState {
    group: Arc<PortGroup>,
    max_body_bytes: usize,
}

impl BoundDispatcher {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn group(&self) -> &Arc<PortGroup> {
        &self.group
    }

    pub async fn serve(self) {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %self.local_addr,
            protocol,
            primary = self.group.is_primary(),
            domains = ?self.group.domains(),
            "Listening (HTTP/1.1 and HTTP/2)"
        );

        let state = Arc::new(DispatchState {
            group: self.group,
            max_body_bytes: self.max_body_bytes,
        });

        accept_loop(
            self.listener,
            self.local_addr,
            self.tls_acceptor,
            self.shutdown_rx,
            move |req, conn| {
                let state = Arc::clone(&state);
                async move { handle_request(req, conn, state).await }
            },
        )
        .await;
    }
}

/// Accept connections until shutdown, serving each on its own task
pub(crate) async fn accept_loop<H, Fut>(
    listener: TcpListener,
    local_addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
    handler: H,
) where
    H: Fn(Request<Incoming>, ConnectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SiteResponse, GatewayError>> + Send + 'static,
{
    let handler = Arc::new(handler);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote_addr)) => {
                        let handler = Arc::clone(&handler);
                        let tls_acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            if let Some(acceptor) = tls_acceptor {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        let conn = ConnectionInfo { remote_addr, local_addr, is_tls: true };
                                        if let Err(e) = serve_connection(tls_stream, conn, handler).await {
                                            debug!(addr = %remote_addr, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        debug!(addr = %remote_addr, port = local_addr.port(), error = %e, "TLS handshake failed");
                                    }
                                }
                            } else {
                                let conn = ConnectionInfo { remote_addr, local_addr, is_tls: false };
                                if let Err(e) = serve_connection(stream, conn, handler).await {
                                    debug!(addr = %remote_addr, error = %e, "Connection error");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(port = local_addr.port(), error = %e, "Failed to accept connection");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(port = local_addr.port(), "Listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn serve_connection<S, H, Fut>(
    stream: S,
    conn: ConnectionInfo,
    handler: Arc<H>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Fn(Request<Incoming>, ConnectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SiteResponse, GatewayError>> + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| handler(req, conn));

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    conn: ConnectionInfo,
    state: Arc<DispatchState>,
) -> Result<SiteResponse, GatewayError> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = extract_hostname(&req);

    if is_upgrade_request(&req) {
        return handle_upgrade(req, conn, host, request_id, &state).await;
    }

    let group = &state.group;

    // www hosts are always redirected, even when registered explicitly
    if !group.is_direct() {
        if let Some(root) = host.as_ref().and_then(Domain::strip_www) {
            let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            debug!(host = ?host, target = %root, "Redirecting www host");
            return Ok(https_redirect(root.as_str(), group.port(), path));
        }
    }

    let Some(route) = group.route(host.as_ref()).cloned() else {
        debug!(host = ?host, port = group.port(), request_id, "No site for host");
        return Ok(site_not_found());
    };

    debug!(domain = %route.domain(), method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
            return Ok(error_response(
                GatewayErrorCode::PayloadTooLarge,
                "Request body too large",
            ));
        }
        Err(e) => {
            debug!(domain = %route.domain(), error = %e, "Failed to read request body");
            return Ok(error_response(GatewayErrorCode::BadRequest, "Invalid request body"));
        }
    };

    let mut request = Request::from_parts(parts, body);
    tag_request(request.headers_mut(), &request_id);
    request.extensions_mut().insert(conn);

    let mut response = route.dispatch(Arc::new(request)).await;
    tag_request(response.headers_mut(), &request_id);
    Ok(response)
}

async fn handle_upgrade(
    mut req: Request<Incoming>,
    conn: ConnectionInfo,
    host: Option<Domain>,
    request_id: String,
    state: &DispatchState,
) -> Result<SiteResponse, GatewayError> {
    let Some(route) = state.group.route(host.as_ref()).cloned() else {
        debug!(host = ?host, request_id, "No site for upgrade, closing connection");
        return Err(GatewayError::UpgradeRouteNotFound(host.map(|h| h.to_string())));
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _body) = req.into_parts();
    let mut head = Request::from_parts(parts, ());
    tag_request(head.headers_mut(), &request_id);
    head.extensions_mut().insert(conn);

    let upgrade_type = head
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    debug!(domain = %route.domain(), request_id, upgrade_type, "Handling upgrade request");

    match route.server().process_upgrade(Arc::new(head)).await {
        UpgradeOutcome::Accepted(accepted) => {
            let (response, on_upgraded) = accepted.into_parts();
            let domain = route.domain().clone();

            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        debug!(domain = %domain, request_id, "Upgrade complete");
                        on_upgraded(TokioIo::new(upgraded)).await;
                    }
                    Err(e) => {
                        debug!(domain = %domain, request_id, error = %e, "Client upgrade failed");
                    }
                }
            });

            Ok(response)
        }
        UpgradeOutcome::Destroyed => {
            debug!(domain = %route.domain(), request_id, "Upgrade not accepted, closing connection");
            Err(GatewayError::UpgradeRejected(route.domain().to_string()))
        }
    }
}

fn tag_request(headers: &mut hyper::HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
}

/// Host from the Host header (or the URI authority for HTTP/2), port stripped and
/// validated. Invalid names count as missing.
pub(crate) fn extract_hostname<B>(req: &Request<B>) -> Option<Domain> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let hostname = raw.split(':').next()?;
    Domain::parse(hostname).ok()
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// 301 to `https://<host>[:<port>]<path>`; the port is omitted when it is 443
pub(crate) fn https_redirect(host: &str, https_port: u16, path: &str) -> SiteResponse {
    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from_static(b"Redirecting to HTTPS")))
        .expect("valid response builder")
}
