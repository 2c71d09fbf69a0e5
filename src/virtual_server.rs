//! Per-domain virtual server
//!
//! A `VirtualServer` is the handle a site's factory receives. The site registers
//! request and upgrade listeners on it as if it owned a dedicated server, while the
//! dispatcher replays traffic from the shared listener into it.

use crate::error::site_not_found;
use crate::registry::Domain;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Response body type shared by every site
pub type SiteBody = BoxBody<Bytes, hyper::Error>;

/// A request with its body fully collected
pub type SiteRequest = Arc<Request<Bytes>>;

pub type SiteResponse = Response<SiteBody>;

/// Callable that handles a request by writing to a `ResponseWriter`
pub type RequestHandler =
    Arc<dyn Fn(SiteRequest, ResponseWriter) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callable invoked with the head of an upgrade request
pub type UpgradeListener =
    Arc<dyn Fn(Arc<Request<()>>, UpgradeSocket) -> BoxFuture<'static, ()> + Send + Sync>;

/// Raw connection handed to a site after a successful upgrade
pub type UpgradedIo = TokioIo<Upgraded>;

pub type UpgradeContinuation = Box<dyn FnOnce(UpgradedIo) -> BoxFuture<'static, ()> + Send>;

const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Wrap an async closure into a `RequestHandler`
pub fn handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(SiteRequest, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |req, res| f(req, res).boxed())
}

/// Build a plain-text response
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> SiteResponse {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response builder")
}

pub fn full_body(body: impl Into<Bytes>) -> SiteBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> SiteBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Collects the single response produced for a request.
///
/// Every listener receives a clone. The first `send` wins and later sends are dropped.
#[derive(Clone, Default)]
pub struct ResponseWriter {
    state: Arc<Mutex<WriterState>>,
}

#[derive(Default)]
struct WriterState {
    response: Option<SiteResponse>,
    finished: bool,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a response was already sent
    pub fn send(&self, response: SiteResponse) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            debug!(status = %response.status(), "Response already sent, ignoring");
            return false;
        }
        state.response = Some(response);
        state.finished = true;
        true
    }

    pub fn send_text(&self, status: StatusCode, body: impl Into<Bytes>) -> bool {
        self.send(text_response(status, body))
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub(crate) fn take(&self) -> Option<SiteResponse> {
        self.state.lock().response.take()
    }
}

/// Identifies a registered listener for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Request,
    Upgrade,
}

/// How a site produces responses, decided once after its factory ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteMode {
    /// Only the virtual server's listeners handle traffic
    ListenerBased,
    /// Only the handler returned by the factory handles traffic
    HandlerBased,
    /// Listeners first, then the returned handler as fallback
    Both,
}

impl SiteMode {
    pub fn classify(has_listeners: bool, has_handler: bool) -> Self {
        match (has_listeners, has_handler) {
            (true, true) => SiteMode::Both,
            (false, true) => SiteMode::HandlerBased,
            _ => SiteMode::ListenerBased,
        }
    }
}

/// Timeouts a site may set. Stored only; the shared listener does not apply them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerTimeouts {
    pub timeout: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub headers_timeout: Option<Duration>,
}

/// Per-domain server handle
#[derive(Clone)]
pub struct VirtualServer {
    inner: Arc<Inner>,
}

struct Inner {
    domain: Domain,
    next_id: AtomicU64,
    request_listeners: RwLock<Vec<(ListenerId, RequestHandler)>>,
    upgrade_listeners: RwLock<Vec<(ListenerId, UpgradeListener)>>,
    fallback: RwLock<Option<RequestHandler>>,
    listening: AtomicBool,
    timeouts: Mutex<ServerTimeouts>,
    address: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for VirtualServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualServer")
            .field("domain", &self.inner.domain)
            .field("request_listeners", &self.listener_count(ServerEvent::Request))
            .field("upgrade_listeners", &self.listener_count(ServerEvent::Upgrade))
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl VirtualServer {
    pub fn new(domain: Domain) -> Self {
        Self {
            inner: Arc::new(Inner {
                domain,
                next_id: AtomicU64::new(1),
                request_listeners: RwLock::new(Vec::new()),
                upgrade_listeners: RwLock::new(Vec::new()),
                fallback: RwLock::new(None),
                listening: AtomicBool::new(false),
                timeouts: Mutex::new(ServerTimeouts::default()),
                address: Mutex::new(None),
            }),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.inner.domain
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Append a request listener. Every listener fires for every request.
    pub fn on_request<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(SiteRequest, ResponseWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_request_listener(handler(listener))
    }

    pub fn add_request_listener(&self, listener: RequestHandler) -> ListenerId {
        let id = self.next_id();
        self.inner.request_listeners.write().push((id, listener));
        id
    }

    /// Append an upgrade listener
    pub fn on_upgrade<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Arc<Request<()>>, UpgradeSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let listener: UpgradeListener = Arc::new(move |head, socket| listener(head, socket).boxed());
        self.inner.upgrade_listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, event: ServerEvent, id: ListenerId) -> bool {
        match event {
            ServerEvent::Request => remove_by_id(&self.inner.request_listeners, id),
            ServerEvent::Upgrade => remove_by_id(&self.inner.upgrade_listeners, id),
        }
    }

    pub fn remove_all_listeners(&self, event: ServerEvent) {
        match event {
            ServerEvent::Request => self.inner.request_listeners.write().clear(),
            ServerEvent::Upgrade => self.inner.upgrade_listeners.write().clear(),
        }
    }

    pub fn listener_count(&self, event: ServerEvent) -> usize {
        match event {
            ServerEvent::Request => self.inner.request_listeners.read().len(),
            ServerEvent::Upgrade => self.inner.upgrade_listeners.read().len(),
        }
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count(ServerEvent::Request) > 0 || self.listener_count(ServerEvent::Upgrade) > 0
    }

    /// Handler invoked when no request listener produced a response
    pub fn set_fallback(&self, fallback: Option<RequestHandler>) {
        *self.inner.fallback.write() = fallback;
    }

    /// Run every request listener in insertion order, then the fallback if nothing
    /// responded, then 404.
    pub async fn process_request(&self, req: SiteRequest) -> SiteResponse {
        let writer = ResponseWriter::new();
        let listeners: Vec<RequestHandler> = self
            .inner
            .request_listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(Arc::clone(&req), writer.clone()).await;
        }

        if !writer.is_finished() {
            let fallback = self.inner.fallback.read().clone();
            if let Some(fallback) = fallback {
                fallback(req, writer.clone()).await;
            }
        }

        writer.take().unwrap_or_else(site_not_found)
    }

    /// Offer an upgrade to every upgrade listener. Unclaimed sockets are destroyed.
    pub async fn process_upgrade(&self, head: Arc<Request<()>>) -> UpgradeOutcome {
        let listeners: Vec<UpgradeListener> = self
            .inner
            .upgrade_listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        if listeners.is_empty() {
            debug!(domain = %self.inner.domain, "No upgrade listeners, destroying socket");
            return UpgradeOutcome::Destroyed;
        }

        let socket = UpgradeSocket::new();
        for listener in listeners {
            listener(Arc::clone(&head), socket.clone()).await;
        }
        socket.into_outcome()
    }

    /// Marks the server as listening and returns the shared listener's address, if bound.
    /// No socket is opened.
    pub fn listen(&self) -> Option<SocketAddr> {
        self.inner.listening.store(true, Ordering::SeqCst);
        self.address()
    }

    pub fn close(&self) {
        self.inner.listening.store(false, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> Option<SocketAddr> {
        *self.inner.address.lock()
    }

    pub(crate) fn attach(&self, addr: SocketAddr) {
        *self.inner.address.lock() = Some(addr);
        self.inner.listening.store(true, Ordering::SeqCst);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.timeouts.lock().timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeouts.lock().timeout
    }

    pub fn set_keep_alive_timeout(&self, timeout: Duration) {
        self.inner.timeouts.lock().keep_alive_timeout = Some(timeout);
    }

    pub fn set_headers_timeout(&self, timeout: Duration) {
        self.inner.timeouts.lock().headers_timeout = Some(timeout);
    }

    pub fn timeouts(&self) -> ServerTimeouts {
        *self.inner.timeouts.lock()
    }
}

fn remove_by_id<T>(listeners: &RwLock<Vec<(ListenerId, T)>>, id: ListenerId) -> bool {
    let mut listeners = listeners.write();
    let before = listeners.len();
    listeners.retain(|(existing, _)| *existing != id);
    listeners.len() != before
}

enum SocketState {
    Pending,
    Accepted {
        response: SiteResponse,
        on_upgraded: UpgradeContinuation,
    },
    Destroyed,
}

/// The client side of an upgrade request, shared by all upgrade listeners.
///
/// The first listener to `accept` claims the connection; `destroy` rejects it.
#[derive(Clone)]
pub struct UpgradeSocket {
    state: Arc<Mutex<SocketState>>,
}

impl UpgradeSocket {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SocketState::Pending)),
        }
    }

    /// Claim the connection. `response` is sent to the client (normally 101), then
    /// `on_upgraded` receives the raw stream, including bytes the client sent after
    /// the request head.
    pub fn accept<F, Fut>(&self, response: SiteResponse, on_upgraded: F) -> bool
    where
        F: FnOnce(UpgradedIo) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if !matches!(*state, SocketState::Pending) {
            return false;
        }
        *state = SocketState::Accepted {
            response,
            on_upgraded: Box::new(move |io| on_upgraded(io).boxed()),
        };
        true
    }

    /// Complete a WebSocket handshake. Destroys the socket if the request carries no
    /// Sec-WebSocket-Key.
    pub fn accept_websocket<F, Fut>(&self, head: &Request<()>, on_upgraded: F) -> bool
    where
        F: FnOnce(UpgradedIo) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = head
            .headers()
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok());

        match key {
            Some(key) => {
                let response = Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(hyper::header::UPGRADE, "websocket")
                    .header(hyper::header::CONNECTION, "Upgrade")
                    .header("sec-websocket-accept", websocket_accept_key(key))
                    .body(empty_body())
                    .expect("valid response builder");
                self.accept(response, on_upgraded)
            }
            None => {
                self.destroy();
                false
            }
        }
    }

    /// Reject the upgrade. Has no effect once another listener accepted.
    pub fn destroy(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SocketState::Accepted { .. }) {
            return false;
        }
        *state = SocketState::Destroyed;
        true
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), SocketState::Pending)
    }

    fn into_outcome(self) -> UpgradeOutcome {
        let state = std::mem::replace(&mut *self.state.lock(), SocketState::Destroyed);
        match state {
            SocketState::Accepted {
                response,
                on_upgraded,
            } => UpgradeOutcome::Accepted(AcceptedUpgrade {
                response,
                on_upgraded,
            }),
            SocketState::Pending | SocketState::Destroyed => UpgradeOutcome::Destroyed,
        }
    }
}

pub enum UpgradeOutcome {
    Accepted(AcceptedUpgrade),
    /// Close the connection without writing anything
    Destroyed,
}

impl UpgradeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UpgradeOutcome::Accepted(_))
    }
}

pub struct AcceptedUpgrade {
    response: SiteResponse,
    on_upgraded: UpgradeContinuation,
}

impl AcceptedUpgrade {
    pub fn into_parts(self) -> (SiteResponse, UpgradeContinuation) {
        (self.response, self.on_upgraded)
    }
}

/// Sec-WebSocket-Accept value for a client key
pub fn websocket_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}
