//! HTTP-01 challenge responder for port 80
//!
//! The certificate manager's ACME client publishes key authorizations either through
//! `Http01Challenges::set` or by writing files under
//! `<store>/webroot/.well-known/acme-challenge/`. Everything else arriving on the
//! plain HTTP port is redirected to HTTPS.

use crate::dispatcher::{accept_loop, extract_hostname, https_redirect, ConnectionInfo};
use crate::error::GatewayError;
use crate::virtual_server::{full_body, SiteResponse};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
    webroot: Option<PathBuf>,
}

impl std::fmt::Debug for Http01Challenges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http01Challenges")
            .field("webroot", &self.webroot)
            .finish()
    }
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also look up tokens as files under `<webroot>/.well-known/acme-challenge/`
    pub fn with_webroot(webroot: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::default(),
            webroot: Some(webroot.into()),
        }
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        if !is_valid_token(token) {
            return None;
        }

        if let Some(key_auth) = self.inner.read().await.get(token).cloned() {
            return Some(key_auth);
        }

        let path = self
            .webroot
            .as_ref()?
            .join(".well-known")
            .join("acme-challenge")
            .join(token);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        let key_auth = content.trim();
        (!key_auth.is_empty()).then(|| key_auth.to_string())
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Tokens are base64url
fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Plain HTTP listener answering challenges and redirecting to HTTPS
pub struct ChallengeServer {
    bind_addr: SocketAddr,
    challenges: Http01Challenges,
    https_port: u16,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChallengeServer {
    pub fn new(
        bind_addr: SocketAddr,
        challenges: Http01Challenges,
        https_port: u16,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            challenges,
            https_port,
            shutdown_rx,
        }
    }

    pub async fn bind(self) -> Result<BoundChallengeServer, GatewayError> {
        let bind_err = |source| GatewayError::ListenerBind {
            addr: self.bind_addr,
            source,
        };
        let listener = TcpListener::bind(self.bind_addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        Ok(BoundChallengeServer {
            listener,
            local_addr,
            challenges: self.challenges,
            https_port: self.https_port,
            shutdown_rx: self.shutdown_rx,
        })
    }

    pub async fn run(self) -> Result<(), GatewayError> {
        self.bind().await?.serve().await;
        Ok(())
    }
}

pub struct BoundChallengeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    challenges: Http01Challenges,
    https_port: u16,
    shutdown_rx: watch::Receiver<bool>,
}

impl BoundChallengeServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self) {
        info!(addr = %self.local_addr, https_port = self.https_port, "ACME challenge listener started");

        let challenges = self.challenges;
        let https_port = self.https_port;
        accept_loop(
            self.listener,
            self.local_addr,
            None,
            self.shutdown_rx,
            move |req, _conn: ConnectionInfo| {
                let challenges = challenges.clone();
                async move { Ok(handle_challenge_request(req, &challenges, https_port).await) }
            },
        )
        .await;
    }
}

async fn handle_challenge_request(
    req: Request<Incoming>,
    challenges: &Http01Challenges,
    https_port: u16,
) -> SiteResponse {
    if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        if let Some(key_auth) = challenges.get(token).await {
            debug!(token, "Responding to ACME HTTP-01 challenge");
            return Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain")
                .body(full_body(Bytes::from(key_auth)))
                .expect("valid response builder");
        }
    }

    let host = extract_hostname(&req)
        .map(|d| d.to_string())
        .unwrap_or_else(|| "localhost".to_string());
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    https_redirect(&host, https_port, path)
}
