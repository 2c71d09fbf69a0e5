//! Vhostgate - A multi-domain HTTPS gateway for in-process sites
//!
//! This library hosts many sites inside one process:
//! - Registers sites by domain (optionally `domain:port`) with a factory per site
//! - Groups sites by port and dispatches each request by Host header
//! - Serves a `www.` alias for apex domains, redirecting it to the root
//! - Selects certificates per connection by SNI on non-primary ports
//! - Hands protocol upgrades (WebSocket) to the owning site
//! - Offers a plain-HTTP local mode with one port per site

pub mod acme;
pub mod certs;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod loader;
pub mod local;
pub mod manager;
pub mod registry;
pub mod virtual_server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
