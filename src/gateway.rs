//! Startup orchestration: group sites by port, assemble them, bind listeners

use crate::acme::ChallengeServer;
use crate::certs::CertificateResolver;
use crate::config::ServerConfig;
use crate::dispatcher::{PortGroup, PortGroupDispatcher};
use crate::error::GatewayError;
use crate::local::{LocalAssignment, LocalModeAllocator};
use crate::manager::{CertificateManager, ManagerConfig, StoreCertificateManager};
use crate::registry::{Domain, SiteRegistry};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// TLS from the certificate manager
    PrimaryTls,
    /// TLS selected per connection by SNI from the certificate store
    SniTls,
    /// Plain HTTP (local mode)
    Plain,
    /// Port 80 challenge responder and HTTPS redirect
    AcmeChallenge,
}

#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub port: u16,
    pub local_addr: SocketAddr,
    pub domains: Vec<Domain>,
    pub kind: ListenerKind,
}

/// A port that could not be bound. Other ports keep serving.
#[derive(Debug)]
pub struct ListenerFailure {
    pub port: u16,
    pub domains: Vec<Domain>,
    pub error: GatewayError,
}

pub struct Gateway {
    config: ServerConfig,
    registry: SiteRegistry,
    resolver: CertificateResolver,
    manager: Option<Arc<dyn CertificateManager>>,
}

impl Gateway {
    pub fn new(config: ServerConfig, registry: SiteRegistry) -> Self {
        let resolver = CertificateResolver::new(config.cert_store_dir());
        Self {
            config,
            registry,
            resolver,
            manager: None,
        }
    }

    /// Replace the store-backed certificate manager used for the primary port
    pub fn with_certificate_manager(mut self, manager: Arc<dyn CertificateManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_resolver(mut self, resolver: CertificateResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &CertificateResolver {
        &self.resolver
    }

    /// Invoke every factory, then bind and serve every listener until `shutdown_rx`
    /// flips to true. Bind failures are reported in the result, not returned as errors.
    pub async fn start(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<RunningGateway, GatewayError> {
        let ip = self
            .config
            .bind_ip()
            .map_err(|_| GatewayError::InvalidBindAddress {
                host: self.config.hostname.clone(),
                port: self.config.default_port,
            })?;

        check_registry(&self.config, &self.registry)?;

        if self.registry.is_empty() {
            warn!("No sites registered");
        }

        if self.config.local {
            self.start_local(ip, shutdown_rx).await
        } else {
            self.start_tls(ip, shutdown_rx).await
        }
    }

    async fn start_local(
        self,
        ip: IpAddr,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<RunningGateway, GatewayError> {
        let allocator = LocalModeAllocator::from_config(&self.config);
        let startup = allocator
            .start(&self.registry, ip, self.config.max_body_bytes, shutdown_rx)
            .await;

        let mut listeners = Vec::new();
        let mut tasks = Vec::new();
        for (assignment, bound) in startup.bound {
            listeners.push(ListenerInfo {
                port: assignment.port,
                local_addr: bound.local_addr(),
                domains: vec![assignment.domain],
                kind: ListenerKind::Plain,
            });
            tasks.push(tokio::spawn(bound.serve()));
        }

        Ok(RunningGateway {
            local: true,
            registry: self.registry,
            listeners,
            failures: startup.failures,
            assignments: startup.assignments,
            tasks,
        })
    }

    async fn start_tls(
        self,
        ip: IpAddr,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<RunningGateway, GatewayError> {
        let primary_port = self.config.default_port;

        let groups: Vec<PortGroup> = self
            .registry
            .group_by_port()
            .iter()
            .map(|(port, sites)| PortGroup::by_host(*port, *port == primary_port, sites, &self.registry))
            .collect();

        let subjects = self.registry.certificate_subjects();
        let manager_config = ManagerConfig {
            email: self.config.email.clone(),
            subjects: subjects.clone(),
            staging: self.config.staging,
            cluster: self.config.cluster,
            store_dir: self.config.cert_store_dir(),
        };

        let store_backed = self.manager.is_none();
        let manager = self.manager.clone().unwrap_or_else(|| {
            Arc::new(StoreCertificateManager::new(self.resolver.clone())) as Arc<dyn CertificateManager>
        });
        let primary = manager
            .init(&manager_config)
            .map_err(GatewayError::CertificateManager)?;

        let watched: Vec<Domain> = subjects
            .iter()
            .filter(|s| store_backed || s.port != primary_port)
            .map(|s| s.subject.clone())
            .collect();

        let mut tasks = Vec::new();
        if !watched.is_empty() {
            let cached = self.resolver.warm(&watched).await;
            info!(domains = watched.len(), cached, "Certificate cache warmed");
            tasks.push(self.resolver.watch(
                watched,
                self.config.cert_refresh_interval(),
                shutdown_rx.clone(),
            ));
        }

        let sni_config = self.resolver.server_config()?;

        let mut listeners = Vec::new();
        let mut failures = Vec::new();

        for group in groups {
            let port = group.port();
            let domains = group.domains();
            let (kind, tls_config) = if group.is_primary() {
                (ListenerKind::PrimaryTls, Arc::clone(&primary.tls_config))
            } else {
                (ListenerKind::SniTls, Arc::clone(&sni_config))
            };

            let dispatcher = PortGroupDispatcher::new(SocketAddr::new(ip, port), group, shutdown_rx.clone())
                .with_tls_config(tls_config)
                .with_max_body_bytes(self.config.max_body_bytes);

            match dispatcher.bind().await {
                Ok(bound) => {
                    listeners.push(ListenerInfo {
                        port,
                        local_addr: bound.local_addr(),
                        domains,
                        kind,
                    });
                    tasks.push(tokio::spawn(bound.serve()));
                }
                Err(e) => {
                    error!(port, domains = ?domains, error = %e, "Failed to bind listener");
                    failures.push(ListenerFailure {
                        port,
                        domains,
                        error: e,
                    });
                }
            }
        }

        let acme_port = self.config.acme_http_port;
        if acme_port > 0 {
            let server = ChallengeServer::new(
                SocketAddr::new(ip, acme_port),
                primary.challenges.clone(),
                primary_port,
                shutdown_rx.clone(),
            );
            match server.bind().await {
                Ok(bound) => {
                    listeners.push(ListenerInfo {
                        port: acme_port,
                        local_addr: bound.local_addr(),
                        domains: Vec::new(),
                        kind: ListenerKind::AcmeChallenge,
                    });
                    tasks.push(tokio::spawn(bound.serve()));
                }
                Err(e) => {
                    error!(port = acme_port, error = %e, "Failed to bind ACME challenge listener");
                    failures.push(ListenerFailure {
                        port: acme_port,
                        domains: Vec::new(),
                        error: e,
                    });
                }
            }
        }

        Ok(RunningGateway {
            local: false,
            registry: self.registry,
            listeners,
            failures,
            assignments: Vec::new(),
            tasks,
        })
    }
}

/// The registry's mode and default port decide URLs and the primary group, so they
/// must agree with the configuration the listeners are bound from.
fn check_registry(config: &ServerConfig, registry: &SiteRegistry) -> Result<(), GatewayError> {
    if registry.is_local() == config.local && registry.default_port() == config.default_port {
        return Ok(());
    }
    let describe = |local: bool, port: u16| {
        format!("{} mode on default port {}", if local { "local" } else { "TLS" }, port)
    };
    Err(GatewayError::RegistryMismatch {
        registry: describe(registry.is_local(), registry.default_port()),
        config: describe(config.local, config.default_port),
    })
}

/// Handle to the started listeners
pub struct RunningGateway {
    local: bool,
    registry: SiteRegistry,
    listeners: Vec<ListenerInfo>,
    failures: Vec<ListenerFailure>,
    assignments: Vec<LocalAssignment>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    pub fn listeners(&self) -> &[ListenerInfo] {
        &self.listeners
    }

    pub fn failures(&self) -> &[ListenerFailure] {
        &self.failures
    }

    pub fn local_assignments(&self) -> &[LocalAssignment] {
        &self.assignments
    }

    pub fn listener_for(&self, domain: &str) -> Option<&ListenerInfo> {
        let site = self.registry.root_of(domain)?;
        self.listeners
            .iter()
            .find(|l| l.domains.contains(&site.domain))
    }

    /// Where a site can be reached. Local mode gives `http://localhost:<port>`.
    pub fn url_for(&self, domain: &str) -> Option<String> {
        if !self.local {
            return self.registry.url_for(domain);
        }
        let site = self.registry.root_of(domain)?;
        self.assignments
            .iter()
            .find(|a| a.domain == site.domain)
            .map(LocalAssignment::url)
    }

    /// Wait for listeners to stop after the shutdown signal was sent
    pub async fn shutdown(self, grace: Duration) {
        let result = tokio::time::timeout(grace, async {
            for task in self.tasks {
                let _ = task.await;
            }
        })
        .await;

        if result.is_err() {
            warn!(grace_secs = grace.as_secs(), "Listeners did not stop within the grace period");
        }
    }
}
