//! Local development mode: one plain-HTTP port per site

use crate::config::ServerConfig;
use crate::dispatcher::{BoundDispatcher, PortGroup, PortGroupDispatcher};
use crate::gateway::ListenerFailure;
use crate::registry::{Domain, SiteRegistry};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::watch;
use tracing::{error, info};

/// Port handed to one root domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAssignment {
    pub domain: Domain,
    pub port: u16,
}

impl LocalAssignment {
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

/// Listeners bound by `LocalModeAllocator::start`
pub struct LocalStartup {
    pub assignments: Vec<LocalAssignment>,
    pub bound: Vec<(LocalAssignment, BoundDispatcher)>,
    pub failures: Vec<ListenerFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalModeAllocator {
    min_port: u16,
    max_port: u16,
}

impl LocalModeAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self { min_port, max_port }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.min_local_port, config.local_port_max())
    }

    /// Sequential ports for root domains in registration order. Domains that do not
    /// fit in the range are skipped.
    pub fn allocate(&self, registry: &SiteRegistry) -> Vec<LocalAssignment> {
        let mut assignments = Vec::new();
        let mut next = u32::from(self.min_port);

        for site in registry.roots() {
            if next > u32::from(self.max_port) {
                error!(domain = %site.domain, max_port = self.max_port, "Local port range exhausted, skipping site");
                continue;
            }
            assignments.push(LocalAssignment {
                domain: site.domain.clone(),
                port: next as u16,
            });
            next += 1;
        }

        assignments
    }

    /// Assemble every site, then bind one listener per site on `ip`
    pub async fn start(
        &self,
        registry: &SiteRegistry,
        ip: IpAddr,
        max_body_bytes: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> LocalStartup {
        let assignments = self.allocate(registry);

        let groups: Vec<(LocalAssignment, PortGroup)> = assignments
            .iter()
            .filter_map(|assignment| {
                let site = registry.get(assignment.domain.as_str())?;
                Some((assignment.clone(), PortGroup::direct(assignment.port, site)))
            })
            .collect();

        let mut bound = Vec::new();
        let mut failures = Vec::new();

        for (assignment, group) in groups {
            let addr = SocketAddr::new(ip, assignment.port);
            let dispatcher = PortGroupDispatcher::new(addr, group, shutdown_rx.clone())
                .with_max_body_bytes(max_body_bytes);

            match dispatcher.bind().await {
                Ok(dispatcher) => {
                    info!(domain = %assignment.domain, url = %assignment.url(), "Local site available");
                    bound.push((assignment, dispatcher));
                }
                Err(e) => {
                    error!(domain = %assignment.domain, port = assignment.port, error = %e, "Failed to bind local listener");
                    failures.push(ListenerFailure {
                        port: assignment.port,
                        domains: vec![assignment.domain.clone()],
                        error: e,
                    });
                }
            }
        }

        LocalStartup {
            assignments,
            bound,
            failures,
        }
    }
}
