//! Site registry: domains, their ports, and the factories that build them

use crate::config::ServerConfig;
use crate::error::RegistryError;
use crate::virtual_server::{RequestHandler, VirtualServer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Port used for sites registered without an explicit port
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Port owned by the ACME HTTP-01 challenge listener
pub const RESERVED_HTTP_PORT: u16 = 80;

/// Maximum hostname length per DNS specification
const MAX_DOMAIN_LEN: usize = 253;

/// A validated, lower-cased host name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(String);

impl Domain {
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let trimmed = input.trim();
        let name = trimmed.strip_suffix('.').unwrap_or(trimmed).to_ascii_lowercase();

        let valid = !name.is_empty()
            && name.len() <= MAX_DOMAIN_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && name.split('.').all(|label| !label.is_empty());

        if !valid {
            return Err(RegistryError::InvalidDomain(input.to_string()));
        }
        Ok(Domain(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `www.<self>` when the name has at most one dot
    pub fn www_alias(&self) -> Option<Domain> {
        if self.0.matches('.').count() < 2 {
            Some(Domain(format!("www.{}", self.0)))
        } else {
            None
        }
    }

    /// The name without a leading `www.`, if it has one
    pub fn strip_www(&self) -> Option<Domain> {
        self.0
            .strip_prefix("www.")
            .filter(|rest| !rest.is_empty())
            .map(|rest| Domain(rest.to_string()))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds a site. Invoked exactly once per root domain when its listener is assembled.
pub type ApplicationFactory = Arc<dyn Fn(&VirtualServer) -> Option<RequestHandler> + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredSite {
    pub domain: Domain,
    pub port: u16,
    pub factory: ApplicationFactory,
    /// Set for synthesized `www.` aliases
    pub alias_of: Option<Domain>,
}

impl RegisteredSite {
    pub fn is_alias(&self) -> bool {
        self.alias_of.is_some()
    }
}

impl fmt::Debug for RegisteredSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSite")
            .field("domain", &self.domain)
            .field("port", &self.port)
            .field("alias_of", &self.alias_of)
            .finish()
    }
}

/// Names a certificate must cover for one root domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSubject {
    pub subject: Domain,
    pub altnames: Vec<Domain>,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SiteRegistry {
    default_port: u16,
    local: bool,
    order: Vec<Domain>,
    sites: HashMap<Domain, RegisteredSite>,
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TLS_PORT, false)
    }
}

impl SiteRegistry {
    pub fn new(default_port: u16, local: bool) -> Self {
        Self {
            default_port,
            local,
            order: Vec::new(),
            sites: HashMap::new(),
        }
    }

    /// Empty registry using the configured default port and mode
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.default_port, config.local)
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Register a site under `domain` or `domain:port`.
    ///
    /// Registering an existing domain replaces it (last write wins).
    pub fn register<F>(&mut self, target: &str, factory: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(&VirtualServer) -> Option<RequestHandler> + Send + Sync + 'static,
    {
        self.register_factory(target, Arc::new(factory))
    }

    pub fn register_factory(
        &mut self,
        target: &str,
        factory: ApplicationFactory,
    ) -> Result<&mut Self, RegistryError> {
        let (domain, port) = self.parse_domain_with_port(target)?;

        if port == RESERVED_HTTP_PORT && !self.local {
            return Err(RegistryError::ReservedPort(domain.to_string()));
        }

        match self.sites.get(&domain) {
            Some(existing) if !existing.is_alias() => {
                warn!(domain = %domain, old_port = existing.port, new_port = port, "Domain registered twice, replacing previous site");
            }
            Some(_) => {
                debug!(domain = %domain, "Explicit registration replaces www alias");
            }
            None => {}
        }

        if !self.order.contains(&domain) {
            self.order.push(domain.clone());
        }

        if let Some(alias) = domain.www_alias() {
            let explicit = self.sites.get(&alias).map(|s| !s.is_alias()).unwrap_or(false);
            if !explicit {
                self.sites.insert(
                    alias.clone(),
                    RegisteredSite {
                        domain: alias,
                        port,
                        factory: Arc::clone(&factory),
                        alias_of: Some(domain.clone()),
                    },
                );
            }
        }

        self.sites.insert(
            domain.clone(),
            RegisteredSite {
                domain,
                port,
                factory,
                alias_of: None,
            },
        );

        Ok(self)
    }

    /// Split `domain[:port]`. A missing port resolves to the registry default.
    pub fn parse_domain_with_port(&self, target: &str) -> Result<(Domain, u16), RegistryError> {
        let target = target.trim();
        let (name, port) = match target.rsplit_once(':') {
            Some((name, port)) => {
                let port: u16 = port
                    .parse()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| RegistryError::InvalidDomain(target.to_string()))?;
                (name, port)
            }
            None => (target, self.default_port),
        };

        let domain = Domain::parse(name).map_err(|_| RegistryError::InvalidDomain(target.to_string()))?;
        Ok((domain, port))
    }

    /// Root sites grouped by port, registration order within each port
    pub fn group_by_port(&self) -> BTreeMap<u16, Vec<RegisteredSite>> {
        let mut groups: BTreeMap<u16, Vec<RegisteredSite>> = BTreeMap::new();
        for site in self.roots() {
            groups.entry(site.port).or_default().push(site.clone());
        }
        groups
    }

    /// Root sites in registration order
    pub fn roots(&self) -> impl Iterator<Item = &RegisteredSite> + '_ {
        self.order.iter().filter_map(|d| self.sites.get(d))
    }

    pub fn aliases_for(&self, root: &Domain) -> Vec<Domain> {
        root.www_alias()
            .into_iter()
            .filter(|alias| {
                self.sites
                    .get(alias)
                    .and_then(|s| s.alias_of.as_ref())
                    .map(|of| of == root)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn get(&self, domain: &str) -> Option<&RegisteredSite> {
        let domain = Domain::parse(domain).ok()?;
        self.sites.get(&domain)
    }

    /// Resolve a name (root or alias) to its root site
    pub fn root_of(&self, domain: &str) -> Option<&RegisteredSite> {
        let site = self.get(domain)?;
        match &site.alias_of {
            Some(root) => self.sites.get(root),
            None => Some(site),
        }
    }

    /// Number of root domains
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Public URL of a registered site: `https://<root>` on 443, with the port otherwise
    pub fn url_for(&self, domain: &str) -> Option<String> {
        let site = self.root_of(domain)?;
        Some(if site.port == DEFAULT_TLS_PORT {
            format!("https://{}", site.domain)
        } else {
            format!("https://{}:{}", site.domain, site.port)
        })
    }

    /// One subject per root domain, with its www alias as an altname when one applies
    pub fn certificate_subjects(&self) -> Vec<CertificateSubject> {
        self.roots()
            .map(|site| {
                let mut altnames = vec![site.domain.clone()];
                altnames.extend(site.domain.www_alias());
                CertificateSubject {
                    subject: site.domain.clone(),
                    altnames,
                    port: site.port,
                }
            })
            .collect()
    }
}
