//! Certificate manager boundary
//!
//! The gateway only asks a certificate manager for the primary port's TLS
//! configuration and for the challenge set served on port 80. Issuance and renewal
//! happen outside this crate; `StoreCertificateManager` consumes what an ACME client
//! leaves in the certificate store.

use crate::acme::Http01Challenges;
use crate::certs::CertificateResolver;
use crate::registry::CertificateSubject;
use anyhow::Context;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const MANIFEST_FILE: &str = "sites.toml";

/// What the gateway hands to the certificate manager at startup
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub email: String,
    pub subjects: Vec<CertificateSubject>,
    pub staging: bool,
    pub cluster: bool,
    pub store_dir: PathBuf,
}

/// TLS for the primary port plus the challenges to answer on port 80
#[derive(Clone)]
pub struct PrimaryTls {
    pub tls_config: Arc<ServerConfig>,
    pub challenges: Http01Challenges,
}

pub trait CertificateManager: Send + Sync {
    /// Prepare certificates for every subject. An error aborts startup.
    fn init(&self, config: &ManagerConfig) -> anyhow::Result<PrimaryTls>;
}

/// Serves the primary port from the on-disk certificate store
pub struct StoreCertificateManager {
    resolver: CertificateResolver,
}

impl StoreCertificateManager {
    pub fn new(resolver: CertificateResolver) -> Self {
        Self { resolver }
    }
}

impl CertificateManager for StoreCertificateManager {
    fn init(&self, config: &ManagerConfig) -> anyhow::Result<PrimaryTls> {
        if config.email.trim().is_empty() {
            anyhow::bail!("A subscriber email is required for certificate management");
        }

        let live_dir = config.store_dir.join("live");
        std::fs::create_dir_all(&live_dir).with_context(|| {
            format!("Failed to create certificate store '{}'", live_dir.display())
        })?;

        if write_site_manifest(&config.store_dir, config)? {
            info!(path = %config.store_dir.join(MANIFEST_FILE).display(), "Site manifest updated");
        }

        let mut loaded = 0;
        for subject in &config.subjects {
            match self.resolver.load(&subject.subject) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    warn!(domain = %subject.subject, error = %e, "No certificate yet, HTTPS for this site will fail until one is issued");
                }
            }
        }

        let tls_config = self
            .resolver
            .server_config()
            .context("Failed to build TLS configuration")?;

        info!(
            email = %config.email,
            staging = config.staging,
            cluster = config.cluster,
            sites = config.subjects.len(),
            loaded,
            "Certificate manager ready"
        );

        Ok(PrimaryTls {
            tls_config,
            challenges: Http01Challenges::with_webroot(config.store_dir.join("webroot")),
        })
    }
}

/// Names the external ACME client should keep certificates for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteManifest {
    pub subscriber_email: String,
    #[serde(default)]
    pub staging: bool,
    #[serde(default)]
    pub sites: Vec<ManifestSite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSite {
    pub subject: String,
    pub altnames: Vec<String>,
    /// Renewal timestamp recorded by the ACME client; preserved across rewrites
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_at: Option<u64>,
}

/// Write `<store>/sites.toml` when its content would change. Returns whether it was written.
pub fn write_site_manifest(store_dir: &Path, config: &ManagerConfig) -> anyhow::Result<bool> {
    let path = store_dir.join(MANIFEST_FILE);

    let existing: Option<SiteManifest> = match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable site manifest");
                None
            }
        },
        Err(_) => None,
    };

    let renewals: HashMap<&str, u64> = existing
        .iter()
        .flat_map(|m| m.sites.iter())
        .filter_map(|s| s.renew_at.map(|at| (s.subject.as_str(), at)))
        .collect();

    let manifest = SiteManifest {
        subscriber_email: config.email.clone(),
        staging: config.staging,
        sites: config
            .subjects
            .iter()
            .map(|s| ManifestSite {
                subject: s.subject.to_string(),
                altnames: s.altnames.iter().map(|a| a.to_string()).collect(),
                renew_at: renewals.get(s.subject.as_str()).copied(),
            })
            .collect(),
    };

    if existing.as_ref() == Some(&manifest) {
        return Ok(false);
    }

    std::fs::create_dir_all(store_dir)
        .with_context(|| format!("Failed to create '{}'", store_dir.display()))?;
    let content = toml::to_string_pretty(&manifest).context("Failed to serialize site manifest")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    Ok(true)
}
