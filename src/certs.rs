//! Certificate store lookup and SNI resolution for non-primary ports
//!
//! Certificates live at `<store>/live/<domain>/{privkey,cert,chain}.pem`. The rustls
//! callback only reads an in-memory cache; disk reads happen at startup and in
//! background refresh tasks so a handshake never blocks on the filesystem.

use crate::error::CertificateError;
use crate::registry::Domain;
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEY_FILE: &str = "privkey.pem";
const CERT_FILE: &str = "cert.pem";
const CHAIN_FILE: &str = "chain.pem";

/// Raw PEM material for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub key: Vec<u8>,
    /// `cert.pem` followed by `chain.pem`
    pub cert_chain: Vec<u8>,
}

impl CertificateRecord {
    fn from_parts(
        domain: &str,
        key: Vec<u8>,
        cert: Vec<u8>,
        chain: Vec<u8>,
    ) -> Result<Self, CertificateError> {
        if key.iter().all(u8::is_ascii_whitespace) {
            return Err(CertificateError::unavailable(domain, "private key is empty"));
        }
        if cert.iter().all(u8::is_ascii_whitespace) {
            return Err(CertificateError::unavailable(domain, "certificate is empty"));
        }

        let mut cert_chain = cert;
        if !cert_chain.ends_with(b"\n") {
            cert_chain.push(b'\n');
        }
        cert_chain.extend_from_slice(&chain);

        Ok(Self { key, cert_chain })
    }

    /// Parse into a rustls signing key with its chain
    pub fn certified_key(&self, domain: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        let mut reader = BufReader::new(self.cert_chain.as_slice());
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::unavailable(domain, format!("unparsable certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(CertificateError::unavailable(domain, "no certificates in cert.pem"));
        }

        let key = load_private_key(&self.key)
            .ok_or_else(|| CertificateError::unavailable(domain, "no private key in privkey.pem"))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| CertificateError::unavailable(domain, format!("unsupported private key: {}", e)))?;

        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }
}

/// File locations for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub chain: PathBuf,
}

impl CertificatePaths {
    fn all(&self) -> [&Path; 3] {
        [self.key.as_path(), self.cert.as_path(), self.chain.as_path()]
    }
}

type FileStamp = [Option<SystemTime>; 3];

struct CachedCertificate {
    certified_key: Arc<CertifiedKey>,
    stamp: FileStamp,
}

/// Domain to key material, backed by the certificate store
#[derive(Clone)]
pub struct CertificateResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    store_root: PathBuf,
    cache: RwLock<HashMap<Domain, CachedCertificate>>,
    /// Domains whose certificates may be loaded on a cache miss
    known: RwLock<HashSet<Domain>>,
    loading: Mutex<HashSet<Domain>>,
}

impl std::fmt::Debug for CertificateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateResolver")
            .field("store_root", &self.inner.store_root)
            .field("cached", &self.inner.cache.read().len())
            .finish()
    }
}

impl CertificateResolver {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                store_root: store_root.into(),
                cache: RwLock::new(HashMap::new()),
                known: RwLock::new(HashSet::new()),
                loading: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn store_root(&self) -> &Path {
        &self.inner.store_root
    }

    pub fn paths(&self, domain: &Domain) -> CertificatePaths {
        let dir = self.inner.store_root.join("live").join(domain.as_str());
        CertificatePaths {
            key: dir.join(KEY_FILE),
            cert: dir.join(CERT_FILE),
            chain: dir.join(CHAIN_FILE),
        }
    }

    /// Read a domain's certificate from the store. Any missing, unreadable or
    /// unparsable file yields `Unavailable`.
    pub fn resolve(&self, domain: &str) -> Result<CertificateRecord, CertificateError> {
        let domain = Domain::parse(domain)
            .map_err(|_| CertificateError::unavailable(domain, "invalid domain name"))?;
        let (record, _) = self.read_blocking(&domain)?;
        Ok(record)
    }

    fn read_blocking(
        &self,
        domain: &Domain,
    ) -> Result<(CertificateRecord, Arc<CertifiedKey>), CertificateError> {
        let paths = self.paths(domain);
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                CertificateError::unavailable(domain.as_str(), format!("{}: {}", path.display(), e))
            })
        };

        let record = CertificateRecord::from_parts(
            domain.as_str(),
            read(&paths.key)?,
            read(&paths.cert)?,
            read(&paths.chain)?,
        )?;
        let certified_key = record.certified_key(domain.as_str())?;
        Ok((record, certified_key))
    }

    async fn read_async(
        &self,
        domain: &Domain,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        let paths = self.paths(domain);
        let mut contents = Vec::with_capacity(3);
        for path in paths.all() {
            let data = tokio::fs::read(path).await.map_err(|e| {
                CertificateError::unavailable(domain.as_str(), format!("{}: {}", path.display(), e))
            })?;
            contents.push(data);
        }
        let chain = contents.pop().unwrap_or_default();
        let cert = contents.pop().unwrap_or_default();
        let key = contents.pop().unwrap_or_default();

        CertificateRecord::from_parts(domain.as_str(), key, cert, chain)?.certified_key(domain.as_str())
    }

    /// Synchronously load a domain into the cache. Startup only.
    pub fn load(&self, domain: &Domain) -> Result<(), CertificateError> {
        self.inner.known.write().insert(domain.clone());
        let stamp = stamp_blocking(&self.paths(domain));
        let (_, certified_key) = self.read_blocking(domain)?;
        self.inner.cache.write().insert(
            domain.clone(),
            CachedCertificate {
                certified_key,
                stamp,
            },
        );
        debug!(domain = %domain, "Certificate loaded");
        Ok(())
    }

    /// Reload a domain if its files changed since the cached copy.
    /// Returns whether the cache was updated. A domain whose files were all
    /// deleted is evicted.
    pub async fn refresh(&self, domain: &Domain) -> Result<bool, CertificateError> {
        self.inner.known.write().insert(domain.clone());

        let stamp = stamp_async(&self.paths(domain)).await;
        let unchanged = self
            .inner
            .cache
            .read()
            .get(domain)
            .map(|cached| cached.stamp == stamp)
            .unwrap_or(false);
        if unchanged {
            return Ok(false);
        }

        let certified_key = match self.read_async(domain).await {
            Ok(certified_key) => certified_key,
            Err(e) => {
                // Only a domain with no files left is evicted; a half-written renewal keeps the old key
                if stamp.iter().all(Option::is_none) && self.inner.cache.write().remove(domain).is_some() {
                    warn!(domain = %domain, "Certificate removed from store, evicted from cache");
                }
                return Err(e);
            }
        };
        self.inner.cache.write().insert(
            domain.clone(),
            CachedCertificate {
                certified_key,
                stamp,
            },
        );
        info!(domain = %domain, "Certificate cache updated");
        Ok(true)
    }

    /// Load every domain, logging the ones without certificates. Returns how many are cached.
    pub async fn warm(&self, domains: &[Domain]) -> usize {
        for domain in domains {
            if let Err(e) = self.refresh(domain).await {
                warn!(domain = %domain, error = %e, "Certificate unavailable, TLS handshakes for this name will fail");
            }
        }
        domains.iter().filter(|d| self.is_cached(d.as_str())).count()
    }

    /// Periodically pick up renewed certificates until shutdown
    pub fn watch(
        &self,
        domains: Vec<Domain>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let resolver = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        for domain in &domains {
                            if let Err(e) = resolver.refresh(domain).await {
                                debug!(domain = %domain, error = %e, "Certificate refresh failed");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Certificate watcher shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn invalidate(&self, domain: &Domain) {
        self.inner.cache.write().remove(domain);
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cached(name).is_some()
    }

    /// Cached key for an SNI name, falling back from `www.<root>` to `<root>`
    pub fn cached(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let domain = Domain::parse(name).ok()?;
        let cache = self.inner.cache.read();
        cache
            .get(&domain)
            .or_else(|| domain.strip_www().and_then(|root| cache.get(&root)))
            .map(|cached| Arc::clone(&cached.certified_key))
    }

    fn is_known(&self, domain: &Domain) -> bool {
        self.inner.known.read().contains(domain)
    }

    fn schedule_refresh(&self, domain: Domain) {
        if !self.inner.loading.lock().insert(domain.clone()) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.loading.lock().remove(&domain);
            return;
        };

        let resolver = self.clone();
        handle.spawn(async move {
            if let Err(e) = resolver.refresh(&domain).await {
                debug!(domain = %domain, error = %e, "Background certificate load failed");
            }
            resolver.inner.loading.lock().remove(&domain);
        });
    }

    /// rustls server configuration that selects certificates through this resolver
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, rustls::Error> {
        let mut config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(self.clone()));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_ascii_lowercase();

        if let Some(key) = self.cached(&name) {
            return Some(key);
        }

        let domain = Domain::parse(&name).ok()?;
        let target = if self.is_known(&domain) {
            domain
        } else {
            match domain.strip_www() {
                Some(root) if self.is_known(&root) => root,
                _ => {
                    debug!(sni = %name, "No certificate for unregistered name");
                    return None;
                }
            }
        };

        debug!(domain = %target, "Certificate not cached, scheduling load");
        self.schedule_refresh(target);
        None
    }
}

fn stamp_blocking(paths: &CertificatePaths) -> FileStamp {
    paths
        .all()
        .map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
}

async fn stamp_async(paths: &CertificatePaths) -> FileStamp {
    let mut stamp: FileStamp = [None; 3];
    for (slot, path) in stamp.iter_mut().zip(paths.all()) {
        *slot = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .ok();
    }
    stamp
}

/// First private key in a PEM buffer (PKCS#1, PKCS#8 or SEC1)
pub(crate) fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}
