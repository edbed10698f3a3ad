//! Local certificate authority
//!
//! Holds a self-signed root and issues leaf certificates for intercepted
//! hosts on demand. Leaves are cached per hostname for the life of the
//! process; concurrent misses for the same host collapse into a single
//! issuance.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::error::{InterposeError, Result};
use crate::tls::crypto_provider;

const ROOT_COMMON_NAME: &str = "Interpose Local Root CA";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 90;
/// Backdate leaves to tolerate client clock skew
const NOT_BEFORE_SKEW_SECS: i64 = 60;

pub const CA_CERT_FILE: &str = "ca_cert.pem";
pub const CA_KEY_FILE: &str = "ca_key.pem";

/// A leaf certificate issued for one hostname, ready to serve
pub struct LeafCert {
    pub hostname: String,
    pub serial: u64,
    /// `[leaf, root]`
    pub chain: Vec<CertificateDer<'static>>,
    pub not_after: OffsetDateTime,
    server_config: Arc<ServerConfig>,
}

impl LeafCert {
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }

    fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.not_after
    }
}

impl std::fmt::Debug for LeafCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCert")
            .field("hostname", &self.hostname)
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .finish()
    }
}

pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    root_pem: String,
    leaves: RwLock<HashMap<String, Arc<LeafCert>>>,
    issued: AtomicUsize,
}

impl CertAuthority {
    /// Create a fresh in-memory root
    pub fn generate() -> Result<Self> {
        let params = root_params();
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        let root_pem = cert.pem();
        let root_der = cert.der().clone();
        let issuer = Issuer::new(params, key);

        info!("Generated in-memory root certificate");
        Ok(Self::from_parts(issuer, root_der, root_pem))
    }

    /// Load the root from `dir`, or generate and persist one if absent
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let root_pem = fs::read_to_string(&cert_path)?;
            let key_pem = fs::read_to_string(&key_path)?;

            let key = KeyPair::from_pem(&key_pem)?;
            let issuer = Issuer::from_ca_cert_pem(&root_pem, key)?;
            let root_der = rustls_pemfile::certs(&mut root_pem.as_bytes())
                .next()
                .ok_or_else(|| {
                    InterposeError::Certificate(format!(
                        "no certificate found in {}",
                        cert_path.display()
                    ))
                })?
                .map_err(|e| InterposeError::Certificate(e.to_string()))?;

            info!(path = %cert_path.display(), "Loaded root certificate");
            return Ok(Self::from_parts(issuer, root_der, root_pem));
        }

        fs::create_dir_all(dir)?;

        let params = root_params();
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let root_pem = cert.pem();

        fs::write(&cert_path, root_pem.as_bytes())?;
        fs::write(&key_path, key.serialize_pem().as_bytes())?;
        restrict_permissions(&key_path)?;

        let root_der = cert.der().clone();
        let issuer = Issuer::new(params, key);

        info!(path = %cert_path.display(), "Generated and saved root certificate");
        Ok(Self::from_parts(issuer, root_der, root_pem))
    }

    fn from_parts(
        issuer: Issuer<'static, KeyPair>,
        root_der: CertificateDer<'static>,
        root_pem: String,
    ) -> Self {
        Self {
            issuer,
            root_der,
            root_pem,
            leaves: RwLock::new(HashMap::new()),
            issued: AtomicUsize::new(0),
        }
    }

    /// Root certificate in PEM form, for installing into client trust stores
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Number of leaves issued since construction
    pub fn issued_count(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// Return the cached leaf for `hostname`, issuing one on a miss.
    pub fn get_leaf(&self, hostname: &str) -> Result<Arc<LeafCert>> {
        let key = normalize_host(hostname)?;

        if let Some(leaf) = self.leaves.read().get(&key) {
            if !leaf.is_expired() {
                return Ok(leaf.clone());
            }
        }

        let mut leaves = self.leaves.write();
        // Another caller may have issued while we waited for the write lock.
        if let Some(leaf) = leaves.get(&key) {
            if !leaf.is_expired() {
                return Ok(leaf.clone());
            }
        }

        let leaf = Arc::new(self.issue(&key)?);
        leaves.insert(key, leaf.clone());
        self.issued.fetch_add(1, Ordering::Relaxed);

        Ok(leaf)
    }

    fn issue(&self, hostname: &str) -> Result<LeafCert> {
        let serial: u64 = rand::thread_rng().gen();

        let mut params = CertificateParams::default();
        params.serial_number = Some(serial.into());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;

        params.subject_alt_names = match hostname.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(hostname.try_into().map_err(|_| {
                InterposeError::Certificate(format!("invalid hostname: {}", hostname))
            })?)],
        };
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        let not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
        params.not_after = not_after;

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer)?;

        let chain = vec![cert.der().clone(), self.root_der.clone()];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key_der)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!(host = %hostname, serial = serial, "Issued leaf certificate");

        Ok(LeafCert {
            hostname: hostname.to_string(),
            serial,
            chain,
            not_after,
            server_config: Arc::new(server_config),
        })
    }
}

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, "Interpose");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
    params
}

/// Lowercase the host and strip IPv6 brackets so cache keys are canonical
fn normalize_host(hostname: &str) -> Result<String> {
    let host = hostname.trim().trim_end_matches('.');
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err(InterposeError::Certificate("empty hostname".to_string()));
    }

    Ok(host.to_ascii_lowercase())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
