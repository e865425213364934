//! Certificate Authority (CA) management for the interception engine
//!
//! The root key pair is generated once per certificate directory and loaded
//! on every later start. Leaf certificates are issued lazily per hostname,
//! persisted next to the root, and kept in an in-memory cache.
//!

use crate::errors::CaError;
use moka::future::Cache;
use moka::Expiry;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::certificate::X509Certificate;

type CaResult<T> = std::result::Result<T, CaError>;

/// Root private key file name (PKCS8 PEM)
pub const ROOT_KEY_FILE: &str = "ca-key.pem";
/// Root certificate file name (PEM)
pub const ROOT_CERT_FILE: &str = "ca-cert.pem";

/// RSA modulus size for root and leaf keys
const RSA_KEY_BITS: usize = 2048;
/// Root validity in days (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity in days (1 year)
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// In-memory leaf cache capacity
const CACHE_CAPACITY: u64 = 1000;

const ORGANIZATION: &str = "Emo-Crab";

/// A leaf certificate issued for one hostname, as stored on disk.
pub struct LeafCertificate {
  host: String,
  cert_path: PathBuf,
  key_path: PathBuf,
  /// `[leaf, root]`
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  not_after: OffsetDateTime,
}

impl LeafCertificate {
  /// Hostname the certificate was issued for
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Path of `{hostname}.crt`
  pub fn cert_path(&self) -> &Path {
    &self.cert_path
  }

  /// Path of `{hostname}.key`
  pub fn key_path(&self) -> &Path {
    &self.key_path
  }

  /// Certificate chain served to clients: the leaf followed by the root
  pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
    self.chain.clone()
  }

  /// Leaf private key
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }

  /// End of the validity period
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// Whether the certificate is past its validity period
  pub fn is_expired(&self) -> bool {
    OffsetDateTime::now_utc() >= self.not_after
  }
}

/// Drops cached leaves from memory once their certificate expires, so the
/// next request goes through the coalesced load-or-issue path again.
struct LeafExpiry;

impl LeafExpiry {
  fn remaining(leaf: &LeafCertificate) -> std::time::Duration {
    (leaf.not_after - OffsetDateTime::now_utc())
      .try_into()
      .unwrap_or(std::time::Duration::ZERO)
  }
}

impl Expiry<String, Arc<LeafCertificate>> for LeafExpiry {
  fn expire_after_create(
    &self,
    _host: &String,
    leaf: &Arc<LeafCertificate>,
    _created_at: Instant,
  ) -> Option<std::time::Duration> {
    Some(Self::remaining(leaf))
  }
}

/// Certificate Authority for generating certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Arc<Issuer<'static, KeyPair>>,
  /// Root CA certificate in DER format
  root_cert_der: CertificateDer<'static>,
  /// Root subject, RFC 4514 rendering
  root_subject: String,
  /// Storage path for certificates
  storage_path: PathBuf,
  /// Issued leaves; `try_get_with` coalesces concurrent issuance per hostname
  leaf_cache: Cache<String, Arc<LeafCertificate>>,
  /// Bounds concurrent RSA key generation and signing
  workers: Arc<Semaphore>,
}

impl CertificateAuthority {
  /// Create a new Certificate Authority
  ///
  /// If a CA already exists at the storage path, it will be loaded and
  /// validated. If neither root file exists, a new CA will be generated.
  /// A partial or unreadable CA is an error: it is never replaced silently.
  pub async fn new(storage_path: impl AsRef<Path>, keygen_workers: usize) -> CaResult<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();

    fs::create_dir_all(&storage_path)
      .await
      .map_err(|e| CaError::storage(&storage_path, e))?;

    let cert_path = storage_path.join(ROOT_CERT_FILE);
    let key_path = storage_path.join(ROOT_KEY_FILE);
    let cert_exists = exists(&cert_path).await?;
    let key_exists = exists(&key_path).await?;

    let (cert_pem, key_pem) = match (cert_exists, key_exists) {
      (true, true) => {
        let cert_pem = read_to_string(&cert_path).await?;
        let key_pem = read_to_string(&key_path).await?;
        tracing::debug!("[MITM] loading root CA from {}", storage_path.display());
        (cert_pem, key_pem)
      }
      (false, false) => {
        tracing::info!("[MITM] generating new root CA in {}", storage_path.display());
        let (cert_pem, key_pem) = tokio::task::spawn_blocking(generate_root)
          .await
          .map_err(|e| CaError::crypto(format!("Root generation task failed: {}", e)))??;
        write_key(&key_path, &key_pem).await?;
        write_atomic(&cert_path, &cert_pem).await?;
        (cert_pem, key_pem)
      }
      (true, false) => {
        return Err(CaError::malformed(format!(
          "{} exists but {} is missing",
          cert_path.display(),
          key_path.display()
        )))
      }
      (false, true) => {
        return Err(CaError::malformed(format!(
          "{} exists but {} is missing",
          key_path.display(),
          cert_path.display()
        )))
      }
    };

    let (issuer, root_cert_der, root_subject) = Self::load_root(&cert_pem, &key_pem)?;

    Ok(Self {
      issuer: Arc::new(issuer),
      root_cert_der,
      root_subject,
      storage_path,
      leaf_cache: Cache::builder()
        .max_capacity(CACHE_CAPACITY)
        .expire_after(LeafExpiry)
        .build(),
      workers: Arc::new(Semaphore::new(keygen_workers.max(1))),
    })
  }

  /// Parse and validate root CA material
  fn load_root(
    cert_pem: &str,
    key_pem: &str,
  ) -> CaResult<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| CaError::malformed(format!("Failed to parse CA key: {}", e)))?;

    let cert_der = first_certificate(cert_pem)
      .map_err(|e| CaError::malformed(format!("Failed to parse CA certificate: {}", e)))?;

    let root_subject = {
      let cert = parse_certificate(&cert_der)
        .map_err(|e| CaError::malformed(format!("Failed to parse CA certificate: {}", e)))?;
      let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .is_some_and(|bc| bc.value.ca);
      if !is_ca {
        return Err(CaError::malformed("CA certificate lacks BasicConstraints ca=true"));
      }
      if cert.public_key().raw != key_pair.subject_public_key_info().as_slice() {
        return Err(CaError::malformed("CA key does not match CA certificate"));
      }
      cert.subject().to_string()
    };

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| CaError::malformed(format!("Failed to create issuer from CA cert: {}", e)))?;

    Ok((issuer, cert_der, root_subject))
  }

  /// Get CA certificate path
  pub fn root_cert_path(&self) -> PathBuf {
    self.storage_path.join(ROOT_CERT_FILE)
  }

  /// Get CA certificate in PEM format for client installation
  pub fn root_cert_pem(&self) -> CaResult<String> {
    let path = self.root_cert_path();
    std::fs::read_to_string(&path).map_err(|e| CaError::storage(&path, e))
  }

  /// Root CA certificate in DER format
  pub fn root_cert_der(&self) -> &CertificateDer<'static> {
    &self.root_cert_der
  }

  /// Directory holding the root and leaf files
  pub fn storage_path(&self) -> &Path {
    &self.storage_path
  }

  /// Issue (or fetch from cache) the leaf for `host` and return `(cert_path, key_path)`.
  pub async fn issue_leaf_certificate(&self, host: &str) -> CaResult<(PathBuf, PathBuf)> {
    let leaf = self.leaf_certificate(host).await?;
    Ok((leaf.cert_path.clone(), leaf.key_path.clone()))
  }

  /// Get or issue the leaf certificate for `host`.
  ///
  /// Concurrent requests for one hostname share a single generation;
  /// other hostnames proceed in parallel. Expired leaves leave the cache on
  /// their own and are renewed through the same path.
  pub async fn leaf_certificate(&self, host: &str) -> CaResult<Arc<LeafCertificate>> {
    let host = normalize_hostname(host)?;
    self
      .leaf_cache
      .try_get_with(host.clone(), self.load_or_issue(host))
      .await
      .map_err(CaError::from_shared)
  }

  /// Load the persisted leaf for `host`, issuing a fresh one when it is
  /// missing, expired, damaged, or signed by a different root.
  async fn load_or_issue(&self, host: String) -> CaResult<Arc<LeafCertificate>> {
    let cert_path = self.storage_path.join(format!("{}.crt", host));
    let key_path = self.storage_path.join(format!("{}.key", host));

    match self.load_leaf(&host, &cert_path, &key_path).await {
      Ok(Some(leaf)) => {
        tracing::debug!("[MITM] reusing leaf certificate for {}", host);
        return Ok(Arc::new(leaf));
      }
      Ok(None) => {}
      Err(e) => tracing::warn!("[MITM] reissuing leaf certificate for {}: {}", host, e),
    }

    let issuer = self.issuer.clone();
    let subject = host.clone();
    let (cert_pem, key_pem) = self.run_blocking(move || sign_leaf(&issuer, &subject)).await?;
    write_key(&key_path, &key_pem).await?;
    write_atomic(&cert_path, &cert_pem).await?;
    tracing::info!("[MITM] issued leaf certificate for {}", host);

    self
      .build_leaf(host, cert_path, key_path, &cert_pem, &key_pem)
      .map(Arc::new)
  }

  async fn load_leaf(
    &self,
    host: &str,
    cert_path: &Path,
    key_path: &Path,
  ) -> CaResult<Option<LeafCertificate>> {
    match (exists(cert_path).await?, exists(key_path).await?) {
      (false, false) => return Ok(None),
      (true, true) => {}
      _ => return Err(CaError::malformed(format!("incomplete leaf pair for {}", host))),
    }
    let cert_pem = read_to_string(cert_path).await?;
    let key_pem = read_to_string(key_path).await?;
    let leaf = self.build_leaf(
      host.to_string(),
      cert_path.to_path_buf(),
      key_path.to_path_buf(),
      &cert_pem,
      &key_pem,
    )?;
    if leaf.is_expired() {
      tracing::info!("[MITM] cached leaf certificate for {} expired", host);
      return Ok(None);
    }
    Ok(Some(leaf))
  }

  /// Parse persisted leaf material and check it belongs to this root.
  fn build_leaf(
    &self,
    host: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    cert_pem: &str,
    key_pem: &str,
  ) -> CaResult<LeafCertificate> {
    let cert_der = first_certificate(cert_pem)
      .map_err(|e| CaError::malformed(format!("Failed to parse leaf certificate: {}", e)))?;
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| CaError::malformed(format!("Failed to parse leaf key: {}", e)))?;

    let not_after = {
      let cert = parse_certificate(&cert_der)
        .map_err(|e| CaError::malformed(format!("Failed to parse leaf certificate: {}", e)))?;
      if cert.issuer().to_string() != self.root_subject {
        return Err(CaError::malformed(format!(
          "leaf for {} was issued by {}",
          host,
          cert.issuer()
        )));
      }
      let root = parse_certificate(&self.root_cert_der)
        .map_err(|e| CaError::malformed(format!("Failed to parse CA certificate: {}", e)))?;
      if let Err(e) = cert.verify_signature(Some(root.public_key())) {
        return Err(CaError::malformed(format!(
          "leaf for {} is not signed by the current root: {}",
          host, e
        )));
      }
      if cert.public_key().raw != key_pair.subject_public_key_info().as_slice() {
        return Err(CaError::malformed(format!(
          "leaf key for {} does not match its certificate",
          host
        )));
      }
      cert.validity().not_after.to_datetime()
    };

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| CaError::malformed("Failed to serialize leaf key"))?;

    Ok(LeafCertificate {
      host,
      cert_path,
      key_path,
      chain: vec![cert_der, self.root_cert_der.clone()],
      key,
      not_after,
    })
  }

  /// Run CPU-bound crypto on the blocking pool, at most `keygen_workers` at a time
  async fn run_blocking<T, F>(&self, f: F) -> CaResult<T>
  where
    F: FnOnce() -> CaResult<T> + Send + 'static,
    T: Send + 'static,
  {
    let _permit = self
      .workers
      .acquire()
      .await
      .map_err(|_| CaError::crypto("certificate worker pool closed"))?;
    tokio::task::spawn_blocking(f)
      .await
      .map_err(|e| CaError::crypto(format!("certificate worker failed: {}", e)))?
  }
}

/// Generate an RSA key pair, returning it with its PKCS8 PEM encoding
fn generate_rsa_key_pair() -> CaResult<(KeyPair, String)> {
  let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
    .map_err(|e| CaError::crypto(format!("Failed to generate RSA key: {}", e)))?;
  let pem = private_key
    .to_pkcs8_pem(LineEnding::LF)
    .map_err(|e| CaError::crypto(format!("Failed to encode RSA key: {}", e)))?;
  let key_pair = KeyPair::from_pem(pem.as_str())
    .map_err(|e| CaError::crypto(format!("Failed to load generated key: {}", e)))?;
  Ok((key_pair, pem.to_string()))
}

/// Generate a new self-signed root, returning `(cert_pem, key_pem)`
fn generate_root() -> CaResult<(String, String)> {
  let mut params = CertificateParams::default();
  params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

  // per-installation suffix, so roots from different directories never share a subject
  let mut dn = DistinguishedName::new();
  dn.push(
    DnType::CommonName,
    format!("Slinger Bump CA {:08x}", rand::thread_rng().gen::<u32>()),
  );
  dn.push(DnType::OrganizationName, ORGANIZATION);
  dn.push(DnType::CountryName, "CN");
  params.distinguished_name = dn;
  // Configure as CA
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
  params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

  let (key_pair, key_pem) = generate_rsa_key_pair()?;
  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| CaError::crypto(format!("Failed to generate CA: {}", e)))?;

  Ok((cert.pem(), key_pem))
}

/// Generate and sign a leaf for `host`, returning `(cert_pem, key_pem)`
fn sign_leaf(issuer: &Issuer<'static, KeyPair>, host: &str) -> CaResult<(String, String)> {
  let mut params = CertificateParams::default();

  // Generate random serial number for uniqueness
  params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, host);
  dn.push(DnType::OrganizationName, ORGANIZATION);
  params.distinguished_name = dn;

  // IP literals get an iPAddress SAN, everything else a dNSName
  params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
    vec![SanType::IpAddress(ip)]
  } else {
    vec![SanType::DnsName(
      host
        .try_into()
        .map_err(|_| CaError::InvalidHostname(host.to_string()))?,
    )]
  };

  params.is_ca = IsCa::ExplicitNoCa;
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyEncipherment,
  ];
  params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

  // Set validity period with clock skew handling
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
  params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

  let (key_pair, key_pem) = generate_rsa_key_pair()?;
  let cert = params
    .signed_by(&key_pair, issuer)
    .map_err(|e| CaError::crypto(format!("Failed to sign leaf for {}: {}", host, e)))?;

  Ok((cert.pem(), key_pem))
}

/// Lowercase `host` and make sure it is safe both as a certificate subject
/// and as a file name inside the certificate directory.
fn normalize_hostname(host: &str) -> CaResult<String> {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  let valid = !host.is_empty()
    && host.len() <= 253
    && !host.starts_with('.')
    && !host.contains("..")
    && host
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'));
  if !valid {
    return Err(CaError::InvalidHostname(host.to_string()));
  }
  Ok(host.to_ascii_lowercase())
}

fn first_certificate(pem: &str) -> std::io::Result<CertificateDer<'static>> {
  rustls_pemfile::certs(&mut pem.as_bytes())
    .next()
    .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no certificate in PEM"))?
}

fn parse_certificate<'a>(der: &'a CertificateDer<'_>) -> Result<X509Certificate<'a>, String> {
  x509_parser::parse_x509_certificate(der.as_ref())
    .map(|(_, cert)| cert)
    .map_err(|e| e.to_string())
}

async fn exists(path: &Path) -> CaResult<bool> {
  fs::try_exists(path)
    .await
    .map_err(|e| CaError::storage(path, e))
}

async fn read_to_string(path: &Path) -> CaResult<String> {
  fs::read_to_string(path)
    .await
    .map_err(|e| CaError::storage(path, e))
}

/// Write through a temporary file and rename, so readers never see a
/// half-written PEM.
async fn write_atomic(path: &Path, contents: &str) -> CaResult<()> {
  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  let tmp = path.with_file_name(format!(".{}.tmp", file_name));
  fs::write(&tmp, contents.as_bytes())
    .await
    .map_err(|e| CaError::storage(&tmp, e))?;
  fs::rename(&tmp, path)
    .await
    .map_err(|e| CaError::storage(path, e))
}

async fn write_key(path: &Path, contents: &str) -> CaResult<()> {
  write_atomic(path, contents).await?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
      .await
      .map_err(|e| CaError::storage(path, e))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hostnames_are_normalized() {
    assert_eq!(normalize_hostname("Example.COM").unwrap(), "example.com");
    assert_eq!(normalize_hostname("[::1]").unwrap(), "::1");
    assert_eq!(normalize_hostname("10.0.0.1").unwrap(), "10.0.0.1");
  }

  fn leaf_expiring_at(not_after: OffsetDateTime) -> LeafCertificate {
    LeafCertificate {
      host: "example.com".to_string(),
      cert_path: PathBuf::from("example.com.crt"),
      key_path: PathBuf::from("example.com.key"),
      chain: Vec::new(),
      key: PrivateKeyDer::Pkcs8(Vec::<u8>::new().into()),
      not_after,
    }
  }

  #[test]
  fn cached_leaves_expire_with_their_certificate() {
    let now = OffsetDateTime::now_utc();
    let expired = leaf_expiring_at(now - Duration::days(1));
    assert!(expired.is_expired());
    assert_eq!(LeafExpiry::remaining(&expired), std::time::Duration::ZERO);

    let fresh = leaf_expiring_at(now + Duration::days(2));
    assert!(!fresh.is_expired());
    let remaining = LeafExpiry::remaining(&fresh);
    assert!(remaining > std::time::Duration::from_secs(86_400));
    assert!(remaining <= std::time::Duration::from_secs(2 * 86_400));
  }

  #[test]
  fn unsafe_hostnames_are_rejected() {
    for host in ["", "../etc/passwd", "a/b", ".hidden", "a..b", "a b", "a\\b"] {
      assert!(
        matches!(normalize_hostname(host), Err(CaError::InvalidHostname(_))),
        "{host:?} accepted"
      );
    }
  }
}
