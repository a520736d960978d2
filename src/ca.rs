//! Root certificate authority and the per-host leaf certificate cache.
//!
//! Leaf certificates are forged on the first TLS interception of a host and
//! kept in memory for the life of the process.

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Default leaf validity in hours.
pub const DEFAULT_VALIDITY_HOURS: i64 = 240;
const LEAF_ORGANIZATION: &str = "MITM proxy";

/// A forged leaf certificate chain and its private key.
#[derive(Debug)]
pub struct LeafCertificate {
  /// `[leaf, root]`
  pub chain: Vec<CertificateDer<'static>>,
  /// PKCS#8 key of the leaf
  pub key: PrivateKeyDer<'static>,
}

impl LeafCertificate {
  /// The leaf certificate itself.
  pub fn leaf(&self) -> &CertificateDer<'static> {
    &self.chain[0]
  }
}

/// Root CA used to sign forged leaf certificates.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
}

impl CertificateAuthority {
  /// Load the root CA from a PEM certificate and a PKCS#8 PEM key.
  pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let read = |path: &Path| {
      std::fs::read_to_string(path)
        .map_err(|e| Error::Certificate(format!("read {}: {}", path.display(), e)))
    };
    let cert_pem = read(cert_path.as_ref())?;
    let key_pem = read(key_path.as_ref())?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build the root CA from PEM text.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    match rustls_pemfile::private_key(&mut key_pem.as_bytes()) {
      Ok(Some(PrivateKeyDer::Pkcs8(_))) => {}
      Ok(Some(_)) => {
        return Err(Error::Certificate(
          "CA key must be a PKCS#8 \"PRIVATE KEY\"".to_string(),
        ))
      }
      Ok(None) => return Err(Error::Certificate("no private key found in PEM".to_string())),
      Err(e) => return Err(Error::Certificate(format!("parse CA key: {}", e))),
    }
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::Certificate(format!("parse CA key: {}", e)))?;

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::Certificate("no certificate found in PEM".to_string()))?
      .map_err(|e| Error::Certificate(format!("parse CA certificate: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::Certificate(format!("load CA certificate: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  /// Generate a throwaway self-signed root CA.
  pub fn generate(common_name: &str) -> Result<Self> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(1);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;
    let key_pem = key_pair.serialize_pem();
    Self::from_pem(&cert.pem(), &key_pem)
  }

  /// Forge a leaf certificate for `host`, valid for `validity_hours`.
  pub fn issue(&self, host: &str, validity_hours: i64) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();

    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    params.distinguished_name = dn;

    params.subject_alt_names = vec![SanType::DnsName(host.try_into().map_err(|_| {
      Error::Certificate(format!("invalid host name: {}", host))
    })?)];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::hours(validity_hours);

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.is_ca = IsCa::ExplicitNoCa;

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.signed_by(&key_pair, &self.issuer)?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::Certificate("serialize leaf key".to_string()))?;

    Ok(LeafCertificate {
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key,
    })
  }

  /// Root certificate in DER form.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root certificate in PEM form, for installing into clients.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root private key in PKCS#8 PEM form.
  pub fn ca_key_pem(&self) -> String {
    self.issuer.key().serialize_pem()
  }
}

/// Caches forged certificates by host name with any port stripped.
///
/// Two simultaneous first lookups of the same host may both forge a
/// certificate; the later insert replaces the earlier one.
pub struct CertificateManager {
  ca: CertificateAuthority,
  validity_hours: i64,
  cert_cache: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateManager {
  /// Wrap `ca` with an empty cache.
  pub fn new(ca: CertificateAuthority, validity_hours: i64) -> Self {
    Self {
      ca,
      validity_hours,
      cert_cache: Cache::builder().build(),
    }
  }

  /// Get the cached certificate for `host` or forge a new one.
  pub async fn get_server_cert(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    let key = cache_key(host);
    if let Some(cached) = self.cert_cache.get(&key).await {
      return Ok(cached);
    }
    tracing::debug!(host = %key, "forging leaf certificate");
    let leaf = Arc::new(self.ca.issue(&key, self.validity_hours)?);
    self.cert_cache.insert(key, leaf.clone()).await;
    Ok(leaf)
  }

  /// The root CA.
  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }
}

/// Strip a trailing `:port` (and IPv6 brackets) from `host`.
pub(crate) fn cache_key(host: &str) -> String {
  if let Some(rest) = host.strip_prefix('[') {
    if let Some((ip, _)) = rest.split_once(']') {
      return ip.to_string();
    }
  }
  match host.rsplit_once(':') {
    Some((h, port)) if !h.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
      h.to_string()
    }
    _ => host.to_string(),
  }
}
