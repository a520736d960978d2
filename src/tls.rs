//! TLS configuration for both sides of an intercepted session.
//!
use std::sync::Arc;

use rustls_pki_types::CertificateDer;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::ca::LeafCertificate;
use crate::errors::Result;

const ALPN_HTTP11: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server side config presented to the client: TLS 1.3 only, X25519 or
/// P-256 key exchange, HTTP/1.1 ALPN.
pub fn server_config(leaf: &LeafCertificate) -> Result<ServerConfig> {
  let base = provider();
  let provider = CryptoProvider {
    kx_groups: vec![
      rustls::crypto::ring::kx_group::X25519,
      rustls::crypto::ring::kx_group::SECP256R1,
    ],
    ..(*base).clone()
  };
  let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .with_no_client_auth()
    .with_single_cert(leaf.chain.clone(), leaf.key.clone_key())?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

/// Client side config used to dial upstream hosts.
///
/// Trusts the platform roots plus any `extra_roots`.
pub fn upstream_config(extra_roots: &[CertificateDer<'static>]) -> Result<ClientConfig> {
  let mut root_cert_store = RootCertStore::empty();
  for cert in extra_roots {
    root_cert_store.add(cert.clone())?;
  }
  let native = rustls_native_certs::load_native_certs();
  for err in &native.errors {
    tracing::debug!("skipping native root: {}", err);
  }
  let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
  tracing::debug!(added, ignored, "loaded native roots");
  let mut config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_root_certificates(root_cert_store)
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}
