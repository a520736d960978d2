//! Startup configuration.
use std::collections::HashMap;
use std::path::PathBuf;

use crate::ca::{CertificateAuthority, DEFAULT_VALIDITY_HOURS};
use crate::errors::{Error, Result};
use crate::rule::{compile_rules, RuleEngine};
use crate::server::ProxyServer;

/// Address the proxy listens on unless told otherwise.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9999";
/// Directory scanned for rule files unless told otherwise.
pub const DEFAULT_RULES_DIR: &str = "proxy_rules";

/// Everything needed to start a [`ProxyServer`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// `host:port` to listen on.
  pub listen_addr: String,
  /// Root CA certificate, PEM.
  pub ca_cert_file: PathBuf,
  /// Root CA private key, PKCS#8 PEM.
  pub ca_key_file: PathBuf,
  /// Rule files live here; a missing directory means no rules.
  pub rules_dir: PathBuf,
  /// Lifetime of forged leaf certificates, in hours.
  pub validity_hours: i64,
  /// Values for `{{ .Envs.NAME }}` placeholders in rules.
  pub env: HashMap<String, String>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
      ca_cert_file: PathBuf::new(),
      ca_key_file: PathBuf::new(),
      rules_dir: PathBuf::from(DEFAULT_RULES_DIR),
      validity_hours: DEFAULT_VALIDITY_HOURS,
      env: HashMap::new(),
    }
  }
}

impl ProxyConfig {
  /// Compile the rules found in `rules_dir`.
  pub fn load_rules(&self) -> Result<RuleEngine> {
    let (request_rules, response_rules) = compile_rules(&self.rules_dir, &self.env)?;
    Ok(RuleEngine::new(request_rules, response_rules))
  }

  /// Load the CA, compile the rules and build the server.
  pub fn build_server(&self) -> Result<ProxyServer> {
    if self.ca_cert_file.as_os_str().is_empty() || self.ca_key_file.as_os_str().is_empty() {
      return Err(Error::Config(
        "both a CA certificate and a CA key file are required".to_string(),
      ));
    }
    if self.validity_hours <= 0 {
      return Err(Error::Config(format!(
        "certificate validity must be positive, got {} hours",
        self.validity_hours
      )));
    }
    let ca = CertificateAuthority::load(&self.ca_cert_file, &self.ca_key_file)?;
    ProxyServer::builder(ca)
      .validity_hours(self.validity_hours)
      .rules(self.load_rules()?)
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = ProxyConfig::default();
    assert_eq!(config.listen_addr, "127.0.0.1:9999");
    assert_eq!(config.rules_dir, PathBuf::from("proxy_rules"));
    assert_eq!(config.validity_hours, 240);
  }

  #[test]
  fn missing_ca_files_are_a_config_error() {
    let err = ProxyConfig::default().build_server().err().unwrap();
    assert!(matches!(err, Error::Config(_)), "{}", err);
  }

  #[test]
  fn builds_from_pem_files() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::generate("config test").unwrap();
    let cert = dir.path().join("ca.pem");
    let key = dir.path().join("ca.key");
    std::fs::write(&cert, ca.ca_cert_pem()).unwrap();
    std::fs::write(&key, ca.ca_key_pem()).unwrap();
    let config = ProxyConfig {
      ca_cert_file: cert,
      ca_key_file: key,
      rules_dir: dir.path().join("rules"),
      ..Default::default()
    };
    let server = config.build_server().unwrap();
    assert!(server.rules().request_rules().is_empty());
  }
}
