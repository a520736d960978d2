#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # mitm-relay
//!
//! An intercepting HTTP/HTTPS proxy that runs compiled rules over every
//! exchange it relays.
//!
//! Clients connect with plain HTTP, with `CONNECT` tunnels, or with TLS
//! directly. TLS sessions are terminated with a leaf certificate forged on
//! the fly and signed by a root CA the client trusts; the proxy then talks
//! TLS to the real host.
//!
//! - Request rules run before a request is forwarded upstream
//! - Response rules run before a response is handed back to the client
//! - A rule either rejects the exchange or runs a small mutation script
//! - WebSocket upgrades are relayed as raw bytes
//!
//! ## Rules
//!
//! Rules are loaded from YAML files, see [`compile_rules`]:
//!
//! ```yaml
//! enabled: true
//! rules:
//!   - name: block-admin
//!     change: request
//!     enabled: true
//!     rule: req.path.startsWith("/admin")
//!     action: reject
//!   - name: tag-json
//!     change: response
//!     enabled: true
//!     rule: resp.headers["Content-Type"].contains("json")
//!     action: script
//!     script: resp.set_header("X-Seen-By", "mitm-relay")
//! ```
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> mitm_relay::Result<()> {
//! use std::collections::HashMap;
//! let (request_rules, response_rules) = mitm_relay::compile_rules("proxy_rules", &HashMap::new())?;
//! let server = mitm_relay::ProxyServer::new("ca.pem", "ca.key", request_rules, response_rules)?;
//! server.run("127.0.0.1:9999").await
//! # }
//! ```
mod body;
/// Root CA and forged leaf certificates
pub mod ca;
mod config;
mod conn;
mod errors;
mod pool;
mod relay;
mod request;
mod response;
/// Compiled rules
pub mod rule;
mod server;
mod socket;
/// TLS configuration
pub mod tls;

pub use body::{Body, Framing, ReusableReader};
pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use config::{ProxyConfig, DEFAULT_LISTEN_ADDR, DEFAULT_RULES_DIR};
pub use conn::BufferedConn;
pub use errors::{Error, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use pool::{BufferPool, PooledBuf, BUF_SIZE, FAST_TIER_CAPACITY};
pub use request::Request;
pub use response::Response;
pub use rule::{apply_rules, compile_rules, Direction, Rule, RuleEngine};
pub use server::{classify, ProxyServer, ProxyServerBuilder, Sniffed};
pub use socket::MaybeTlsStream;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
