//! Listener and per-connection bootstrap.
use std::path::Path;
use std::sync::Arc;

use http::uri::Scheme;
use http::Method;
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::LazyConfigAcceptor;
use tracing::Instrument;

use crate::ca::{cache_key, CertificateAuthority, CertificateManager, DEFAULT_VALIDITY_HOURS};
use crate::conn::BufferedConn;
use crate::errors::{protocol, Error, Result};
use crate::pool::BufferPool;
use crate::relay::{self, RelayContext};
use crate::request::Request;
use crate::rule::{Rule, RuleEngine};
use crate::tls;

const CONNECT_PREFIX: &[u8] = b"CONNECT";
const TLS_HANDSHAKE: u8 = 0x16;
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// How a freshly accepted connection wants to talk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
  /// A TLS handshake follows; the session is intercepted.
  Tls,
  /// Plain HTTP/1.x.
  Plain,
}

/// Classify a connection from its first bytes.
pub fn classify(prefix: &[u8]) -> Sniffed {
  match prefix.first() {
    Some(&TLS_HANDSHAKE) => Sniffed::Tls,
    _ => Sniffed::Plain,
  }
}

/// An intercepting HTTP/HTTPS proxy.
///
/// Cheap to clone; clones share the certificate cache, rules and buffer
/// pool.
#[derive(Clone)]
pub struct ProxyServer {
  cert_manager: Arc<CertificateManager>,
  context: RelayContext,
}

impl ProxyServer {
  /// Load the root CA from PEM files and serve with the given rules.
  pub fn new<P: AsRef<Path>>(
    ca_cert_path: P,
    ca_key_path: P,
    request_rules: Vec<Rule>,
    response_rules: Vec<Rule>,
  ) -> Result<ProxyServer> {
    let ca = CertificateAuthority::load(ca_cert_path, ca_key_path)?;
    ProxyServer::builder(ca)
      .rules(RuleEngine::new(request_rules, response_rules))
      .build()
  }

  /// Start building a server that signs with `ca`.
  pub fn builder(ca: CertificateAuthority) -> ProxyServerBuilder {
    ProxyServerBuilder {
      ca,
      validity_hours: DEFAULT_VALIDITY_HOURS,
      rules: RuleEngine::default(),
      upstream_tls: None,
      extra_roots: Vec::new(),
    }
  }

  /// The certificate cache.
  pub fn cert_manager(&self) -> &CertificateManager {
    &self.cert_manager
  }

  /// The compiled rules.
  pub fn rules(&self) -> &RuleEngine {
    &self.context.rules
  }

  /// Accept connections on `addr` forever, one task per connection.
  pub async fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("[MITM] listening on {}", listener.local_addr()?);
    self.serve(listener).await
  }

  /// Accept connections from an already bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          tracing::error!("[MITM] accept failed: {}", e);
          continue;
        }
      };
      let server = self.clone();
      tokio::spawn(async move {
        match server.handle_connection(stream).await {
          Ok(()) => tracing::debug!(%peer, "[MITM] connection closed"),
          Err(e) => tracing::debug!(%peer, "[MITM] connection aborted: {}", e),
        }
      });
    }
  }

  /// Serve one client connection to completion.
  ///
  /// Failures before the first request are logged here; exchange failures
  /// are logged by the relay.
  pub async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let peer = stream
      .peer_addr()
      .map(|a| a.to_string())
      .unwrap_or_else(|_| "-".to_string());
    self
      .dispatch(stream)
      .instrument(tracing::info_span!("connection", %peer))
      .await
  }

  async fn dispatch(&self, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut conn = BufferedConn::new(stream);
    let mut connect_host = None;
    let prefix = conn
      .peek(CONNECT_PREFIX.len())
      .await
      .map_err(|e| aborted("peek", None, e.into()))?;
    if prefix == CONNECT_PREFIX {
      let (next, host) = accept_connect(conn)
        .await
        .map_err(|e| aborted("CONNECT", None, e))?;
      conn = next;
      connect_host = Some(host);
    }
    let first = conn
      .peek(1)
      .await
      .map_err(|e| aborted("peek", connect_host.as_deref(), e.into()))?;
    if first.is_empty() {
      return Ok(());
    }
    match classify(first) {
      Sniffed::Tls => self.intercept(conn, connect_host).await,
      Sniffed::Plain => {
        relay::serve(conn, Scheme::HTTP, connect_host, self.context.clone()).await
      }
    }
  }

  async fn intercept(
    &self,
    conn: BufferedConn<TcpStream>,
    connect_host: Option<String>,
  ) -> Result<()> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), conn)
      .await
      .map_err(|e| aborted("TLS handshake", connect_host.as_deref(), e.into()))?;
    let sni = start.client_hello().server_name().map(|s| s.to_string());
    let host = connect_host
      .as_deref()
      .map(cache_key)
      .or(sni)
      .ok_or_else(|| aborted("TLS handshake", None, protocol("no host for TLS interception")))?;
    let leaf = self
      .cert_manager
      .get_server_cert(&host)
      .await
      .map_err(|e| aborted("certificate", Some(&host), e))?;
    let config = tls::server_config(&leaf).map_err(|e| aborted("certificate", Some(&host), e))?;
    let stream = start
      .into_stream(Arc::new(config))
      .await
      .map_err(|e| aborted("TLS handshake", Some(&host), e.into()))?;
    tracing::debug!(%host, "TLS session intercepted");
    let fallback = connect_host.unwrap_or(host);
    relay::serve(stream, Scheme::HTTPS, Some(fallback), self.context.clone()).await
  }
}

fn aborted(stage: &str, host: Option<&str>, e: Error) -> Error {
  tracing::warn!(host = host.unwrap_or("-"), "[MITM] {} failed: {}", stage, e);
  e
}

/// Read the CONNECT head, answer it, and hand back the connection with
/// anything the client sent after the head still unread.
async fn accept_connect(
  conn: BufferedConn<TcpStream>,
) -> Result<(BufferedConn<TcpStream>, String)> {
  let mut reader = BufReader::new(conn);
  let req = Request::read_from(&mut reader)
    .await?
    .ok_or_else(|| protocol("connection closed inside CONNECT"))?;
  if req.method() != Method::CONNECT {
    return Err(protocol(format!("expected CONNECT, got {}", req.method())));
  }
  let host = req
    .uri()
    .authority()
    .map(|a| a.to_string())
    .ok_or_else(|| protocol("CONNECT without a target"))?;
  let mut leftover = reader.buffer().to_vec();
  let (mut inner, rest) = reader.into_inner().into_parts();
  leftover.extend_from_slice(&rest);
  inner.write_all(CONNECT_ESTABLISHED).await?;
  inner.flush().await?;
  tracing::debug!(%host, "CONNECT tunnel established");
  Ok((BufferedConn::with_prefix(inner, &leftover), host))
}

/// Builder for [`ProxyServer`].
pub struct ProxyServerBuilder {
  ca: CertificateAuthority,
  validity_hours: i64,
  rules: RuleEngine,
  upstream_tls: Option<ClientConfig>,
  extra_roots: Vec<CertificateDer<'static>>,
}

impl ProxyServerBuilder {
  /// Lifetime of forged leaf certificates, in hours.
  pub fn validity_hours(mut self, hours: i64) -> Self {
    self.validity_hours = hours;
    self
  }
  /// Rules applied to every exchange.
  pub fn rules(mut self, rules: RuleEngine) -> Self {
    self.rules = rules;
    self
  }
  /// TLS config used to dial upstream hosts, replacing the platform roots.
  pub fn upstream_tls(mut self, config: ClientConfig) -> Self {
    self.upstream_tls = Some(config);
    self
  }
  /// Trust `cert` for upstream connections in addition to the platform
  /// roots.
  pub fn add_upstream_root(mut self, cert: CertificateDer<'static>) -> Self {
    self.extra_roots.push(cert);
    self
  }
  /// Build the server.
  pub fn build(self) -> Result<ProxyServer> {
    let upstream_tls = match self.upstream_tls {
      Some(config) => config,
      None => tls::upstream_config(&self.extra_roots)?,
    };
    Ok(ProxyServer {
      cert_manager: Arc::new(CertificateManager::new(self.ca, self.validity_hours)),
      context: RelayContext {
        rules: Arc::new(self.rules),
        upstream_tls: Arc::new(upstream_tls),
        pool: BufferPool::new(),
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;
  use tokio::io::AsyncReadExt;

  #[derive(Clone, Default)]
  struct Captured(Arc<Mutex<Vec<u8>>>);

  impl std::io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
    type Writer = Captured;
    fn make_writer(&'a self) -> Self::Writer {
      self.clone()
    }
  }

  #[test]
  fn classifies_by_first_byte() {
    assert_eq!(classify(&[0x16, 0x03, 0x01]), Sniffed::Tls);
    assert_eq!(classify(b"GET / HTTP/1.1"), Sniffed::Plain);
  }

  #[tokio::test]
  async fn connect_is_answered_and_leftover_kept() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move {
      let mut stream = TcpStream::connect(addr).await.unwrap();
      stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01")
        .await
        .unwrap();
      let mut reply = [0u8; 19];
      stream.read_exact(&mut reply).await.unwrap();
      reply
    });
    let (stream, _) = listener.accept().await.unwrap();
    let (mut conn, host) = accept_connect(BufferedConn::new(stream)).await.unwrap();
    assert_eq!(host, "example.com:443");
    assert_eq!(&client.await.unwrap(), CONNECT_ESTABLISHED);
    assert_eq!(conn.peek(3).await.unwrap(), b"\x16\x03\x01");
    assert_eq!(classify(conn.buffered()), Sniffed::Tls);
  }

  #[tokio::test]
  async fn failed_handshake_is_logged_with_peer_and_host() {
    let logs = Captured::default();
    let subscriber = tracing_subscriber::fmt()
      .with_writer(logs.clone())
      .with_ansi(false)
      .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let ca = CertificateAuthority::generate("log test").unwrap();
    let server = ProxyServer::builder(ca).build().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move {
      let mut stream = TcpStream::connect(addr).await.unwrap();
      stream
        .write_all(b"CONNECT broken.test:443 HTTP/1.1\r\n\r\n\x16\x03\x01\x00\x01\x00")
        .await
        .unwrap();
      stream.shutdown().await.unwrap();
      let mut rest = Vec::new();
      stream.read_to_end(&mut rest).await.ok();
    });
    let (stream, peer) = listener.accept().await.unwrap();
    assert!(server.handle_connection(stream).await.is_err());
    client.await.unwrap();

    let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(out.contains("WARN"), "{}", out);
    assert!(out.contains("TLS handshake failed"), "{}", out);
    assert!(out.contains("broken.test:443"), "{}", out);
    assert!(out.contains(&peer.to_string()), "{}", out);
  }
}
