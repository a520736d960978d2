use std::io::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::ca::cache_key;
use crate::errors::{self, Result};

/// Connection to the upstream host.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// Connect to `host` (`name` or `name:port`), wrapping the socket in TLS
  /// when `tls` is given. The default port is 443 with TLS and 80 without.
  pub(crate) async fn dial(host: &str, tls: Option<Arc<ClientConfig>>) -> Result<MaybeTlsStream> {
    let addr = with_default_port(host, if tls.is_some() { 443 } else { 80 });
    let dial_error = |source: std::io::Error| errors::Error::Dial {
      addr: addr.clone(),
      source,
    };
    let tcp = TcpStream::connect(&addr).await.map_err(dial_error)?;
    tcp.set_nodelay(true).map_err(dial_error)?;
    let config = match tls {
      Some(config) => config,
      None => return Ok(MaybeTlsStream::Tcp(tcp)),
    };
    let name = ServerName::try_from(cache_key(host))
      .map_err(|e| errors::protocol(format!("invalid server name {:?}: {}", host, e)))?;
    let stream = TlsConnector::from(config)
      .connect(name, tcp)
      .await
      .map_err(dial_error)?;
    Ok(MaybeTlsStream::Tls(Box::new(stream)))
  }
}

fn with_default_port(host: &str, port: u16) -> String {
  if cache_key(host) == host {
    if host.contains(':') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    }
  } else {
    host.to_string()
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::result::Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_port_is_added_once() {
    assert_eq!(with_default_port("example.com", 443), "example.com:443");
    assert_eq!(with_default_port("example.com:8443", 443), "example.com:8443");
    assert_eq!(with_default_port("[::1]:8080", 80), "[::1]:8080");
    assert_eq!(with_default_port("::1", 80), "[::1]:80");
  }

  #[tokio::test]
  async fn dial_failure_names_the_address() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = MaybeTlsStream::dial(&addr.to_string(), None)
      .await
      .unwrap_err();
    match err {
      errors::Error::Dial { addr: dialed, .. } => assert_eq!(dialed, addr.to_string()),
      other => panic!("unexpected error {:?}", other),
    }
  }
}
