use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A connection together with bytes already read off it while sniffing.
///
/// Reads drain the held bytes before touching the raw connection. Writes,
/// flush and shutdown go straight to the raw connection.
#[derive(Debug)]
pub struct BufferedConn<S> {
  inner: S,
  buffer: BytesMut,
}

impl<S> BufferedConn<S> {
  /// Wrap a raw connection with nothing buffered.
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      buffer: BytesMut::new(),
    }
  }
  /// Wrap a raw connection that already had `prefix` read from it.
  pub fn with_prefix(inner: S, prefix: &[u8]) -> Self {
    Self {
      inner,
      buffer: BytesMut::from(prefix),
    }
  }
  /// Bytes held but not yet consumed.
  pub fn buffered(&self) -> &[u8] {
    &self.buffer
  }
  /// Drop the first `n` held bytes.
  pub fn consume(&mut self, n: usize) {
    let n = std::cmp::min(n, self.buffer.len());
    self.buffer.advance(n);
  }
  /// Raw connection, for socket options.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
  /// Raw connection, mutably.
  pub fn get_mut(&mut self) -> &mut S {
    &mut self.inner
  }
  /// Give back the raw connection and whatever is still buffered.
  pub fn into_parts(self) -> (S, BytesMut) {
    (self.inner, self.buffer)
  }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
  /// Look at the first `n` bytes without consuming them.
  ///
  /// Returns fewer than `n` bytes only when the peer closed the connection.
  pub async fn peek(&mut self, n: usize) -> std::io::Result<&[u8]> {
    while self.buffer.len() < n {
      let read = self.inner.read_buf(&mut self.buffer).await?;
      if read == 0 {
        break;
      }
    }
    let end = std::cmp::min(n, self.buffer.len());
    Ok(&self.buffer[..end])
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedConn<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.buffer.is_empty() {
      let n = std::cmp::min(self.buffer.len(), buf.remaining());
      buf.put_slice(&self.buffer[..n]);
      self.buffer.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedConn<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  #[tokio::test]
  async fn peek_does_not_consume() {
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"CONNECT example.com:443").await.unwrap();
    drop(client);
    let mut conn = BufferedConn::new(server);
    assert_eq!(conn.peek(7).await.unwrap(), b"CONNECT");
    assert_eq!(conn.peek(7).await.unwrap(), b"CONNECT");
    let mut all = Vec::new();
    conn.read_to_end(&mut all).await.unwrap();
    assert_eq!(all, b"CONNECT example.com:443");
  }

  #[tokio::test]
  async fn short_stream_peeks_what_it_has() {
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"GET").await.unwrap();
    drop(client);
    let mut conn = BufferedConn::new(server);
    assert_eq!(conn.peek(7).await.unwrap(), b"GET");
  }

  #[tokio::test]
  async fn writes_pass_through() {
    let (client, server) = tokio::io::duplex(64);
    let mut conn = BufferedConn::with_prefix(server, b"held");
    conn.write_all(b"pong").await.unwrap();
    drop(conn);
    let mut client = client;
    let mut got = Vec::new();
    client.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, b"pong");
  }
}
