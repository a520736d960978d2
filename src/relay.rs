//! Request/response relay over one client connection.
use std::sync::Arc;

use http::uri::Scheme;
use tokio::io::{
  AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
  WriteHalf,
};
use tokio_rustls::rustls::ClientConfig;
use tracing::Instrument;

use crate::body::{copy_body, read_body, Body, Framing};
use crate::errors::{protocol, Result};
use crate::pool::{BufferPool, BUF_SIZE};
use crate::request::Request;
use crate::response::Response;
use crate::rule::RuleEngine;
use crate::socket::MaybeTlsStream;

/// What is shared by every connection of a server.
#[derive(Clone)]
pub(crate) struct RelayContext {
  pub(crate) rules: Arc<RuleEngine>,
  pub(crate) upstream_tls: Arc<ClientConfig>,
  pub(crate) pool: BufferPool,
}

struct Upstream {
  reader: BufReader<ReadHalf<MaybeTlsStream>>,
  writer: WriteHalf<MaybeTlsStream>,
}

enum Next {
  KeepAlive,
  Close,
  Upgrade,
}

/// Relay exchanges between `client` and the host it addresses until either
/// side closes, keep-alive ends, or the connection upgrades.
pub(crate) async fn serve<S>(
  client: S,
  scheme: Scheme,
  connect_host: Option<String>,
  ctx: RelayContext,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let (client_read, client_write) = tokio::io::split(client);
  let mut session = Session {
    client_reader: BufReader::new(client_read),
    client_writer: client_write,
    upstream: None,
    scheme,
    connect_host,
    ctx,
  };
  loop {
    let req = match session.read_request().await {
      Ok(Some(req)) => req,
      Ok(None) => return Ok(()),
      Err(e) => {
        tracing::warn!(host = ?session.connect_host, "[MITM] reading request failed: {}", e);
        return Err(e);
      }
    };
    let id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("exchange", %id, method = %req.method(), url = %req.uri());
    let next = match session.exchange(req).instrument(span.clone()).await {
      Ok(next) => next,
      Err(e) => {
        span.in_scope(|| tracing::error!(host = ?session.connect_host, "[MITM] exchange failed: {}", e));
        return Err(e);
      }
    };
    match next {
      Next::KeepAlive => continue,
      Next::Close => {
        session.client_writer.shutdown().await.ok();
        return Ok(());
      }
      Next::Upgrade => {
        return session.pump().instrument(span.clone()).await.inspect_err(|e| {
          span.in_scope(|| tracing::warn!("[MITM] upgraded connection failed: {}", e))
        })
      }
    }
  }
}

struct Session<S> {
  client_reader: BufReader<ReadHalf<S>>,
  client_writer: WriteHalf<S>,
  upstream: Option<Upstream>,
  scheme: Scheme,
  connect_host: Option<String>,
  ctx: RelayContext,
}

impl<S> Session<S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  async fn read_request(&mut self) -> Result<Option<Request>> {
    let mut req = match Request::read_from(&mut self.client_reader).await? {
      Some(req) => req,
      None => return Ok(None),
    };
    req.absolutize(self.scheme.clone(), self.connect_host.as_deref())?;
    Ok(Some(req))
  }

  async fn exchange(&mut self, mut req: Request) -> Result<Next> {
    tracing::info!("request");
    let rules = self.ctx.rules.clone();
    if rules.request_body_needed() {
      buffer_body(&mut self.client_reader, req.body_mut()).await?;
    }
    let mut snapshot = req.snapshot();
    rules.apply_request(&mut req)?;
    // a rule may have rewritten the target into origin form
    req.absolutize(self.scheme.clone(), self.connect_host.as_deref())?;
    if let Body::Buffered(_) = req.body() {
      *snapshot.body_mut() = req.body().clone();
    }

    let upstream = match self.upstream.take() {
      Some(upstream) => upstream,
      None => self.dial(&req).await?,
    };
    let upstream = self.upstream.insert(upstream);

    upstream.writer.write_all(&req.head_to_raw()).await?;
    match req.body() {
      Body::Pending(framing) => {
        copy_body(&mut self.client_reader, &mut upstream.writer, *framing).await?
      }
      Body::Buffered(body) => upstream.writer.write_all(body.bytes()).await?,
      Body::Empty => {}
    }
    upstream.writer.flush().await?;

    let mut resp = Response::read_from(&mut upstream.reader, req.method()).await?;
    // interim responses go straight through
    while resp.status_code().is_informational() && !resp.is_switching_protocols() {
      self.client_writer.write_all(&resp.head_to_raw()).await?;
      resp = Response::read_from(&mut upstream.reader, req.method()).await?;
    }
    if rules.response_body_needed() {
      buffer_body(&mut upstream.reader, resp.body_mut()).await?;
    }
    let close_delimited = resp.body() == &Body::Pending(Framing::Close);
    rules.apply_response(&mut snapshot, &mut resp)?;
    tracing::info!(status = resp.status_code().as_u16(), "response");

    self.client_writer.write_all(&resp.head_to_raw()).await?;
    match resp.body() {
      Body::Pending(framing) => {
        copy_body(&mut upstream.reader, &mut self.client_writer, *framing).await?
      }
      Body::Buffered(body) => self.client_writer.write_all(body.bytes()).await?,
      Body::Empty => {}
    }
    self.client_writer.flush().await?;

    if req.is_websocket() || resp.is_switching_protocols() {
      return Ok(Next::Upgrade);
    }
    if close_delimited || !req.is_keep_alive() {
      return Ok(Next::Close);
    }
    Ok(Next::KeepAlive)
  }

  async fn dial(&self, req: &Request) -> Result<Upstream> {
    let host = req
      .host()
      .or_else(|| self.connect_host.clone())
      .ok_or_else(|| protocol("request has no host"))?;
    let tls = if self.scheme == Scheme::HTTPS {
      Some(self.ctx.upstream_tls.clone())
    } else {
      None
    };
    tracing::debug!(%host, tls = tls.is_some(), "dialing upstream");
    let stream = MaybeTlsStream::dial(&host, tls).await?;
    let (reader, writer) = tokio::io::split(stream);
    Ok(Upstream {
      reader: BufReader::new(reader),
      writer,
    })
  }

  /// Copy raw bytes both ways; the first direction to finish ends both.
  async fn pump(self) -> Result<()> {
    let upstream = self
      .upstream
      .ok_or_else(|| protocol("upgrade without an upstream connection"))?;
    let (tx, mut rx) = tokio::sync::mpsc::channel(2);
    let to_upstream = {
      let tx = tx.clone();
      let pool = self.ctx.pool.clone();
      let (reader, writer) = (self.client_reader, upstream.writer);
      tokio::spawn(async move {
        tx.send(copy_with(reader, writer, pool).await).await.ok();
      })
    };
    let to_client = {
      let pool = self.ctx.pool.clone();
      let (reader, writer) = (upstream.reader, self.client_writer);
      tokio::spawn(async move {
        tx.send(copy_with(reader, writer, pool).await).await.ok();
      })
    };
    let first = rx.recv().await;
    to_upstream.abort();
    to_client.abort();
    match first {
      Some(Ok(n)) => {
        tracing::debug!(bytes = n, "upgraded connection closed");
        Ok(())
      }
      Some(Err(e)) => Err(e.into()),
      None => Ok(()),
    }
  }
}

async fn buffer_body<R>(reader: &mut R, body: &mut Body) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  if let Body::Pending(framing) = body {
    let bytes = read_body(reader, *framing).await?;
    *body = Body::from(bytes);
  }
  Ok(())
}

async fn copy_with<R, W>(mut reader: R, mut writer: W, pool: BufferPool) -> std::io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = pool.get(BUF_SIZE);
  let mut total = 0u64;
  loop {
    let n = reader.read(&mut buf).await?;
    if n == 0 {
      writer.shutdown().await.ok();
      return Ok(total);
    }
    writer.write_all(&buf[..n]).await?;
    writer.flush().await?;
    total += n as u64;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn copy_with_returns_buffer_to_pool() {
    let pool = BufferPool::new();
    let (mut a, b) = tokio::io::duplex(64);
    let (c, mut d) = tokio::io::duplex(64);
    a.write_all(b"frame").await.unwrap();
    drop(a);
    let copied = copy_with(b, c, pool.clone()).await.unwrap();
    assert_eq!(copied, 5);
    let mut out = Vec::new();
    d.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"frame");
    assert_eq!(pool.idle(), 1);
  }

  #[tokio::test]
  async fn buffer_body_materializes_pending() {
    let mut reader = BufReader::new(&b"5\r\nhello\r\n0\r\n\r\n"[..]);
    let mut body = Body::Pending(Framing::Chunked);
    buffer_body(&mut reader, &mut body).await.unwrap();
    assert_eq!(body.text().unwrap(), "hello");
  }
}
