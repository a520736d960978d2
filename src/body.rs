use std::fmt;
use std::io::{ErrorKind, Read};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf,
};

use crate::errors::{new_io_error, protocol, Result};
use crate::CR_LF;

/// A materialized body that replays its content after every end-of-stream.
///
/// Each consumer reads from offset zero to the end. The read that observes
/// end-of-stream returns `0` and rewinds the cursor, so the next consumer sees
/// the complete payload again. Only one consumer may read at a time.
#[derive(Clone, PartialEq)]
pub struct ReusableReader {
  data: Bytes,
  offset: usize,
}

impl ReusableReader {
  /// Wrap an already materialized payload.
  pub fn new<B: Into<Bytes>>(data: B) -> Self {
    Self {
      data: data.into(),
      offset: 0,
    }
  }
  /// Drain `reader` completely and keep the bytes for replay.
  pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(Self::new(data))
  }
  /// Run one full read cycle and return what it produced.
  pub fn read_cycle(&mut self) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(self.data.len());
    Read::read_to_end(self, &mut out)?;
    Ok(out)
  }
  /// The underlying payload, independent of the cursor.
  pub fn bytes(&self) -> &Bytes {
    &self.data
  }
  /// Payload length in bytes.
  pub fn len(&self) -> usize {
    self.data.len()
  }
  /// Returns `true` when the payload is empty.
  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  fn fill(&mut self, out: &mut [u8]) -> usize {
    if self.offset >= self.data.len() {
      self.offset = 0;
      return 0;
    }
    let n = std::cmp::min(out.len(), self.data.len() - self.offset);
    out[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
    self.offset += n;
    n
  }
}

impl Read for ReusableReader {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    Ok(self.fill(buf))
  }
}

impl AsyncRead for ReusableReader {
  fn poll_read(
    self: Pin<&mut Self>,
    _cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if buf.remaining() == 0 {
      return Poll::Ready(Ok(()));
    }
    let n = this.fill(buf.initialize_unfilled());
    buf.advance(n);
    Poll::Ready(Ok(()))
  }
}

impl fmt::Debug for ReusableReader {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ReusableReader")
      .field("len", &self.data.len())
      .field("offset", &self.offset)
      .finish()
  }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// No body follows the head.
  None,
  /// Exactly this many bytes follow.
  Length(u64),
  /// `Transfer-Encoding: chunked`.
  Chunked,
  /// The body runs until the peer closes the connection.
  Close,
}

/// A message body.
///
/// A body starts out `Pending`: its bytes are still on the wire and will be
/// streamed to the peer in their original framing. Rules that read or replace
/// the body turn it into `Buffered`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
  /// No body.
  #[default]
  Empty,
  /// Not read yet; the framing says how to find its end.
  Pending(Framing),
  /// Fully read into memory.
  Buffered(ReusableReader),
}

impl Body {
  /// Whether the bytes still have to be pulled from the connection.
  pub fn is_pending(&self) -> bool {
    matches!(self, Body::Pending(f) if *f != Framing::None)
  }
  /// Read the whole body through one cycle, leaving it replayable.
  ///
  /// Pending bodies read as empty.
  pub fn raw(&mut self) -> std::io::Result<Bytes> {
    match self {
      Body::Buffered(reader) => reader.read_cycle().map(Bytes::from),
      _ => Ok(Bytes::new()),
    }
  }
  /// Like [`Body::raw`], decoded lossily for display.
  pub fn text(&mut self) -> std::io::Result<String> {
    let raw = self.raw()?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body::Buffered(ReusableReader::new(b))
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    Body::Buffered(ReusableReader::new(s))
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Body::Buffered(ReusableReader::new(Bytes::from_static(s.as_bytes())))
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body::Buffered(ReusableReader::new(v))
  }
}

/// Read a body delimited by `framing` fully into memory, decoding chunks.
pub(crate) async fn read_body<R>(reader: &mut R, framing: Framing) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  match framing {
    Framing::None => {}
    Framing::Length(len) => {
      (&mut *reader).take(len).read_to_end(&mut body).await?;
      if (body.len() as u64) < len {
        return Err(new_io_error(
          ErrorKind::UnexpectedEof,
          "body shorter than content-length",
        ));
      }
    }
    Framing::Chunked => {
      body = read_chunked_body(reader).await?;
    }
    Framing::Close => {
      reader.read_to_end(&mut body).await?;
    }
  }
  Ok(Bytes::from(body))
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    read_line(reader, &mut line).await?;
    let size = chunk_size(&line)?;
    if size == 0 {
      // trailers
      loop {
        line.clear();
        read_line(reader, &mut line).await?;
        if line == CR_LF || line == b"\n" {
          break;
        }
      }
      break;
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    line.clear();
    read_line(reader, &mut line).await?;
  }
  Ok(body)
}

/// Stream a body from `reader` to `writer` in its original framing.
pub(crate) async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: Framing) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  match framing {
    Framing::None => {}
    Framing::Length(len) => {
      let copied = tokio::io::copy(&mut (&mut *reader).take(len), writer).await?;
      if copied < len {
        return Err(new_io_error(
          ErrorKind::UnexpectedEof,
          "body shorter than content-length",
        ));
      }
    }
    Framing::Chunked => {
      let mut line = Vec::new();
      loop {
        line.clear();
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await?;
        let size = chunk_size(&line)?;
        if size == 0 {
          loop {
            line.clear();
            read_line(reader, &mut line).await?;
            writer.write_all(&line).await?;
            if line == CR_LF || line == b"\n" {
              break;
            }
          }
          break;
        }
        // chunk data plus its CRLF
        let copied = tokio::io::copy(&mut (&mut *reader).take(size as u64 + 2), writer).await?;
        if copied < size as u64 + 2 {
          return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunk"));
        }
      }
    }
    Framing::Close => {
      tokio::io::copy(reader, writer).await?;
    }
  }
  Ok(())
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  if reader.read_until(b'\n', line).await? == 0 {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "connection closed inside chunked body",
    ));
  }
  Ok(())
}

fn chunk_size(line: &[u8]) -> Result<usize> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let size = line.split(|b| *b == b';').next().unwrap_or_default();
  let size = std::str::from_utf8(size)
    .map_err(|_| protocol("invalid chunk size"))?
    .trim();
  usize::from_str_radix(size, 16).map_err(|_| protocol(format!("invalid chunk size {:?}", size)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[test]
  fn replays_after_end_of_stream() {
    let payload = b"secret-data".to_vec();
    let mut reader = ReusableReader::new(payload.clone());
    for _ in 0..4 {
      let mut out = Vec::new();
      Read::read_to_end(&mut reader, &mut out).unwrap();
      assert_eq!(out, payload);
    }
  }

  #[test]
  fn replays_with_small_reads() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let mut reader = ReusableReader::new(payload.clone());
    for _ in 0..3 {
      let mut out = Vec::new();
      let mut buf = [0u8; 7];
      loop {
        let n = Read::read(&mut reader, &mut buf).unwrap();
        if n == 0 {
          break;
        }
        out.extend_from_slice(&buf[..n]);
      }
      assert_eq!(out, payload);
    }
  }

  #[test]
  fn empty_payload_is_always_eof() {
    let mut reader = ReusableReader::new(Vec::new());
    assert!(reader.read_cycle().unwrap().is_empty());
    assert!(reader.read_cycle().unwrap().is_empty());
  }

  #[tokio::test]
  async fn async_reads_replay() {
    let mut reader = ReusableReader::from_reader(&b"hello"[..]).unwrap();
    for _ in 0..2 {
      let mut out = Vec::new();
      tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
        .await
        .unwrap();
      assert_eq!(out, b"hello");
    }
  }

  #[tokio::test]
  async fn decodes_chunked_body_with_trailer() {
    let wire = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";
    let mut reader = BufReader::new(&wire[..]);
    let body = read_body(&mut reader, Framing::Chunked).await.unwrap();
    assert_eq!(&body[..], b"hello world");
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"NEXT");
  }

  #[tokio::test]
  async fn copies_chunked_body_verbatim() {
    let wire = b"3\r\nabc\r\n0\r\n\r\nGET";
    let mut reader = BufReader::new(&wire[..]);
    let mut out = Vec::new();
    copy_body(&mut reader, &mut out, Framing::Chunked)
      .await
      .unwrap();
    assert_eq!(out, b"3\r\nabc\r\n0\r\n\r\n");
  }

  #[tokio::test]
  async fn short_content_length_is_an_error() {
    let mut reader = BufReader::new(&b"abc"[..]);
    assert!(read_body(&mut reader, Framing::Length(10)).await.is_err());
  }
}
