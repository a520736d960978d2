use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::{Body, Framing};
use crate::errors::{new_io_error, protocol, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Largest request or response head accepted, in bytes.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// A response read from the upstream host.
#[derive(Clone, PartialEq)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  headers: HeaderMap<HeaderValue>,
  body: Body,
}

impl Debug for Response {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("version", &self.version)
      .field("status_code", &self.status_code)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl Default for Response {
  fn default() -> Self {
    Response {
      version: Version::HTTP_11,
      status_code: StatusCode::OK,
      headers: HeaderMap::new(),
      body: Body::Empty,
    }
  }
}

impl Response {
  /// A response with the given status and no headers.
  pub fn new(status_code: StatusCode) -> Self {
    Response {
      status_code,
      ..Default::default()
    }
  }
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get a mutable reference to the status code.
  #[inline]
  pub fn status_code_mut(&mut self) -> &mut StatusCode {
    &mut self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body of this `Response`.
  pub fn body(&self) -> &Body {
    &self.body
  }
  /// Get a mutable reference to the body of this `Response`.
  pub fn body_mut(&mut self) -> &mut Body {
    &mut self.body
  }
  /// Whether the upstream agreed to switch protocols.
  pub fn is_switching_protocols(&self) -> bool {
    self.status_code == StatusCode::SWITCHING_PROTOCOLS
  }

  /// Serialize the status line and headers.
  ///
  /// A buffered body is announced with its exact length.
  pub(crate) fn head_to_raw(&mut self) -> Bytes {
    if let Body::Buffered(b) = &self.body {
      self.headers.remove(http::header::TRANSFER_ENCODING);
      self
        .headers
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
    }
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(
      self
        .status_code
        .canonical_reason()
        .unwrap_or_default()
        .as_bytes(),
    );
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    Bytes::from(http_response)
  }

  /// Read a response head; the body is left `Pending` on the reader.
  ///
  /// `method` is the method of the request this answers.
  pub(crate) async fn read_from<R>(reader: &mut R, method: &Method) -> Result<Response>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "upstream closed before sending a response",
      ));
    }
    let (version, status_code) = parser_status_line(&line)?;
    let headers = read_headers(reader, line.len()).await?;
    let mut response = Response {
      version,
      status_code,
      headers,
      body: Body::Empty,
    };
    response.body = match response.framing(method) {
      Framing::None => Body::Empty,
      framing => Body::Pending(framing),
    };
    Ok(response)
  }

  fn framing(&self, method: &Method) -> Framing {
    if matches!(*method, Method::HEAD)
      || self.status_code.is_informational()
      || self.status_code == StatusCode::NO_CONTENT
      || self.status_code == StatusCode::NOT_MODIFIED
    {
      return Framing::None;
    }
    if is_chunked(&self.headers) {
      return Framing::Chunked;
    }
    match content_length(&self.headers) {
      Some(0) => Framing::None,
      Some(len) => Framing::Length(len),
      None => Framing::Close,
    }
  }
}

fn parser_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parser_version(parts.next().unwrap_or_default())?;
  let status_code = parts
    .next()
    .filter(|s| !s.is_empty())
    .ok_or_else(|| protocol("missing status code"))?;
  let status_code =
    StatusCode::from_bytes(status_code).map_err(|x| Error::Http(http::Error::from(x)))?;
  Ok((version, status_code))
}

pub(crate) fn parser_version(vc: &[u8]) -> Result<Version> {
  match vc {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(protocol(format!(
      "unsupported http version {:?}",
      String::from_utf8_lossy(vc)
    ))),
  }
}

/// Read header lines up to the blank line that ends the head.
pub(crate) async fn read_headers<R>(reader: &mut R, mut head_size: usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let length = reader.read_until(b'\n', &mut header_line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside message head",
      ));
    }
    head_size += length;
    if head_size > MAX_HEAD_SIZE {
      return Err(protocol("message head exceeds maximum allowed size"));
    }
    if header_line == CR_LF || header_line == b"\n" {
      break;
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\r").unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |s| s == &b':');
  let name = parts.next().unwrap_or_default();
  let value = parts
    .next()
    .ok_or_else(|| protocol(format!("malformed header line {:?}", buffer.escape_ascii().to_string())))?;
  let value = value.trim_ascii();
  let k = http::HeaderName::from_bytes(name)?;
  let v = http::HeaderValue::from_bytes(value)?;
  Ok((k, v))
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|x| x.to_str().ok()?.trim().parse().ok())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn reads_head_and_leaves_body_pending() {
    let wire = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello";
    let mut reader = BufReader::new(&wire[..]);
    let resp = Response::read_from(&mut reader, &Method::GET).await.unwrap();
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/html");
    assert_eq!(resp.body(), &Body::Pending(Framing::Length(5)));
  }

  #[tokio::test]
  async fn head_and_no_content_have_no_body() {
    let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let resp = Response::read_from(&mut reader, &Method::HEAD).await.unwrap();
    assert_eq!(resp.body(), &Body::Empty);

    let wire = b"HTTP/1.1 204 No Content\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let resp = Response::read_from(&mut reader, &Method::GET).await.unwrap();
    assert_eq!(resp.body(), &Body::Empty);
  }

  #[tokio::test]
  async fn unframed_body_is_close_delimited() {
    let wire = b"HTTP/1.0 200 OK\r\n\r\nrest";
    let mut reader = BufReader::new(&wire[..]);
    let resp = Response::read_from(&mut reader, &Method::GET).await.unwrap();
    assert_eq!(resp.body(), &Body::Pending(Framing::Close));
  }

  #[tokio::test]
  async fn rejects_garbage_status_line() {
    let mut reader = BufReader::new(&b"SSH-2.0-OpenSSH\r\n\r\n"[..]);
    assert!(Response::read_from(&mut reader, &Method::GET).await.is_err());
  }

  #[test]
  fn buffered_body_rewrites_framing_headers() {
    let mut resp = Response::new(StatusCode::OK);
    resp
      .headers_mut()
      .insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    *resp.body_mut() = Body::from("patched");
    let raw = resp.head_to_raw();
    let raw = String::from_utf8(raw.to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.contains("content-length: 7\r\n"));
    assert!(!raw.contains("transfer-encoding"));
  }
}
