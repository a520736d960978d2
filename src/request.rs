use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{HeaderMap, HeaderValue, Method, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::{Body, Framing};
use crate::errors::{protocol, Result};
use crate::response::{content_length, is_chunked, parser_version, read_headers, MAX_HEAD_SIZE};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A request read from the client.
#[derive(Clone, PartialEq)]
pub struct Request {
  method: Method,
  uri: Uri,
  version: Version,
  headers: HeaderMap<HeaderValue>,
  body: Body,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("method", &self.method)
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl Default for Request {
  fn default() -> Self {
    Request {
      method: Method::GET,
      uri: Uri::from_static("/"),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: Body::Empty,
    }
  }
}

impl Request {
  /// Constructs a new request.
  #[inline]
  pub fn new(method: Method, uri: Uri) -> Self {
    Request {
      method,
      uri,
      ..Default::default()
    }
  }
  /// Get the method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get a mutable reference to the method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the uri.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Get a mutable reference to the uri.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut Uri {
    &mut self.uri
  }
  /// Get the http version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body.
  #[inline]
  pub fn body(&self) -> &Body {
    &self.body
  }
  /// Get a mutable reference to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Body {
    &mut self.body
  }
  /// Host the client addressed, port included when given.
  ///
  /// The `Host` header wins over the request-target authority.
  pub fn host(&self) -> Option<String> {
    self
      .headers
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
      .filter(|h| !h.is_empty())
      .map(|h| h.to_string())
      .or_else(|| self.uri.authority().map(|a| a.to_string()))
  }
  /// Whether the client asked to keep the connection open.
  pub fn is_keep_alive(&self) -> bool {
    header_equals(&self.headers, http::header::CONNECTION, "keep-alive")
      || header_equals(&self.headers, "proxy-connection", "keep-alive")
  }
  /// Whether the client asked to upgrade to a WebSocket.
  pub fn is_websocket(&self) -> bool {
    header_equals(&self.headers, http::header::UPGRADE, "websocket")
  }
  /// A copy of the head with no body attached.
  pub fn snapshot(&self) -> Request {
    Request {
      method: self.method.clone(),
      uri: self.uri.clone(),
      version: self.version,
      headers: self.headers.clone(),
      body: Body::Empty,
    }
  }

  /// Turn an origin-form target into an absolute URI.
  pub(crate) fn absolutize(&mut self, scheme: Scheme, fallback_host: Option<&str>) -> Result<()> {
    if self.uri.scheme().is_some() {
      return Ok(());
    }
    let host = self
      .host()
      .or_else(|| fallback_host.map(|h| h.to_string()))
      .ok_or_else(|| protocol("request has no host"))?;
    let authority: Authority = host.parse()?;
    let mut parts = self.uri.clone().into_parts();
    parts.scheme = Some(scheme);
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
      parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    self.uri = Uri::from_parts(parts).map_err(|e| http::Error::from(e))?;
    Ok(())
  }

  /// Serialize the request line and headers in origin form.
  ///
  /// A buffered body is announced with its exact length.
  pub(crate) fn head_to_raw(&mut self) -> Bytes {
    if let Body::Buffered(b) = &self.body {
      self.headers.remove(http::header::TRANSFER_ENCODING);
      self
        .headers
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
    }
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    match self.uri.path_and_query() {
      Some(pq) if !pq.as_str().is_empty() => http_requests.extend(pq.as_str().as_bytes()),
      _ => http_requests.extend(b"/"),
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(http::header::HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(authority.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    for (k, v) in self.headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    Bytes::from(http_requests)
  }

  /// Read a request head; the body is left `Pending` on the reader.
  ///
  /// Returns `None` when the peer closed the connection before sending
  /// anything.
  pub(crate) async fn read_from<R>(reader: &mut R) -> Result<Option<Request>>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut line = Vec::new();
    let mut head_size = 0;
    // tolerate stray CRLFs between pipelined requests
    loop {
      line.clear();
      let n = reader.read_until(b'\n', &mut line).await?;
      if n == 0 {
        return Ok(None);
      }
      head_size += n;
      if head_size > MAX_HEAD_SIZE {
        return Err(protocol("request line too long"));
      }
      if line != CR_LF && line != b"\n" {
        break;
      }
    }
    let (method, uri, version) = parser_request_line(&line)?;
    let headers = read_headers(reader, head_size).await?;
    let mut request = Request {
      method,
      uri,
      version,
      headers,
      body: Body::Empty,
    };
    request.body = match request.framing() {
      Framing::None => Body::Empty,
      framing => Body::Pending(framing),
    };
    Ok(Some(request))
  }

  fn framing(&self) -> Framing {
    if is_chunked(&self.headers) {
      return Framing::Chunked;
    }
    match content_length(&self.headers) {
      Some(len) if len > 0 => Framing::Length(len),
      _ => Framing::None,
    }
  }
}

fn parser_request_line(line: &[u8]) -> Result<(Method, Uri, Version)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let parts: Vec<&[u8]> = line.split(|b| b == &b' ').filter(|p| !p.is_empty()).collect();
  if parts.len() != 3 {
    return Err(protocol(format!(
      "invalid request line {:?}",
      line.escape_ascii().to_string()
    )));
  }
  let method = Method::from_bytes(parts[0]).map_err(|e| http::Error::from(e))?;
  let uri = if method == Method::CONNECT {
    // authority-form
    let authority = Authority::try_from(parts[1])?;
    Uri::from(authority)
  } else {
    Uri::try_from(parts[1])?
  };
  let version = parser_version(parts[2])?;
  Ok((method, uri, version))
}

fn header_equals<K: http::header::AsHeaderName>(headers: &HeaderMap, key: K, expected: &str) -> bool {
  headers
    .get(key)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().eq_ignore_ascii_case(expected))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn reads_absolute_form_request() {
    let wire = b"POST http://example.com/submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 11\r\nProxy-Connection: keep-alive\r\n\r\nsecret-data";
    let mut reader = BufReader::new(&wire[..]);
    let req = Request::read_from(&mut reader).await.unwrap().unwrap();
    assert_eq!(req.method(), Method::POST);
    assert_eq!(req.uri().path(), "/submit");
    assert_eq!(req.host().as_deref(), Some("example.com"));
    assert!(req.is_keep_alive());
    assert!(!req.is_websocket());
    assert_eq!(req.body(), &Body::Pending(Framing::Length(11)));
  }

  #[tokio::test]
  async fn reads_connect_authority() {
    let wire = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let req = Request::read_from(&mut reader).await.unwrap().unwrap();
    assert_eq!(req.method(), Method::CONNECT);
    assert_eq!(req.uri().authority().unwrap().as_str(), "example.com:443");
  }

  #[tokio::test]
  async fn eof_before_request_is_none() {
    let mut reader = BufReader::new(&b""[..]);
    assert!(Request::read_from(&mut reader).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn malformed_request_line_is_protocol_error() {
    let mut reader = BufReader::new(&b"GARBAGE\r\n\r\n"[..]);
    assert!(Request::read_from(&mut reader).await.is_err());
  }

  #[test]
  fn absolutize_and_serialize_origin_form() {
    let mut req = Request::new(Method::GET, Uri::from_static("/index?q=1"));
    req
      .headers_mut()
      .insert(http::header::HOST, HeaderValue::from_static("example.com"));
    req.absolutize(Scheme::HTTPS, None).unwrap();
    assert_eq!(req.uri().to_string(), "https://example.com/index?q=1");
    let raw = req.head_to_raw();
    assert!(raw.starts_with(b"GET /index?q=1 HTTP/1.1\r\nhost: example.com\r\n"));
  }

  #[test]
  fn absolutize_falls_back_to_tunnel_host() {
    let mut req = Request::new(Method::GET, Uri::from_static("/"));
    req.absolutize(Scheme::HTTPS, Some("example.com:443")).unwrap();
    assert_eq!(req.uri().to_string(), "https://example.com:443/");
    let raw = req.head_to_raw();
    assert!(raw.starts_with(b"GET / HTTP/1.1\r\nhost: example.com:443\r\n"));
  }
}
