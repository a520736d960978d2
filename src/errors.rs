//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `mitm_relay::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while loading rules or relaying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Malformed CONNECT or HTTP framing, or a failed peek.
  #[error("protocol error: {0}")]
  Protocol(String),
  /// The upstream host could not be reached.
  #[error("dial {addr}: {source}")]
  Dial {
    /// `host:port` that was dialed
    addr: String,
    /// underlying failure
    source: std::io::Error,
  },
  /// A rule failed to load or compile.
  #[error("{file}: rule \"{rule}\": {message}")]
  RuleCompile {
    /// rule file the definition came from
    file: String,
    /// rule name, empty when the whole file failed to parse
    rule: String,
    /// reason
    message: String,
  },
  /// A predicate or script faulted while running.
  #[error("rule \"{rule}\" error: {message}")]
  RuleEvaluation {
    /// rule name
    rule: String,
    /// reason
    message: String,
  },
  /// A matching rule rejected the exchange.
  #[error("rejected by rule \"{rule}\"")]
  Rejected {
    /// rule name
    rule: String,
  },
  /// Leaf certificate or root CA failure.
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Startup configuration failure.
  #[error("config error: {0}")]
  Config(String),
}

impl Error {
  /// Whether this error came from an explicit reject action.
  pub fn is_rejected(&self) -> bool {
    matches!(self, Error::Rejected { .. })
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Certificate(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn protocol<S: Into<String>>(msg: S) -> Error {
  Error::Protocol(msg.into())
}
