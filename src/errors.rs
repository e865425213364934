//! engine error
use crate::hook::Direction;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `slinger_bump::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while running the interception engine.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Root CA initialization or leaf issuance failed
  #[error(transparent)]
  Ca(#[from] CaError),
  /// CONNECT negotiation with the client failed
  #[error(transparent)]
  Tunnel(#[from] TunnelError),
  /// Connecting to the origin failed
  #[error(transparent)]
  Upstream(#[from] UpstreamError),
  /// Relaying bytes failed mid-stream
  #[error(transparent)]
  Relay(#[from] RelayError),
  /// Invalid configuration
  #[error("configuration error: {0}")]
  Config(String),
  /// IO error
  #[error(transparent)]
  IO(#[from] io::Error),
}

impl Error {
  /// Stable, log-friendly name of the error kind
  pub fn kind(&self) -> &'static str {
    match self {
      Error::Ca(e) => e.kind(),
      Error::Tunnel(e) => e.kind(),
      Error::Upstream(e) => e.kind(),
      Error::Relay(_) => "relay",
      Error::Config(_) => "config",
      Error::IO(_) => "io",
    }
  }

  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("Configuration error: {}", error);
    error
  }
}

/// Errors raised while initializing the root CA or issuing leaf certificates.
#[derive(ThisError, Debug)]
pub enum CaError {
  /// The certificate directory or one of its files could not be read or written
  #[error("certificate storage error at {}: {source}", .path.display())]
  Storage {
    /// offending path
    path: PathBuf,
    /// underlying IO error
    #[source]
    source: io::Error,
  },
  /// Key generation or signing failed
  #[error("crypto error: {0}")]
  Crypto(String),
  /// CA material on disk exists but cannot be used
  #[error("malformed CA material: {0}")]
  Malformed(String),
  /// The hostname cannot be used as a certificate subject or file name
  #[error("invalid hostname for certificate: {0:?}")]
  InvalidHostname(String),
}

impl CaError {
  pub(crate) fn storage(path: &Path, source: io::Error) -> Self {
    let error = CaError::Storage {
      path: path.to_path_buf(),
      source,
    };
    tracing::error!("Certificate storage error: {}", error);
    error
  }

  pub(crate) fn crypto(msg: impl Into<String>) -> Self {
    let error = CaError::Crypto(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  pub(crate) fn malformed(msg: impl Into<String>) -> Self {
    let error = CaError::Malformed(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Rebuild an owned error from one shared between coalesced issuance waiters.
  pub(crate) fn from_shared(shared: Arc<CaError>) -> Self {
    match Arc::try_unwrap(shared) {
      Ok(error) => error,
      Err(shared) => match shared.as_ref() {
        CaError::Storage { path, source } => CaError::Storage {
          path: path.clone(),
          source: io::Error::new(source.kind(), source.to_string()),
        },
        CaError::Crypto(msg) => CaError::Crypto(msg.clone()),
        CaError::Malformed(msg) => CaError::Malformed(msg.clone()),
        CaError::InvalidHostname(host) => CaError::InvalidHostname(host.clone()),
      },
    }
  }

  /// Stable, log-friendly name of the error kind
  pub fn kind(&self) -> &'static str {
    match self {
      CaError::Storage { .. } => "ca_storage",
      CaError::Crypto(_) => "ca_crypto",
      CaError::Malformed(_) => "ca_malformed",
      CaError::InvalidHostname(_) => "ca_invalid_hostname",
    }
  }
}

/// Errors raised while negotiating a CONNECT tunnel with the client.
#[derive(ThisError, Debug)]
pub enum TunnelError {
  /// The client did not send a usable `CONNECT host:port HTTP/1.x` head
  #[error("malformed CONNECT request: {0}")]
  MalformedRequest(String),
  /// The server-side TLS handshake with the client failed
  #[error("TLS handshake with client failed for {host}: {reason}")]
  HandshakeFailed {
    /// target host the client asked for
    host: String,
    /// handshake failure description
    reason: String,
  },
  /// No leaf certificate could be obtained for the target host
  #[error("certificate issuance failed for {host}: {source}")]
  CertificateIssuanceFailed {
    /// target host the client asked for
    host: String,
    /// CA failure
    #[source]
    source: CaError,
  },
}

impl TunnelError {
  /// Stable, log-friendly name of the error kind
  pub fn kind(&self) -> &'static str {
    match self {
      TunnelError::MalformedRequest(_) => "tunnel_malformed_request",
      TunnelError::HandshakeFailed { .. } => "tunnel_handshake_failed",
      TunnelError::CertificateIssuanceFailed { .. } => "tunnel_certificate_issuance_failed",
    }
  }
}

/// Errors raised while connecting to the real origin.
#[derive(ThisError, Debug)]
pub enum UpstreamError {
  /// TCP connection to the origin failed
  #[error("origin {addr} unreachable: {source}")]
  Unreachable {
    /// `host:port` that was dialed
    addr: String,
    /// underlying IO error
    #[source]
    source: io::Error,
  },
  /// TLS handshake with the origin failed
  #[error("TLS error talking to {host}: {reason}")]
  Tls {
    /// origin host
    host: String,
    /// handshake failure description
    reason: String,
  },
  /// Connecting or handshaking took longer than allowed
  #[error("timed out after {after:?} connecting to {addr}")]
  Timeout {
    /// `host:port` that was dialed
    addr: String,
    /// configured limit
    after: Duration,
  },
}

impl UpstreamError {
  /// Stable, log-friendly name of the error kind
  pub fn kind(&self) -> &'static str {
    match self {
      UpstreamError::Unreachable { .. } => "upstream_unreachable",
      UpstreamError::Tls { .. } => "upstream_tls",
      UpstreamError::Timeout { .. } => "upstream_timeout",
    }
  }
}

/// Mid-stream IO failure in one relay direction.
#[derive(ThisError, Debug)]
pub enum RelayError {
  /// Reading from the source side failed
  #[error("{direction} read failed: {source}")]
  Read {
    /// direction being pumped
    direction: Direction,
    /// underlying IO error
    #[source]
    source: io::Error,
  },
  /// Writing to the destination side failed
  #[error("{direction} write failed: {source}")]
  Write {
    /// direction being pumped
    direction: Direction,
    /// underlying IO error
    #[source]
    source: io::Error,
  },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_are_stable() {
    let err: Error = TunnelError::MalformedRequest("x".to_string()).into();
    assert_eq!(err.kind(), "tunnel_malformed_request");
    let err: Error = UpstreamError::Timeout {
      addr: "a:1".to_string(),
      after: Duration::from_secs(1),
    }
    .into();
    assert_eq!(err.kind(), "upstream_timeout");
    let err: Error = CaError::Malformed("bad".to_string()).into();
    assert_eq!(err.kind(), "ca_malformed");
  }

  #[test]
  fn shared_errors_keep_their_variant() {
    let shared = Arc::new(CaError::Storage {
      path: PathBuf::from("/nope"),
      source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
    });
    let _other = shared.clone();
    match CaError::from_shared(shared) {
      CaError::Storage { path, source } => {
        assert_eq!(path, PathBuf::from("/nope"));
        assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
      }
      other => panic!("unexpected {other:?}"),
    }
  }
}
