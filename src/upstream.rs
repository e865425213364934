//! Outbound TLS connections to the real origin

use crate::config::ProxyConfig;
use crate::errors::{Error, Result, UpstreamError};
use crate::tls::{self, UpstreamVerification};
use rustls_pki_types::{CertificateDer, ServerName};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Opens TLS connections to origins.
///
/// Each call dials once; retries are left to the caller.
#[derive(Clone)]
pub struct UpstreamConnector {
  connector: TlsConnector,
  connect_timeout: Duration,
  handshake_timeout: Duration,
}

impl UpstreamConnector {
  /// Create a connector trusting the platform roots plus `extra_roots`
  pub fn new(
    verification: UpstreamVerification,
    extra_roots: Vec<CertificateDer<'static>>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
  ) -> Result<Self> {
    let config = tls::client_config(verification, extra_roots)
      .map_err(|e| Error::config(format!("Failed to build upstream TLS config: {}", e)))?;
    if verification != UpstreamVerification::Verify {
      tracing::warn!(
        "[MITM] upstream certificate verification relaxed: {:?}",
        verification
      );
    }
    Ok(Self {
      connector: TlsConnector::from(Arc::new(config)),
      connect_timeout,
      handshake_timeout,
    })
  }

  /// Create a connector from the proxy configuration, reading `extra_root_certs`
  pub fn from_config(config: &ProxyConfig) -> Result<Self> {
    let mut extra_roots = Vec::new();
    for path in &config.extra_root_certs {
      let certs = tls::load_pem_certs(path).map_err(|e| {
        Error::config(format!(
          "Failed to read root certificates from {}: {}",
          path.display(),
          e
        ))
      })?;
      extra_roots.extend(certs);
    }
    Self::new(
      config.upstream_verification,
      extra_roots,
      config.connect_timeout(),
      config.handshake_timeout(),
    )
  }

  /// Connect to `host:port` and complete the TLS handshake, presenting
  /// `host` as SNI.
  pub async fn connect(
    &self,
    host: &str,
    port: u16,
  ) -> std::result::Result<TlsStream<TcpStream>, UpstreamError> {
    let addr = if host.contains(':') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    };

    let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
      Ok(Ok(tcp)) => tcp,
      Ok(Err(source)) => return Err(UpstreamError::Unreachable { addr, source }),
      Err(_) => {
        return Err(UpstreamError::Timeout {
          addr,
          after: self.connect_timeout,
        })
      }
    };
    if let Err(e) = tcp.set_nodelay(true) {
      tracing::debug!("[MITM] set_nodelay on {} failed: {}", addr, e);
    }

    let server_name = ServerName::try_from(host.to_string()).map_err(|e| UpstreamError::Tls {
      host: host.to_string(),
      reason: format!("invalid server name: {}", e),
    })?;

    match tokio::time::timeout(
      self.handshake_timeout,
      self.connector.connect(server_name, tcp),
    )
    .await
    {
      Ok(Ok(stream)) => {
        tracing::debug!(host, port, "[MITM] upstream TLS established");
        Ok(stream)
      }
      Ok(Err(e)) => Err(UpstreamError::Tls {
        host: host.to_string(),
        reason: e.to_string(),
      }),
      Err(_) => Err(UpstreamError::Timeout {
        addr,
        after: self.handshake_timeout,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  fn connector(timeout: Duration) -> UpstreamConnector {
    UpstreamConnector::new(UpstreamVerification::Verify, Vec::new(), timeout, timeout).unwrap()
  }

  #[tokio::test]
  async fn refused_connection_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = connector(Duration::from_secs(5))
      .connect("127.0.0.1", port)
      .await
      .unwrap_err();
    assert_eq!(err.kind(), "upstream_unreachable");
  }

  #[tokio::test]
  async fn silent_origin_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // accept and hold the socket without ever answering the ClientHello
    let holder = tokio::spawn(async move {
      let (socket, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(5)).await;
      drop(socket);
    });

    let err = connector(Duration::from_millis(200))
      .connect("127.0.0.1", port)
      .await
      .unwrap_err();
    assert_eq!(err.kind(), "upstream_timeout");
    holder.abort();
  }

  #[tokio::test]
  async fn non_tls_origin_is_a_tls_error() {
    use tokio::io::AsyncWriteExt;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
      let _ = socket.shutdown().await;
    });

    let err = connector(Duration::from_secs(5))
      .connect("127.0.0.1", port)
      .await
      .unwrap_err();
    assert_eq!(err.kind(), "upstream_tls");
  }
}
