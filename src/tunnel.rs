//! CONNECT negotiation and the client-side TLS handshake

use crate::ca::CertificateAuthority;
use crate::errors::TunnelError;
use crate::tls;
use http::uri::Authority;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Reply sent once the CONNECT request is accepted
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// 16KB max for proxy headers
const MAX_CONNECT_HEAD: usize = 16 * 1024;

/// Target of a `CONNECT host:port HTTP/1.x` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
  /// Target host, without IPv6 brackets
  pub host: String,
  /// Target port
  pub port: u16,
}

impl ConnectRequest {
  /// Parse a request head (request line plus header lines)
  pub fn parse(head: &str) -> Result<Self, TunnelError> {
    let request_line = head.lines().next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let [method, target, version] = parts.as_slice() else {
      return Err(TunnelError::MalformedRequest(format!(
        "Invalid request line: {:?}",
        request_line
      )));
    };
    if *method != http::Method::CONNECT.as_str() {
      return Err(TunnelError::MalformedRequest(format!(
        "unsupported method {}",
        method
      )));
    }
    if !version.starts_with("HTTP/1.") {
      return Err(TunnelError::MalformedRequest(format!(
        "unsupported version {}",
        version
      )));
    }

    let authority: Authority = target
      .parse()
      .map_err(|_| TunnelError::MalformedRequest(format!("Invalid target: {}", target)))?;
    if target.contains('@') {
      return Err(TunnelError::MalformedRequest(format!(
        "credentials in target: {}",
        target
      )));
    }
    let port = authority
      .port_u16()
      .ok_or_else(|| TunnelError::MalformedRequest(format!("missing port in {}", target)))?;
    let host = authority
      .host()
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_string();
    if host.is_empty() {
      return Err(TunnelError::MalformedRequest(format!(
        "missing host in {}",
        target
      )));
    }
    Ok(Self { host, port })
  }
}

impl fmt::Display for ConnectRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Negotiation progress. A failure in any stage moves to `Failed` and is
/// logged with the stage it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  /// Waiting for the CONNECT head
  AwaitConnect,
  /// Sending `200 Connection Established`
  Send200,
  /// Presenting the forged leaf to the client
  TlsHandshake,
  /// Decrypted stream available
  Established,
  /// Negotiation gave up; the client connection is closed
  Failed,
}

/// Client side of an intercepted tunnel after a successful handshake
pub struct EstablishedTunnel<S> {
  /// Decrypted client stream
  pub stream: TlsStream<BufReader<S>>,
  /// What the client asked to reach
  pub target: ConnectRequest,
}

/// Drives `AWAIT_CONNECT -> SEND_200 -> TLS_HANDSHAKE -> ESTABLISHED | FAILED`
#[derive(Clone)]
pub struct TunnelNegotiator {
  ca: Arc<CertificateAuthority>,
  read_timeout: Duration,
  handshake_timeout: Duration,
}

impl TunnelNegotiator {
  /// Create a negotiator issuing leaves from `ca`
  pub fn new(
    ca: Arc<CertificateAuthority>,
    read_timeout: Duration,
    handshake_timeout: Duration,
  ) -> Self {
    Self {
      ca,
      read_timeout,
      handshake_timeout,
    }
  }

  /// Negotiate a tunnel on a freshly accepted client stream.
  ///
  /// On failure the stream is dropped, which closes the connection.
  pub async fn negotiate<S>(&self, stream: S) -> Result<EstablishedTunnel<S>, TunnelError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut state = TunnelState::AwaitConnect;
    let result = self.drive(stream, &mut state).await;
    if let Err(e) = &result {
      tracing::debug!(stage = ?state, "[MITM] tunnel negotiation failed: {}", e);
      state = TunnelState::Failed;
    }
    tracing::trace!(state = ?state, "[MITM] negotiation finished");
    result
  }

  async fn drive<S>(
    &self,
    stream: S,
    state: &mut TunnelState,
  ) -> Result<EstablishedTunnel<S>, TunnelError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    // the reader stays wrapped: bytes buffered past the head belong to the ClientHello
    let mut reader = BufReader::new(stream);
    let head = match tokio::time::timeout(self.read_timeout, read_head(&mut reader)).await {
      Ok(head) => head,
      Err(_) => {
        return Err(TunnelError::MalformedRequest(format!(
          "no CONNECT request within {:?}",
          self.read_timeout
        )));
      }
    };
    let target = head.and_then(|head| ConnectRequest::parse(&head))?;

    *state = TunnelState::Send200;
    let sent = async {
      reader.get_mut().write_all(CONNECT_ESTABLISHED).await?;
      reader.get_mut().flush().await
    }
    .await;
    if let Err(e) = sent {
      return Err(TunnelError::HandshakeFailed {
        host: target.host,
        reason: format!("client went away before the handshake: {}", e),
      });
    }

    *state = TunnelState::TlsHandshake;
    let leaf = match self.ca.leaf_certificate(&target.host).await {
      Ok(leaf) => leaf,
      Err(source) => {
        return Err(TunnelError::CertificateIssuanceFailed {
          host: target.host,
          source,
        });
      }
    };
    let config = match tls::server_config(&leaf) {
      Ok(config) => config,
      Err(e) => {
        return Err(TunnelError::HandshakeFailed {
          host: target.host,
          reason: format!("Failed to create TLS config: {}", e),
        });
      }
    };
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let stream = match tokio::time::timeout(self.handshake_timeout, acceptor.accept(reader)).await {
      Ok(Ok(stream)) => stream,
      Ok(Err(e)) => {
        return Err(TunnelError::HandshakeFailed {
          host: target.host,
          reason: e.to_string(),
        });
      }
      Err(_) => {
        return Err(TunnelError::HandshakeFailed {
          host: target.host,
          reason: format!("timed out after {:?}", self.handshake_timeout),
        });
      }
    };

    *state = TunnelState::Established;
    tracing::debug!(host = %target.host, port = target.port, "[MITM] client tunnel established");
    Ok(EstablishedTunnel { stream, target })
  }
}

/// Read up to and including the blank line that ends the request head
async fn read_head<R>(reader: &mut R) -> Result<String, TunnelError>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = String::new();
  loop {
    let mut line = String::new();
    let n = (&mut *reader)
      .take((MAX_CONNECT_HEAD - head.len() + 1) as u64)
      .read_line(&mut line)
      .await
      .map_err(|e| TunnelError::MalformedRequest(format!("failed to read request: {}", e)))?;
    if n == 0 {
      return Err(TunnelError::MalformedRequest(
        "connection closed before end of request head".to_string(),
      ));
    }
    head.push_str(&line);
    if head.len() > MAX_CONNECT_HEAD {
      return Err(TunnelError::MalformedRequest(
        "CONNECT headers size exceeds maximum allowed".to_string(),
      ));
    }
    // End of headers is an empty line (CRLF)
    if line == "\r\n" || line == "\n" {
      return Ok(head);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_connect_targets() {
    let req =
      ConnectRequest::parse("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .unwrap();
    assert_eq!(req.host, "example.com");
    assert_eq!(req.port, 443);

    let req = ConnectRequest::parse("CONNECT [::1]:8443 HTTP/1.0\r\n\r\n").unwrap();
    assert_eq!(req.host, "::1");
    assert_eq!(req.port, 8443);
    assert_eq!(req.to_string(), "[::1]:8443");
  }

  #[test]
  fn rejects_malformed_requests() {
    for head in [
      "",
      "GET http://example.com/ HTTP/1.1\r\n\r\n",
      "CONNECT example.com HTTP/1.1\r\n\r\n",
      "CONNECT example.com:notaport HTTP/1.1\r\n\r\n",
      "CONNECT example.com:443 HTTP/2\r\n\r\n",
      "CONNECT example.com:443\r\n\r\n",
      "CONNECT user@example.com:443 HTTP/1.1\r\n\r\n",
    ] {
      assert!(
        matches!(ConnectRequest::parse(head), Err(TunnelError::MalformedRequest(_))),
        "{head:?} accepted"
      );
    }
  }

  #[tokio::test]
  async fn head_is_read_up_to_the_blank_line() {
    let mut input = &b"CONNECT a:1 HTTP/1.1\r\nHost: a:1\r\n\r\n\x16\x03\x01"[..];
    let mut reader = BufReader::new(&mut input);
    let head = read_head(&mut reader).await.unwrap();
    assert_eq!(head, "CONNECT a:1 HTTP/1.1\r\nHost: a:1\r\n\r\n");
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"\x16\x03\x01");
  }

  #[tokio::test]
  async fn oversized_head_is_rejected() {
    let mut data = b"CONNECT a:1 HTTP/1.1\r\n".to_vec();
    data.extend(vec![b'x'; MAX_CONNECT_HEAD + 10]);
    let mut input = &data[..];
    let mut reader = BufReader::new(&mut input);
    assert!(matches!(
      read_head(&mut reader).await,
      Err(TunnelError::MalformedRequest(_))
    ));
  }
}
