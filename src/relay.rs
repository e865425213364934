//! Bidirectional relay between the decrypted client and origin streams

use crate::errors::RelayError;
use crate::hook::{Direction, HookHandler, InterceptionEvent};
use crate::registry::{ConnectionRegistry, SessionId, SessionState, TunnelSession};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Totals for a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
  /// Session the relay ran under
  pub session_id: SessionId,
  /// Bytes written to the origin
  pub client_to_origin: u64,
  /// Bytes written to the client
  pub origin_to_client: u64,
  /// Whether the session was closed from outside (`close_session` or shutdown)
  pub cancelled: bool,
}

enum PumpEnd {
  Eof,
  Cancelled,
}

/// Runs the two pumps of a tunnel under one cancellation scope
#[derive(Clone)]
pub struct RelayLoop {
  registry: Arc<ConnectionRegistry>,
  hooks: Arc<RwLock<HookHandler>>,
  chunk_size: usize,
  close_grace: Duration,
}

impl RelayLoop {
  /// Create a relay registering its sessions in `registry`
  pub fn new(
    registry: Arc<ConnectionRegistry>,
    hooks: Arc<RwLock<HookHandler>>,
    chunk_size: usize,
    close_grace: Duration,
  ) -> Self {
    Self {
      registry,
      hooks,
      chunk_size: chunk_size.max(1),
      close_grace,
    }
  }

  /// Relay until both directions finish or the session is cancelled.
  ///
  /// The session is registered for the duration of the call. When one
  /// direction reaches end of stream its write side is shut down and the other
  /// direction gets `close_grace` to finish. An IO error on either side tears
  /// the whole tunnel down at once.
  pub async fn run<C, O>(
    &self,
    host: &str,
    port: u16,
    client: C,
    origin: O,
  ) -> Result<RelaySummary, RelayError>
  where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
  {
    let guard = self.registry.open(host, port);
    let session = guard.session();
    let scope = session.cancel_token().child_token();
    let finished = AtomicUsize::new(0);

    let (client_read, client_write) = tokio::io::split(client);
    let (origin_read, origin_write) = tokio::io::split(origin);

    let (c2o, o2c) = tokio::join!(
      self.pump(
        Direction::ClientToOrigin,
        session,
        &scope,
        &finished,
        client_read,
        origin_write
      ),
      self.pump(
        Direction::OriginToClient,
        session,
        &scope,
        &finished,
        origin_read,
        client_write
      ),
    );

    let summary = RelaySummary {
      session_id: session.id(),
      client_to_origin: session.bytes(Direction::ClientToOrigin),
      origin_to_client: session.bytes(Direction::OriginToClient),
      cancelled: session.cancel_token().is_cancelled(),
    };
    tracing::info!(
      session = summary.session_id,
      host,
      port,
      c2o = summary.client_to_origin,
      o2c = summary.origin_to_client,
      cancelled = summary.cancelled,
      "[MITM] tunnel closed"
    );
    c2o?;
    o2c?;
    Ok(summary)
  }

  async fn pump<R, W>(
    &self,
    direction: Direction,
    session: &TunnelSession,
    scope: &CancellationToken,
    finished: &AtomicUsize,
    mut reader: R,
    mut writer: W,
  ) -> Result<(), RelayError>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let outcome = self
      .forward(direction, session, scope, &mut reader, &mut writer)
      .await;
    // propagate the close to the peer, bounded so a stuck peer cannot hold the tunnel
    let _ = tokio::time::timeout(self.close_grace, writer.shutdown()).await;
    let first = finished.fetch_add(1, Ordering::AcqRel) == 0;

    match outcome {
      Ok(PumpEnd::Eof) if first => {
        session.set_state(SessionState::Draining);
        tracing::debug!(
          session = session.id(),
          direction = %direction,
          "[MITM] end of stream, draining the other direction"
        );
        tokio::select! {
          _ = tokio::time::sleep(self.close_grace) => scope.cancel(),
          _ = scope.cancelled() => {}
        }
        Ok(())
      }
      Ok(PumpEnd::Eof) => {
        scope.cancel();
        Ok(())
      }
      Ok(PumpEnd::Cancelled) => Ok(()),
      Err(e) => {
        tracing::debug!(
          session = session.id(),
          kind = "relay",
          "[MITM] {}",
          e
        );
        scope.cancel();
        Err(e)
      }
    }
  }

  async fn forward<R, W>(
    &self,
    direction: Direction,
    session: &TunnelSession,
    scope: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
  ) -> Result<PumpEnd, RelayError>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut buffer = vec![0u8; self.chunk_size];
    loop {
      let n = tokio::select! {
        biased;
        _ = scope.cancelled() => return Ok(PumpEnd::Cancelled),
        read = reader.read(&mut buffer) => {
          read.map_err(|source| RelayError::Read { direction, source })?
        }
      };
      if n == 0 {
        return Ok(PumpEnd::Eof);
      }

      let chunk = Bytes::copy_from_slice(&buffer[..n]);
      let chunk = {
        // snapshot the chain so registration never waits on a slow hook
        let hooks = self.hooks.read().await.clone();
        if hooks.has_hooks() {
          let event = InterceptionEvent::new(direction, session.id(), chunk);
          tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(PumpEnd::Cancelled),
            chunk = hooks.process(event) => chunk,
          }
        } else {
          chunk
        }
      };
      // an empty result means a hook dropped the chunk
      if chunk.is_empty() {
        continue;
      }

      tokio::select! {
        biased;
        _ = scope.cancelled() => return Ok(PumpEnd::Cancelled),
        written = async {
          writer.write_all(&chunk).await?;
          writer.flush().await
        } => {
          written.map_err(|source| RelayError::Write { direction, source })?
        }
      }
      session.record(direction, chunk.len());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hook::{HookError, InterceptionHook};
  use tokio::io::duplex;

  struct Redact;

  #[async_trait::async_trait]
  impl InterceptionHook for Redact {
    async fn transform(&self, event: &InterceptionEvent) -> Result<Bytes, HookError> {
      if event.direction == Direction::ClientToOrigin {
        Ok(Bytes::from(
          String::from_utf8_lossy(&event.chunk).replace("secret", "******"),
        ))
      } else {
        Ok(event.chunk.clone())
      }
    }
  }

  fn relay(registry: Arc<ConnectionRegistry>, handler: HookHandler) -> RelayLoop {
    RelayLoop::new(
      registry,
      Arc::new(RwLock::new(handler)),
      8192,
      Duration::from_secs(1),
    )
  }

  #[tokio::test]
  async fn hooks_rewrite_one_direction() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handler = HookHandler::new();
    handler.register("redact", Arc::new(Redact));
    let relay = relay(registry.clone(), handler);

    let (client, mut client_peer) = duplex(1024);
    let (origin, mut origin_peer) = duplex(1024);
    let task = tokio::spawn(async move { relay.run("example.com", 443, client, origin).await });

    client_peer.write_all(b"token=secret").await.unwrap();
    let mut buf = [0u8; 12];
    origin_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"token=******");

    origin_peer.write_all(b"secret ok").await.unwrap();
    let mut buf = [0u8; 9];
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"secret ok");

    drop(client_peer);
    drop(origin_peer);
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.client_to_origin, 12);
    assert_eq!(summary.origin_to_client, 9);
    assert!(!summary.cancelled);
    assert!(registry.is_empty());
  }

  #[tokio::test]
  async fn half_close_drains_the_other_direction() {
    let registry = Arc::new(ConnectionRegistry::new());
    let relay = relay(registry.clone(), HookHandler::new());

    let (client, mut client_peer) = duplex(1024);
    let (origin, mut origin_peer) = duplex(1024);
    let task = tokio::spawn(async move { relay.run("example.com", 443, client, origin).await });

    client_peer.write_all(b"request").await.unwrap();
    client_peer.shutdown().await.unwrap();

    let mut request = Vec::new();
    origin_peer.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"request");
    origin_peer.write_all(b"response").await.unwrap();

    let mut buf = [0u8; 8];
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"response");

    let summary = tokio::time::timeout(Duration::from_secs(5), task)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(summary.origin_to_client, 8);
    assert!(registry.is_empty());
  }
}
