//! Live tunnel sessions, for introspection and cancellation

use crate::hook::Direction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

/// Identifier of a tunnel session, unique per registry
pub type SessionId = u64;

/// Lifecycle state of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SessionState {
  /// Both pumps are running
  Relaying,
  /// One side finished; the other is draining within the grace period
  Draining,
  /// Cancelled by `close_session` or shutdown
  Closing,
}

impl SessionState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => SessionState::Relaying,
      1 => SessionState::Draining,
      _ => SessionState::Closing,
    }
  }
}

/// A relayed tunnel. Counters are updated by the relay pumps.
#[derive(Debug)]
pub struct TunnelSession {
  id: SessionId,
  host: String,
  port: u16,
  started_at: SystemTime,
  started: Instant,
  client_to_origin: AtomicU64,
  origin_to_client: AtomicU64,
  state: AtomicU8,
  cancel: CancellationToken,
}

impl TunnelSession {
  /// Session identifier
  pub fn id(&self) -> SessionId {
    self.id
  }

  /// Target host from the CONNECT request
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Target port from the CONNECT request
  pub fn port(&self) -> u16 {
    self.port
  }

  /// Cancellation scope shared by both pumps of this session
  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Current state
  pub fn state(&self) -> SessionState {
    SessionState::from_u8(self.state.load(Ordering::Acquire))
  }

  pub(crate) fn set_state(&self, state: SessionState) {
    let value = match state {
      SessionState::Relaying => 0,
      SessionState::Draining => 1,
      SessionState::Closing => 2,
    };
    // Closing is terminal
    let _ = self
      .state
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (current < 2).then_some(value)
      });
  }

  pub(crate) fn record(&self, direction: Direction, bytes: usize) {
    let counter = match direction {
      Direction::ClientToOrigin => &self.client_to_origin,
      Direction::OriginToClient => &self.origin_to_client,
    };
    counter.fetch_add(bytes as u64, Ordering::Relaxed);
  }

  /// Bytes forwarded in `direction` so far
  pub fn bytes(&self, direction: Direction) -> u64 {
    match direction {
      Direction::ClientToOrigin => self.client_to_origin.load(Ordering::Relaxed),
      Direction::OriginToClient => self.origin_to_client.load(Ordering::Relaxed),
    }
  }

  /// Point-in-time view of this session
  pub fn snapshot(&self) -> SessionInfo {
    SessionInfo {
      id: self.id,
      host: self.host.clone(),
      port: self.port,
      started_at: self.started_at,
      duration: self.started.elapsed(),
      bytes_client_to_origin: self.bytes(Direction::ClientToOrigin),
      bytes_origin_to_client: self.bytes(Direction::OriginToClient),
      state: self.state(),
    }
  }
}

/// Snapshot returned by [`ConnectionRegistry::list_active_sessions`]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SessionInfo {
  /// Session identifier
  pub id: SessionId,
  /// Target host
  pub host: String,
  /// Target port
  pub port: u16,
  /// Wall-clock start time
  pub started_at: SystemTime,
  /// Time since the session started
  pub duration: Duration,
  /// Bytes forwarded from client to origin
  pub bytes_client_to_origin: u64,
  /// Bytes forwarded from origin to client
  pub bytes_origin_to_client: u64,
  /// Current state
  pub state: SessionState,
}

/// Registry of live tunnel sessions.
///
/// Sessions are owned by the relay; the registry only keeps a reference so
/// they can be listed and cancelled.
#[derive(Debug)]
pub struct ConnectionRegistry {
  sessions: Mutex<HashMap<SessionId, Arc<TunnelSession>>>,
  next_id: AtomicU64,
  shutdown: CancellationToken,
}

impl ConnectionRegistry {
  /// Create an empty registry
  pub fn new() -> Self {
    Self {
      sessions: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
      shutdown: CancellationToken::new(),
    }
  }

  fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<TunnelSession>>> {
    // the map stays consistent even if a holder panicked
    self.sessions.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register a new session. It is removed again when the guard drops.
  pub fn open(self: &Arc<Self>, host: &str, port: u16) -> SessionGuard {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let session = Arc::new(TunnelSession {
      id,
      host: host.to_string(),
      port,
      started_at: SystemTime::now(),
      started: Instant::now(),
      client_to_origin: AtomicU64::new(0),
      origin_to_client: AtomicU64::new(0),
      state: AtomicU8::new(0),
      cancel: self.shutdown.child_token(),
    });
    self.sessions().insert(id, session.clone());
    tracing::debug!(session = id, host, port, "[MITM] session opened");
    SessionGuard {
      registry: self.clone(),
      session,
    }
  }

  /// Snapshots of every live session, ordered by id
  pub fn list_active_sessions(&self) -> Vec<SessionInfo> {
    let mut sessions: Vec<SessionInfo> = self.sessions().values().map(|s| s.snapshot()).collect();
    sessions.sort_by_key(|s| s.id);
    sessions
  }

  /// Snapshot of a single session
  pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
    self.sessions().get(&id).map(|s| s.snapshot())
  }

  /// Cancel both pumps of a session and drop it from the registry.
  ///
  /// Returns `false` if no such session is live.
  pub fn close_session(&self, id: SessionId) -> bool {
    let session = self.sessions().remove(&id);
    match session {
      Some(session) => {
        session.set_state(SessionState::Closing);
        session.cancel.cancel();
        tracing::info!(session = id, host = %session.host, "[MITM] session closed on request");
        true
      }
      None => false,
    }
  }

  /// Number of live sessions
  pub fn len(&self) -> usize {
    self.sessions().len()
  }

  /// Whether no session is live
  pub fn is_empty(&self) -> bool {
    self.sessions().is_empty()
  }

  /// Cancel every live session and every session opened afterwards
  pub fn shutdown(&self) {
    let sessions: Vec<Arc<TunnelSession>> = self.sessions().drain().map(|(_, s)| s).collect();
    for session in &sessions {
      session.set_state(SessionState::Closing);
    }
    self.shutdown.cancel();
    tracing::info!("[MITM] registry shut down, {} sessions cancelled", sessions.len());
  }

  fn remove(&self, session: &Arc<TunnelSession>) {
    let mut sessions = self.sessions();
    if sessions
      .get(&session.id)
      .is_some_and(|live| Arc::ptr_eq(live, session))
    {
      sessions.remove(&session.id);
    }
  }
}

impl Default for ConnectionRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Keeps a session registered for as long as it lives
#[derive(Debug)]
pub struct SessionGuard {
  registry: Arc<ConnectionRegistry>,
  session: Arc<TunnelSession>,
}

impl SessionGuard {
  /// The guarded session
  pub fn session(&self) -> &Arc<TunnelSession> {
    &self.session
  }
}

impl Drop for SessionGuard {
  fn drop(&mut self) {
    self.registry.remove(&self.session);
    tracing::debug!(
      session = self.session.id,
      c2o = self.session.bytes(Direction::ClientToOrigin),
      o2c = self.session.bytes(Direction::OriginToClient),
      "[MITM] session removed"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn open_list_and_drop() {
    let registry = Arc::new(ConnectionRegistry::new());
    let a = registry.open("a.example", 443);
    let b = registry.open("b.example", 8443);
    a.session().record(Direction::ClientToOrigin, 10);
    b.session().record(Direction::OriginToClient, 3);

    let sessions = registry.list_active_sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].host, "a.example");
    assert_eq!(sessions[0].bytes_client_to_origin, 10);
    assert_eq!(sessions[1].port, 8443);
    assert_eq!(sessions[1].bytes_origin_to_client, 3);
    assert_eq!(sessions[1].state, SessionState::Relaying);

    drop(a);
    assert_eq!(registry.len(), 1);
    drop(b);
    assert!(registry.is_empty());
  }

  #[test]
  fn close_session_cancels_and_removes() {
    let registry = Arc::new(ConnectionRegistry::new());
    let guard = registry.open("a.example", 443);
    let id = guard.session().id();
    assert!(registry.close_session(id));
    assert!(guard.session().cancel_token().is_cancelled());
    assert_eq!(guard.session().state(), SessionState::Closing);
    guard.session().set_state(SessionState::Draining);
    assert_eq!(guard.session().state(), SessionState::Closing);
    assert!(registry.session(id).is_none());
    assert!(!registry.close_session(id));
  }

  #[test]
  fn shutdown_cancels_existing_and_future_sessions() {
    let registry = Arc::new(ConnectionRegistry::new());
    let before = registry.open("a.example", 443);
    registry.shutdown();
    let after = registry.open("b.example", 443);
    assert!(before.session().cancel_token().is_cancelled());
    assert!(after.session().cancel_token().is_cancelled());
  }
}
