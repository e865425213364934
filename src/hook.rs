//! Traffic interception and modification interfaces

use crate::registry::SessionId;
use bytes::Bytes;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Error type a hook may return; any error makes the chunk pass through untouched.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Which way a chunk is travelling through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Direction {
  /// Decrypted bytes sent by the client, headed for the origin
  ClientToOrigin,
  /// Decrypted bytes sent by the origin, headed for the client
  OriginToClient,
}

impl Direction {
  /// Short name used in logs
  pub fn as_str(&self) -> &'static str {
    match self {
      Direction::ClientToOrigin => "client->origin",
      Direction::OriginToClient => "origin->client",
    }
  }
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One relayed chunk handed to the hooks. Never persisted.
#[derive(Clone)]
pub struct InterceptionEvent {
  /// Direction of travel
  pub direction: Direction,
  /// Tunnel session the chunk belongs to
  pub session_id: SessionId,
  /// Timestamp (unix millis) when the chunk was read
  pub timestamp: u64,
  /// Raw decrypted bytes
  pub chunk: Bytes,
}

impl InterceptionEvent {
  /// Create a new event stamped with the current time
  pub fn new(direction: Direction, session_id: SessionId, chunk: Bytes) -> Self {
    Self {
      direction,
      session_id,
      timestamp: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0),
      chunk,
    }
  }
}

impl fmt::Debug for InterceptionEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InterceptionEvent")
      .field("direction", &self.direction)
      .field("session_id", &self.session_id)
      .field("timestamp", &self.timestamp)
      .field("len", &self.chunk.len())
      .finish()
  }
}

/// Hook invoked for every relayed chunk.
///
/// The returned bytes replace the chunk; returning an empty buffer drops it.
/// Returning an error (or panicking, or exceeding the hook timeout) forwards
/// the chunk unmodified.
#[async_trait::async_trait]
pub trait InterceptionHook: Send + Sync {
  /// Inspect and optionally transform a chunk
  async fn transform(&self, event: &InterceptionEvent) -> Result<Bytes, HookError>;
}

#[derive(Clone)]
struct HookEntry {
  name: String,
  enabled: bool,
  hook: Arc<dyn InterceptionHook>,
}

/// Ordered chain of named hooks applied to every chunk.
///
/// Cloning is cheap and yields a snapshot: later registrations on the
/// original do not affect chunks already being processed by the clone.
#[derive(Clone)]
pub struct HookHandler {
  hooks: Arc<Vec<HookEntry>>,
  timeout: Option<Duration>,
}

impl HookHandler {
  /// Create an empty handler with no per-hook time limit
  pub fn new() -> Self {
    Self {
      hooks: Arc::new(Vec::new()),
      timeout: None,
    }
  }

  /// Create an empty handler that gives each hook at most `timeout` per chunk
  pub fn with_timeout(timeout: Duration) -> Self {
    Self {
      hooks: Arc::new(Vec::new()),
      timeout: Some(timeout),
    }
  }

  /// Register a hook under `name`, replacing any hook with the same name
  pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn InterceptionHook>) {
    let name = name.into();
    let hooks = Arc::make_mut(&mut self.hooks);
    if let Some(entry) = hooks.iter_mut().find(|e| e.name == name) {
      entry.hook = hook;
      entry.enabled = true;
      return;
    }
    hooks.push(HookEntry {
      name,
      enabled: true,
      hook,
    });
  }

  /// Remove a hook, returning whether it existed
  pub fn unregister(&mut self, name: &str) -> bool {
    if !self.hooks.iter().any(|e| e.name == name) {
      return false;
    }
    Arc::make_mut(&mut self.hooks).retain(|e| e.name != name);
    true
  }

  /// Enable or disable a hook without removing it
  pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
    match Arc::make_mut(&mut self.hooks)
      .iter_mut()
      .find(|e| e.name == name)
    {
      Some(entry) => {
        entry.enabled = enabled;
        true
      }
      None => false,
    }
  }

  /// Names of the registered hooks, in application order
  pub fn hook_names(&self) -> Vec<String> {
    self.hooks.iter().map(|e| e.name.clone()).collect()
  }

  /// Check if any enabled hook is registered
  pub fn has_hooks(&self) -> bool {
    self.hooks.iter().any(|e| e.enabled)
  }

  /// Run `event` through every enabled hook and return the bytes to forward.
  ///
  /// A failing hook is skipped: the next hook sees the input the failing one received.
  pub async fn process(&self, mut event: InterceptionEvent) -> Bytes {
    for entry in self.hooks.iter().filter(|e| e.enabled) {
      let call = AssertUnwindSafe(entry.hook.transform(&event)).catch_unwind();
      let outcome = match self.timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
          Ok(outcome) => outcome,
          Err(_) => {
            tracing::warn!(
              hook = %entry.name,
              session = event.session_id,
              direction = %event.direction,
              "[MITM] hook timed out after {:?}, forwarding chunk unmodified",
              limit
            );
            continue;
          }
        },
        None => call.await,
      };
      match outcome {
        Ok(Ok(chunk)) => event.chunk = chunk,
        Ok(Err(e)) => {
          tracing::warn!(
            hook = %entry.name,
            session = event.session_id,
            direction = %event.direction,
            "[MITM] hook failed, forwarding chunk unmodified: {}",
            e
          );
        }
        Err(_) => {
          tracing::error!(
            hook = %entry.name,
            session = event.session_id,
            direction = %event.direction,
            "[MITM] hook panicked, forwarding chunk unmodified"
          );
        }
      }
    }
    event.chunk
  }
}

impl Default for HookHandler {
  fn default() -> Self {
    Self::new()
  }
}

/// Logging hook that leaves traffic untouched
pub struct LoggingHook;

impl LoggingHook {
  const PREVIEW_LEN: usize = 200;

  fn preview(chunk: &[u8]) -> Option<String> {
    const METHODS: [&[u8]; 9] = [
      b"GET ",
      b"POST ",
      b"PUT ",
      b"DELETE ",
      b"HEAD ",
      b"OPTIONS ",
      b"PATCH ",
      b"CONNECT ",
      b"TRACE ",
    ];
    let looks_like_http =
      chunk.starts_with(b"HTTP/") || METHODS.iter().any(|m| chunk.starts_with(m));
    if !looks_like_http {
      return None;
    }
    let line_end = chunk
      .iter()
      .position(|b| *b == b'\r' || *b == b'\n')
      .unwrap_or(chunk.len())
      .min(Self::PREVIEW_LEN);
    Some(String::from_utf8_lossy(&chunk[..line_end]).into_owned())
  }
}

#[async_trait::async_trait]
impl InterceptionHook for LoggingHook {
  async fn transform(&self, event: &InterceptionEvent) -> Result<Bytes, HookError> {
    match Self::preview(&event.chunk) {
      Some(line) => tracing::info!(
        session = event.session_id,
        direction = %event.direction,
        "[MITM] {} bytes: {}",
        event.chunk.len(),
        line
      ),
      None => tracing::info!(
        session = event.session_id,
        direction = %event.direction,
        "[MITM] {} bytes",
        event.chunk.len()
      ),
    }
    Ok(event.chunk.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io;

  struct Upper;

  #[async_trait::async_trait]
  impl InterceptionHook for Upper {
    async fn transform(&self, event: &InterceptionEvent) -> Result<Bytes, HookError> {
      Ok(Bytes::from(event.chunk.to_ascii_uppercase()))
    }
  }

  struct Failing;

  #[async_trait::async_trait]
  impl InterceptionHook for Failing {
    async fn transform(&self, _event: &InterceptionEvent) -> Result<Bytes, HookError> {
      Err(io::Error::other("boom").into())
    }
  }

  struct Panicking;

  #[async_trait::async_trait]
  impl InterceptionHook for Panicking {
    async fn transform(&self, _event: &InterceptionEvent) -> Result<Bytes, HookError> {
      panic!("hook exploded")
    }
  }

  struct Sleepy;

  #[async_trait::async_trait]
  impl InterceptionHook for Sleepy {
    async fn transform(&self, _event: &InterceptionEvent) -> Result<Bytes, HookError> {
      tokio::time::sleep(Duration::from_secs(30)).await;
      Ok(Bytes::from_static(b"late"))
    }
  }

  fn event(data: &'static [u8]) -> InterceptionEvent {
    InterceptionEvent::new(Direction::ClientToOrigin, 7, Bytes::from_static(data))
  }

  #[tokio::test]
  async fn empty_handler_passes_through() {
    let handler = HookHandler::new();
    assert!(!handler.has_hooks());
    assert_eq!(handler.process(event(b"abc")).await, Bytes::from_static(b"abc"));
  }

  #[tokio::test]
  async fn failing_hooks_fail_open() {
    let mut handler = HookHandler::new();
    handler.register("fail", Arc::new(Failing));
    handler.register("panic", Arc::new(Panicking));
    handler.register("upper", Arc::new(Upper));
    assert_eq!(handler.process(event(b"abc")).await, Bytes::from_static(b"ABC"));
  }

  #[tokio::test]
  async fn slow_hook_is_bounded() {
    let mut handler = HookHandler::with_timeout(Duration::from_millis(50));
    handler.register("sleepy", Arc::new(Sleepy));
    assert_eq!(handler.process(event(b"abc")).await, Bytes::from_static(b"abc"));
  }

  #[tokio::test]
  async fn disabled_and_removed_hooks_are_skipped() {
    let mut handler = HookHandler::new();
    handler.register("upper", Arc::new(Upper));
    assert!(handler.set_enabled("upper", false));
    assert_eq!(handler.process(event(b"abc")).await, Bytes::from_static(b"abc"));
    assert!(handler.set_enabled("upper", true));
    assert_eq!(handler.hook_names(), vec!["upper".to_string()]);
    assert!(handler.unregister("upper"));
    assert!(!handler.unregister("upper"));
    assert!(!handler.set_enabled("upper", true));
  }

  #[tokio::test]
  async fn snapshots_ignore_later_changes() {
    let mut handler = HookHandler::new();
    handler.register("upper", Arc::new(Upper));
    let snapshot = handler.clone();
    assert!(handler.unregister("upper"));
    assert!(!handler.has_hooks());
    assert_eq!(snapshot.hook_names(), vec!["upper".to_string()]);
    assert_eq!(snapshot.process(event(b"abc")).await, Bytes::from_static(b"ABC"));
  }

  #[test]
  fn preview_only_for_http_like_chunks() {
    assert_eq!(
      LoggingHook::preview(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").as_deref(),
      Some("GET / HTTP/1.1")
    );
    assert_eq!(
      LoggingHook::preview(b"HTTP/1.1 200 OK\r\n").as_deref(),
      Some("HTTP/1.1 200 OK")
    );
    assert_eq!(LoggingHook::preview(&[0x16, 0x03, 0x01]), None);
  }
}
