//! TLS interception proxy with logging and request tagging
//!
//! Install the generated `ca-cert.pem` in the client trust store, then point
//! the client at the proxy, e.g.
//! `curl --proxy http://127.0.0.1:8080 --cacert certs/ca-cert.pem https://example.com`.
//!
//! To run:
//! ```bash
//! RUST_LOG=info cargo run --example intercept_proxy -- [config.json] [listen-addr]
//! ```

use slinger_bump::{
  async_trait, Bytes, Direction, HookError, InterceptProxy, InterceptionEvent, InterceptionHook,
  LoggingHook, ProxyConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Adds a marker header to every plaintext HTTP/1.1 request head it sees
struct TagRequests;

#[async_trait]
impl InterceptionHook for TagRequests {
  async fn transform(&self, event: &InterceptionEvent) -> Result<Bytes, HookError> {
    if event.direction != Direction::ClientToOrigin {
      return Ok(event.chunk.clone());
    }
    let Some(line_end) = event.chunk.windows(2).position(|w| w == b"\r\n") else {
      return Ok(event.chunk.clone());
    };
    if !event.chunk[..line_end].ends_with(b"HTTP/1.1") {
      return Ok(event.chunk.clone());
    }
    let mut tagged = Vec::with_capacity(event.chunk.len() + 24);
    tagged.extend_from_slice(&event.chunk[..line_end + 2]);
    tagged.extend_from_slice(b"X-Slinger-Bump: 1\r\n");
    tagged.extend_from_slice(&event.chunk[line_end + 2..]);
    Ok(Bytes::from(tagged))
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut args = std::env::args().skip(1);
  let config = match args.next() {
    Some(path) => ProxyConfig::load(path).await?,
    None => ProxyConfig::default(),
  };
  let addr = args.next().unwrap_or_else(|| "127.0.0.1:8080".to_string());

  let proxy = Arc::new(InterceptProxy::new(config).await?);
  println!("Root CA certificate: {}", proxy.root_cert_path().display());
  println!("Listening on {}", addr);

  proxy.register_interception_hook("log", LoggingHook).await;
  proxy.register_interception_hook("tag", TagRequests).await;

  {
    let proxy = proxy.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(Duration::from_secs(10));
      loop {
        ticker.tick().await;
        for session in proxy.list_active_sessions() {
          println!(
            "#{} {}:{} {:?} up={}B down={}B {:?}",
            session.id,
            session.host,
            session.port,
            session.duration,
            session.bytes_client_to_origin,
            session.bytes_origin_to_client,
            session.state
          );
        }
      }
    });
  }

  let server = {
    let proxy = proxy.clone();
    tokio::spawn(async move { proxy.start(&addr).await })
  };

  tokio::signal::ctrl_c().await?;
  println!("Shutting down");
  proxy.shutdown();
  server.await??;
  Ok(())
}
