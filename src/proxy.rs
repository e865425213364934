//! Interception proxy facade

use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::errors::Result;
use crate::hook::{HookHandler, InterceptionHook};
use crate::registry::{ConnectionRegistry, SessionId, SessionInfo};
use crate::server::ProxyServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// TLS interception proxy
///
/// Owns the CA, the session registry and the hook chain, and serves CONNECT
/// tunnels through a [`ProxyServer`].
pub struct InterceptProxy {
  server: ProxyServer,
}

impl InterceptProxy {
  /// Create a new proxy with the given configuration.
  ///
  /// Loads or creates the root CA in `config.cert_dir`; failure here is fatal.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    config.validate()?;
    let ca = Arc::new(CertificateAuthority::new(&config.cert_dir, config.keygen_workers).await?);
    let server = ProxyServer::builder()
      .config(config)
      .certificate_authority(ca)
      .build()?;
    Ok(Self { server })
  }

  /// Wrap an already built server
  pub fn from_server(server: ProxyServer) -> Self {
    Self { server }
  }

  /// Configuration in use
  pub fn config(&self) -> &ProxyConfig {
    self.server.config()
  }

  /// Register a hook applied to every relayed chunk, after the hooks already
  /// registered. A hook with the same name is replaced.
  pub async fn register_interception_hook(
    &self,
    name: impl Into<String>,
    hook: impl InterceptionHook + 'static,
  ) {
    let name = name.into();
    tracing::info!("[MITM] registering interception hook {}", name);
    self
      .server
      .hook_handler()
      .write()
      .await
      .register(name, Arc::new(hook));
  }

  /// Remove a hook by name
  pub async fn unregister_interception_hook(&self, name: &str) -> bool {
    self.server.hook_handler().write().await.unregister(name)
  }

  /// Get a reference to the hook handler
  pub fn hook_handler(&self) -> Arc<RwLock<HookHandler>> {
    self.server.hook_handler()
  }

  /// Snapshots of the live tunnels
  pub fn list_active_sessions(&self) -> Vec<SessionInfo> {
    self.server.registry().list_active_sessions()
  }

  /// Close a live tunnel. Returns `false` if no such session exists.
  pub fn close_session(&self, id: SessionId) -> bool {
    self.server.registry().close_session(id)
  }

  /// Get the session registry
  pub fn registry(&self) -> &Arc<ConnectionRegistry> {
    self.server.registry()
  }

  /// Get the certificate authority
  pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
    self.server.certificate_authority()
  }

  /// Get the CA certificate path
  pub fn root_cert_path(&self) -> PathBuf {
    self.server.certificate_authority().root_cert_path()
  }

  /// Get the CA certificate in PEM format
  ///
  /// This certificate should be installed in the client's trust store
  pub fn root_cert_pem(&self) -> Result<String> {
    Ok(self.server.certificate_authority().root_cert_pem()?)
  }

  /// Start the proxy server on the given address
  pub async fn start(&self, addr: &str) -> Result<()> {
    self.server.run(addr).await
  }

  /// Serve on an already bound listener
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    self.server.serve(listener).await
  }

  /// Stop accepting connections and cancel every live tunnel
  pub fn shutdown(&self) {
    self.server.shutdown()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_intercept_proxy_creation() {
    let cert_dir = std::env::temp_dir().join(format!("slinger-bump-proxy-{}", std::process::id()));
    let config = ProxyConfig {
      cert_dir: cert_dir.clone(),
      ..Default::default()
    };

    let proxy = InterceptProxy::new(config).await.unwrap();
    let pem = proxy.root_cert_pem().unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
    assert_eq!(proxy.root_cert_path(), cert_dir.join("ca-cert.pem"));
    assert!(proxy.list_active_sessions().is_empty());
    assert!(!proxy.close_session(42));

    proxy
      .register_interception_hook("log", crate::hook::LoggingHook)
      .await;
    assert_eq!(proxy.hook_handler().read().await.hook_names(), vec!["log"]);
    assert!(proxy.unregister_interception_hook("log").await);

    std::fs::remove_dir_all(&cert_dir).ok();
  }
}
