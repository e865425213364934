//! Proxy server implementation

use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::hook::HookHandler;
use crate::registry::ConnectionRegistry;
use crate::relay::RelayLoop;
use crate::tunnel::TunnelNegotiator;
use crate::upstream::UpstreamConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// Proxy server implementation
pub struct ProxyServer {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  registry: Arc<ConnectionRegistry>,
  hook_handler: Arc<RwLock<HookHandler>>,
  negotiator: TunnelNegotiator,
  connector: UpstreamConnector,
  relay: RelayLoop,
  tunnels: Arc<Semaphore>,
  shutdown: CancellationToken,
}

/// Builder for `ProxyServer`.
///
/// Allows sharing a CA, registry or hook chain with other components.
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Option<ProxyConfig>,
  ca: Option<Arc<CertificateAuthority>>,
  registry: Option<Arc<ConnectionRegistry>>,
  hook_handler: Option<Arc<RwLock<HookHandler>>>,
  connector: Option<UpstreamConnector>,
}

impl ProxyServerBuilder {
  /// Set the `ProxyConfig` to use.
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Set the `CertificateAuthority` to use.
  pub fn certificate_authority(mut self, ca: Arc<CertificateAuthority>) -> Self {
    self.ca = Some(ca);
    self
  }

  /// Set the `ConnectionRegistry` sessions are registered in.
  pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
    self.registry = Some(registry);
    self
  }

  /// Set the `HookHandler` to use.
  pub fn hook_handler(mut self, handler: Arc<RwLock<HookHandler>>) -> Self {
    self.hook_handler = Some(handler);
    self
  }

  /// Provide a fully constructed `UpstreamConnector` instead of building one
  /// from the configuration.
  pub fn upstream_connector(mut self, connector: UpstreamConnector) -> Self {
    self.connector = Some(connector);
    self
  }

  /// Build the `ProxyServer`.
  ///
  /// CA creation is async, so a synchronous build requires one to be
  /// provided. Callers who don't have one should use `build_async()`.
  pub fn build(self) -> Result<ProxyServer> {
    let config = self.config.unwrap_or_default();
    config.validate()?;

    let ca = match self.ca {
      Some(ca) => ca,
      None => {
        return Err(Error::config(
          "CertificateAuthority not provided; use ProxyServer::builder().build_async().await to create one automatically",
        ))
      }
    };

    let registry = self.registry.unwrap_or_default();
    let hook_handler = self.hook_handler.unwrap_or_else(|| {
      let handler = match config.hook_timeout() {
        Some(timeout) => HookHandler::with_timeout(timeout),
        None => HookHandler::new(),
      };
      Arc::new(RwLock::new(handler))
    });
    let connector = match self.connector {
      Some(connector) => connector,
      None => UpstreamConnector::from_config(&config)?,
    };

    let negotiator = TunnelNegotiator::new(
      ca.clone(),
      config.connect_read_timeout(),
      config.handshake_timeout(),
    );
    let relay = RelayLoop::new(
      registry.clone(),
      hook_handler.clone(),
      config.chunk_size,
      config.close_grace(),
    );

    Ok(ProxyServer {
      tunnels: Arc::new(Semaphore::new(config.max_tunnels)),
      config,
      ca,
      registry,
      hook_handler,
      negotiator,
      connector,
      relay,
      shutdown: CancellationToken::new(),
    })
  }

  /// Build the `ProxyServer`, creating the CA from `config.cert_dir` when
  /// none was provided.
  pub async fn build_async(mut self) -> Result<ProxyServer> {
    if self.ca.is_none() {
      let config = self.config.get_or_insert_with(ProxyConfig::default);
      config.validate()?;
      let ca = CertificateAuthority::new(&config.cert_dir, config.keygen_workers).await?;
      self.ca = Some(Arc::new(ca));
    }
    self.build()
  }
}

impl ProxyServer {
  /// Start building a proxy server
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// Configuration the server was built with
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// CA issuing the leaf certificates
  pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }

  /// Registry of live tunnels
  pub fn registry(&self) -> &Arc<ConnectionRegistry> {
    &self.registry
  }

  /// Hook chain applied to relayed chunks
  pub fn hook_handler(&self) -> Arc<RwLock<HookHandler>> {
    self.hook_handler.clone()
  }

  /// Bind `addr` and serve until [`ProxyServer::shutdown`] is called
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
      tracing::error!("[MITM] Failed to bind to {}: {}", addr, e);
      Error::IO(e)
    })?;
    self.serve(listener).await
  }

  /// Serve connections from an already bound listener until
  /// [`ProxyServer::shutdown`] is called
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    if let Ok(local) = listener.local_addr() {
      tracing::info!("[MITM] listening on {}", local);
    }
    loop {
      let accepted = tokio::select! {
        _ = self.shutdown.cancelled() => break,
        accepted = listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, peer_addr)) => {
          let Ok(permit) = self.tunnels.clone().try_acquire_owned() else {
            tracing::warn!(
              peer = %peer_addr,
              "[MITM] tunnel limit of {} reached, dropping connection",
              self.config.max_tunnels
            );
            continue;
          };
          let negotiator = self.negotiator.clone();
          let connector = self.connector.clone();
          let relay = self.relay.clone();
          let shutdown = self.shutdown.clone();

          tokio::spawn(async move {
            tokio::select! {
              _ = shutdown.cancelled() => {}
              _ = Self::handle_connection(stream, peer_addr, negotiator, connector, relay) => {}
            }
            drop(permit);
          });
        }
        Err(e) => {
          tracing::error!("[MITM] Failed to accept connection: {}", e);
        }
      }
    }
    tracing::info!("[MITM] stopped accepting connections");
    Ok(())
  }

  /// Stop accepting connections and cancel every live tunnel
  pub fn shutdown(&self) {
    self.shutdown.cancel();
    self.registry.shutdown();
  }

  /// Handle a client connection
  async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    negotiator: TunnelNegotiator,
    connector: UpstreamConnector,
    relay: RelayLoop,
  ) {
    if let Err(e) = stream.set_nodelay(true) {
      tracing::debug!(peer = %peer_addr, "[MITM] set_nodelay failed: {}", e);
    }

    let tunnel = match negotiator.negotiate(stream).await {
      Ok(tunnel) => tunnel,
      Err(e) => {
        let e = Error::from(e);
        tracing::warn!(kind = e.kind(), peer = %peer_addr, "[MITM] {}", e);
        return;
      }
    };
    let host = tunnel.target.host.clone();
    let port = tunnel.target.port;

    let origin = match connector.connect(&host, port).await {
      Ok(origin) => origin,
      Err(e) => {
        let e = Error::from(e);
        tracing::warn!(kind = e.kind(), peer = %peer_addr, host = %host, port, "[MITM] {}", e);
        return;
      }
    };

    if let Err(e) = relay.run(&host, port, tunnel.stream, origin).await {
      let e = Error::from(e);
      tracing::warn!(kind = e.kind(), peer = %peer_addr, host = %host, port, "[MITM] {}", e);
    }
  }
}
