#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-bump
//!
//! TLS interception ("SSL bumping") engine in the spirit of Burp Suite,
//! built on rustls.
//!
//! A client sends `CONNECT host:port`, the proxy answers
//! `200 Connection Established` and completes the TLS handshake with a leaf
//! certificate forged for `host` and signed by a local root CA. It then opens
//! its own TLS connection to the origin and relays the decrypted bytes in
//! both directions, handing every chunk to the registered
//! [`InterceptionHook`]s.
//!
//! - Root CA created once per certificate directory and reused afterwards
//! - Leaf certificates issued lazily per hostname, persisted and cached
//! - Hook chain with fail-open semantics (errors, panics and timeouts forward
//!   the original bytes)
//! - Live session listing and cancellation
//!
//! ## Running a proxy
//!
//! ```no_run
//! use slinger_bump::{InterceptProxy, LoggingHook, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let proxy = InterceptProxy::new(ProxyConfig::default()).await?;
//!   println!("install {} in the client trust store", proxy.root_cert_path().display());
//!   proxy.register_interception_hook("log", LoggingHook).await;
//!   proxy.start("127.0.0.1:8080").await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Writing a hook
//!
//! The bytes returned by a hook replace the chunk; an empty buffer drops it.
//!
//! ```
//! use slinger_bump::{Bytes, HookError, InterceptionEvent, InterceptionHook};
//!
//! struct Redact;
//!
//! #[slinger_bump::async_trait]
//! impl InterceptionHook for Redact {
//!   async fn transform(&self, event: &InterceptionEvent) -> Result<Bytes, HookError> {
//!     let text = String::from_utf8_lossy(&event.chunk);
//!     Ok(Bytes::from(text.replace("password", "********")))
//!   }
//! }
//! ```
//!
//! ## Certificate storage
//!
//! ```text
//! ca-key.pem        root private key, PKCS8 PEM
//! ca-cert.pem       root certificate
//! {hostname}.key    leaf private key, PKCS8 PEM
//! {hostname}.crt    leaf certificate
//! ```
//!
//! Leaves are read from disk the first time a host is seen by a running
//! process and then served from memory until they expire. A pair that is
//! missing, expired, damaged or signed by another root is reissued when it is
//! next read. Deleting only one of the root files is an error: the CA is never
//! replaced silently.

mod ca;
mod config;
mod errors;
mod hook;
mod proxy;
mod registry;
mod relay;
mod server;
mod tls;
mod tunnel;
mod upstream;

pub use async_trait::async_trait;
pub use bytes::Bytes;
pub use ca::{CertificateAuthority, LeafCertificate, ROOT_CERT_FILE, ROOT_KEY_FILE};
pub use config::ProxyConfig;
pub use errors::{CaError, Error, RelayError, Result, TunnelError, UpstreamError};
pub use hook::{Direction, HookError, HookHandler, InterceptionEvent, InterceptionHook, LoggingHook};
pub use proxy::InterceptProxy;
pub use registry::{
  ConnectionRegistry, SessionGuard, SessionId, SessionInfo, SessionState, TunnelSession,
};
pub use relay::{RelayLoop, RelaySummary};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use tls::{load_pem_certs, UpstreamVerification};
pub use tokio_rustls;
pub use tunnel::{
  ConnectRequest, EstablishedTunnel, TunnelNegotiator, TunnelState, CONNECT_ESTABLISHED,
};
pub use upstream::UpstreamConnector;
