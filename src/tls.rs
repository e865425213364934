//! TLS configuration and types
//!
use crate::ca::LeafCertificate;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::{
  self, ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, ServerConfig,
  SignatureScheme,
};

/// Only HTTP/1.1 is offered on either side of the tunnel
pub(crate) const ALPN_HTTP1: &[u8] = b"http/1.1";

/// How the proxy verifies origin certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UpstreamVerification {
  /// Full chain and hostname verification
  #[default]
  Verify,
  /// Verify the chain against the trust roots but accept any hostname
  IgnoreHostname,
  /// Accept any certificate
  Disabled,
}

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Read every certificate from a PEM file
pub fn load_pem_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
  let file = std::fs::File::open(path)?;
  read_pem_certs(&mut std::io::BufReader::new(file))
}

pub(crate) fn read_pem_certs(
  reader: &mut impl BufRead,
) -> std::io::Result<Vec<CertificateDer<'static>>> {
  rustls_pemfile::certs(reader).collect()
}

/// Server-side config presenting `leaf` to the client
pub(crate) fn server_config(leaf: &LeafCertificate) -> Result<ServerConfig, TLSError> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(leaf.cert_chain(), leaf.private_key())?;
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(config)
}

/// Client-side config used toward origins
pub(crate) fn client_config(
  verification: UpstreamVerification,
  extra_roots: Vec<CertificateDer<'static>>,
) -> Result<ClientConfig, TLSError> {
  let mut root_cert_store = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for err in &native.errors {
    tracing::debug!("[MITM] skipping native certificate: {}", err);
  }
  let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
  tracing::debug!(
    "[MITM] loaded {} native trust roots ({} ignored)",
    added,
    ignored
  );
  for cert in extra_roots {
    root_cert_store.add(cert)?;
  }

  let provider = provider();
  let algorithms = provider.signature_verification_algorithms;
  let config_builder = ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()?;
  let config_builder = match verification {
    UpstreamVerification::Verify => config_builder.with_root_certificates(root_cert_store),
    UpstreamVerification::IgnoreHostname => config_builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(RelaxedVerifier {
        roots: Some(root_cert_store),
        algorithms,
      })),
    UpstreamVerification::Disabled => config_builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(RelaxedVerifier {
        roots: None,
        algorithms,
      })),
  };
  let mut config = config_builder.with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(config)
}

/// Origin verifier for the relaxed modes.
///
/// The server name is never checked. The chain is checked against `roots`
/// when present and accepted as is otherwise. Handshake signatures are
/// always verified, so the origin still has to hold the key of whatever
/// certificate it presents.
#[derive(Debug)]
struct RelaxedVerifier {
  roots: Option<RootCertStore>,
  algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for RelaxedVerifier {
  fn verify_server_cert(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    now: UnixTime,
  ) -> Result<ServerCertVerified, TLSError> {
    if let Some(roots) = &self.roots {
      let cert = ParsedCertificate::try_from(end_entity)?;
      rustls::client::verify_server_cert_signed_by_trust_anchor(
        &cert,
        roots,
        intermediates,
        now,
        self.algorithms.all,
      )?;
    }
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.algorithms.supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn client_configs_build_for_every_mode() {
    for mode in [
      UpstreamVerification::Verify,
      UpstreamVerification::IgnoreHostname,
      UpstreamVerification::Disabled,
    ] {
      let config = client_config(mode, Vec::new()).unwrap();
      assert_eq!(config.alpn_protocols, vec![ALPN_HTTP1.to_vec()]);
    }
  }

  #[test]
  fn relaxed_verifier_checks_the_chain_only_when_given_roots() {
    let algorithms = provider().signature_verification_algorithms;
    let garbage = CertificateDer::from(b"not a certificate".to_vec());
    let name = ServerName::try_from("example.com").unwrap();

    let disabled = RelaxedVerifier {
      roots: None,
      algorithms,
    };
    assert!(disabled
      .verify_server_cert(&garbage, &[], &name, &[], UnixTime::now())
      .is_ok());

    let chain_only = RelaxedVerifier {
      roots: Some(RootCertStore::empty()),
      algorithms,
    };
    assert!(chain_only
      .verify_server_cert(&garbage, &[], &name, &[], UnixTime::now())
      .is_err());
    assert!(!chain_only.supported_verify_schemes().is_empty());
  }

  #[test]
  fn garbage_pem_yields_no_certs() {
    let certs = read_pem_certs(&mut &b"not a pem"[..]).unwrap();
    assert!(certs.is_empty());
  }
}
