//! Proxy configuration

use crate::errors::{Error, Result};
use crate::tls::UpstreamVerification;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the interception proxy
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyConfig {
  /// Directory holding the root CA and issued leaf certificates
  pub cert_dir: PathBuf,
  /// How origin certificates are verified
  pub upstream_verification: UpstreamVerification,
  /// Extra PEM files whose certificates are trusted for origins
  pub extra_root_certs: Vec<PathBuf>,
  /// Maximum bytes read per relay chunk
  pub chunk_size: usize,
  /// Maximum concurrent tunnels; further connections are closed on accept
  pub max_tunnels: usize,
  /// Origin TCP connect timeout in seconds
  pub connect_timeout_secs: u64,
  /// TLS handshake timeout in seconds, both toward the client and the origin
  pub handshake_timeout_secs: u64,
  /// Time allowed for the client to send its CONNECT head, in seconds
  pub connect_read_timeout_secs: u64,
  /// Time allowed per hook call, in milliseconds (0 disables the limit)
  pub hook_timeout_millis: u64,
  /// Grace period for the surviving direction once the other finishes
  pub close_grace_millis: u64,
  /// Concurrent RSA key generation / signing jobs
  pub keygen_workers: usize,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      cert_dir: PathBuf::from("./certs"),
      upstream_verification: UpstreamVerification::Verify,
      extra_root_certs: Vec::new(),
      chunk_size: 8192,
      max_tunnels: 1000,
      connect_timeout_secs: 30,
      handshake_timeout_secs: 10,
      connect_read_timeout_secs: 10,
      hook_timeout_millis: 5000,
      close_grace_millis: 500,
      keygen_workers: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4),
    }
  }
}

impl ProxyConfig {
  /// Origin TCP connect timeout
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  /// TLS handshake timeout
  pub fn handshake_timeout(&self) -> Duration {
    Duration::from_secs(self.handshake_timeout_secs)
  }

  /// CONNECT head read timeout
  pub fn connect_read_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_read_timeout_secs)
  }

  /// Per-hook time limit, `None` when disabled
  pub fn hook_timeout(&self) -> Option<Duration> {
    (self.hook_timeout_millis > 0).then(|| Duration::from_millis(self.hook_timeout_millis))
  }

  /// Grace period given to the surviving relay direction
  pub fn close_grace(&self) -> Duration {
    Duration::from_millis(self.close_grace_millis)
  }

  /// Reject values the engine cannot run with
  pub fn validate(&self) -> Result<()> {
    if self.chunk_size == 0 {
      return Err(Error::config("chunk_size must be greater than 0"));
    }
    if self.max_tunnels == 0 {
      return Err(Error::config("max_tunnels must be greater than 0"));
    }
    if self.keygen_workers == 0 {
      return Err(Error::config("keygen_workers must be greater than 0"));
    }
    if self.cert_dir.as_os_str().is_empty() {
      return Err(Error::config("cert_dir must not be empty"));
    }
    Ok(())
  }
}

#[cfg(feature = "serde")]
impl ProxyConfig {
  /// Load a JSON configuration file; a missing file yields the defaults.
  pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
    let path = path.as_ref();
    let contents = match tokio::fs::read_to_string(path).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        tracing::debug!("no config at {}, using defaults", path.display());
        return Ok(Self::default());
      }
      Err(e) => return Err(e.into()),
    };
    let config: Self = serde_json::from_str(&contents)
      .map_err(|e| Error::config(format!("invalid config {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
  }

  /// Write this configuration as pretty-printed JSON
  pub async fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
    let contents = serde_json::to_string_pretty(self)
      .map_err(|e| Error::config(format!("failed to serialize config: {}", e)))?;
    tokio::fs::write(path, contents).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = ProxyConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.chunk_size, 8192);
    assert_eq!(config.hook_timeout(), Some(Duration::from_millis(5000)));
  }

  #[test]
  fn zero_limits_are_rejected() {
    let config = ProxyConfig {
      chunk_size: 0,
      ..Default::default()
    };
    assert!(matches!(config.validate(), Err(Error::Config(_))));
    let config = ProxyConfig {
      max_tunnels: 0,
      ..Default::default()
    };
    assert!(matches!(config.validate(), Err(Error::Config(_))));
    let config = ProxyConfig {
      hook_timeout_millis: 0,
      ..Default::default()
    };
    assert_eq!(config.hook_timeout(), None);
  }

  #[cfg(feature = "serde")]
  #[tokio::test]
  async fn load_and_save() {
    let dir = std::env::temp_dir().join(format!("slinger-bump-config-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("proxy.json");

    let missing = ProxyConfig::load(&path).await.unwrap();
    assert_eq!(missing, ProxyConfig::default());

    let config = ProxyConfig {
      chunk_size: 1024,
      upstream_verification: UpstreamVerification::IgnoreHostname,
      ..Default::default()
    };
    config.save(&path).await.unwrap();
    let loaded = ProxyConfig::load(&path).await.unwrap();
    assert_eq!(loaded, config);

    tokio::fs::write(&path, r#"{"chunk_size": 64}"#).await.unwrap();
    let partial = ProxyConfig::load(&path).await.unwrap();
    assert_eq!(partial.chunk_size, 64);
    assert_eq!(partial.max_tunnels, 1000);

    tokio::fs::write(&path, r#"{"chunk_size": 0}"#).await.unwrap();
    assert!(ProxyConfig::load(&path).await.is_err());

    let _ = tokio::fs::remove_dir_all(&dir).await;
  }
}
