//! Create (or load) a root CA and issue leaf certificates for hostnames
//!
//! To run:
//! ```bash
//! cargo run --example issue_certificates -- ./certs example.com 10.0.0.1
//! ```

use slinger_bump::CertificateAuthority;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut args = std::env::args().skip(1);
  let cert_dir = args.next().unwrap_or_else(|| "./certs".to_string());
  let workers = std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(4);

  let ca = CertificateAuthority::new(&cert_dir, workers).await?;
  println!("root: {}", ca.root_cert_path().display());

  for host in args {
    let leaf = ca.leaf_certificate(&host).await?;
    println!(
      "{}: {} {} (valid until {})",
      leaf.host(),
      leaf.cert_path().display(),
      leaf.key_path().display(),
      leaf.not_after()
    );
  }
  Ok(())
}
