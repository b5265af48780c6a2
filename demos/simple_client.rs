//! Minimal SSH client running one command.
//!
//! ```bash
//! cargo run -p tidewire-proto --example simple_client -- 127.0.0.1:2222 "uname -a"
//! ```

use std::sync::Arc;

use tidewire_proto::ssh::auth::{ClientAuthMethod, StaticPassword};
use tidewire_proto::ssh::client::{connect_tcp, SshClientConfig};
use tidewire_proto::ssh::hostkey::HostKey;
use tidewire_proto::ssh::known_hosts::{KnownHosts, StrictHostKeyChecking};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:2222".to_string());
    let command = args.next().unwrap_or_else(|| "whoami".to_string());

    // The demo server generates a fresh key each run, so record it on first use.
    let config = SshClientConfig::new("demo")
        .with_verifier(Arc::new(KnownHosts::new(StrictHostKeyChecking::AcceptNew)))
        .with_auth_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new("demo"))));

    let client = connect_tcp(&addr, config).await?;
    if let Some(key) = client.transport().server_host_key() {
        info!(fingerprint = %key.fingerprint(), "Server host key");
    }

    let (output, status) = client.execute(&command).await?;
    print!("{}", String::from_utf8_lossy(&output));
    info!(?status, "Command finished");

    client.disconnect().await;
    Ok(())
}
