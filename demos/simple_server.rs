//! Minimal SSH server answering `exec` requests.
//!
//! ```bash
//! RUST_LOG=debug cargo run -p tidewire-proto --example simple_server
//! ```
//!
//! Then connect with `simple_client`, user `demo`, password `demo`.

use std::sync::Arc;

use tidewire_platform::TidewireResult;
use tidewire_proto::ssh::auth::StaticAuthenticator;
use tidewire_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use tidewire_proto::ssh::server::{ServerConnection, SshServer, SshServerConfig};
use tidewire_proto::ssh::session::{send_exit_status, SessionEvent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn handle(mut conn: ServerConnection) {
    while let Some(event) = conn.next_event().await {
        let result: TidewireResult<()> = async {
            match event {
                SessionEvent::Exec { channel, command } => {
                    info!(user = conn.user(), %command, "exec");
                    channel
                        .send(format!("Executed: {}\n", command).as_bytes())
                        .await?;
                    send_exit_status(&channel, 0).await?;
                    channel.send_eof().await?;
                    channel.close().await
                }
                SessionEvent::Shell { channel } => {
                    channel.send(b"No shell here.\n").await?;
                    send_exit_status(&channel, 1).await?;
                    channel.close().await
                }
                SessionEvent::Subsystem { channel, name } => {
                    warn!(%name, "Subsystem not provided");
                    channel.close().await
                }
                SessionEvent::Env { name, value, .. } => {
                    info!(%name, %value, "env");
                    Ok(())
                }
            }
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Session request failed");
        }
    }
    info!(user = conn.user(), "Connection closed");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let host_key = Ed25519HostKey::generate()?;
    info!(fingerprint = %host_key.fingerprint(), "Generated host key");

    let mut config = SshServerConfig::default();
    config.host_keys.push(Arc::new(host_key));
    config.banner = Some("Tidewire demo server\n".to_string());

    let authenticator = Arc::new(StaticAuthenticator::new().with_password("demo", "demo"));
    let server = SshServer::bind("127.0.0.1:2222", config, authenticator).await?;
    info!(addr = %server.local_addr()?, "Listening");

    server.serve(handle).await?;
    Ok(())
}
