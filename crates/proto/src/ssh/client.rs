//! SSH client front end.
//!
//! Wires the transport, user authentication and the connection service
//! together for one outgoing connection.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidewire_proto::ssh::auth::{ClientAuthMethod, StaticPassword};
//! use tidewire_proto::ssh::client::{connect_tcp, SshClientConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshClientConfig::new("user")
//!     .with_auth_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new("password"))));
//! let client = connect_tcp("127.0.0.1:2222", config).await?;
//!
//! let (output, status) = client.execute("ls -la").await?;
//! println!("{} (exit {:?})", String::from_utf8_lossy(&output), status);
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tidewire_platform::{TidewireError, TidewireResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::ssh::auth::{ClientAuthMethod, UserAuthClient};
use crate::ssh::channel::ChannelConfig;
use crate::ssh::connection::ConnectionService;
use crate::ssh::known_hosts::{HostKeyVerifier, KnownHosts, StrictHostKeyChecking};
use crate::ssh::session::Session;
use crate::ssh::transport::{HostId, Transport, TransportConfig};

/// SSH client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// Transport parameters. `host_id` is filled in by [`connect_tcp`].
    pub transport: TransportConfig,
    /// User to authenticate as.
    pub user: String,
    /// Authentication methods, tried in order.
    pub auth_methods: Vec<ClientAuthMethod>,
    /// Limit for TCP connect, handshake and authentication together.
    pub connect_timeout: Duration,
    /// Decides whether the server's host key is trusted.
    ///
    /// Defaults to an empty [`KnownHosts`] with [`StrictHostKeyChecking::Yes`],
    /// which trusts nothing.
    pub verifier: Arc<dyn HostKeyVerifier>,
    /// Receive parameters of channels this client opens.
    pub channel: ChannelConfig,
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("transport", &self.transport)
            .field("user", &self.user)
            .field("auth_methods", &self.auth_methods)
            .field("connect_timeout", &self.connect_timeout)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            user: String::new(),
            auth_methods: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            verifier: Arc::new(KnownHosts::new(StrictHostKeyChecking::Yes)),
            channel: ChannelConfig::default(),
        }
    }
}

impl SshClientConfig {
    /// Configuration for `user` with defaults otherwise.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    /// Adds an authentication method.
    pub fn with_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_methods.push(method);
        self
    }

    /// Replaces the host key verifier.
    pub fn with_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }
}

/// Splits `host:port` (or `[v6]:port`) into a [`HostId`].
fn parse_host_id(addr: &str) -> TidewireResult<HostId> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TidewireError::Config(format!("Address {} has no port", addr)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TidewireError::Config(format!("Invalid port in {}", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(HostId::new(host, port))
}

/// Connects over TCP to `addr` (`host:port`), then runs the handshake and
/// authentication.
///
/// # Errors
///
/// - [`TidewireError::Io`] with `TimedOut` if `connect_timeout` elapses
/// - any error of [`SshClient::connect`]
pub async fn connect_tcp(addr: &str, mut config: SshClientConfig) -> TidewireResult<SshClient> {
    config.transport.host_id = parse_host_id(addr)?;
    let limit = config.connect_timeout;

    tokio::time::timeout(limit, async {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr, "TCP connected");
        SshClient::establish(stream, config).await
    })
    .await
    .map_err(|_| {
        TidewireError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "Connection timeout",
        ))
    })?
}

/// An authenticated client connection.
#[derive(Debug, Clone)]
pub struct SshClient {
    transport: Transport,
    connection: Arc<ConnectionService>,
    user: String,
}

impl SshClient {
    /// Runs the handshake and authentication over an already connected
    /// stream, bounded by `connect_timeout`.
    ///
    /// # Errors
    ///
    /// - transport errors from [`Transport::connect`]
    /// - [`TidewireError::Authentication`] if no method succeeds
    pub async fn connect<S>(stream: S, config: SshClientConfig) -> TidewireResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::time::timeout(config.connect_timeout, Self::establish(stream, config))
            .await
            .map_err(|_| {
                TidewireError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Handshake timeout",
                ))
            })?
    }

    async fn establish<S>(stream: S, config: SshClientConfig) -> TidewireResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Transport::connect(stream, config.transport, config.verifier).await?;

        let auth = config
            .auth_methods
            .into_iter()
            .fold(UserAuthClient::new(config.user.clone()), |auth, method| {
                auth.with_method(method)
            });
        if let Err(e) = auth.authenticate(&transport).await {
            transport.disconnect().await;
            return Err(e);
        }

        let connection = ConnectionService::register(&transport, config.channel, None)?;
        info!(user = %config.user, server = %transport.peer_version(), "Client ready");
        Ok(Self {
            transport,
            connection,
            user: config.user,
        })
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The connection service, for opening channels of any type.
    pub fn connection(&self) -> &Arc<ConnectionService> {
        &self.connection
    }

    /// Authenticated user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Opens a session channel.
    pub async fn open_session(&self) -> TidewireResult<Session> {
        Session::open(&self.connection).await
    }

    /// Runs `command` in a new session and collects its standard output.
    ///
    /// Returns the output and the exit status, if the server reported one.
    ///
    /// # Errors
    ///
    /// [`TidewireError::Protocol`] if the server refuses the command.
    pub async fn execute(&self, command: &str) -> TidewireResult<(Vec<u8>, Option<u32>)> {
        let session = self.open_session().await?;
        if !session.exec(command).await? {
            session.close().await?;
            return Err(TidewireError::Protocol(format!(
                "Server refused to execute {}",
                command
            )));
        }
        let output = session.channel().read_to_end().await?;
        session.close().await?;
        Ok((output, session.exit_status()))
    }

    /// Closes the connection.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SshClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.auth_methods.is_empty());
        assert_eq!(config.channel, ChannelConfig::default());
    }

    #[test]
    fn test_parse_host_id() {
        assert_eq!(parse_host_id("example.com:22").unwrap(), HostId::new("example.com", 22));
        assert_eq!(parse_host_id("[::1]:2222").unwrap(), HostId::new("::1", 2222));
        assert!(parse_host_id("example.com").is_err());
        assert!(parse_host_id("example.com:ssh").is_err());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // The listener never answers the version exchange.
        let mut config = SshClientConfig::new("user");
        config.connect_timeout = Duration::from_millis(200);
        let err = connect_tcp(&addr, config).await.unwrap_err();
        assert!(matches!(
            err,
            TidewireError::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut
        ));
        drop(listener);
    }
}
