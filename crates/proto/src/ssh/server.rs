//! SSH server front end.
//!
//! [`SshServer`] listens on TCP and turns each accepted socket into an
//! authenticated [`ServerConnection`] whose session requests arrive as
//! [`SessionEvent`]s.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidewire_proto::ssh::auth::StaticAuthenticator;
//! use tidewire_proto::ssh::hostkey::Ed25519HostKey;
//! use tidewire_proto::ssh::server::{SshServer, SshServerConfig};
//! use tidewire_proto::ssh::session::{send_exit_status, SessionEvent};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SshServerConfig::default();
//! config.host_keys.push(Arc::new(Ed25519HostKey::generate()?));
//! let auth = Arc::new(StaticAuthenticator::new().with_password("user", "password"));
//!
//! let server = SshServer::bind("127.0.0.1:2222", config, auth).await?;
//! let mut conn = server.accept().await?;
//! while let Some(event) = conn.next_event().await {
//!     if let SessionEvent::Exec { channel, command } = event {
//!         channel.send(format!("Executed: {}\n", command).as_bytes()).await?;
//!         send_exit_status(&channel, 0).await?;
//!         channel.close().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tidewire_platform::{TidewireError, TidewireResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ssh::auth::{
    Authenticator, UserAuthServer, CONNECTION_SERVICE, DEFAULT_FAILURE_DELAY, DEFAULT_MAX_ATTEMPTS,
};
use crate::ssh::channel::ChannelConfig;
use crate::ssh::connection::ConnectionService;
use crate::ssh::hostkey::HostKey;
use crate::ssh::session::{SessionAcceptor, SessionEvent};
use crate::ssh::transport::{HostId, Transport, TransportConfig};

/// SSH server configuration.
#[derive(Clone)]
pub struct SshServerConfig {
    /// Transport parameters. `host_id` is set to the peer address per
    /// connection.
    pub transport: TransportConfig,
    /// Host keys offered to clients; at least one is required.
    pub host_keys: Vec<Arc<dyn HostKey>>,
    /// Authentication requests answered before disconnecting.
    pub max_auth_attempts: u32,
    /// Pause after each failed authentication request.
    pub auth_failure_delay: Duration,
    /// Methods offered in USERAUTH_FAILURE.
    pub auth_methods: Vec<String>,
    /// Banner sent before authentication.
    pub banner: Option<String>,
    /// Receive parameters of accepted channels.
    pub channel: ChannelConfig,
    /// Limit for handshake and authentication together.
    pub handshake_timeout: Duration,
}

impl std::fmt::Debug for SshServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let host_keys: Vec<&str> = self.host_keys.iter().map(|k| k.algorithm_name()).collect();
        f.debug_struct("SshServerConfig")
            .field("transport", &self.transport)
            .field("host_keys", &host_keys)
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("auth_failure_delay", &self.auth_failure_delay)
            .field("auth_methods", &self.auth_methods)
            .field("banner", &self.banner)
            .field("channel", &self.channel)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            host_keys: Vec::new(),
            max_auth_attempts: DEFAULT_MAX_ATTEMPTS,
            auth_failure_delay: DEFAULT_FAILURE_DELAY,
            auth_methods: vec!["publickey".to_string(), "password".to_string()],
            banner: None,
            channel: ChannelConfig::default(),
            handshake_timeout: Duration::from_secs(120),
        }
    }
}

impl SshServerConfig {
    fn user_auth(&self, authenticator: Arc<dyn Authenticator>) -> UserAuthServer {
        let methods: Vec<&str> = self.auth_methods.iter().map(String::as_str).collect();
        let auth = UserAuthServer::new(authenticator)
            .with_methods(&methods)
            .with_max_attempts(self.max_auth_attempts)
            .with_failure_delay(self.auth_failure_delay);
        match &self.banner {
            Some(banner) => auth.with_banner(banner.clone()),
            None => auth,
        }
    }
}

/// TCP listener producing authenticated connections.
pub struct SshServer {
    listener: TcpListener,
    config: SshServerConfig,
    authenticator: Arc<dyn Authenticator>,
}

impl std::fmt::Debug for SshServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SshServer {
    /// Binds to `addr`.
    ///
    /// # Errors
    ///
    /// - [`TidewireError::Config`] if `config.host_keys` is empty
    /// - [`TidewireError::Io`] if binding fails
    pub async fn bind(
        addr: &str,
        config: SshServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> TidewireResult<Self> {
        if config.host_keys.is_empty() {
            return Err(TidewireError::Config(
                "At least one host key is required".to_string(),
            ));
        }
        let listener = TcpListener::bind(addr).await?;
        info!(addr = ?listener.local_addr().ok(), "SSH server listening");
        Ok(Self {
            listener,
            config,
            authenticator,
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one connection and runs its handshake and authentication.
    ///
    /// # Errors
    ///
    /// Errors of the handshake are returned; the listener stays usable.
    pub async fn accept(&self) -> TidewireResult<ServerConnection> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%peer, "TCP connection accepted");

        let mut config = self.config.clone();
        config.transport.host_id = HostId::new(peer.ip().to_string(), peer.port());
        ServerConnection::establish(stream, config, self.authenticator.clone()).await
    }

    /// Accepts connections forever, running `handler` on each in its own task.
    ///
    /// Failed handshakes are logged and skipped.
    pub async fn serve<F, Fut>(self, handler: F) -> TidewireResult<()>
    where
        F: Fn(ServerConnection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let server = Arc::new(self);
        let handler = Arc::new(handler);
        loop {
            let (stream, peer) = server.listener.accept().await?;
            let server = server.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut config = server.config.clone();
                config.transport.host_id = HostId::new(peer.ip().to_string(), peer.port());
                let authenticator = server.authenticator.clone();
                match ServerConnection::establish(stream, config, authenticator).await {
                    Ok(conn) => handler(conn).await,
                    Err(e) => warn!(%peer, error = %e, "Handshake failed"),
                }
            });
        }
    }
}

/// An authenticated server-side connection.
#[derive(Debug)]
pub struct ServerConnection {
    transport: Transport,
    connection: Arc<ConnectionService>,
    user: String,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl ServerConnection {
    /// Runs the server handshake and authentication over `stream`, bounded
    /// by `handshake_timeout`.
    ///
    /// # Errors
    ///
    /// - transport errors from [`Transport::accept`]
    /// - [`TidewireError::Disconnect`] once the attempt limit is reached
    /// - [`TidewireError::Io`] with `TimedOut` if the limit elapses
    pub async fn establish<S>(
        stream: S,
        config: SshServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> TidewireResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let limit = config.handshake_timeout;
        tokio::time::timeout(limit, Self::handshake(stream, config, authenticator))
            .await
            .map_err(|_| {
                TidewireError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Handshake timeout",
                ))
            })?
    }

    async fn handshake<S>(
        stream: S,
        config: SshServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> TidewireResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let auth = config.user_auth(authenticator);
        let transport =
            Transport::accept(stream, config.transport.clone(), config.host_keys.clone()).await?;

        let (acceptor, events) = SessionAcceptor::new();
        let mut connection = None;
        let result = auth
            .authenticate_then(&transport, |_| {
                connection = Some(ConnectionService::register(
                    &transport,
                    config.channel,
                    Some(Arc::new(acceptor)),
                )?);
                transport.expect_service_request()
            })
            .await;

        let user = match result {
            Ok(user) => user,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };
        let connection = connection.ok_or_else(|| {
            TidewireError::Other("Connection service was not registered".into())
        })?;
        info!(%user, peer = %config.transport.host_id, "Client authenticated");

        // The connection service already runs; a client may still ask for it
        // explicitly.
        let service_transport = transport.clone();
        tokio::spawn(async move {
            if let Err(e) = service_transport.accept_service(&[CONNECTION_SERVICE]).await {
                debug!(error = %e, "No service request after authentication");
            }
        });

        Ok(Self {
            transport,
            connection,
            user,
            events,
        })
    }

    /// Next accepted session request, or None once the connection is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The connection service.
    pub fn connection(&self) -> &Arc<ConnectionService> {
        &self.connection
    }

    /// Authenticated user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Closes the connection.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }
}
