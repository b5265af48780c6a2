//! SSH connection protocol (RFC 4254).
//!
//! [`ConnectionService`] multiplexes [`Channel`]s over one authenticated
//! transport. It registers itself for message types 80 to 100 under the
//! `ssh-connection` scope and routes every channel message to its channel by
//! the recipient id.
//!
//! - outgoing opens: [`ConnectionService::open`]
//! - incoming opens: offered to a [`ChannelAcceptor`], accepted channels come
//!   out of [`ConnectionService::accept_channel`]
//! - global requests: always answered with REQUEST_FAILURE
//!
//! # Example
//!
//! ```rust,no_run
//! use tidewire_proto::ssh::channel::ChannelConfig;
//! use tidewire_proto::ssh::connection::ConnectionService;
//! # async fn example(transport: tidewire_proto::ssh::transport::Transport)
//! #     -> tidewire_platform::TidewireResult<()> {
//! let connection = ConnectionService::register(&transport, ChannelConfig::default(), None)?;
//! let channel = connection.open("session", &[]).await?;
//! channel.send(b"hello").await?;
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use tidewire_platform::{TidewireError, TidewireResult};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelConfig, ChannelHandler, ChannelRequest, RemoteChannel};
use super::codec::{Reader, Writer};
use super::dispatcher::MessageHandler;
use super::message::{ChannelOpenFailureReason, MessageType};
use super::transport::Transport;

/// Handler scope of the connection protocol.
pub const CONNECTION_SCOPE: &str = "ssh-connection";

/// Message types handled by [`ConnectionService`].
pub const CONNECTION_MESSAGES: std::ops::RangeInclusive<u8> = 80..=100;

/// Accepted channels waiting for [`ConnectionService::accept_channel`]
/// before further opens are refused with RESOURCE_SHORTAGE.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 32;

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type name
    pub channel_type: String,
    /// Sender's channel id
    pub sender_channel: u32,
    /// Sender's initial window
    pub initial_window_size: u32,
    /// Sender's maximum packet size
    pub maximum_packet_size: u32,
    /// Channel type specific data
    pub extra: Vec<u8>,
}

impl ChannelOpen {
    /// Serializes to bytes.
    ///
    /// Format:
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpen);
        w.put_str(&self.channel_type);
        w.put_u32(self.sender_channel);
        w.put_u32(self.initial_window_size);
        w.put_u32(self.maximum_packet_size);
        w.put_raw(&self.extra);
        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = expect_type(data, MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: r.get_utf8()?,
            sender_channel: r.get_u32()?,
            initial_window_size: r.get_u32()?,
            maximum_packet_size: r.get_u32()?,
            extra: r.rest().to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel id, as the peer received it
    pub recipient_channel: u32,
    /// The peer's channel id
    pub sender_channel: u32,
    /// The peer's initial window
    pub initial_window_size: u32,
    /// The peer's maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpenConfirmation);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.sender_channel);
        w.put_u32(self.initial_window_size);
        w.put_u32(self.maximum_packet_size);
        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = expect_type(data, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
            sender_channel: r.get_u32()?,
            initial_window_size: r.get_u32()?,
            maximum_packet_size: r.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// The id the opener assigned
    pub recipient_channel: u32,
    /// Reason code (1 to 4 are defined)
    pub reason_code: u32,
    /// Human readable description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpenFailure);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.reason_code);
        w.put_str(&self.description);
        w.put_str("");
        w.into_vec()
    }

    /// Parses from bytes. The language tag may be missing.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = expect_type(data, MessageType::ChannelOpenFailure)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
            reason_code: r.get_u32()?,
            description: r.get_utf8()?,
        })
    }
}

fn expect_type(data: &[u8], msg_type: MessageType) -> TidewireResult<Reader<'_>> {
    let mut r = Reader::new(data);
    let actual = r.get_u8()?;
    if actual != msg_type as u8 {
        return Err(TidewireError::Protocol(format!(
            "Expected {}, got message type {}",
            msg_type.name(),
            actual
        )));
    }
    Ok(r)
}

/// Answer to an incoming CHANNEL_OPEN.
pub enum ChannelDecision {
    /// Open the channel; `handler` answers its requests.
    Accept(Arc<dyn ChannelHandler>),
    /// Refuse with a reason code and description.
    Reject(ChannelOpenFailureReason, String),
}

impl fmt::Debug for ChannelDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelDecision::Accept(_) => f.write_str("Accept"),
            ChannelDecision::Reject(reason, description) => f
                .debug_tuple("Reject")
                .field(reason)
                .field(description)
                .finish(),
        }
    }
}

/// Decides on channels the peer opens.
#[async_trait]
pub trait ChannelAcceptor: Send + Sync {
    /// `extra` is the channel type specific data of the open request.
    async fn accept(&self, channel_type: &str, extra: &[u8]) -> ChannelDecision;

    /// Whether accepted channels are queued for
    /// [`ConnectionService::accept_channel`]. Acceptors that hand channels
    /// to the application some other way return false.
    fn queues_channels(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct Channels {
    by_local: HashMap<u32, Channel>,
    by_remote: HashMap<u32, Channel>,
}

/// Channel multiplexer for one transport.
pub struct ConnectionService {
    transport: Transport,
    config: ChannelConfig,
    next_id: AtomicU32,
    channels: StdMutex<Channels>,
    acceptor: Option<Arc<dyn ChannelAcceptor>>,
    incoming_tx: StdMutex<Option<mpsc::Sender<Channel>>>,
    incoming_rx: Mutex<mpsc::Receiver<Channel>>,
}

impl fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionService")
            .field("config", &self.config)
            .field("channels", &self.channel_count())
            .finish_non_exhaustive()
    }
}

impl ConnectionService {
    /// Creates the service and registers it on `transport`.
    ///
    /// # Arguments
    ///
    /// * `transport` - An authenticated transport
    /// * `config` - Receive parameters for channels opened on either side
    /// * `acceptor` - Decides on incoming opens; without one every incoming
    ///   open is refused with UNKNOWN_CHANNEL_TYPE
    ///
    /// # Errors
    ///
    /// [`TidewireError::Config`] if another scope already handles the
    /// connection message types.
    pub fn register(
        transport: &Transport,
        config: ChannelConfig,
        acceptor: Option<Arc<dyn ChannelAcceptor>>,
    ) -> TidewireResult<Arc<Self>> {
        Self::register_with_backlog(transport, config, acceptor, DEFAULT_ACCEPT_BACKLOG)
    }

    /// Like [`ConnectionService::register`] with room for `backlog`
    /// accepted channels not yet taken by [`ConnectionService::accept_channel`].
    pub fn register_with_backlog(
        transport: &Transport,
        config: ChannelConfig,
        acceptor: Option<Arc<dyn ChannelAcceptor>>,
        backlog: usize,
    ) -> TidewireResult<Arc<Self>> {
        if backlog == 0 {
            return Err(TidewireError::Config(
                "Accept backlog must be at least 1".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(backlog);
        let service = Arc::new(Self {
            transport: transport.clone(),
            config,
            next_id: AtomicU32::new(0),
            channels: StdMutex::new(Channels::default()),
            acceptor,
            incoming_tx: StdMutex::new(Some(tx)),
            incoming_rx: Mutex::new(rx),
        });
        let types: Vec<u8> = CONNECTION_MESSAGES.collect();
        transport.register_handlers(CONNECTION_SCOPE, &types, service.clone())?;
        debug!("Connection service registered");
        Ok(service)
    }

    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The transport the service runs over.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Number of channels not yet closed by both sides.
    pub fn channel_count(&self) -> usize {
        self.channels().by_local.len()
    }

    /// Looks a channel up by our id.
    pub fn channel(&self, local_id: u32) -> Option<Channel> {
        self.channels().by_local.get(&local_id).cloned()
    }

    /// Looks a channel up by the peer's id.
    pub fn channel_by_remote_id(&self, remote_id: u32) -> Option<Channel> {
        self.channels().by_remote.get(&remote_id).cloned()
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a channel of `channel_type` and waits for the peer's answer.
    ///
    /// # Errors
    ///
    /// - [`TidewireError::ChannelOpenFailed`] with the peer's reason code
    /// - [`TidewireError::ConnectionLost`] if the connection ends first
    pub async fn open(&self, channel_type: &str, extra: &[u8]) -> TidewireResult<Channel> {
        self.open_with_config(channel_type, extra, self.config).await
    }

    /// Like [`ConnectionService::open`] with explicit receive parameters.
    pub async fn open_with_config(
        &self,
        channel_type: &str,
        extra: &[u8],
        config: ChannelConfig,
    ) -> TidewireResult<Channel> {
        let local_id = self.allocate_id();
        let (channel, reply) =
            Channel::opening(self.transport.clone(), local_id, channel_type, config);
        self.channels().by_local.insert(local_id, channel.clone());

        let open = ChannelOpen {
            channel_type: channel_type.to_string(),
            sender_channel: local_id,
            initial_window_size: config.window_size,
            maximum_packet_size: config.max_packet_size,
            extra: extra.to_vec(),
        };
        debug!(channel = local_id, channel_type, "Opening channel");

        if let Err(e) = self.transport.send(&open.to_bytes()).await {
            self.forget(&channel);
            return Err(e);
        }
        let result = reply.await.unwrap_or_else(|_| {
            Err(TidewireError::ConnectionLost(
                "Channel open was abandoned".to_string(),
            ))
        });
        match result {
            Ok(()) => {
                info!(
                    channel = local_id,
                    remote = ?channel.remote_id(),
                    channel_type,
                    "Channel open"
                );
                Ok(channel)
            }
            Err(e) => {
                // Closed before the peer answered: the id stays reserved
                // until the confirmation or failure arrives.
                if !channel.is_open_pending() {
                    self.forget(&channel);
                }
                Err(e)
            }
        }
    }

    /// Waits for the next channel the peer opened and we accepted.
    ///
    /// # Errors
    ///
    /// [`TidewireError::ConnectionLost`] once the connection has ended.
    pub async fn accept_channel(&self) -> TidewireResult<Channel> {
        self.incoming_rx.lock().await.recv().await.ok_or_else(|| {
            TidewireError::ConnectionLost("Connection closed".to_string())
        })
    }

    fn forget(&self, channel: &Channel) {
        let mut channels = self.channels();
        channels.by_local.remove(&channel.local_id());
        if let Some(remote_id) = channel.remote_id() {
            if channels
                .by_remote
                .get(&remote_id)
                .is_some_and(|c| c.local_id() == channel.local_id())
            {
                channels.by_remote.remove(&remote_id);
            }
        }
    }

    fn lookup(&self, local_id: u32) -> TidewireResult<Channel> {
        self.channel(local_id).ok_or_else(|| {
            TidewireError::Protocol(format!("Message for unknown channel {}", local_id))
        })
    }

    async fn handle_open(&self, payload: &[u8]) -> TidewireResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        if self.channel_by_remote_id(open.sender_channel).is_some() {
            return Err(TidewireError::Protocol(format!(
                "Peer reused channel id {}",
                open.sender_channel
            )));
        }

        let decision = match &self.acceptor {
            Some(acceptor) => acceptor.accept(&open.channel_type, &open.extra).await,
            None => ChannelDecision::Reject(
                ChannelOpenFailureReason::UnknownChannelType,
                format!("Unknown channel type {}", open.channel_type),
            ),
        };

        let queue = self.acceptor.as_ref().is_some_and(|a| a.queues_channels());
        let (handler, permit) = match decision {
            ChannelDecision::Accept(handler) if !queue => (handler, None),
            ChannelDecision::Accept(handler) => match self.reserve_incoming() {
                Some(permit) => (handler, Some(permit)),
                None => {
                    warn!(
                        channel_type = %open.channel_type,
                        "Accept backlog full, refusing channel open"
                    );
                    let failure = ChannelOpenFailure {
                        recipient_channel: open.sender_channel,
                        reason_code: ChannelOpenFailureReason::ResourceShortage.code(),
                        description: "Too many unaccepted channels".to_string(),
                    };
                    return self.transport.send(&failure.to_bytes()).await;
                }
            },
            ChannelDecision::Reject(reason, description) => {
                info!(
                    channel_type = %open.channel_type,
                    reason = reason.as_str(),
                    "Refusing channel open"
                );
                let failure = ChannelOpenFailure {
                    recipient_channel: open.sender_channel,
                    reason_code: reason.code(),
                    description,
                };
                return self.transport.send(&failure.to_bytes()).await;
            }
        };

        let local_id = self.allocate_id();
        let remote = RemoteChannel {
            id: open.sender_channel,
            window_left: open.initial_window_size,
            max_packet_size: open.maximum_packet_size,
        };
        let channel = Channel::accepted(
            self.transport.clone(),
            local_id,
            &open.channel_type,
            self.config,
            remote,
            handler,
        );
        {
            let mut channels = self.channels();
            channels.by_local.insert(local_id, channel.clone());
            channels.by_remote.insert(remote.id, channel.clone());
        }

        let confirmation = ChannelOpenConfirmation {
            recipient_channel: remote.id,
            sender_channel: local_id,
            initial_window_size: self.config.window_size,
            maximum_packet_size: self.config.max_packet_size,
        };
        self.transport.send(&confirmation.to_bytes()).await?;
        info!(
            channel = local_id,
            remote = remote.id,
            channel_type = %open.channel_type,
            "Accepted channel"
        );

        if let Some(permit) = permit {
            permit.send(channel);
        }
        Ok(())
    }

    fn reserve_incoming(&self) -> Option<mpsc::OwnedPermit<Channel>> {
        let tx = self
            .incoming_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()?;
        tx.try_reserve_owned().ok()
    }

    async fn handle_open_confirmation(&self, payload: &[u8]) -> TidewireResult<()> {
        let confirmation = ChannelOpenConfirmation::from_bytes(payload)?;
        let channel = self.lookup(confirmation.recipient_channel)?;
        let remote = RemoteChannel {
            id: confirmation.sender_channel,
            window_left: confirmation.initial_window_size,
            max_packet_size: confirmation.maximum_packet_size,
        };
        self.channels().by_remote.insert(remote.id, channel.clone());
        if channel.on_open_confirmed(remote) {
            // Closed locally while the open was in flight.
            let mut w = Writer::message(MessageType::ChannelClose);
            w.put_u32(remote.id);
            self.transport.send(w.as_slice()).await?;
        }
        Ok(())
    }

    fn handle_open_failure(&self, payload: &[u8]) -> TidewireResult<()> {
        let failure = ChannelOpenFailure::from_bytes(payload)?;
        let channel = self.lookup(failure.recipient_channel)?;
        info!(
            channel = failure.recipient_channel,
            reason = failure.reason_code,
            description = %failure.description,
            "Channel open refused"
        );
        self.forget(&channel);
        channel.on_open_failed(failure.reason_code, failure.description);
        Ok(())
    }

    async fn handle_channel_message(
        &self,
        msg_type: MessageType,
        payload: &[u8],
    ) -> TidewireResult<()> {
        let mut r = Reader::new(payload);
        r.get_u8()?;
        let channel = self.lookup(r.get_u32()?)?;

        match msg_type {
            MessageType::ChannelWindowAdjust => channel.on_window_adjust(r.get_u32()?),
            MessageType::ChannelData => channel.on_data(None, r.get_string()?),
            MessageType::ChannelExtendedData => {
                let code = r.get_u32()?;
                channel.on_data(Some(code), r.get_string()?);
            }
            MessageType::ChannelEof => channel.on_eof(),
            MessageType::ChannelClose => {
                self.forget(&channel);
                channel.on_close().await?;
            }
            MessageType::ChannelSuccess => channel.on_request_reply(true),
            MessageType::ChannelFailure => channel.on_request_reply(false),
            MessageType::ChannelRequest => {
                let (_, request) = ChannelRequest::from_bytes(payload)?;
                let accepted = channel.on_request(&request).await;
                debug!(
                    channel = channel.local_id(),
                    request = %request.request_type,
                    accepted,
                    "Handled channel request"
                );
                if request.want_reply && !channel.is_closed() {
                    if let Some(remote_id) = channel.remote_id() {
                        let reply = if accepted {
                            MessageType::ChannelSuccess
                        } else {
                            MessageType::ChannelFailure
                        };
                        let mut w = Writer::message(reply);
                        w.put_u32(remote_id);
                        self.transport.send(w.as_slice()).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_global_request(&self, payload: &[u8]) -> TidewireResult<()> {
        let mut r = expect_type(payload, MessageType::GlobalRequest)?;
        let name = r.get_utf8()?;
        let want_reply = r.get_bool()?;
        debug!(request = %name, want_reply, "Refusing global request");
        if want_reply {
            self.transport
                .send(&[MessageType::RequestFailure as u8])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ConnectionService {
    async fn handle(&self, _transport: &Transport, payload: &[u8]) -> TidewireResult<()> {
        let Some(msg_type) = payload.first().copied().and_then(MessageType::from_u8) else {
            return Err(TidewireError::Protocol(format!(
                "Unknown connection message {:?}",
                payload.first()
            )));
        };

        match msg_type {
            MessageType::GlobalRequest => self.handle_global_request(payload).await,
            MessageType::RequestSuccess | MessageType::RequestFailure => {
                warn!(msg_type = msg_type.name(), "Unsolicited global request reply");
                Ok(())
            }
            MessageType::ChannelOpen => self.handle_open(payload).await,
            MessageType::ChannelOpenConfirmation => self.handle_open_confirmation(payload).await,
            MessageType::ChannelOpenFailure => self.handle_open_failure(payload),
            _ => self.handle_channel_message(msg_type, payload).await,
        }
    }

    async fn on_transport_closed(&self) {
        self.incoming_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let channels: Vec<Channel> = {
            let mut channels = self.channels();
            channels.by_remote.clear();
            channels.by_local.drain().map(|(_, c)| c).collect()
        };
        debug!(channels = channels.len(), "Closing channels after transport loss");
        for channel in channels {
            channel.on_transport_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::channel::DefaultChannelHandler;
    use crate::ssh::transport::test_support::{pair, LIMIT};
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct AcceptSessions;

    #[async_trait]
    impl ChannelAcceptor for AcceptSessions {
        async fn accept(&self, channel_type: &str, _extra: &[u8]) -> ChannelDecision {
            match channel_type {
                "session" => ChannelDecision::Accept(Arc::new(DefaultChannelHandler)),
                "direct-tcpip" => ChannelDecision::Reject(
                    ChannelOpenFailureReason::AdministrativelyProhibited,
                    "Forwarding disabled".to_string(),
                ),
                other => ChannelDecision::Reject(
                    ChannelOpenFailureReason::UnknownChannelType,
                    format!("Unknown channel type {}", other),
                ),
            }
        }
    }

    async fn services(
        client_config: ChannelConfig,
        server_config: ChannelConfig,
    ) -> (Arc<ConnectionService>, Arc<ConnectionService>) {
        let (client, server) = pair().await;
        let client = ConnectionService::register(&client, client_config, None).unwrap();
        let server =
            ConnectionService::register(&server, server_config, Some(Arc::new(AcceptSessions)))
                .unwrap();
        (client, server)
    }

    async fn open_pair(
        client: &ConnectionService,
        server: &ConnectionService,
    ) -> (Channel, Channel) {
        let local = timeout(LIMIT, client.open("session", &[])).await.unwrap().unwrap();
        let remote = timeout(LIMIT, server.accept_channel()).await.unwrap().unwrap();
        (local, remote)
    }

    #[test]
    fn test_open_messages_round_trip() {
        let open = ChannelOpen {
            channel_type: "session".to_string(),
            sender_channel: 3,
            initial_window_size: 32768,
            maximum_packet_size: 16384,
            extra: vec![],
        };
        assert_eq!(ChannelOpen::from_bytes(&open.to_bytes()).unwrap(), open);

        let failure = ChannelOpenFailure {
            recipient_channel: 3,
            reason_code: 2,
            description: "no".to_string(),
        };
        assert_eq!(
            ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap(),
            failure
        );
        assert!(ChannelOpenConfirmation::from_bytes(&open.to_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_open_and_exchange_data() {
        let (client, server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let (local, remote) = open_pair(&client, &server).await;
        assert_eq!(local.remote_id(), Some(remote.local_id()));
        assert_eq!(remote.remote_id(), Some(local.local_id()));

        local.send(b"ping").await.unwrap();
        assert_eq!(remote.read_exact(4).await.unwrap(), b"ping");
        remote.send_extended(1, b"err").await.unwrap();
        assert_eq!(local.read_extended_at_most(1, 10).await.unwrap(), b"err");
    }

    #[tokio::test]
    async fn test_open_refused() {
        let (client, _server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let err = client.open("x11", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            TidewireError::ChannelOpenFailed { reason: 3, .. }
        ));
        let err = client.open("direct-tcpip", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            TidewireError::ChannelOpenFailed { reason: 1, ref description }
                if description == "Forwarding disabled"
        ));
        assert_eq!(client.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_client_refuses_incoming_open() {
        let (client, server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let err = server.open("session", &[]).await.unwrap_err();
        assert!(matches!(err, TidewireError::ChannelOpenFailed { reason: 3, .. }));
        assert_eq!(client.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_send_respects_window() {
        let small = ChannelConfig {
            window_size: 32768,
            max_packet_size: 16384,
        };
        let (client, server) = services(ChannelConfig::default(), small).await;
        let (local, remote) = open_pair(&client, &server).await;
        assert_eq!(local.remote_window(), 32768);

        let data = vec![0x5a; 40000];
        let sender = {
            let local = local.clone();
            let data = data.clone();
            tokio::spawn(async move { local.send(&data).await })
        };

        // The first 32768 bytes fill the window; the rest waits.
        timeout(LIMIT, async {
            while remote.window_data_left() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(local.remote_window(), 0);
        assert!(!sender.is_finished());

        let received = timeout(LIMIT, remote.read_exact(40000)).await.unwrap().unwrap();
        timeout(LIMIT, sender).await.unwrap().unwrap().unwrap();
        assert_eq!(received, data);
        assert!(remote.inbound_chunks().iter().all(|&n| n <= 16384));
        assert_eq!(remote.inbound_chunks().iter().sum::<usize>(), 40000);
    }

    #[tokio::test]
    async fn test_window_adjust_after_drain() {
        let config = ChannelConfig {
            window_size: 1000,
            max_packet_size: 1000,
        };
        let (client, server) = services(ChannelConfig::default(), config).await;
        let (local, remote) = open_pair(&client, &server).await;

        local.send(&[1u8; 600]).await.unwrap();
        assert_eq!(remote.read_exact(600).await.unwrap().len(), 600);
        // 400 left is below half of 1000, so the window was restored.
        assert_eq!(remote.window_data_left(), 1000);
        timeout(LIMIT, async {
            while local.remote_window() != 1000 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        local.send(&[2u8; 300]).await.unwrap();
        assert_eq!(remote.read_exact(300).await.unwrap().len(), 300);
        assert_eq!(remote.window_data_left(), 700);
    }

    #[tokio::test]
    async fn test_overflow_is_dropped() {
        let config = ChannelConfig {
            window_size: 100,
            max_packet_size: 100,
        };
        let (client, server) = services(ChannelConfig::default(), config).await;
        let (local, remote) = open_pair(&client, &server).await;

        // Bypass flow control on the sending side.
        let mut w = Writer::message(MessageType::ChannelData);
        w.put_u32(remote.local_id());
        w.put_string(&[0u8; 200]);
        client.transport().send(w.as_slice()).await.unwrap();
        local.send(b"ok").await.unwrap();

        assert_eq!(remote.read_at_most(10).await.unwrap(), b"ok");
        assert!(!client.transport().is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let (client, server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let (local, remote) = open_pair(&client, &server).await;

        let reader = {
            let local = local.clone();
            tokio::spawn(async move { local.read_exact(1000).await })
        };
        tokio::task::yield_now().await;
        local.close().await.unwrap();
        let read = timeout(LIMIT, reader).await.unwrap().unwrap().unwrap();
        assert!(read.is_empty());

        // The peer sees EOF and answers with its own CLOSE.
        assert!(timeout(LIMIT, remote.read_at_most(10)).await.unwrap().unwrap().is_empty());
        timeout(LIMIT, async {
            while client.channel_count() != 0 || server.channel_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            local.send(b"late").await,
            Err(TidewireError::ChannelClosed(_))
        ));
        local.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_ends_stream() {
        let (client, server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let (local, remote) = open_pair(&client, &server).await;
        local.send(b"tail").await.unwrap();
        local.send_eof().await.unwrap();
        local.send_eof().await.unwrap();
        assert_eq!(remote.read_to_end().await.unwrap(), b"tail");
        assert!(remote.is_eof());
    }

    #[tokio::test]
    async fn test_channel_requests() {
        let (client, server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let (local, remote) = open_pair(&client, &server).await;

        // The default handler refuses everything but exit-status.
        assert!(!local.send_channel_request("shell", true, &[]).await.unwrap());
        assert!(remote
            .send_channel_request("exit-status", true, &[0, 0, 0, 3])
            .await
            .unwrap());
        assert_eq!(local.exit_status(), Some(3));

        local.close().await.unwrap();
        assert!(!local.send_channel_request("shell", true, &[]).await.unwrap());
    }

    struct Gate(Arc<Notify>);

    #[async_trait]
    impl ChannelHandler for Gate {
        async fn handle_request(&self, _channel: &Channel, _request: &ChannelRequest) -> bool {
            self.0.notified().await;
            true
        }
    }

    #[tokio::test]
    async fn test_second_outstanding_request_conflicts() {
        let (client, server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let (local, remote) = open_pair(&client, &server).await;
        let gate = Arc::new(Notify::new());
        remote.set_handler(Arc::new(Gate(gate.clone())));

        let first = {
            let local = local.clone();
            tokio::spawn(async move { local.send_channel_request("exec", true, b"x").await })
        };
        timeout(LIMIT, async {
            while !local.has_pending_request() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let err = local.send_channel_request("shell", true, &[]).await.unwrap_err();
        assert!(matches!(err, TidewireError::WaiterConflict(_)));
        // Requests without a reply do not wait and never conflict.
        assert!(local.send_channel_request("env", false, &[]).await.unwrap());

        gate.notify_one();
        assert!(timeout(LIMIT, first).await.unwrap().unwrap().unwrap());
        // Release the handler for the queued env request too.
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_global_request_refused() {
        let (client, _server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let waiter = client
            .transport()
            .expect(&[MessageType::RequestSuccess as u8, MessageType::RequestFailure as u8])
            .unwrap();
        let mut w = Writer::message(MessageType::GlobalRequest);
        w.put_str("tcpip-forward");
        w.put_bool(true);
        w.put_str("0.0.0.0");
        w.put_u32(8080);
        client.transport().send(w.as_slice()).await.unwrap();
        let reply = timeout(LIMIT, waiter.recv()).await.unwrap().unwrap();
        assert_eq!(reply, vec![MessageType::RequestFailure as u8]);
    }

    struct GatedAcceptor(Arc<Notify>);

    #[async_trait]
    impl ChannelAcceptor for GatedAcceptor {
        async fn accept(&self, _channel_type: &str, _extra: &[u8]) -> ChannelDecision {
            self.0.notified().await;
            ChannelDecision::Accept(Arc::new(DefaultChannelHandler))
        }
    }

    #[tokio::test]
    async fn test_close_while_open_pending() {
        let (client, server) = pair().await;
        let gate = Arc::new(Notify::new());
        let client = ConnectionService::register(&client, ChannelConfig::default(), None).unwrap();
        let server = ConnectionService::register(
            &server,
            ChannelConfig::default(),
            Some(Arc::new(GatedAcceptor(gate.clone()))),
        )
        .unwrap();

        let opening = {
            let client = client.clone();
            tokio::spawn(async move { client.open("session", &[]).await })
        };
        let pending = timeout(LIMIT, async {
            loop {
                if let Some(channel) = client.channel(0) {
                    return channel;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        pending.close().await.unwrap();
        let err = timeout(LIMIT, opening).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, TidewireError::ChannelOpenFailed { reason: 2, .. }));
        assert!(pending.is_open_pending());
        assert_eq!(client.channel_count(), 1);

        // The late confirmation is answered with CLOSE, not a disconnect.
        gate.notify_one();
        timeout(LIMIT, async {
            while client.channel_count() != 0 || server.channel_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!client.transport().is_closed());

        gate.notify_one();
        let local = timeout(LIMIT, client.open("session", &[])).await.unwrap().unwrap();
        let _late = timeout(LIMIT, server.accept_channel()).await.unwrap().unwrap();
        let remote = timeout(LIMIT, server.accept_channel()).await.unwrap().unwrap();
        local.send(b"alive").await.unwrap();
        assert_eq!(remote.read_exact(5).await.unwrap(), b"alive");
    }

    #[tokio::test]
    async fn test_full_backlog_refuses_opens() {
        let (client, server) = pair().await;
        let client = ConnectionService::register(&client, ChannelConfig::default(), None).unwrap();
        let server = ConnectionService::register_with_backlog(
            &server,
            ChannelConfig::default(),
            Some(Arc::new(AcceptSessions)),
            1,
        )
        .unwrap();

        let first = timeout(LIMIT, client.open("session", &[])).await.unwrap().unwrap();
        let err = client.open("session", &[]).await.unwrap_err();
        assert!(matches!(err, TidewireError::ChannelOpenFailed { reason: 4, .. }));

        let accepted = timeout(LIMIT, server.accept_channel()).await.unwrap().unwrap();
        assert_eq!(accepted.remote_id(), Some(first.local_id()));
        timeout(LIMIT, client.open("session", &[])).await.unwrap().unwrap();
        assert!(ConnectionService::register_with_backlog(
            client.transport(),
            ChannelConfig::default(),
            None,
            0
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_transport_loss_closes_channels() {
        let (client, server) = services(ChannelConfig::default(), ChannelConfig::default()).await;
        let (local, _remote) = open_pair(&client, &server).await;
        let reader = {
            let local = local.clone();
            tokio::spawn(async move { local.read_at_most(10).await })
        };
        server.transport().disconnect().await;
        assert!(timeout(LIMIT, reader).await.unwrap().unwrap().unwrap().is_empty());
        assert!(local.is_closed());
        assert!(matches!(
            client.accept_channel().await,
            Err(TidewireError::ConnectionLost(_))
        ));
    }
}
