//! SSH transport layer (RFC 4253).
//!
//! A [`Transport`] owns one connection from the version exchange to the
//! final DISCONNECT:
//!
//! 1. **Version exchange**: identification lines in both directions
//! 2. **Key exchange**: KEXINIT negotiation, the DH / ECDH exchange,
//!    NEWKEYS, key derivation
//! 3. **Established**: framed, encrypted and MAC-protected messages,
//!    dispatched to waiters and handlers
//!
//! # Transport States
//!
//! ```text
//! Connecting -> VersionExchanged -> KexInProgress -> Established -> Disconnected
//!                                         ^               |
//!                                         +---- rekey ----+
//! ```
//!
//! # Tasks
//!
//! A background receive task reads, decrypts and verifies every frame, then
//! handles transport messages itself and routes the rest through the
//! [`Dispatcher`]. Sending goes through one async mutex so frames never
//! interleave. While a key exchange is running, messages of type 50 and above
//! are queued and flushed once the new keys are active.
//!
//! # Rekeying
//!
//! A new exchange starts when:
//! - [`Transport::rekey`] is called
//! - the peer sends KEXINIT
//! - more than [`TransportConfig::rekey_bytes_limit`] bytes were sent since
//!   the last exchange
//!
//! The session id never changes after the first exchange.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidewire_proto::ssh::known_hosts::AcceptAnyHostKey;
//! use tidewire_proto::ssh::transport::{Transport, TransportConfig};
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:2222").await?;
//! let transport =
//!     Transport::connect(stream, TransportConfig::default(), Arc::new(AcceptAnyHostKey)).await?;
//! transport.request_service("ssh-userauth").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use once_cell::sync::OnceCell;
use tidewire_platform::{TidewireError, TidewireResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, trace, warn};

use super::codec::{Reader, Writer};
use super::crypto::{Cipher, CipherAlgorithm, CompressionAlgorithm, MacAlgorithm, MacKey};
use super::dispatcher::{Dispatcher, MessageHandler, Waiter};
use super::hostkey::HostKey;
use super::kex::{guess_is_wrong, negotiate, AlgorithmPreferences, KexInit, NegotiatedAlgorithms};
use super::kex_dh::{
    derive_session_keys, server_kex_reply, ClientKex, DirectionKeys, KexOutput, KexTranscript,
    KeySizes,
};
use super::known_hosts::HostKeyVerifier;
use super::message::{DisconnectReason, MessageType};
use super::packet::{
    check_aead_packet_length, check_packet_length, effective_block_size, split_frame_body,
    Packet, MAX_PACKET_LENGTH,
};
use super::version::{read_identification_line, Version};

/// Default outbound byte count that triggers a rekey (1 GiB).
pub const DEFAULT_REKEY_BYTES_LIMIT: u64 = 1 << 30;

/// Identity of the remote peer, used for host key verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostId {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl HostId {
    /// Creates a host identity.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for HostId {
    fn default() -> Self {
        Self::new("localhost", 22)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 22 {
            f.write_str(&self.host)
        } else {
            write!(f, "[{}]:{}", self.host, self.port)
        }
    }
}

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates key exchange and authentication
    Client,
    /// Holds host keys and answers key exchange
    Server,
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Software version field of our identification.
    pub software_version: String,

    /// Optional comments after the software version.
    pub comments: Option<String>,

    /// Algorithm preferences advertised in KEXINIT.
    pub preferences: AlgorithmPreferences,

    /// Send a guessed kex init right after KEXINIT (client only).
    pub proactive_kex: bool,

    /// Outbound bytes after which a new key exchange starts (default: 1 GiB).
    pub rekey_bytes_limit: u64,

    /// Largest accepted frame, length field included (default: 1 MiB).
    pub max_packet_length: usize,

    /// The peer's identity, passed to the host key verifier.
    pub host_id: HostId,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            software_version: format!("Tidewire_{}", env!("CARGO_PKG_VERSION")),
            comments: None,
            preferences: AlgorithmPreferences::default(),
            proactive_kex: false,
            rekey_bytes_limit: DEFAULT_REKEY_BYTES_LIMIT,
            max_packet_length: MAX_PACKET_LENGTH,
            host_id: HostId::default(),
        }
    }
}

impl TransportConfig {
    /// Our identification.
    pub fn local_version(&self) -> Version {
        Version::new(&self.software_version, self.comments.as_deref())
    }
}

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Stream open, identifications not yet exchanged
    Connecting,
    /// Identifications exchanged
    VersionExchanged,
    /// A key exchange is running
    KexInProgress,
    /// Keys are active and no exchange is running
    Established,
    /// Terminal
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: TransportState,
    exchanges: u64,
}

#[derive(Debug, Clone)]
struct CloseReason {
    code: Option<u32>,
    description: String,
}

impl CloseReason {
    fn to_error(&self) -> TidewireError {
        match self.code {
            Some(reason) => TidewireError::Disconnect {
                reason,
                description: self.description.clone(),
            },
            None => TidewireError::ConnectionLost(self.description.clone()),
        }
    }
}

fn disconnect_payload(reason: DisconnectReason, description: &str) -> Vec<u8> {
    let mut w = Writer::message(MessageType::Disconnect);
    w.put_u32(reason.code());
    w.put_str(description);
    w.put_str("");
    w.into_vec()
}

/// Write half of the stream and the outbound direction state.
struct Outbound {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    cipher: Cipher,
    mac: MacKey,
    compression: CompressionAlgorithm,
    sequence: u32,
    kex_active: bool,
    deferred: VecDeque<Vec<u8>>,
    bytes_since_kex: u64,
    closed: bool,
    #[cfg(test)]
    corrupt_next_mac: bool,
}

impl Outbound {
    fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            writer,
            cipher: Cipher::none(),
            mac: MacKey::none(),
            compression: CompressionAlgorithm::None,
            sequence: 0,
            kex_active: false,
            deferred: VecDeque::new(),
            bytes_since_kex: 0,
            closed: false,
            #[cfg(test)]
            corrupt_next_mac: false,
        }
    }

    /// Frames, encrypts and writes one payload. Returns its sequence number.
    async fn write_payload(&mut self, payload: &[u8]) -> TidewireResult<u32> {
        if self.closed {
            return Err(TidewireError::ConnectionLost(
                "Transport is closed".to_string(),
            ));
        }

        let msg_type = payload.first().copied().unwrap_or_default();
        let body = self.compression.compress(payload.to_vec());
        let frame = if self.cipher.is_aead() {
            let mut frame = Packet::for_aead(body, self.cipher.block_size()).to_bytes();
            self.cipher.seal(self.sequence, &mut frame)?;
            frame
        } else {
            let mut frame = Packet::with_block_size(body, self.cipher.block_size()).to_bytes();
            let mac = self.mac.compute(self.sequence, &frame)?;
            self.cipher.encrypt(&mut frame)?;
            frame.extend_from_slice(&mac);
            frame
        };
        #[cfg(test)]
        let frame = self.tamper(frame);

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_since_kex += frame.len() as u64;
        trace!(seq = sequence, msg_type, len = payload.len(), "Sent packet");
        Ok(sequence)
    }

    /// Flips the last byte of the MAC or AEAD tag once requested.
    #[cfg(test)]
    fn tamper(&mut self, mut frame: Vec<u8>) -> Vec<u8> {
        let protected = self.mac.digest_size() > 0 || self.cipher.is_aead();
        if self.corrupt_next_mac && protected {
            if let Some(last) = frame.last_mut() {
                *last ^= 0x01;
            }
            self.corrupt_next_mac = false;
        }
        frame
    }

    /// Sends DISCONNECT (best effort) and shuts the stream.
    async fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if self.closed {
            return;
        }
        if let Err(e) = self
            .write_payload(&disconnect_payload(reason, description))
            .await
        {
            debug!(error = %e, "Failed to send DISCONNECT");
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.writer.shutdown().await;
        }
    }
}

enum ReadError {
    /// The stream ended or failed
    Closed(TidewireError),
    /// The peer broke the protocol; disconnect with this reason
    Violation(DisconnectReason, String),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Closed(TidewireError::Io(e))
    }
}

fn violation(reason: DisconnectReason) -> impl Fn(TidewireError) -> ReadError {
    move |e| ReadError::Violation(reason, e.to_string())
}

/// Read half of the stream and the inbound direction state. Owned by the
/// receive task.
struct Inbound<R> {
    reader: R,
    cipher: Cipher,
    mac: MacKey,
    compression: CompressionAlgorithm,
    sequence: u32,
    ignore_first_packet: bool,
    max_packet_length: usize,
}

impl<R: AsyncRead + Unpin> Inbound<R> {
    fn new(reader: R, max_packet_length: usize) -> Self {
        Self {
            reader,
            cipher: Cipher::none(),
            mac: MacKey::none(),
            compression: CompressionAlgorithm::None,
            sequence: 0,
            ignore_first_packet: false,
            max_packet_length,
        }
    }

    /// Reads, decrypts and verifies one frame.
    async fn read_payload(&mut self) -> Result<(u32, Vec<u8>), ReadError> {
        let frame = if self.cipher.is_aead() {
            self.read_aead_frame().await?
        } else {
            self.read_frame().await?
        };
        let sequence = self.sequence;

        let (payload, _padding) =
            split_frame_body(&frame[4..]).map_err(violation(DisconnectReason::ProtocolError))?;
        let payload = self
            .compression
            .decompress(payload.to_vec())
            .map_err(violation(DisconnectReason::CompressionError))?;
        self.sequence = self.sequence.wrapping_add(1);

        trace!(seq = sequence, len = payload.len(), "Received packet");
        Ok((sequence, payload))
    }

    fn check_limit(&self, total: usize) -> Result<(), ReadError> {
        if total > self.max_packet_length {
            return Err(ReadError::Violation(
                DisconnectReason::ProtocolError,
                format!("Packet of {} bytes exceeds the configured limit", total),
            ));
        }
        Ok(())
    }

    /// Frame of a block cipher: the length sits in the first encrypted
    /// block and a MAC over the plaintext follows.
    async fn read_frame(&mut self) -> Result<Vec<u8>, ReadError> {
        let cipher_block = self.cipher.block_size();
        let block = effective_block_size(cipher_block);

        let mut frame = vec![0u8; block];
        self.reader.read_exact(&mut frame).await?;
        self.cipher
            .decrypt(&mut frame)
            .map_err(violation(DisconnectReason::ProtocolError))?;

        let packet_length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        check_packet_length(packet_length, cipher_block)
            .map_err(violation(DisconnectReason::ProtocolError))?;
        let total = packet_length as usize + 4;
        self.check_limit(total)?;

        frame.resize(total, 0);
        self.reader.read_exact(&mut frame[block..]).await?;
        self.cipher
            .decrypt(&mut frame[block..])
            .map_err(violation(DisconnectReason::ProtocolError))?;

        let mut mac = vec![0u8; self.mac.digest_size()];
        self.reader.read_exact(&mut mac).await?;
        let valid = self
            .mac
            .verify(self.sequence, &frame, &mac)
            .map_err(violation(DisconnectReason::MacError))?;
        if !valid {
            return Err(ReadError::Violation(
                DisconnectReason::MacError,
                "MAC verification failed".to_string(),
            ));
        }
        Ok(frame)
    }

    /// Frame of an AEAD cipher: a 4-byte length header (encrypted only by
    /// chacha20-poly1305), the sealed body and the tag.
    async fn read_aead_frame(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).await?;
        let packet_length = u32::from_be_bytes(self.cipher.decrypt_length(self.sequence, header));
        check_aead_packet_length(packet_length, self.cipher.block_size())
            .map_err(violation(DisconnectReason::ProtocolError))?;
        let total = packet_length as usize + 4;
        self.check_limit(total)?;

        let mut frame = vec![0u8; total + self.cipher.algorithm().tag_size()];
        frame[..4].copy_from_slice(&header);
        self.reader.read_exact(&mut frame[4..]).await?;
        self.cipher
            .open(self.sequence, &mut frame)
            .map_err(violation(DisconnectReason::MacError))?;
        Ok(frame)
    }
}

/// Inbound keys waiting for the peer's NEWKEYS.
struct PendingInbound {
    cipher: Cipher,
    mac: MacKey,
    compression: CompressionAlgorithm,
}

/// State of the key exchange round in progress.
#[derive(Default)]
struct KexContext {
    local_kexinit: Option<Vec<u8>>,
    peer_kexinit: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    client_kex: Option<ClientKex>,
    pending_inbound: Option<PendingInbound>,
}

struct Inner {
    role: Role,
    config: TransportConfig,
    local_version: Version,
    peer_version: Version,
    out: Mutex<Outbound>,
    dispatcher: Dispatcher,
    kex: StdMutex<KexContext>,
    session_id: OnceCell<Vec<u8>>,
    status: watch::Sender<Status>,
    host_keys: Vec<Arc<dyn HostKey>>,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    shutdown: Notify,
    close_reason: StdMutex<Option<CloseReason>>,
    server_host_key: StdMutex<Option<Arc<dyn HostKey>>>,
    negotiated: StdMutex<Option<NegotiatedAlgorithms>>,
    session_keys: StdMutex<Option<(DirectionKeys, DirectionKeys)>>,
    pending_service_request: StdMutex<Option<Waiter>>,
}

/// Messages that must wait for NEWKEYS (RFC 4253 Section 7.1).
fn deferred_during_kex(msg_type: u8) -> bool {
    msg_type == MessageType::ServiceRequest as u8
        || msg_type == MessageType::ServiceAccept as u8
        || msg_type >= MessageType::UserauthRequest as u8
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One SSH connection. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("peer_version", &self.inner.peer_version.identification())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Runs the client side of the handshake over `stream`.
    ///
    /// Returns once the first key exchange has completed.
    ///
    /// # Arguments
    ///
    /// * `stream` - Connected byte stream
    /// * `config` - Transport configuration
    /// * `verifier` - Decides whether the server's host key is trusted
    ///
    /// # Errors
    ///
    /// - [`TidewireError::Config`] if an algorithm list is empty
    /// - [`TidewireError::Disconnect`] if version exchange or key exchange
    ///   fails (PROTOCOL_ERROR, PROTOCOL_VERSION_NOT_SUPPORTED,
    ///   KEY_EXCHANGE_FAILED, HOST_KEY_NOT_VERIFIABLE)
    /// - [`TidewireError::Io`] / [`TidewireError::ConnectionLost`] on stream
    ///   failures
    pub async fn connect<S>(
        stream: S,
        config: TransportConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> TidewireResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(stream, Role::Client, config, Vec::new(), Some(verifier)).await
    }

    /// Runs the server side of the handshake over `stream`.
    ///
    /// Only host key types present in `host_keys` are advertised.
    ///
    /// # Errors
    ///
    /// As for [`Transport::connect`]; additionally [`TidewireError::Config`]
    /// if none of `host_keys` matches the host key preferences.
    pub async fn accept<S>(
        stream: S,
        config: TransportConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
    ) -> TidewireResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(stream, Role::Server, config, host_keys, None).await
    }

    async fn establish<S>(
        stream: S,
        role: Role,
        config: TransportConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
        verifier: Option<Arc<dyn HostKeyVerifier>>,
    ) -> TidewireResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.preferences.validate()?;
        if role == Role::Server
            && !config
                .preferences
                .host_key
                .iter()
                .any(|alg| host_keys.iter().any(|k| k.algorithm() == *alg))
        {
            return Err(TidewireError::Config(
                "No host key matches the host key algorithm preferences".to_string(),
            ));
        }

        let local_version = config.local_version();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut out = Outbound::new(Box::new(write_half));

        out.writer.write_all(&local_version.to_wire_format()).await?;
        out.writer.flush().await?;
        let line = read_identification_line(&mut reader).await?;

        let peer_version = match Version::parse(&line) {
            Ok(v) => v,
            Err(e) => {
                let description = e.to_string();
                out.disconnect(DisconnectReason::ProtocolError, &description)
                    .await;
                return Err(TidewireError::Disconnect {
                    reason: DisconnectReason::ProtocolError.code(),
                    description,
                });
            }
        };
        if !peer_version.is_supported() {
            let description = format!(
                "Unsupported protocol version {}",
                peer_version.proto_version()
            );
            out.disconnect(DisconnectReason::ProtocolVersionNotSupported, &description)
                .await;
            return Err(TidewireError::Disconnect {
                reason: DisconnectReason::ProtocolVersionNotSupported.code(),
                description,
            });
        }
        info!(
            role = ?role,
            local = %local_version,
            peer = %peer_version,
            "Version exchange complete"
        );

        let (status, _) = watch::channel(Status {
            state: TransportState::VersionExchanged,
            exchanges: 0,
        });
        let dispatcher = Dispatcher::new();
        let pending_service_request = match role {
            Role::Server => Some(dispatcher.expect(&[MessageType::ServiceRequest as u8])?),
            Role::Client => None,
        };
        let max_packet_length = config.max_packet_length;

        let transport = Transport {
            inner: Arc::new(Inner {
                role,
                config,
                local_version,
                peer_version,
                out: Mutex::new(out),
                dispatcher,
                kex: StdMutex::new(KexContext::default()),
                session_id: OnceCell::new(),
                status,
                host_keys,
                verifier,
                shutdown: Notify::new(),
                close_reason: StdMutex::new(None),
                server_host_key: StdMutex::new(None),
                negotiated: StdMutex::new(None),
                session_keys: StdMutex::new(None),
                pending_service_request: StdMutex::new(pending_service_request),
            }),
        };

        let inbound = Inbound::new(reader, max_packet_length);
        tokio::spawn(receive_loop(transport.clone(), inbound));

        transport.begin_kex().await?;
        transport.wait_for_exchange(0).await?;
        Ok(transport)
    }

    /// Returns our role.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Returns the current state.
    pub fn state(&self) -> TransportState {
        self.inner.status.borrow().state
    }

    /// Returns true once the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Disconnected
    }

    /// Number of completed key exchanges.
    pub fn completed_exchanges(&self) -> u64 {
        self.inner.status.borrow().exchanges
    }

    /// Our identification.
    pub fn local_version(&self) -> &Version {
        &self.inner.local_version
    }

    /// The peer's identification.
    pub fn peer_version(&self) -> &Version {
        &self.inner.peer_version
    }

    /// The exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner.session_id.get().cloned()
    }

    /// Algorithms chosen by the most recent key exchange.
    pub fn negotiated_algorithms(&self) -> Option<NegotiatedAlgorithms> {
        *lock(&self.inner.negotiated)
    }

    /// The server's host key, as received by a client.
    pub fn server_host_key(&self) -> Option<Arc<dyn HostKey>> {
        lock(&self.inner.server_host_key).clone()
    }

    /// Keys derived by the most recent exchange, as
    /// `(client_to_server, server_to_client)`.
    pub fn session_keys(&self) -> Option<(DirectionKeys, DirectionKeys)> {
        lock(&self.inner.session_keys).clone()
    }

    /// Sequence number the next outbound frame will carry.
    pub async fn outbound_sequence(&self) -> u32 {
        self.inner.out.lock().await.sequence
    }

    fn set_state(&self, state: TransportState) {
        self.inner.status.send_modify(|s| {
            if s.state != TransportState::Disconnected {
                s.state = state;
            }
        });
    }

    fn kex_ctx(&self) -> MutexGuard<'_, KexContext> {
        lock(&self.inner.kex)
    }

    fn record_close(&self, code: Option<u32>, description: &str) {
        let mut reason = lock(&self.inner.close_reason);
        if reason.is_none() {
            *reason = Some(CloseReason {
                code,
                description: description.to_string(),
            });
        }
    }

    fn closed_error(&self) -> TidewireError {
        lock(&self.inner.close_reason)
            .as_ref()
            .map(CloseReason::to_error)
            .unwrap_or_else(|| TidewireError::ConnectionLost("Transport is closed".to_string()))
    }

    /// Registers a waiter for the next message of any of `types`.
    ///
    /// Register before sending the request whose reply is awaited.
    ///
    /// # Errors
    ///
    /// [`TidewireError::WaiterConflict`] if a live waiter exists for one of
    /// the types.
    pub fn expect(&self, types: &[u8]) -> TidewireResult<Waiter> {
        self.inner.dispatcher.expect(types)
    }

    /// Registers `handler` for `types` under `scope`.
    ///
    /// # Errors
    ///
    /// [`TidewireError::Config`] if another scope owns one of the types.
    pub fn register_handlers(
        &self,
        scope: &str,
        types: &[u8],
        handler: Arc<dyn MessageHandler>,
    ) -> TidewireResult<()> {
        self.inner
            .dispatcher
            .register_handlers(scope, types, handler)
    }

    /// Removes the handlers of `scope`.
    pub fn unregister_handlers(&self, scope: &str) {
        self.inner.dispatcher.unregister_handlers(scope);
    }

    /// Sends one message. `payload` starts with the message type byte.
    ///
    /// During a key exchange, service requests and accepts and messages of
    /// type 50 and above are queued and sent after the new keys are active.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is empty, the transport is closed or
    /// the write fails.
    pub async fn send(&self, payload: &[u8]) -> TidewireResult<()> {
        let Some(&msg_type) = payload.first() else {
            return Err(TidewireError::Protocol("Empty payload".to_string()));
        };

        let needs_rekey = {
            let mut out = self.inner.out.lock().await;
            if out.closed {
                return Err(self.closed_error());
            }
            if out.kex_active && deferred_during_kex(msg_type) {
                trace!(msg_type, queued = out.deferred.len() + 1, "Deferred during key exchange");
                out.deferred.push_back(payload.to_vec());
                return Ok(());
            }
            out.write_payload(payload).await?;
            !out.kex_active && out.bytes_since_kex >= self.inner.config.rekey_bytes_limit
        };

        if needs_rekey && self.state() == TransportState::Established {
            info!(
                limit = self.inner.config.rekey_bytes_limit,
                "Byte limit reached, starting key exchange"
            );
            self.begin_kex().await?;
        }
        Ok(())
    }

    /// Sends a transport-layer message without deferral or rekey checks.
    async fn send_transport(&self, payload: &[u8]) -> TidewireResult<u32> {
        self.inner.out.lock().await.write_payload(payload).await
    }

    /// Sends DISCONNECT, closes the stream and stops the receive task.
    ///
    /// Returns the [`TidewireError::Disconnect`] describing the disconnect,
    /// for the caller to propagate.
    pub async fn send_disconnect(
        &self,
        reason: DisconnectReason,
        description: &str,
    ) -> TidewireError {
        warn!(reason = reason.as_str(), description, "Disconnecting");
        self.record_close(Some(reason.code()), description);
        self.inner
            .out
            .lock()
            .await
            .disconnect(reason, description)
            .await;
        self.inner.shutdown.notify_one();
        TidewireError::Disconnect {
            reason: reason.code(),
            description: description.to_string(),
        }
    }

    /// Closes the connection with BY_APPLICATION.
    pub async fn disconnect(&self) {
        if !self.is_closed() {
            self.send_disconnect(DisconnectReason::ByApplication, "Closed by application")
                .await;
        }
    }

    /// Waits until the connection has ended and returns why.
    pub async fn closed(&self) -> TidewireError {
        let mut rx = self.inner.status.subscribe();
        let _ = rx
            .wait_for(|s| s.state == TransportState::Disconnected)
            .await;
        self.closed_error()
    }

    /// Starts a new key exchange and waits for it to finish.
    ///
    /// If an exchange is already running, waits for that one instead.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection if it closes first.
    pub async fn rekey(&self) -> TidewireResult<()> {
        let before = self.completed_exchanges();
        self.begin_kex().await?;
        self.wait_for_exchange(before).await
    }

    async fn wait_for_exchange(&self, after: u64) -> TidewireResult<()> {
        let mut rx = self.inner.status.subscribe();
        let status = match rx
            .wait_for(|s| s.exchanges > after || s.state == TransportState::Disconnected)
            .await
        {
            Ok(status) => *status,
            Err(_) => return Err(self.closed_error()),
        };
        if status.exchanges > after {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    /// Sends SERVICE_REQUEST and waits for the matching SERVICE_ACCEPT.
    ///
    /// # Errors
    ///
    /// Disconnects with PROTOCOL_ERROR if the server accepts a different
    /// service.
    pub async fn request_service(&self, name: &str) -> TidewireResult<()> {
        let waiter = self.expect(&[MessageType::ServiceAccept as u8])?;
        let mut w = Writer::message(MessageType::ServiceRequest);
        w.put_str(name);
        self.send(w.as_slice()).await?;

        let reply = waiter.recv().await?;
        let mut r = Reader::new(&reply);
        r.get_u8()?;
        let accepted = r.get_utf8()?;
        if accepted != name {
            return Err(self
                .send_disconnect(
                    DisconnectReason::ProtocolError,
                    &format!("Requested service {}, server accepted {}", name, accepted),
                )
                .await);
        }
        debug!(service = name, "Service accepted");
        Ok(())
    }

    /// Listens for the next SERVICE_REQUEST from now on, so a request sent
    /// before [`Transport::accept_service`] runs is not answered with
    /// UNIMPLEMENTED.
    pub(crate) fn expect_service_request(&self) -> TidewireResult<()> {
        let waiter = self.expect(&[MessageType::ServiceRequest as u8])?;
        *lock(&self.inner.pending_service_request) = Some(waiter);
        Ok(())
    }

    /// Waits for a SERVICE_REQUEST and accepts it if `name` is in `allowed`.
    ///
    /// # Errors
    ///
    /// Disconnects with SERVICE_NOT_AVAILABLE for other names.
    pub async fn accept_service(&self, allowed: &[&str]) -> TidewireResult<String> {
        let pending = lock(&self.inner.pending_service_request).take();
        let waiter = match pending {
            Some(w) => w,
            None => self.expect(&[MessageType::ServiceRequest as u8])?,
        };
        let request = waiter.recv().await?;
        let mut r = Reader::new(&request);
        r.get_u8()?;
        let name = r.get_utf8()?;
        if !allowed.contains(&name.as_str()) {
            return Err(self
                .send_disconnect(
                    DisconnectReason::ServiceNotAvailable,
                    &format!("Service {} is not available", name),
                )
                .await);
        }

        let mut w = Writer::message(MessageType::ServiceAccept);
        w.put_str(&name);
        self.send(w.as_slice()).await?;
        debug!(service = %name, "Service request accepted");
        Ok(name)
    }

    /// The preferences we advertise: a server lists only host key types it
    /// holds.
    fn advertised_preferences(&self) -> AlgorithmPreferences {
        let mut prefs = self.inner.config.preferences.clone();
        if self.inner.role == Role::Server {
            let keys = &self.inner.host_keys;
            prefs
                .host_key
                .retain(|alg| keys.iter().any(|k| k.algorithm() == *alg));
        }
        prefs
    }

    /// Sends our KEXINIT unless one is already out for this round.
    async fn begin_kex(&self) -> TidewireResult<()> {
        let mut out = self.inner.out.lock().await;
        if out.closed {
            return Err(self.closed_error());
        }

        let (kexinit, guess) = {
            let mut ctx = self.kex_ctx();
            if ctx.local_kexinit.is_some() {
                return Ok(());
            }
            let prefs = self.advertised_preferences();
            let proactive = self.inner.role == Role::Client && self.inner.config.proactive_kex;
            let kexinit = KexInit::from_preferences(&prefs, proactive).to_bytes();
            ctx.local_kexinit = Some(kexinit.clone());

            let guess = match prefs.kex.first() {
                Some(&kex) if proactive => {
                    let client_kex = ClientKex::new(kex);
                    let init = client_kex.init_message();
                    ctx.client_kex = Some(client_kex);
                    Some(init)
                }
                _ => None,
            };
            (kexinit, guess)
        };

        out.kex_active = true;
        self.set_state(TransportState::KexInProgress);
        out.write_payload(&kexinit).await?;
        debug!(proactive = guess.is_some(), "Sent KEXINIT");
        if let Some(init) = guess {
            out.write_payload(&init).await?;
        }
        Ok(())
    }

    /// Handles one received payload.
    async fn process<R: AsyncRead + Unpin>(
        &self,
        inbound: &mut Inbound<R>,
        sequence: u32,
        payload: Vec<u8>,
    ) -> TidewireResult<()> {
        let Some(&msg_type) = payload.first() else {
            return Err(self
                .send_disconnect(DisconnectReason::ProtocolError, "Empty payload")
                .await);
        };

        match MessageType::from_u8(msg_type) {
            Some(MessageType::Disconnect) => {
                let mut r = Reader::new(&payload[1..]);
                let reason = r.get_u32()?;
                let description = r.get_utf8().unwrap_or_default();
                info!(reason, description = %description, "Peer disconnected");
                self.record_close(Some(reason), &description);
                Err(TidewireError::Disconnect {
                    reason,
                    description,
                })
            }
            Some(MessageType::Ignore) => {
                trace!(seq = sequence, "Ignoring SSH_MSG_IGNORE");
                Ok(())
            }
            Some(MessageType::Debug) => {
                let mut r = Reader::new(&payload[1..]);
                let always_display = r.get_bool().unwrap_or(false);
                let message = r.get_utf8().unwrap_or_default();
                debug!(always_display, message = %message, "Peer debug message");
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                let mut r = Reader::new(&payload[1..]);
                let rejected = r.get_u32().unwrap_or_default();
                warn!(seq = rejected, "Peer did not implement our message");
                let _ = self.inner.dispatcher.deliver(payload);
                Ok(())
            }
            Some(MessageType::KexInit) => self.handle_kexinit(inbound, payload).await,
            Some(MessageType::NewKeys) => self.handle_newkeys(inbound).await,
            _ if MessageType::is_kex_method(msg_type) => {
                self.handle_kex_message(inbound, payload).await
            }
            _ => self.dispatch(sequence, payload).await,
        }
    }

    async fn dispatch(&self, sequence: u32, payload: Vec<u8>) -> TidewireResult<()> {
        let msg_type = payload[0];
        let Some(payload) = self.inner.dispatcher.deliver(payload) else {
            return Ok(());
        };

        if let Some(handler) = self.inner.dispatcher.handler_for(msg_type) {
            return match handler.handle(self, &payload).await {
                Ok(()) => Ok(()),
                Err(e @ TidewireError::Disconnect { .. }) => Err(e),
                Err(e) => {
                    warn!(msg_type, error = %e, "Handler failed");
                    Err(self
                        .send_disconnect(DisconnectReason::ProtocolError, &e.to_string())
                        .await)
                }
            };
        }

        debug!(seq = sequence, msg_type, "No handler, replying UNIMPLEMENTED");
        let mut w = Writer::message(MessageType::Unimplemented);
        w.put_u32(sequence);
        self.send_transport(w.as_slice()).await?;
        Ok(())
    }

    async fn handle_kexinit<R: AsyncRead + Unpin>(
        &self,
        inbound: &mut Inbound<R>,
        payload: Vec<u8>,
    ) -> TidewireResult<()> {
        self.begin_kex().await?;

        let peer = match KexInit::from_bytes(&payload) {
            Ok(k) => k,
            Err(e) => {
                return Err(self
                    .send_disconnect(DisconnectReason::ProtocolError, &e.to_string())
                    .await)
            }
        };

        let (local_bytes, duplicate) = {
            let ctx = self.kex_ctx();
            (ctx.local_kexinit.clone(), ctx.peer_kexinit.is_some())
        };
        let Some(local_bytes) = local_bytes.filter(|_| !duplicate) else {
            return Err(self
                .send_disconnect(DisconnectReason::ProtocolError, "Unexpected KEXINIT")
                .await);
        };
        let local = KexInit::from_bytes(&local_bytes)?;

        let (client, server) = match self.inner.role {
            Role::Client => (&local, &peer),
            Role::Server => (&peer, &local),
        };
        let negotiated = match negotiate(client, server) {
            Ok(n) => n,
            Err(e) => {
                return Err(self
                    .send_disconnect(DisconnectReason::KeyExchangeFailed, &e.to_string())
                    .await)
            }
        };
        debug!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            cipher_c2s = negotiated.cipher_client_to_server.name(),
            cipher_s2c = negotiated.cipher_server_to_client.name(),
            mac_c2s = negotiated.mac_client_to_server.name(),
            mac_s2c = negotiated.mac_server_to_client.name(),
            "Negotiated algorithms"
        );

        if peer.first_kex_packet_follows() && guess_is_wrong(&peer, &negotiated) {
            debug!("Peer guessed wrong, discarding its first kex packet");
            inbound.ignore_first_packet = true;
        }

        let resend = {
            let mut ctx = self.kex_ctx();
            ctx.peer_kexinit = Some(payload);
            ctx.negotiated = Some(negotiated);
            if self.inner.role == Role::Client {
                let guess_ok = ctx.client_kex.is_some() && !guess_is_wrong(&local, &negotiated);
                if guess_ok {
                    None
                } else {
                    let client_kex = ClientKex::new(negotiated.kex);
                    let init = client_kex.init_message();
                    ctx.client_kex = Some(client_kex);
                    Some(init)
                }
            } else {
                None
            }
        };
        if let Some(init) = resend {
            self.send_transport(&init).await?;
        }
        Ok(())
    }

    async fn handle_kex_message<R: AsyncRead + Unpin>(
        &self,
        inbound: &mut Inbound<R>,
        payload: Vec<u8>,
    ) -> TidewireResult<()> {
        if inbound.ignore_first_packet {
            inbound.ignore_first_packet = false;
            debug!(msg_type = payload[0], "Discarded guessed kex packet");
            return Ok(());
        }

        let (negotiated, local, peer, client_kex) = {
            let mut ctx = self.kex_ctx();
            let client_kex = ctx.client_kex.take();
            (
                ctx.negotiated,
                ctx.local_kexinit.clone(),
                ctx.peer_kexinit.clone(),
                client_kex,
            )
        };
        let (Some(negotiated), Some(local), Some(peer)) = (negotiated, local, peer) else {
            return Err(self
                .send_disconnect(
                    DisconnectReason::ProtocolError,
                    "Key exchange message outside a key exchange",
                )
                .await);
        };

        let (client_version, server_version, client_kexinit, server_kexinit) = match self.inner.role
        {
            Role::Client => (
                self.inner.local_version.identification(),
                self.inner.peer_version.identification(),
                &local,
                &peer,
            ),
            Role::Server => (
                self.inner.peer_version.identification(),
                self.inner.local_version.identification(),
                &peer,
                &local,
            ),
        };
        let transcript = KexTranscript {
            client_version,
            server_version,
            client_kexinit,
            server_kexinit,
        };

        let output = match self.inner.role {
            Role::Server => {
                let Some(host_key) = self
                    .inner
                    .host_keys
                    .iter()
                    .find(|k| k.algorithm() == negotiated.host_key)
                    .cloned()
                else {
                    return Err(self
                        .send_disconnect(
                            DisconnectReason::KeyExchangeFailed,
                            "No host key for the negotiated algorithm",
                        )
                        .await);
                };
                match server_kex_reply(negotiated.kex, &payload, &transcript, host_key) {
                    Ok((reply, output)) => {
                        self.send_transport(&reply).await?;
                        output
                    }
                    Err(e) => {
                        return Err(self
                            .send_disconnect(DisconnectReason::KeyExchangeFailed, &e.to_string())
                            .await)
                    }
                }
            }
            Role::Client => {
                let Some(client_kex) = client_kex else {
                    return Err(self
                        .send_disconnect(
                            DisconnectReason::ProtocolError,
                            "Unexpected key exchange reply",
                        )
                        .await);
                };
                let output =
                    match client_kex.process_reply(&payload, &transcript, negotiated.host_key) {
                        Ok(output) => output,
                        Err(e) => {
                            return Err(self
                                .send_disconnect(
                                    DisconnectReason::KeyExchangeFailed,
                                    &e.to_string(),
                                )
                                .await)
                        }
                    };
                let trusted = match &self.inner.verifier {
                    Some(verifier) => {
                        verifier
                            .verify(&self.inner.config.host_id, output.host_key.as_ref())
                            .await
                    }
                    None => false,
                };
                if !trusted {
                    return Err(self
                        .send_disconnect(
                            DisconnectReason::HostKeyNotVerifiable,
                            "Host key not verifiable",
                        )
                        .await);
                }
                *lock(&self.inner.server_host_key) = Some(output.host_key.clone());
                output
            }
        };

        self.finish_kex(negotiated, output).await
    }

    /// Derives keys, sends NEWKEYS and switches the outbound direction.
    async fn finish_kex(
        &self,
        negotiated: NegotiatedAlgorithms,
        output: KexOutput,
    ) -> TidewireResult<()> {
        let session_id = self
            .inner
            .session_id
            .get_or_init(|| output.exchange_hash.clone())
            .clone();

        let sizes = |cipher: CipherAlgorithm, mac: MacAlgorithm| KeySizes {
            iv: cipher.iv_size(),
            encryption_key: cipher.key_size(),
            mac_key: mac.key_size(),
        };
        let (c2s, s2c) = derive_session_keys(
            negotiated.kex.hash(),
            &output.shared_secret,
            &output.exchange_hash,
            &session_id,
            sizes(
                negotiated.cipher_client_to_server,
                negotiated.mac_client_to_server,
            ),
            sizes(
                negotiated.cipher_server_to_client,
                negotiated.mac_server_to_client,
            ),
        );

        let c2s_algs = (
            negotiated.cipher_client_to_server,
            negotiated.mac_client_to_server,
            negotiated.compression_client_to_server,
        );
        let s2c_algs = (
            negotiated.cipher_server_to_client,
            negotiated.mac_server_to_client,
            negotiated.compression_server_to_client,
        );
        let ((out_keys, out_algs), (in_keys, in_algs)) = match self.inner.role {
            Role::Client => ((&c2s, c2s_algs), (&s2c, s2c_algs)),
            Role::Server => ((&s2c, s2c_algs), (&c2s, c2s_algs)),
        };

        let out_cipher = Cipher::encryptor(out_algs.0, &out_keys.encryption_key, &out_keys.iv)?;
        let out_mac = MacKey::new(out_algs.1, &out_keys.mac_key)?;
        let pending = PendingInbound {
            cipher: Cipher::decryptor(in_algs.0, &in_keys.encryption_key, &in_keys.iv)?,
            mac: MacKey::new(in_algs.1, &in_keys.mac_key)?,
            compression: in_algs.2,
        };

        self.kex_ctx().pending_inbound = Some(pending);
        *lock(&self.inner.negotiated) = Some(negotiated);
        *lock(&self.inner.session_keys) = Some((c2s.clone(), s2c.clone()));

        let mut out = self.inner.out.lock().await;
        out.write_payload(&[MessageType::NewKeys as u8]).await?;
        out.cipher = out_cipher;
        out.mac = out_mac;
        out.compression = out_algs.2;
        out.bytes_since_kex = 0;
        out.kex_active = false;
        let queued = out.deferred.len();
        while let Some(payload) = out.deferred.pop_front() {
            out.write_payload(&payload).await?;
        }
        debug!(flushed = queued, "Sent NEWKEYS, outbound keys active");
        Ok(())
    }

    async fn handle_newkeys<R: AsyncRead + Unpin>(
        &self,
        inbound: &mut Inbound<R>,
    ) -> TidewireResult<()> {
        let pending = {
            let mut ctx = self.kex_ctx();
            let pending = ctx.pending_inbound.take();
            if pending.is_some() {
                *ctx = KexContext::default();
            }
            pending
        };
        let Some(pending) = pending else {
            return Err(self
                .send_disconnect(DisconnectReason::ProtocolError, "Unexpected NEWKEYS")
                .await);
        };

        inbound.cipher = pending.cipher;
        inbound.mac = pending.mac;
        inbound.compression = pending.compression;

        let mut exchanges = 0;
        self.inner.status.send_modify(|s| {
            s.exchanges += 1;
            exchanges = s.exchanges;
            if s.state != TransportState::Disconnected {
                s.state = TransportState::Established;
            }
        });
        info!(exchanges, "Key exchange complete");
        Ok(())
    }

    /// Final bookkeeping once the receive task stops.
    async fn finish_close(&self, description: &str) {
        self.record_close(None, description);
        self.inner.out.lock().await.shutdown().await;
        self.set_state(TransportState::Disconnected);

        let handlers = self.inner.dispatcher.close(description);
        for handler in handlers {
            handler.on_transport_closed().await;
        }
        debug!(reason = description, "Transport closed");
    }
}

async fn receive_loop<R>(transport: Transport, mut inbound: Inbound<R>)
where
    R: AsyncRead + Unpin + Send,
{
    let description = loop {
        let frame = tokio::select! {
            _ = transport.inner.shutdown.notified() => break "Transport closed locally".to_string(),
            frame = inbound.read_payload() => frame,
        };

        match frame {
            Ok((sequence, payload)) => {
                if let Err(e) = transport.process(&mut inbound, sequence, payload).await {
                    break e.to_string();
                }
            }
            Err(ReadError::Closed(e)) => {
                debug!(error = %e, "Stream closed");
                break "Connection closed by peer".to_string();
            }
            Err(ReadError::Violation(reason, description)) => {
                let e = transport.send_disconnect(reason, &description).await;
                break e.to_string();
            }
        }
    };
    transport.finish_close(&description).await;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Connected transport pairs over in-memory streams.

    use super::*;
    use crate::ssh::hostkey::{test_keys, Ed25519HostKey};
    use crate::ssh::known_hosts::AcceptAnyHostKey;
    use std::time::Duration;
    use tokio::time::timeout;

    pub const LIMIT: Duration = Duration::from_secs(10);

    pub fn host_keys() -> Vec<Arc<dyn HostKey>> {
        vec![
            Arc::new(Ed25519HostKey::generate().unwrap()),
            Arc::new(test_keys::rsa()),
            Arc::new(test_keys::dss()),
        ]
    }

    pub async fn pair_with(
        client_config: TransportConfig,
        server_config: TransportConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> (TidewireResult<Transport>, TidewireResult<Transport>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let server = tokio::spawn(Transport::accept(b, server_config, host_keys()));
        let client = Transport::connect(a, client_config, verifier);
        let client = timeout(LIMIT, client).await.unwrap();
        let server = timeout(LIMIT, server).await.unwrap().unwrap();
        (client, server)
    }

    /// Client and server transports with default configuration.
    pub async fn pair() -> (Transport, Transport) {
        let (c, s) = pair_with(
            TransportConfig::default(),
            TransportConfig::default(),
            Arc::new(AcceptAnyHostKey),
        )
        .await;
        (c.unwrap(), s.unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{pair, pair_with, LIMIT};
    use super::*;
    use crate::ssh::hostkey::HostKeyAlgorithm;
    use crate::ssh::kex::KexAlgorithm;
    use crate::ssh::known_hosts::{AcceptAnyHostKey, KnownHosts, StrictHostKeyChecking};
    use tokio::time::timeout;

    fn group1_config(software: &str) -> TransportConfig {
        TransportConfig {
            software_version: software.to_string(),
            preferences: AlgorithmPreferences {
                kex: vec![KexAlgorithm::DiffieHellmanGroup1Sha1],
                host_key: vec![HostKeyAlgorithm::SshDss],
                cipher: vec![CipherAlgorithm::Aes128Ctr],
                mac: vec![MacAlgorithm::HmacSha1],
                compression: vec![CompressionAlgorithm::None],
            },
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_agrees_on_keys() {
        let (client, server) = pair().await;
        assert_eq!(client.state(), TransportState::Established);
        assert_eq!(server.state(), TransportState::Established);
        assert!(client.session_id().is_some());
        assert_eq!(client.session_id(), server.session_id());

        let (c2s, s2c) = client.session_keys().unwrap();
        let (c2s_s, s2c_s) = server.session_keys().unwrap();
        assert_eq!(c2s.encryption_key, c2s_s.encryption_key);
        assert_eq!(s2c.mac_key, s2c_s.mac_key);
        assert_eq!(c2s.iv, c2s_s.iv);
        assert_ne!(c2s.encryption_key, s2c.encryption_key);

        let negotiated = client.negotiated_algorithms().unwrap();
        assert_eq!(negotiated.kex, KexAlgorithm::Curve25519Sha256);
        assert_eq!(negotiated.host_key, HostKeyAlgorithm::SshEd25519);
        assert!(client.server_host_key().is_some());
    }

    #[tokio::test]
    async fn test_group1_handshake() {
        let (client, server) = pair_with(
            group1_config("Test"),
            group1_config("Test"),
            Arc::new(AcceptAnyHostKey),
        )
        .await;
        let (client, server) = (client.unwrap(), server.unwrap());
        assert_eq!(client.peer_version().identification(), "SSH-2.0-Test");
        assert_eq!(client.session_id().unwrap().len(), 20);
        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(
            client.negotiated_algorithms().unwrap().host_key,
            HostKeyAlgorithm::SshDss
        );
    }

    #[tokio::test]
    async fn test_service_request() {
        let (client, server) = pair().await;
        let accept = tokio::spawn(async move { server.accept_service(&["ssh-userauth"]).await });
        client.request_service("ssh-userauth").await.unwrap();
        assert_eq!(accept.await.unwrap().unwrap(), "ssh-userauth");
    }

    #[tokio::test]
    async fn test_unknown_service_disconnects() {
        let (client, server) = pair().await;
        let accept = tokio::spawn(async move { server.accept_service(&["ssh-userauth"]).await });
        let err = client.request_service("ssh-bogus").await.unwrap_err();
        assert!(matches!(
            err,
            TidewireError::ConnectionLost(_) | TidewireError::Disconnect { reason: 7, .. }
        ));
        let server_err = accept.await.unwrap().unwrap_err();
        assert_eq!(server_err.disconnect_reason(), Some(7));
        assert_eq!(client.closed().await.disconnect_reason(), Some(7));
    }

    #[tokio::test]
    async fn test_unimplemented_reply_carries_sequence() {
        let (client, _server) = pair().await;
        let waiter = client.expect(&[MessageType::Unimplemented as u8]).unwrap();
        let sequence = client.outbound_sequence().await;
        client.send(&[192, 1, 2, 3]).await.unwrap();

        let reply = timeout(LIMIT, waiter.recv()).await.unwrap().unwrap();
        let mut r = Reader::new(&reply[1..]);
        assert_eq!(r.get_u32().unwrap(), sequence);
    }

    fn cipher_config(cipher: CipherAlgorithm) -> TransportConfig {
        TransportConfig {
            preferences: AlgorithmPreferences {
                cipher: vec![cipher],
                ..AlgorithmPreferences::default()
            },
            ..TransportConfig::default()
        }
    }

    async fn cipher_pair(cipher: CipherAlgorithm) -> (Transport, Transport) {
        let (client, server) = pair_with(
            cipher_config(cipher),
            cipher_config(cipher),
            Arc::new(AcceptAnyHostKey),
        )
        .await;
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_mac_error_disconnects() {
        for cipher in [
            CipherAlgorithm::ChaCha20Poly1305,
            CipherAlgorithm::Aes128Gcm,
            CipherAlgorithm::Aes256Ctr,
        ] {
            let (client, server) = cipher_pair(cipher).await;
            server.inner.out.lock().await.corrupt_next_mac = true;
            server.send(&[MessageType::Ignore as u8, 0, 0, 0, 0]).await.unwrap();

            let code = Some(DisconnectReason::MacError.code());
            let err = timeout(LIMIT, client.closed()).await.unwrap();
            assert_eq!(err.disconnect_reason(), code, "{}", cipher.name());
            let err = timeout(LIMIT, server.closed()).await.unwrap();
            assert_eq!(err.disconnect_reason(), code, "{}", cipher.name());
        }
    }

    #[tokio::test]
    async fn test_each_cipher_carries_traffic() {
        for cipher in CipherAlgorithm::ALL {
            let (client, server) = cipher_pair(cipher).await;
            let negotiated = client.negotiated_algorithms().unwrap();
            assert_eq!(negotiated.cipher_server_to_client, cipher);
            assert_eq!(
                negotiated.mac_server_to_client == MacAlgorithm::None,
                cipher.is_aead(),
                "{}",
                cipher.name()
            );

            let mut ignore = vec![MessageType::Ignore as u8, 0, 0, 0x10, 0];
            ignore.extend_from_slice(&[0x5a; 4096]);
            server.send(&ignore).await.unwrap();
            client.send(&ignore).await.unwrap();

            // The GCM counter restarts from the new IV; sequence numbers carry on.
            timeout(LIMIT, client.rekey()).await.unwrap().unwrap();
            let accept =
                tokio::spawn(async move { server.accept_service(&["ssh-userauth"]).await });
            timeout(LIMIT, client.request_service("ssh-userauth"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(accept.await.unwrap().unwrap(), "ssh-userauth");
        }
    }

    #[tokio::test]
    async fn test_rekey_keeps_session_id() {
        let (client, server) = pair().await;
        let session_id = client.session_id();
        let (old_c2s, _) = client.session_keys().unwrap();

        timeout(LIMIT, client.rekey()).await.unwrap().unwrap();
        assert_eq!(client.completed_exchanges(), 2);
        assert_eq!(client.session_id(), session_id);
        let (new_c2s, _) = client.session_keys().unwrap();
        assert_ne!(old_c2s.encryption_key, new_c2s.encryption_key);

        // The connection still carries traffic under the new keys.
        let accept = tokio::spawn(async move { server.accept_service(&["ssh-userauth"]).await });
        client.request_service("ssh-userauth").await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_byte_limit_triggers_rekey() {
        let config = TransportConfig {
            rekey_bytes_limit: 4096,
            ..TransportConfig::default()
        };
        let (client, server) =
            pair_with(config, TransportConfig::default(), Arc::new(AcceptAnyHostKey)).await;
        let (client, server) = (client.unwrap(), server.unwrap());

        let mut ignore = vec![MessageType::Ignore as u8, 0, 0, 0x04, 0];
        ignore.extend_from_slice(&[0u8; 1024]);
        for _ in 0..8 {
            client.send(&ignore).await.unwrap();
        }
        let mut rx = server.inner.status.subscribe();
        timeout(LIMIT, rx.wait_for(|s| s.exchanges >= 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.session_id(), server.session_id());
    }

    #[tokio::test]
    async fn test_messages_deferred_during_kex() {
        let (client, _server) = pair().await;
        client.inner.out.lock().await.kex_active = true;
        client.send(&[MessageType::ChannelData as u8, 0]).await.unwrap();
        client.send(&[MessageType::Ignore as u8]).await.unwrap();

        let mut out = client.inner.out.lock().await;
        assert_eq!(out.deferred.len(), 1);
        out.deferred.clear();
        out.kex_active = false;
    }

    #[tokio::test]
    async fn test_service_request_waits_for_kex() {
        let (client, server) = pair().await;
        client.inner.out.lock().await.kex_active = true;

        let accept = tokio::spawn(async move { server.accept_service(&["ssh-userauth"]).await });
        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.request_service("ssh-userauth").await })
        };
        timeout(LIMIT, async {
            while client.inner.out.lock().await.deferred.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!request.is_finished());

        {
            let mut out = client.inner.out.lock().await;
            assert_eq!(out.deferred[0][0], MessageType::ServiceRequest as u8);
            out.kex_active = false;
            while let Some(payload) = out.deferred.pop_front() {
                out.write_payload(&payload).await.unwrap();
            }
        }
        timeout(LIMIT, request).await.unwrap().unwrap().unwrap();
        assert_eq!(timeout(LIMIT, accept).await.unwrap().unwrap().unwrap(), "ssh-userauth");
        assert!(deferred_during_kex(MessageType::ServiceAccept as u8));
        assert!(!deferred_during_kex(MessageType::Ignore as u8));
    }

    #[tokio::test]
    async fn test_wrong_guess_is_discarded() {
        let client_config = TransportConfig {
            proactive_kex: true,
            preferences: AlgorithmPreferences {
                kex: vec![
                    KexAlgorithm::Curve25519Sha256,
                    KexAlgorithm::DiffieHellmanGroup1Sha1,
                ],
                ..AlgorithmPreferences::default()
            },
            ..TransportConfig::default()
        };
        let server_config = TransportConfig {
            preferences: AlgorithmPreferences {
                kex: vec![KexAlgorithm::DiffieHellmanGroup1Sha1],
                ..AlgorithmPreferences::default()
            },
            ..TransportConfig::default()
        };
        let (client, server) =
            pair_with(client_config, server_config, Arc::new(AcceptAnyHostKey)).await;
        let (client, server) = (client.unwrap(), server.unwrap());
        assert_eq!(
            client.negotiated_algorithms().unwrap().kex,
            KexAlgorithm::DiffieHellmanGroup1Sha1
        );
        assert_eq!(client.session_id(), server.session_id());
    }

    #[tokio::test]
    async fn test_right_guess_is_used() {
        let client_config = TransportConfig {
            proactive_kex: true,
            ..TransportConfig::default()
        };
        let (client, server) = pair_with(
            client_config,
            TransportConfig::default(),
            Arc::new(AcceptAnyHostKey),
        )
        .await;
        assert_eq!(client.unwrap().session_id(), server.unwrap().session_id());
    }

    #[tokio::test]
    async fn test_no_common_cipher() {
        let client_config = TransportConfig {
            preferences: AlgorithmPreferences {
                cipher: vec![CipherAlgorithm::Aes128Ctr],
                ..AlgorithmPreferences::default()
            },
            ..TransportConfig::default()
        };
        let server_config = TransportConfig {
            preferences: AlgorithmPreferences {
                cipher: vec![CipherAlgorithm::Aes256Cbc],
                ..AlgorithmPreferences::default()
            },
            ..TransportConfig::default()
        };
        let (client, server) =
            pair_with(client_config, server_config, Arc::new(AcceptAnyHostKey)).await;
        let code = DisconnectReason::KeyExchangeFailed.code();
        assert_eq!(client.unwrap_err().disconnect_reason(), Some(code));
        assert_eq!(server.unwrap_err().disconnect_reason(), Some(code));
    }

    #[tokio::test]
    async fn test_untrusted_host_key() {
        let (client, _server) = pair_with(
            TransportConfig::default(),
            TransportConfig::default(),
            Arc::new(KnownHosts::new(StrictHostKeyChecking::Yes)),
        )
        .await;
        assert_eq!(
            client.unwrap_err().disconnect_reason(),
            Some(DisconnectReason::HostKeyNotVerifiable.code())
        );
    }

    #[tokio::test]
    async fn test_unsupported_peer_version() {
        let (a, mut b) = tokio::io::duplex(4096);
        let peer = tokio::spawn(async move {
            b.write_all(b"SSH-1.5-Ancient\r\n").await.unwrap();
            let mut sink = Vec::new();
            let _ = b.read_to_end(&mut sink).await;
        });
        let err = Transport::connect(a, TransportConfig::default(), Arc::new(AcceptAnyHostKey))
            .await
            .unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(DisconnectReason::ProtocolVersionNotSupported.code())
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_peer_version() {
        let (a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            b.write_all(b"SSH-2.0\r\n").await.unwrap();
            let mut sink = Vec::new();
            let _ = b.read_to_end(&mut sink).await;
        });
        let err = Transport::connect(a, TransportConfig::default(), Arc::new(AcceptAnyHostKey))
            .await
            .unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(DisconnectReason::ProtocolError.code())
        );
    }

    #[tokio::test]
    async fn test_disconnect_wakes_waiters() {
        let (client, server) = pair().await;
        let waiter = client.expect(&[MessageType::ServiceAccept as u8]).unwrap();
        server.disconnect().await;
        let err = timeout(LIMIT, waiter.recv()).await.unwrap().unwrap_err();
        assert!(matches!(err, TidewireError::ConnectionLost(_)));
        assert_eq!(
            client.closed().await.disconnect_reason(),
            Some(DisconnectReason::ByApplication.code())
        );
        assert!(client.send(&[MessageType::Ignore as u8]).await.is_err());
    }

    #[test]
    fn test_host_id_display() {
        assert_eq!(HostId::new("example.com", 22).to_string(), "example.com");
        assert_eq!(HostId::new("::1", 2222).to_string(), "[::1]:2222");
    }
}
