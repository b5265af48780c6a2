//! SSH channels (RFC 4254 Section 5).
//!
//! A [`Channel`] is one flow-controlled logical stream multiplexed over a
//! [`Transport`]. Handles are cheap to clone and share one channel.
//!
//! # Flow control
//!
//! Each side advertises a receive window. [`Channel::send`] never sends more
//! than the peer's remaining window or its maximum packet size, and waits
//! while the window is exhausted. Received data shrinks our window; reads
//! refill it with WINDOW_ADJUST once the buffer is drained and less than half
//! of the window is left.
//!
//! # Lifecycle
//!
//! ```text
//! Opening -> Open -> (EOF) -> Closed
//! ```
//!
//! [`Channel::close`] sends CHANNEL_CLOSE once and wakes every task waiting
//! on the channel. The channel is forgotten by the connection once both
//! sides have sent CLOSE.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use tidewire_platform::{TidewireError, TidewireResult};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use super::codec::{Reader, Writer};
use super::message::{ChannelOpenFailureReason, MessageType};
use super::transport::Transport;

/// Default initial receive window (128 KiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 131_072;

/// Default maximum packet size (128 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 131_072;

/// Extended data type code for stderr.
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Receive-side channel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Initial (and refill) receive window in bytes.
    pub window_size: u32,
    /// Largest data packet we accept.
    pub max_packet_size: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST without the recipient channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Request name, e.g. `exec` or `exit-status`
    pub request_type: String,
    /// Whether the sender waits for SUCCESS / FAILURE
    pub want_reply: bool,
    /// Type specific data
    pub data: Vec<u8>,
}

impl ChannelRequest {
    /// Serializes the request for `recipient_channel`.
    ///
    /// Format (RFC 4254 Section 5.4):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_REQUEST (98)
    /// uint32    recipient channel
    /// string    request type
    /// boolean   want reply
    /// ....      type-specific data
    /// ```
    pub fn to_bytes(&self, recipient_channel: u32) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelRequest);
        w.put_u32(recipient_channel);
        w.put_str(&self.request_type);
        w.put_bool(self.want_reply);
        w.put_raw(&self.data);
        w.into_vec()
    }

    /// Parses a request payload, returning the recipient channel too.
    pub fn from_bytes(payload: &[u8]) -> TidewireResult<(u32, Self)> {
        let mut r = Reader::new(payload);
        if r.get_u8()? != MessageType::ChannelRequest as u8 {
            return Err(TidewireError::Protocol(
                "Not a CHANNEL_REQUEST message".to_string(),
            ));
        }
        let recipient = r.get_u32()?;
        let request_type = r.get_utf8()?;
        let want_reply = r.get_bool()?;
        Ok((
            recipient,
            Self {
                request_type,
                want_reply,
                data: r.rest().to_vec(),
            },
        ))
    }
}

/// Decides on requests the peer sends on a channel.
///
/// Runs on the connection's receive task.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Returns true to answer SUCCESS, false for FAILURE.
    async fn handle_request(&self, channel: &Channel, request: &ChannelRequest) -> bool;
}

/// Records `exit-status` and refuses every other request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChannelHandler;

#[async_trait]
impl ChannelHandler for DefaultChannelHandler {
    async fn handle_request(&self, channel: &Channel, request: &ChannelRequest) -> bool {
        if request.request_type == "exit-status" {
            match Reader::new(&request.data).get_u32() {
                Ok(status) => {
                    channel.record_exit_status(status);
                    return true;
                }
                Err(e) => {
                    warn!(channel = channel.local_id(), error = %e, "Malformed exit-status");
                    return false;
                }
            }
        }
        debug!(
            channel = channel.local_id(),
            request = %request.request_type,
            "Refusing channel request"
        );
        false
    }
}

/// The peer's side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteChannel {
    /// The peer's channel id
    pub id: u32,
    /// Bytes we may still send
    pub window_left: u32,
    /// Largest data packet the peer accepts
    pub max_packet_size: u32,
}

type OpenWaiter = oneshot::Sender<TidewireResult<()>>;

struct ChannelState {
    remote: Option<RemoteChannel>,
    window_data_left: u32,
    buffer: Vec<u8>,
    extended: HashMap<u32, Vec<u8>>,
    eof: bool,
    eof_sent: bool,
    closed: bool,
    close_received: bool,
    open_pending: bool,
    open_waiter: Option<OpenWaiter>,
    request_waiter: Option<oneshot::Sender<bool>>,
    exit_status: Option<u32>,
    #[cfg(test)]
    inbound_chunks: Vec<usize>,
}

struct ChannelShared {
    local_id: u32,
    channel_type: String,
    config: ChannelConfig,
    transport: Transport,
    state: StdMutex<ChannelState>,
    changed: Notify,
    handler: StdMutex<Arc<dyn ChannelHandler>>,
}

/// One SSH channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Channel")
            .field("local_id", &self.shared.local_id)
            .field("type", &self.shared.channel_type)
            .field("remote", &state.remote)
            .field("window_data_left", &state.window_data_left)
            .field("eof", &state.eof)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Where [`Channel::read_inner`] takes data from.
#[derive(Clone, Copy)]
enum Stream {
    Data,
    Extended(u32),
}

impl Channel {
    /// Creates a channel in the opening state. Used by the connection
    /// service; the returned receiver completes when the peer answers.
    pub(crate) fn opening(
        transport: Transport,
        local_id: u32,
        channel_type: &str,
        config: ChannelConfig,
    ) -> (Self, oneshot::Receiver<TidewireResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let channel = Self::new(transport, local_id, channel_type, config, None, Some(tx));
        (channel, rx)
    }

    /// Creates a channel the peer opened.
    pub(crate) fn accepted(
        transport: Transport,
        local_id: u32,
        channel_type: &str,
        config: ChannelConfig,
        remote: RemoteChannel,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        let channel = Self::new(transport, local_id, channel_type, config, Some(remote), None);
        channel.set_handler(handler);
        channel
    }

    fn new(
        transport: Transport,
        local_id: u32,
        channel_type: &str,
        config: ChannelConfig,
        remote: Option<RemoteChannel>,
        open_waiter: Option<OpenWaiter>,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                local_id,
                channel_type: channel_type.to_string(),
                config,
                transport,
                state: StdMutex::new(ChannelState {
                    remote,
                    window_data_left: config.window_size,
                    buffer: Vec::new(),
                    extended: HashMap::new(),
                    eof: false,
                    eof_sent: false,
                    closed: false,
                    close_received: false,
                    open_pending: open_waiter.is_some(),
                    open_waiter,
                    request_waiter: None,
                    exit_status: None,
                    #[cfg(test)]
                    inbound_chunks: Vec::new(),
                }),
                changed: Notify::new(),
                handler: StdMutex::new(Arc::new(DefaultChannelHandler)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self) {
        self.shared.changed.notify_waiters();
    }

    /// Our channel id.
    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    /// The peer's channel id, once known.
    pub fn remote_id(&self) -> Option<u32> {
        self.state().remote.map(|r| r.id)
    }

    /// Channel type name, e.g. `session`.
    pub fn channel_type(&self) -> &str {
        &self.shared.channel_type
    }

    /// Our receive parameters.
    pub fn config(&self) -> ChannelConfig {
        self.shared.config
    }

    /// The transport this channel runs over.
    pub fn transport(&self) -> &Transport {
        &self.shared.transport
    }

    /// Bytes the peer may still send before we adjust the window.
    pub fn window_data_left(&self) -> u32 {
        self.state().window_data_left
    }

    /// Bytes we may still send.
    pub fn remote_window(&self) -> u32 {
        self.state().remote.map_or(0, |r| r.window_left)
    }

    /// True once we closed the channel or the connection ended.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// True while our CHANNEL_OPEN has not been answered by the peer.
    pub fn is_open_pending(&self) -> bool {
        self.state().open_pending
    }

    /// True once the peer sent EOF or CLOSE.
    pub fn is_eof(&self) -> bool {
        self.state().eof
    }

    /// Exit status reported by the peer, if any.
    pub fn exit_status(&self) -> Option<u32> {
        self.state().exit_status
    }

    pub(crate) fn record_exit_status(&self, status: u32) {
        debug!(channel = self.local_id(), status, "Exit status received");
        self.state().exit_status = Some(status);
        self.wake();
    }

    /// Replaces the handler for requests the peer sends.
    pub fn set_handler(&self, handler: Arc<dyn ChannelHandler>) {
        *self
            .shared
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handler;
    }

    fn handler(&self) -> Arc<dyn ChannelHandler> {
        self.shared
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Waits until `check` returns a value, re-evaluating it whenever the
    /// channel changes.
    async fn wait_until<T>(&self, mut check: impl FnMut(&mut ChannelState) -> Option<T>) -> T {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let ready = {
                let mut state = self.state();
                check(&mut state)
            };
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }

    /// Sends `data`, splitting it to fit the peer's window and packet size.
    ///
    /// # Errors
    ///
    /// [`TidewireError::ChannelClosed`] if the channel closes before all data
    /// is sent.
    pub async fn send(&self, data: &[u8]) -> TidewireResult<()> {
        self.send_stream(None, data).await
    }

    /// Sends extended data, e.g. stderr with [`SSH_EXTENDED_DATA_STDERR`].
    pub async fn send_extended(&self, data_type: u32, data: &[u8]) -> TidewireResult<()> {
        self.send_stream(Some(data_type), data).await
    }

    async fn send_stream(&self, data_type: Option<u32>, data: &[u8]) -> TidewireResult<()> {
        let local_id = self.local_id();
        let mut offset = 0;
        while offset < data.len() {
            let remaining = data.len() - offset;
            let reserved = self
                .wait_until(|state| {
                    if state.closed || state.close_received {
                        return Some(Err(TidewireError::ChannelClosed(local_id)));
                    }
                    let remote = state.remote.as_mut()?;
                    let n = (remote.window_left as usize)
                        .min(remote.max_packet_size as usize)
                        .min(remaining);
                    if n == 0 {
                        return None;
                    }
                    remote.window_left -= n as u32;
                    Some(Ok((remote.id, n)))
                })
                .await;
            let (remote_id, n) = reserved?;

            let chunk = &data[offset..offset + n];
            let mut w = match data_type {
                None => Writer::message(MessageType::ChannelData),
                Some(_) => Writer::message(MessageType::ChannelExtendedData),
            };
            w.put_u32(remote_id);
            if let Some(code) = data_type {
                w.put_u32(code);
            }
            w.put_string(chunk);
            self.shared.transport.send(w.as_slice()).await?;
            trace!(channel = local_id, bytes = n, "Sent channel data");
            offset += n;
        }
        Ok(())
    }

    /// Reads up to `n` bytes, waiting while nothing is buffered.
    ///
    /// Returns an empty vector at end of stream.
    pub async fn read_at_most(&self, n: usize) -> TidewireResult<Vec<u8>> {
        self.read_inner(Stream::Data, n).await
    }

    /// Reads up to `n` bytes of extended data of type `data_type`.
    pub async fn read_extended_at_most(
        &self,
        data_type: u32,
        n: usize,
    ) -> TidewireResult<Vec<u8>> {
        self.read_inner(Stream::Extended(data_type), n).await
    }

    /// Reads exactly `n` bytes, or fewer if the stream ends first.
    pub async fn read_exact(&self, n: usize) -> TidewireResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let chunk = self.read_at_most(n - out.len()).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Reads until end of stream.
    pub async fn read_to_end(&self) -> TidewireResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_at_most(self.shared.config.window_size as usize).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    async fn read_inner(&self, stream: Stream, n: usize) -> TidewireResult<Vec<u8>> {
        let window_size = self.shared.config.window_size;
        let (data, adjust) = self
            .wait_until(|state| {
                let buffer = match stream {
                    Stream::Data => &mut state.buffer,
                    Stream::Extended(code) => state.extended.entry(code).or_default(),
                };
                if buffer.is_empty() {
                    return (state.eof || state.closed).then(|| (Vec::new(), None));
                }

                let take = n.min(buffer.len());
                let data: Vec<u8> = buffer.drain(..take).collect();
                let drained = buffer.is_empty();

                let mut adjust = None;
                if drained
                    && !state.closed
                    && state.window_data_left < window_size / 2
                {
                    if let Some(remote) = state.remote {
                        let bytes = window_size - state.window_data_left;
                        state.window_data_left = window_size;
                        adjust = Some((remote.id, bytes));
                    }
                }
                Some((data, adjust))
            })
            .await;

        if let Some((remote_id, bytes)) = adjust {
            let mut w = Writer::message(MessageType::ChannelWindowAdjust);
            w.put_u32(remote_id);
            w.put_u32(bytes);
            self.shared.transport.send(w.as_slice()).await?;
            trace!(channel = self.local_id(), bytes, "Sent window adjust");
        }
        Ok(data)
    }

    /// Sends CHANNEL_EOF. Later calls do nothing.
    pub async fn send_eof(&self) -> TidewireResult<()> {
        let remote_id = {
            let mut state = self.state();
            if state.closed {
                return Err(TidewireError::ChannelClosed(self.local_id()));
            }
            if state.eof_sent {
                return Ok(());
            }
            state.eof_sent = true;
            state.remote.map(|r| r.id)
        };
        let Some(remote_id) = remote_id else {
            return Err(TidewireError::ChannelClosed(self.local_id()));
        };
        let mut w = Writer::message(MessageType::ChannelEof);
        w.put_u32(remote_id);
        self.shared.transport.send(w.as_slice()).await
    }

    /// Closes the channel. Later calls do nothing.
    ///
    /// Pending sends fail, pending reads return end of stream, a pending
    /// request answers false and a pending open fails with CONNECT_FAILED.
    pub async fn close(&self) -> TidewireResult<()> {
        let remote_id = {
            let mut state = self.state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if let Some(tx) = state.open_waiter.take() {
                let _ = tx.send(Err(TidewireError::ChannelOpenFailed {
                    reason: ChannelOpenFailureReason::ConnectFailed.code(),
                    description: "Channel has been closed".to_string(),
                }));
            }
            if let Some(tx) = state.request_waiter.take() {
                let _ = tx.send(false);
            }
            state.remote.map(|r| r.id)
        };
        self.wake();
        debug!(channel = self.local_id(), "Closing channel");

        match remote_id {
            Some(remote_id) if !self.shared.transport.is_closed() => {
                let mut w = Writer::message(MessageType::ChannelClose);
                w.put_u32(remote_id);
                self.shared.transport.send(w.as_slice()).await
            }
            _ => Ok(()),
        }
    }

    /// Sends a channel request.
    ///
    /// With `want_reply`, waits for the peer's answer and returns it;
    /// otherwise returns true once sent. A closed channel answers false.
    ///
    /// # Errors
    ///
    /// [`TidewireError::WaiterConflict`] if another reply-awaiting request
    /// is outstanding on this channel.
    pub async fn send_channel_request(
        &self,
        request_type: &str,
        want_reply: bool,
        data: &[u8],
    ) -> TidewireResult<bool> {
        let (remote_id, reply) = {
            let mut state = self.state();
            if state.closed {
                return Ok(false);
            }
            let Some(remote) = state.remote else {
                return Ok(false);
            };
            let reply = if want_reply {
                if state.request_waiter.is_some() {
                    return Err(TidewireError::WaiterConflict(format!(
                        "Channel {} already has a request outstanding",
                        self.local_id()
                    )));
                }
                let (tx, rx) = oneshot::channel();
                state.request_waiter = Some(tx);
                Some(rx)
            } else {
                None
            };
            (remote.id, reply)
        };

        let request = ChannelRequest {
            request_type: request_type.to_string(),
            want_reply,
            data: data.to_vec(),
        };
        if let Err(e) = self.shared.transport.send(&request.to_bytes(remote_id)).await {
            self.state().request_waiter = None;
            return Err(e);
        }
        debug!(
            channel = self.local_id(),
            request = request_type,
            want_reply,
            "Sent channel request"
        );

        match reply {
            Some(rx) => Ok(rx.await.unwrap_or(false)),
            None => Ok(true),
        }
    }

    // Inbound events, called by the connection service on the receive task.

    /// Records the peer's side. Returns true if the channel was closed while
    /// the open was pending, in which case the caller owes the peer a CLOSE.
    pub(crate) fn on_open_confirmed(&self, remote: RemoteChannel) -> bool {
        let (waiter, closed) = {
            let mut state = self.state();
            state.remote = Some(remote);
            state.open_pending = false;
            (state.open_waiter.take(), state.closed)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(Ok(()));
        }
        self.wake();
        closed
    }

    pub(crate) fn on_open_failed(&self, reason: u32, description: String) {
        let waiter = {
            let mut state = self.state();
            state.closed = true;
            state.open_pending = false;
            state.open_waiter.take()
        };
        if let Some(tx) = waiter {
            let _ = tx.send(Err(TidewireError::ChannelOpenFailed {
                reason,
                description,
            }));
        }
        self.wake();
    }

    pub(crate) fn on_data(&self, data_type: Option<u32>, data: &[u8]) {
        {
            let mut state = self.state();
            if data.len() > state.window_data_left as usize {
                warn!(
                    channel = self.local_id(),
                    len = data.len(),
                    window = state.window_data_left,
                    "Peer exceeded the channel window, dropping data"
                );
                return;
            }
            state.window_data_left -= data.len() as u32;
            #[cfg(test)]
            state.inbound_chunks.push(data.len());
            match data_type {
                None => state.buffer.extend_from_slice(data),
                Some(code) => state.extended.entry(code).or_default().extend_from_slice(data),
            }
        }
        trace!(channel = self.local_id(), bytes = data.len(), "Received channel data");
        self.wake();
    }

    pub(crate) fn on_window_adjust(&self, bytes: u32) {
        if let Some(remote) = self.state().remote.as_mut() {
            remote.window_left = remote.window_left.saturating_add(bytes);
        }
        trace!(channel = self.local_id(), bytes, "Remote window grew");
        self.wake();
    }

    pub(crate) fn on_eof(&self) {
        self.state().eof = true;
        debug!(channel = self.local_id(), "Peer sent EOF");
        self.wake();
    }

    pub(crate) async fn on_close(&self) -> TidewireResult<()> {
        {
            let mut state = self.state();
            state.eof = true;
            state.close_received = true;
        }
        debug!(channel = self.local_id(), "Peer closed channel");
        self.close().await
    }

    pub(crate) fn on_request_reply(&self, success: bool) {
        match self.state().request_waiter.take() {
            Some(tx) => {
                let _ = tx.send(success);
            }
            None => warn!(channel = self.local_id(), "Unsolicited channel request reply"),
        }
    }

    pub(crate) async fn on_request(&self, request: &ChannelRequest) -> bool {
        self.handler().handle_request(self, request).await
    }

    pub(crate) fn on_transport_closed(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.eof = true;
            state.open_pending = false;
            if let Some(tx) = state.open_waiter.take() {
                let _ = tx.send(Err(TidewireError::ConnectionLost(
                    "Connection closed while opening channel".to_string(),
                )));
            }
            if let Some(tx) = state.request_waiter.take() {
                let _ = tx.send(false);
            }
        }
        self.wake();
    }

    #[cfg(test)]
    pub(crate) fn inbound_chunks(&self) -> Vec<usize> {
        self.state().inbound_chunks.clone()
    }

    #[cfg(test)]
    pub(crate) fn has_pending_request(&self) -> bool {
        self.state().request_waiter.is_some()
    }
}
