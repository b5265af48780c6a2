//! Session channels (RFC 4254 Section 6).
//!
//! Client side, [`Session`] wraps a `session` channel with typed requests:
//! pseudo terminal, shell, command execution, subsystem and environment.
//!
//! Server side, [`SessionAcceptor`] accepts `session` channels and gives each
//! one a [`SessionRequests`] handler. Accepted requests are published as
//! [`SessionEvent`]s for the application to act on.

use std::sync::Arc;

use async_trait::async_trait;
use tidewire_platform::TidewireResult;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channel::{Channel, ChannelHandler, ChannelRequest, DefaultChannelHandler};
use super::codec::{Reader, Writer};
use super::connection::{ChannelAcceptor, ChannelDecision, ConnectionService};
use super::message::ChannelOpenFailureReason;

/// Channel type of interactive sessions.
pub const SESSION_CHANNEL: &str = "session";

/// Terminal geometry and modes for a `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// TERM value, e.g. `xterm`
    pub term: String,
    /// Width in characters
    pub cols: u32,
    /// Height in rows
    pub rows: u32,
    /// Width in pixels
    pub width_px: u32,
    /// Height in pixels
    pub height_px: u32,
    /// Encoded terminal modes
    pub modes: Vec<u8>,
}

impl PtyRequest {
    fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str(&self.term);
        w.put_u32(self.cols);
        w.put_u32(self.rows);
        w.put_u32(self.width_px);
        w.put_u32(self.height_px);
        w.put_string(&self.modes);
        w.into_vec()
    }
}

/// Client side of a session channel.
#[derive(Debug, Clone)]
pub struct Session {
    channel: Channel,
}

impl Session {
    /// Opens a session channel on `connection`.
    pub async fn open(connection: &ConnectionService) -> TidewireResult<Self> {
        let channel = connection.open(SESSION_CHANNEL, &[]).await?;
        Ok(Self { channel })
    }

    /// Wraps an already open session channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// The underlying channel, for data transfer.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Requests a pseudo terminal. Returns whether the server agreed.
    pub async fn open_pty(
        &self,
        term: &str,
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
        modes: &[u8],
    ) -> TidewireResult<bool> {
        let request = PtyRequest {
            term: term.to_string(),
            cols,
            rows,
            width_px,
            height_px,
            modes: modes.to_vec(),
        };
        self.channel
            .send_channel_request("pty-req", true, &request.to_bytes())
            .await
    }

    /// Starts the user's shell.
    pub async fn shell(&self) -> TidewireResult<bool> {
        self.channel.send_channel_request("shell", true, &[]).await
    }

    /// Runs `command`.
    pub async fn exec(&self, command: &str) -> TidewireResult<bool> {
        let mut w = Writer::new();
        w.put_str(command);
        self.channel
            .send_channel_request("exec", true, w.as_slice())
            .await
    }

    /// Starts subsystem `name`, e.g. `sftp`.
    pub async fn subsystem(&self, name: &str) -> TidewireResult<bool> {
        let mut w = Writer::new();
        w.put_str(name);
        self.channel
            .send_channel_request("subsystem", true, w.as_slice())
            .await
    }

    /// Passes an environment variable.
    pub async fn set_env(&self, name: &str, value: &str) -> TidewireResult<bool> {
        let mut w = Writer::new();
        w.put_str(name);
        w.put_str(value);
        self.channel
            .send_channel_request("env", true, w.as_slice())
            .await
    }

    /// Exit status reported by the server, once known.
    pub fn exit_status(&self) -> Option<u32> {
        self.channel.exit_status()
    }

    /// Closes the session.
    pub async fn close(&self) -> TidewireResult<()> {
        self.channel.close().await
    }
}

/// A session request the server accepted.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// `shell`
    Shell {
        /// The session channel
        channel: Channel,
    },
    /// `exec`
    Exec {
        /// The session channel
        channel: Channel,
        /// Command line
        command: String,
    },
    /// `subsystem`
    Subsystem {
        /// The session channel
        channel: Channel,
        /// Subsystem name
        name: String,
    },
    /// `env`
    Env {
        /// The session channel
        channel: Channel,
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
}

impl SessionEvent {
    /// The channel the request arrived on.
    pub fn channel(&self) -> &Channel {
        match self {
            SessionEvent::Shell { channel }
            | SessionEvent::Exec { channel, .. }
            | SessionEvent::Subsystem { channel, .. }
            | SessionEvent::Env { channel, .. } => channel,
        }
    }
}

/// Server-side request handler for one session channel.
///
/// Accepts `shell`, `exec`, `env` and `subsystem`; refuses `pty-req`,
/// `x11-req` and anything unknown.
#[derive(Debug, Clone)]
pub struct SessionRequests {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRequests {
    /// Creates a handler publishing to `events`.
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { events }
    }

    fn parse(channel: &Channel, request: &ChannelRequest) -> TidewireResult<Option<SessionEvent>> {
        let mut r = Reader::new(&request.data);
        let channel = channel.clone();
        let event = match request.request_type.as_str() {
            "shell" => SessionEvent::Shell { channel },
            "exec" => SessionEvent::Exec {
                channel,
                command: r.get_utf8()?,
            },
            "subsystem" => SessionEvent::Subsystem {
                channel,
                name: r.get_utf8()?,
            },
            "env" => SessionEvent::Env {
                channel,
                name: r.get_utf8()?,
                value: r.get_utf8()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[async_trait]
impl ChannelHandler for SessionRequests {
    async fn handle_request(&self, channel: &Channel, request: &ChannelRequest) -> bool {
        match request.request_type.as_str() {
            "pty-req" | "x11-req" => {
                debug!(
                    channel = channel.local_id(),
                    request = %request.request_type,
                    "Terminal requests are not supported"
                );
                return false;
            }
            "exit-status" => return DefaultChannelHandler.handle_request(channel, request).await,
            _ => {}
        }

        match Self::parse(channel, request) {
            Ok(Some(event)) => {
                info!(
                    channel = channel.local_id(),
                    request = %request.request_type,
                    "Session request accepted"
                );
                self.events.send(event).is_ok()
            }
            Ok(None) => {
                debug!(
                    channel = channel.local_id(),
                    request = %request.request_type,
                    "Unknown session request"
                );
                false
            }
            Err(e) => {
                debug!(channel = channel.local_id(), error = %e, "Malformed session request");
                false
            }
        }
    }
}

/// Accepts `session` channels and refuses every other type.
#[derive(Debug, Clone)]
pub struct SessionAcceptor {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionAcceptor {
    /// Creates an acceptor and the receiver of its session events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

#[async_trait]
impl ChannelAcceptor for SessionAcceptor {
    async fn accept(&self, channel_type: &str, _extra: &[u8]) -> ChannelDecision {
        if channel_type == SESSION_CHANNEL {
            ChannelDecision::Accept(Arc::new(SessionRequests::new(self.events.clone())))
        } else {
            ChannelDecision::Reject(
                ChannelOpenFailureReason::UnknownChannelType,
                format!("Unknown channel type {}", channel_type),
            )
        }
    }

    // Session channels reach the application through their events.
    fn queues_channels(&self) -> bool {
        false
    }
}

/// Reports a command's exit status to the client.
pub async fn send_exit_status(channel: &Channel, status: u32) -> TidewireResult<()> {
    let mut w = Writer::new();
    w.put_u32(status);
    channel
        .send_channel_request("exit-status", false, w.as_slice())
        .await?;
    Ok(())
}
