//! Error types for Tidewire

use std::fmt;

/// Unified error type for all Tidewire operations
#[derive(Debug)]
pub enum TidewireError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed message or frame)
    Protocol(String),

    /// Security error (key material, signatures, etc.)
    Security(String),

    /// The connection was terminated with an SSH disconnect message,
    /// either sent by us or received from the peer.
    Disconnect {
        /// Disconnect reason code (RFC 4253 Section 11.1)
        reason: u32,
        /// Human readable description
        description: String,
    },

    /// The receive loop ended while an operation was waiting on it
    ConnectionLost(String),

    /// User authentication failed with every available method
    Authentication(String),

    /// The peer refused to open a channel
    ChannelOpenFailed {
        /// Open failure reason code (RFC 4254 Section 5.1)
        reason: u32,
        /// Human readable description
        description: String,
    },

    /// Operation on a channel that has already been closed
    ChannelClosed(u32),

    /// A second waiter was registered for something that allows only one
    WaiterConflict(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TidewireError {
    /// Returns the disconnect reason code if this error ended the connection.
    pub fn disconnect_reason(&self) -> Option<u32> {
        match self {
            TidewireError::Disconnect { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for TidewireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TidewireError::Io(e) => write!(f, "IO error: {}", e),
            TidewireError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TidewireError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TidewireError::Security(msg) => write!(f, "Security error: {}", msg),
            TidewireError::Disconnect {
                reason,
                description,
            } => write!(f, "Disconnected (reason {}): {}", reason, description),
            TidewireError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TidewireError::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            TidewireError::ChannelOpenFailed {
                reason,
                description,
            } => write!(f, "Channel open failed (reason {}): {}", reason, description),
            TidewireError::ChannelClosed(id) => write!(f, "Channel {} is closed", id),
            TidewireError::WaiterConflict(msg) => write!(f, "Waiter conflict: {}", msg),
            TidewireError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            TidewireError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for TidewireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TidewireError::Io(e) => Some(e),
            TidewireError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TidewireError {
    fn from(err: std::io::Error) -> Self {
        TidewireError::Io(err)
    }
}

/// Result type for Tidewire operations
pub type TidewireResult<T> = Result<T, TidewireError>;
