//! SSH protocol message numbers and reason codes.
//!
//! Message numbers follow RFC 4250 Section 4.1:
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service request
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Authentication protocol
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::message::{DisconnectReason, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(DisconnectReason::MacError.code(), 5);
//! ```

/// SSH message types.
///
/// Some numbers are reused by different sub-protocols (30/31 by every key
/// exchange method, 60 by two authentication methods); the enum carries the
/// most common name and [`USERAUTH_PASSWD_CHANGEREQ`] names the other use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - carries no meaning.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// DH / ECDH key exchange init.
    KexdhInit = 30,
    /// DH / ECDH key exchange reply.
    KexdhReply = 31,

    // User authentication (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK, or password change request in the password method.
    UserauthPkOk = 60,

    // Connection protocol (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

/// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ shares its number with PK_OK.
pub const USERAUTH_PASSWD_CHANGEREQ: u8 = 60;

/// SSH_MSG_KEX_ECDH_INIT shares its number with KEXDH_INIT.
pub const KEX_ECDH_INIT: u8 = 30;

/// SSH_MSG_KEX_ECDH_REPLY shares its number with KEXDH_REPLY.
pub const KEX_ECDH_REPLY: u8 = 31;

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tidewire_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// True for numbers reserved for key-exchange-method messages (30-49).
    pub fn is_kex_method(byte: u8) -> bool {
        (30..=49).contains(&byte)
    }

    /// True for transport layer numbers (1-49), which are never deferred
    /// while a key exchange runs.
    pub fn is_transport(byte: u8) -> bool {
        (1..=49).contains(&byte)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect
    HostNotAllowedToConnect = 1,
    /// Protocol error
    ProtocolError = 2,
    /// Key exchange failed
    KeyExchangeFailed = 3,
    /// Reserved
    Reserved = 4,
    /// MAC error
    MacError = 5,
    /// Compression error
    CompressionError = 6,
    /// Service not available
    ServiceNotAvailable = 7,
    /// Protocol version not supported
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable
    HostKeyNotVerifiable = 9,
    /// Connection lost
    ConnectionLost = 10,
    /// Disconnected by application
    ByApplication = 11,
    /// Too many connections
    TooManyConnections = 12,
    /// Authentication cancelled by user
    AuthCancelledByUser = 13,
    /// No more authentication methods available
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Numeric reason code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Converts from a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::HostNotAllowedToConnect),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::KeyExchangeFailed),
            4 => Some(Self::Reserved),
            5 => Some(Self::MacError),
            6 => Some(Self::CompressionError),
            7 => Some(Self::ServiceNotAvailable),
            8 => Some(Self::ProtocolVersionNotSupported),
            9 => Some(Self::HostKeyNotVerifiable),
            10 => Some(Self::ConnectionLost),
            11 => Some(Self::ByApplication),
            12 => Some(Self::TooManyConnections),
            13 => Some(Self::AuthCancelledByUser),
            14 => Some(Self::NoMoreAuthMethodsAvailable),
            15 => Some(Self::IllegalUserName),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostNotAllowedToConnect => "Host not allowed to connect",
            Self::ProtocolError => "Protocol error",
            Self::KeyExchangeFailed => "Key exchange failed",
            Self::Reserved => "Reserved",
            Self::MacError => "MAC error",
            Self::CompressionError => "Compression error",
            Self::ServiceNotAvailable => "Service not available",
            Self::ProtocolVersionNotSupported => "Protocol version not supported",
            Self::HostKeyNotVerifiable => "Host key not verifiable",
            Self::ConnectionLost => "Connection lost",
            Self::ByApplication => "Disconnected by application",
            Self::TooManyConnections => "Too many connections",
            Self::AuthCancelledByUser => "Authentication cancelled by user",
            Self::NoMoreAuthMethodsAvailable => "No more authentication methods available",
            Self::IllegalUserName => "Illegal user name",
        }
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Numeric reason code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}
