//! SSH (Secure Shell) protocol implementation.
//!
//! This module implements SSH-2 according to RFC 4251-4254.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire encoding** ([`codec`], [`packet`]) - SSH data types and the
//!    binary packet protocol (RFC 4253 Section 6)
//! 2. **Transport** ([`transport`], [`kex`], [`kex_dh`], [`crypto`]) - version
//!    exchange, key exchange, encryption, MAC and rekeying (RFC 4253)
//! 3. **Dispatch** ([`dispatcher`]) - routes decrypted messages to one-shot
//!    waiters or to the handlers of a registered service
//! 4. **Authentication** ([`auth`]) - publickey and password (RFC 4252)
//! 5. **Connection** ([`connection`], [`channel`], [`session`]) - channel
//!    multiplexing with flow control (RFC 4254)
//! 6. **Front ends** ([`client`], [`server`]) - TCP connect and accept
//!
//! # Security Considerations
//!
//! - **Input validation**: frame lengths, padding and name-lists are bounded
//! - **Constant-time comparisons** for passwords and MACs
//! - **Memory safety**: session keys and passwords are zeroized on drop
//! - **No unsafe code**
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-IGNORE payload".to_vec());
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-IGNORE payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod channel;
pub mod client;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod server;
pub mod session;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{
    constant_time_compare, construct_signature_data, AuthBanner, AuthFailure, AuthMethod,
    AuthPkOk, AuthRequest, Authenticator, ClientAuthMethod, PasswordProvider,
    StaticAuthenticator, StaticPassword, UserAuthClient, UserAuthServer,
};
pub use channel::{Channel, ChannelConfig, ChannelHandler, ChannelRequest};
pub use client::{connect_tcp, SshClient, SshClientConfig};
pub use connection::{ChannelAcceptor, ChannelDecision, ConnectionService};
pub use crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
pub use hostkey::{
    parse_public_key, DssHostKey, Ed25519HostKey, HostKey, HostKeyAlgorithm, SshRsaHostKey,
};
pub use kex::{AlgorithmPreferences, KexAlgorithm, KexInit, NegotiatedAlgorithms};
pub use known_hosts::{
    AcceptAnyHostKey, HostKeyStatus, HostKeyVerifier, KnownHosts, StrictHostKeyChecking,
};
pub use message::{ChannelOpenFailureReason, DisconnectReason, MessageType};
pub use packet::Packet;
pub use server::{ServerConnection, SshServer, SshServerConfig};
pub use session::{Session, SessionAcceptor, SessionEvent};
pub use transport::{HostId, Role, Transport, TransportConfig, TransportState};
pub use version::Version;
