//! SSH-2 protocol engine for the Tidewire toolkit.
//!
//! This crate implements both ends of SSH-2 over any async byte stream:
//!
//! - **Transport** - version exchange, Diffie-Hellman and Curve25519 key
//!   exchange, AES-CTR/CBC with HMAC, rekeying
//! - **Authentication** - publickey and password, client and server
//! - **Connection** - multiplexed channels with windowed flow control,
//!   session requests
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::Packet;
//!
//! // Create and serialize an SSH packet
//! let packet = Packet::new(b"SSH message payload".to_vec());
//! let wire_format = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted crates (`ring`, RustCrypto, `dalek`)
//! - Constant-time operations for authentication
//! - Secure memory handling with `zeroize`
//! - Frame and codec parsing is fuzzed
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
