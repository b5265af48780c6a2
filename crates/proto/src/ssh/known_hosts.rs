//! Server host key verification.
//!
//! During key exchange the client hands the server's host key to a
//! [`HostKeyVerifier`]. A rejected key aborts the connection with
//! HOST_KEY_NOT_VERIFIABLE.
//!
//! Two verifiers are provided:
//! - [`AcceptAnyHostKey`] trusts every key (tests and demos only)
//! - [`KnownHosts`] checks keys against an in-memory table, optionally
//!   learning unknown hosts on first use
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
//! use tidewire_proto::ssh::known_hosts::{HostKeyStatus, KnownHosts, StrictHostKeyChecking};
//! use tidewire_proto::ssh::transport::HostId;
//!
//! let key = Ed25519HostKey::generate().unwrap();
//! let host = HostId::new("example.com", 22);
//!
//! let known = KnownHosts::new(StrictHostKeyChecking::Yes);
//! assert_eq!(known.check(&host, &key), HostKeyStatus::Unknown);
//! known.add(&host, &key);
//! assert_eq!(known.check(&host, &key), HostKeyStatus::Known);
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tidewire_platform::{TidewireError, TidewireResult};
use tracing::{info, warn};

use super::hostkey::{parse_public_key, HostKey};
use super::transport::HostId;

/// Decides whether a server's host key is trusted.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    /// Returns true if `key` is acceptable for `host`.
    async fn verify(&self, host: &HostId, key: &dyn HostKey) -> bool;
}

/// Accepts every host key.
///
/// Offers no protection against man-in-the-middle attacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

#[async_trait]
impl HostKeyVerifier for AcceptAnyHostKey {
    async fn verify(&self, host: &HostId, key: &dyn HostKey) -> bool {
        warn!(%host, fingerprint = %key.fingerprint(), "Accepting unverified host key");
        true
    }
}

/// Result of looking a key up in [`KnownHosts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The key is recorded for this host.
    Known,
    /// Nothing is recorded for this host.
    Unknown,
    /// Other keys are recorded for this host, this one is not.
    Changed {
        /// Fingerprints of the recorded keys
        expected: Vec<String>,
    },
}

/// Policy for hosts with no recorded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Reject unknown hosts.
    #[default]
    Yes,
    /// Record the key of an unknown host and accept it.
    AcceptNew,
}

/// In-memory table of trusted host keys.
#[derive(Debug, Default)]
pub struct KnownHosts {
    policy: StrictHostKeyChecking,
    entries: Mutex<HashMap<HostId, Vec<Vec<u8>>>>,
}

impl KnownHosts {
    /// Creates an empty table.
    pub fn new(policy: StrictHostKeyChecking) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<HostId, Vec<Vec<u8>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Trusts `key` for `host`.
    pub fn add(&self, host: &HostId, key: &dyn HostKey) {
        self.add_blob(host, key.public_key_bytes());
    }

    fn add_blob(&self, host: &HostId, blob: Vec<u8>) {
        let mut entries = self.entries();
        let keys = entries.entry(host.clone()).or_default();
        if !keys.contains(&blob) {
            keys.push(blob);
        }
    }

    /// Adds an entry written as `algorithm base64-blob`, the key part of an
    /// OpenSSH known_hosts line.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Config`] if the entry is malformed or the
    /// algorithm does not match the blob.
    pub fn add_openssh_key(&self, host: &HostId, entry: &str) -> TidewireResult<()> {
        let mut parts = entry.split_whitespace();
        let (Some(algorithm), Some(encoded)) = (parts.next(), parts.next()) else {
            return Err(TidewireError::Config(format!(
                "Malformed host key entry: '{}'",
                entry
            )));
        };
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| TidewireError::Config(format!("Invalid base64 host key: {}", e)))?;
        let key = parse_public_key(&blob)
            .map_err(|e| TidewireError::Config(format!("Invalid host key: {}", e)))?;
        if key.algorithm_name() != algorithm {
            return Err(TidewireError::Config(format!(
                "Host key entry says {}, blob is {}",
                algorithm,
                key.algorithm_name()
            )));
        }
        self.add_blob(host, blob);
        Ok(())
    }

    /// Removes every key recorded for `host`.
    pub fn remove(&self, host: &HostId) {
        self.entries().remove(host);
    }

    /// Looks `key` up for `host`.
    pub fn check(&self, host: &HostId, key: &dyn HostKey) -> HostKeyStatus {
        let blob = key.public_key_bytes();
        let entries = self.entries();
        match entries.get(host) {
            None => HostKeyStatus::Unknown,
            Some(keys) if keys.contains(&blob) => HostKeyStatus::Known,
            Some(keys) => HostKeyStatus::Changed {
                expected: keys
                    .iter()
                    .filter_map(|b| parse_public_key(b).ok())
                    .map(|k| k.fingerprint())
                    .collect(),
            },
        }
    }
}

#[async_trait]
impl HostKeyVerifier for KnownHosts {
    async fn verify(&self, host: &HostId, key: &dyn HostKey) -> bool {
        match self.check(host, key) {
            HostKeyStatus::Known => true,
            HostKeyStatus::Unknown if self.policy == StrictHostKeyChecking::AcceptNew => {
                info!(%host, fingerprint = %key.fingerprint(), "Learned new host key");
                self.add(host, key);
                true
            }
            HostKeyStatus::Unknown => {
                warn!(%host, fingerprint = %key.fingerprint(), "Unknown host key");
                false
            }
            HostKeyStatus::Changed { expected } => {
                warn!(
                    %host,
                    fingerprint = %key.fingerprint(),
                    expected = ?expected,
                    "HOST KEY HAS CHANGED"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;

    #[tokio::test]
    async fn test_accept_any() {
        let key = Ed25519HostKey::generate().unwrap();
        assert!(AcceptAnyHostKey.verify(&HostId::new("h", 22), &key).await);
    }

    #[tokio::test]
    async fn test_strict_rejects_unknown() {
        let key = Ed25519HostKey::generate().unwrap();
        let known = KnownHosts::new(StrictHostKeyChecking::Yes);
        assert!(!known.verify(&HostId::new("h", 22), &key).await);
    }

    #[tokio::test]
    async fn test_accept_new_learns_key() {
        let key = Ed25519HostKey::generate().unwrap();
        let other = Ed25519HostKey::generate().unwrap();
        let host = HostId::new("h", 2222);
        let known = KnownHosts::new(StrictHostKeyChecking::AcceptNew);

        assert!(known.verify(&host, &key).await);
        assert_eq!(known.check(&host, &key), HostKeyStatus::Known);
        // Once learned, a different key is a change, not a new host.
        assert!(!known.verify(&host, &other).await);
        assert!(matches!(
            known.check(&host, &other),
            HostKeyStatus::Changed { expected } if expected == vec![key.fingerprint()]
        ));
    }

    #[test]
    fn test_port_is_part_of_identity() {
        let key = Ed25519HostKey::generate().unwrap();
        let known = KnownHosts::new(StrictHostKeyChecking::Yes);
        known.add(&HostId::new("h", 22), &key);
        assert_eq!(
            known.check(&HostId::new("h", 2222), &key),
            HostKeyStatus::Unknown
        );
        known.remove(&HostId::new("h", 22));
        assert_eq!(known.check(&HostId::new("h", 22), &key), HostKeyStatus::Unknown);
    }

    #[test]
    fn test_add_openssh_key() {
        let key = Ed25519HostKey::generate().unwrap();
        let host = HostId::new("h", 22);
        let known = KnownHosts::default();
        let line = format!(
            "ssh-ed25519 {} comment",
            STANDARD.encode(key.public_key_bytes())
        );
        known.add_openssh_key(&host, &line).unwrap();
        assert_eq!(known.check(&host, &key), HostKeyStatus::Known);

        let wrong = format!("ssh-rsa {}", STANDARD.encode(key.public_key_bytes()));
        assert!(known.add_openssh_key(&host, &wrong).is_err());
        assert!(known.add_openssh_key(&host, "ssh-ed25519").is_err());
        assert!(known.add_openssh_key(&host, "ssh-ed25519 !!!").is_err());
    }
}
