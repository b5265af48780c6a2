//! SSH algorithm negotiation (RFC 4253 Section 7).
//!
//! This module covers the negotiation half of a key exchange:
//! - SSH_MSG_KEXINIT encoding and decoding
//! - Algorithm preference lists ([`AlgorithmPreferences`])
//! - Selecting one algorithm of each kind ([`negotiate`])
//! - Deciding whether a guessed first kex packet must be discarded
//!
//! The exchange methods themselves live in [`crate::ssh::kex_dh`].
//!
//! # Negotiation rules
//!
//! - Key exchange and host key: walk the client's kex list and take the first
//!   method the server also offers for which a mutually offered host key
//!   type with the required capabilities exists.
//! - Cipher, MAC, compression: for client-to-server the client's list
//!   decides the order, for server-to-client the server's list does. Both
//!   peers run the same computation and agree.
//! - Languages are ignored.
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::kex::{negotiate, AlgorithmPreferences, KexInit};
//!
//! let prefs = AlgorithmPreferences::default();
//! let client = KexInit::from_preferences(&prefs, false);
//! let server = KexInit::from_preferences(&prefs, false);
//!
//! let chosen = negotiate(&client, &server).unwrap();
//! assert_eq!(chosen.kex.name(), "curve25519-sha256");
//! ```

use rand::RngCore;
use tidewire_platform::{TidewireError, TidewireResult};

use super::codec::{Reader, Writer};
use super::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
use super::hostkey::HostKeyAlgorithm;
use super::message::MessageType;

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org, the pre-standard name of the same method
    Curve25519Sha256LibSsh,
    /// diffie-hellman-group1-sha1 (RFC 4253 Section 8.1)
    DiffieHellmanGroup1Sha1,
}

impl KexAlgorithm {
    /// Every supported method, most preferred first.
    pub const ALL: [KexAlgorithm; 3] = [
        KexAlgorithm::Curve25519Sha256,
        KexAlgorithm::Curve25519Sha256LibSsh,
        KexAlgorithm::DiffieHellmanGroup1Sha1,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256LibSsh => "curve25519-sha256@libssh.org",
            KexAlgorithm::DiffieHellmanGroup1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Parses a method from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }

    /// The method authenticates the exchange with a host key signature.
    pub fn wants_signature_host_key(&self) -> bool {
        true
    }

    /// The method needs a host key that can encrypt.
    pub fn wants_encryption_host_key(&self) -> bool {
        false
    }

    /// True if `host_key` meets this method's requirements.
    pub fn accepts_host_key(&self, host_key: HostKeyAlgorithm) -> bool {
        (!self.wants_signature_host_key() || host_key.supports_signature())
            && (!self.wants_encryption_host_key() || host_key.supports_encryption())
    }
}

/// Ordered algorithm preferences for one side of a connection.
///
/// Lists are most preferred first and are advertised verbatim in KEXINIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<KexAlgorithm>,
    /// Host key types. A server only advertises types it holds a key for.
    pub host_key: Vec<HostKeyAlgorithm>,
    /// Ciphers, both directions
    pub cipher: Vec<CipherAlgorithm>,
    /// MACs, both directions
    pub mac: Vec<MacAlgorithm>,
    /// Compression methods, both directions
    pub compression: Vec<CompressionAlgorithm>,
}

impl Default for AlgorithmPreferences {
    /// Every implemented algorithm except the `none` cipher and MAC.
    fn default() -> Self {
        Self {
            kex: KexAlgorithm::ALL.to_vec(),
            host_key: HostKeyAlgorithm::ALL.to_vec(),
            cipher: CipherAlgorithm::ALL
                .into_iter()
                .filter(|c| *c != CipherAlgorithm::None)
                .collect(),
            mac: MacAlgorithm::ALL
                .into_iter()
                .filter(|m| *m != MacAlgorithm::None)
                .collect(),
            compression: CompressionAlgorithm::ALL.to_vec(),
        }
    }
}

impl AlgorithmPreferences {
    /// Checks that every list has at least one entry.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Config`] naming the first empty list.
    pub fn validate(&self) -> TidewireResult<()> {
        let lists = [
            ("kex", self.kex.is_empty()),
            ("host key", self.host_key.is_empty()),
            ("cipher", self.cipher.is_empty()),
            ("mac", self.mac.is_empty()),
            ("compression", self.compression.is_empty()),
        ];
        for (name, empty) in lists {
            if empty {
                return Err(TidewireError::Config(format!(
                    "Empty {} algorithm list",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn names<T, F: Fn(&T) -> &'static str>(items: &[T], name: F) -> Vec<String> {
    items.iter().map(|i| name(i).to_string()).collect()
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_algorithms_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_algorithms_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_algorithms_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_algorithms_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_algorithms_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_algorithms_server_to_client: Vec<String>,
    /// Languages client to server
    languages_client_to_server: Vec<String>,
    /// Languages server to client
    languages_server_to_client: Vec<String>,
    /// A guessed kex packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT advertising `prefs`, with a fresh random cookie.
    pub fn from_preferences(prefs: &AlgorithmPreferences, first_kex_packet_follows: bool) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers = names(&prefs.cipher, |c| c.name());
        let macs = names(&prefs.mac, |m| m.name());
        let compression = names(&prefs.compression, |c| c.name());

        Self {
            cookie,
            kex_algorithms: names(&prefs.kex, |k| k.name()),
            server_host_key_algorithms: names(&prefs.host_key, |h| h.name()),
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: compression.clone(),
            compression_algorithms_server_to_client: compression,
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client-to-server ciphers.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the server-to-client ciphers.
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the client-to-server MACs.
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the server-to-client MACs.
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the client-to-server compression methods.
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the server-to-client compression methods.
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether a guessed kex packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes to a message payload (type byte included).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::KexInit);
        w.put_raw(&self.cookie);
        w.put_name_list(&self.kex_algorithms);
        w.put_name_list(&self.server_host_key_algorithms);
        w.put_name_list(&self.encryption_algorithms_client_to_server);
        w.put_name_list(&self.encryption_algorithms_server_to_client);
        w.put_name_list(&self.mac_algorithms_client_to_server);
        w.put_name_list(&self.mac_algorithms_server_to_client);
        w.put_name_list(&self.compression_algorithms_client_to_server);
        w.put_name_list(&self.compression_algorithms_server_to_client);
        w.put_name_list(&self.languages_client_to_server);
        w.put_name_list(&self.languages_server_to_client);
        w.put_bool(self.first_kex_packet_follows);
        w.put_u32(0);
        w.into_vec()
    }

    /// Parses a message payload (type byte included).
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Protocol`] if the type byte is not 20 or
    /// the message is truncated.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = Reader::new(data);
        let msg_type = r.get_u8()?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(TidewireError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.get_fixed(16)?);

        let kex_algorithms = r.get_name_list()?;
        let server_host_key_algorithms = r.get_name_list()?;
        let encryption_algorithms_client_to_server = r.get_name_list()?;
        let encryption_algorithms_server_to_client = r.get_name_list()?;
        let mac_algorithms_client_to_server = r.get_name_list()?;
        let mac_algorithms_server_to_client = r.get_name_list()?;
        let compression_algorithms_client_to_server = r.get_name_list()?;
        let compression_algorithms_server_to_client = r.get_name_list()?;
        let languages_client_to_server = r.get_name_list()?;
        let languages_server_to_client = r.get_name_list()?;
        let first_kex_packet_follows = r.get_bool()?;
        let _reserved = r.get_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// The algorithm set chosen by negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: KexAlgorithm,
    /// Server host key type
    pub host_key: HostKeyAlgorithm,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server
    pub mac_client_to_server: MacAlgorithm,
    /// MAC server to client
    pub mac_server_to_client: MacAlgorithm,
    /// Compression client to server
    pub compression_client_to_server: CompressionAlgorithm,
    /// Compression server to client
    pub compression_server_to_client: CompressionAlgorithm,
}

/// Returns the first entry of `preferred` that also appears in `other`.
///
/// # Example
///
/// ```rust
/// use tidewire_proto::ssh::kex::negotiate_algorithm;
///
/// let a = vec!["x".to_string(), "y".to_string()];
/// let b = vec!["y".to_string(), "x".to_string()];
/// assert_eq!(negotiate_algorithm(&a, &b), Some("x"));
/// assert_eq!(negotiate_algorithm(&b, &a), Some("y"));
/// ```
pub fn negotiate_algorithm<'a>(preferred: &'a [String], other: &[String]) -> Option<&'a str> {
    preferred
        .iter()
        .find(|name| other.contains(name))
        .map(String::as_str)
}

fn pick<T>(
    what: &str,
    preferred: &[String],
    other: &[String],
    parse: impl Fn(&str) -> Option<T>,
) -> TidewireResult<T> {
    preferred
        .iter()
        .filter(|name| other.contains(name))
        .find_map(|name| parse(name))
        .ok_or_else(|| TidewireError::Protocol(format!("No matching {} algorithm", what)))
}

/// Selects one algorithm of each kind from two KEXINIT messages.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] naming the kind with no common
/// algorithm; the transport turns it into a KEY_EXCHANGE_FAILED disconnect.
pub fn negotiate(client: &KexInit, server: &KexInit) -> TidewireResult<NegotiatedAlgorithms> {
    let (kex, host_key) = negotiate_kex(client, server)?;

    let cipher_client_to_server = pick(
        "client to server cipher",
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
        CipherAlgorithm::from_name,
    )?;
    let cipher_server_to_client = pick(
        "server to client cipher",
        &server.encryption_algorithms_server_to_client,
        &client.encryption_algorithms_server_to_client,
        CipherAlgorithm::from_name,
    )?;

    // An AEAD cipher authenticates its own frames; the MAC lists are ignored.
    let mac_client_to_server = if cipher_client_to_server.is_aead() {
        MacAlgorithm::None
    } else {
        pick(
            "client to server MAC",
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
            MacAlgorithm::from_name,
        )?
    };
    let mac_server_to_client = if cipher_server_to_client.is_aead() {
        MacAlgorithm::None
    } else {
        pick(
            "server to client MAC",
            &server.mac_algorithms_server_to_client,
            &client.mac_algorithms_server_to_client,
            MacAlgorithm::from_name,
        )?
    };

    Ok(NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_client_to_server,
        cipher_server_to_client,
        mac_client_to_server,
        mac_server_to_client,
        compression_client_to_server: pick(
            "client to server compression",
            &client.compression_algorithms_client_to_server,
            &server.compression_algorithms_client_to_server,
            CompressionAlgorithm::from_name,
        )?,
        compression_server_to_client: pick(
            "server to client compression",
            &server.compression_algorithms_server_to_client,
            &client.compression_algorithms_server_to_client,
            CompressionAlgorithm::from_name,
        )?,
    })
}

fn negotiate_kex(
    client: &KexInit,
    server: &KexInit,
) -> TidewireResult<(KexAlgorithm, HostKeyAlgorithm)> {
    for kex_name in &client.kex_algorithms {
        if !server.kex_algorithms.contains(kex_name) {
            continue;
        }
        let Some(kex) = KexAlgorithm::from_name(kex_name) else {
            continue;
        };
        let host_key = client
            .server_host_key_algorithms
            .iter()
            .filter(|name| server.server_host_key_algorithms.contains(name))
            .filter_map(|name| HostKeyAlgorithm::from_name(name))
            .find(|alg| kex.accepts_host_key(*alg));
        if let Some(host_key) = host_key {
            return Ok((kex, host_key));
        }
    }
    Err(TidewireError::Protocol(
        "No matching key exchange and host key algorithm".to_string(),
    ))
}

/// True if `kexinit` guessed a different kex method or host key type than
/// the negotiated pair. A wrong guess means the guessed packet is discarded.
pub fn guess_is_wrong(kexinit: &KexInit, negotiated: &NegotiatedAlgorithms) -> bool {
    kexinit.kex_algorithms.first().map(String::as_str) != Some(negotiated.kex.name())
        || kexinit.server_host_key_algorithms.first().map(String::as_str)
            != Some(negotiated.host_key.name())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs_with_ciphers(ciphers: Vec<CipherAlgorithm>) -> AlgorithmPreferences {
        AlgorithmPreferences {
            cipher: ciphers,
            ..AlgorithmPreferences::default()
        }
    }

    #[test]
    fn test_kexinit_round_trip() {
        let kexinit = KexInit::from_preferences(&AlgorithmPreferences::default(), true);
        let bytes = kexinit.to_bytes();
        assert_eq!(bytes[0], 20);

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, kexinit);
        assert!(parsed.first_kex_packet_follows());
    }

    #[test]
    fn test_kexinit_wrong_type() {
        let mut bytes =
            KexInit::from_preferences(&AlgorithmPreferences::default(), false).to_bytes();
        bytes[0] = 21;
        assert!(KexInit::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_kexinit_truncated() {
        let bytes = KexInit::from_preferences(&AlgorithmPreferences::default(), false).to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_default_preferences_exclude_none() {
        let prefs = AlgorithmPreferences::default();
        assert!(!prefs.cipher.contains(&CipherAlgorithm::None));
        assert!(!prefs.mac.contains(&MacAlgorithm::None));
        assert!(prefs.validate().is_ok());
    }

    #[test]
    fn test_empty_preferences_rejected() {
        let prefs = AlgorithmPreferences {
            mac: vec![],
            ..AlgorithmPreferences::default()
        };
        assert!(matches!(prefs.validate(), Err(TidewireError::Config(_))));
    }

    #[test]
    fn test_directional_preference() {
        let client = KexInit::from_preferences(
            &prefs_with_ciphers(vec![CipherAlgorithm::Aes128Ctr, CipherAlgorithm::Aes256Ctr]),
            false,
        );
        let server = KexInit::from_preferences(
            &prefs_with_ciphers(vec![CipherAlgorithm::Aes256Ctr, CipherAlgorithm::Aes128Ctr]),
            false,
        );

        let chosen = negotiate(&client, &server).unwrap();
        assert_eq!(chosen.cipher_client_to_server, CipherAlgorithm::Aes128Ctr);
        assert_eq!(chosen.cipher_server_to_client, CipherAlgorithm::Aes256Ctr);
    }

    #[test]
    fn test_aead_cipher_needs_no_mac() {
        let client = KexInit::from_preferences(
            &AlgorithmPreferences {
                cipher: vec![CipherAlgorithm::ChaCha20Poly1305, CipherAlgorithm::Aes128Ctr],
                mac: vec![MacAlgorithm::HmacSha1],
                ..AlgorithmPreferences::default()
            },
            false,
        );
        let server = KexInit::from_preferences(
            &AlgorithmPreferences {
                cipher: vec![CipherAlgorithm::Aes128Ctr, CipherAlgorithm::ChaCha20Poly1305],
                mac: vec![MacAlgorithm::HmacSha256],
                ..AlgorithmPreferences::default()
            },
            false,
        );

        // c2s follows the client and lands on the AEAD cipher; s2c follows
        // the server and still needs a common MAC, which there is none of.
        let err = negotiate(&client, &server).unwrap_err();
        assert!(err.to_string().contains("server to client MAC"));

        let server = KexInit::from_preferences(
            &AlgorithmPreferences {
                cipher: vec![CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305],
                mac: vec![MacAlgorithm::HmacSha256],
                ..AlgorithmPreferences::default()
            },
            false,
        );
        let chosen = negotiate(&client, &server).unwrap();
        assert_eq!(chosen.cipher_client_to_server, CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!(chosen.cipher_server_to_client, CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!(chosen.mac_client_to_server, MacAlgorithm::None);
        assert_eq!(chosen.mac_server_to_client, MacAlgorithm::None);
    }

    #[test]
    fn test_default_prefers_chacha() {
        let client = KexInit::from_preferences(&AlgorithmPreferences::default(), false);
        let server = KexInit::from_preferences(&AlgorithmPreferences::default(), false);
        let chosen = negotiate(&client, &server).unwrap();
        assert_eq!(chosen.cipher_client_to_server, CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!(chosen.mac_client_to_server, MacAlgorithm::None);
    }

    #[test]
    fn test_kex_follows_client_order() {
        let client = KexInit::from_preferences(
            &AlgorithmPreferences {
                kex: vec![
                    KexAlgorithm::DiffieHellmanGroup1Sha1,
                    KexAlgorithm::Curve25519Sha256,
                ],
                ..AlgorithmPreferences::default()
            },
            false,
        );
        let server = KexInit::from_preferences(&AlgorithmPreferences::default(), false);

        let chosen = negotiate(&client, &server).unwrap();
        assert_eq!(chosen.kex, KexAlgorithm::DiffieHellmanGroup1Sha1);
    }

    #[test]
    fn test_host_key_intersection() {
        let client = KexInit::from_preferences(&AlgorithmPreferences::default(), false);
        let server = KexInit::from_preferences(
            &AlgorithmPreferences {
                host_key: vec![HostKeyAlgorithm::SshDss],
                ..AlgorithmPreferences::default()
            },
            false,
        );
        let chosen = negotiate(&client, &server).unwrap();
        assert_eq!(chosen.host_key, HostKeyAlgorithm::SshDss);
    }

    #[test]
    fn test_no_common_cipher() {
        let client = KexInit::from_preferences(
            &prefs_with_ciphers(vec![CipherAlgorithm::Aes128Ctr]),
            false,
        );
        let server = KexInit::from_preferences(
            &prefs_with_ciphers(vec![CipherAlgorithm::Aes256Cbc]),
            false,
        );
        let err = negotiate(&client, &server).unwrap_err();
        assert!(err.to_string().contains("cipher"));
    }

    #[test]
    fn test_unknown_names_are_skipped() {
        let mut client = KexInit::from_preferences(&AlgorithmPreferences::default(), false);
        client.kex_algorithms.insert(0, "sntrup761x25519-sha512".to_string());
        let mut server = client.clone();
        server.cookie = [1; 16];

        let chosen = negotiate(&client, &server).unwrap();
        assert_eq!(chosen.kex, KexAlgorithm::Curve25519Sha256);
    }

    #[test]
    fn test_guess_detection() {
        let client = KexInit::from_preferences(&AlgorithmPreferences::default(), true);
        let server = KexInit::from_preferences(
            &AlgorithmPreferences {
                kex: vec![KexAlgorithm::DiffieHellmanGroup1Sha1],
                ..AlgorithmPreferences::default()
            },
            false,
        );
        let chosen = negotiate(&client, &server).unwrap();
        assert_eq!(chosen.kex, KexAlgorithm::DiffieHellmanGroup1Sha1);
        assert!(guess_is_wrong(&client, &chosen));
        assert!(!guess_is_wrong(&server, &chosen));
    }

    #[test]
    fn test_negotiate_algorithm_helper() {
        let a = vec!["a".to_string(), "b".to_string()];
        let c = vec!["c".to_string()];
        assert_eq!(negotiate_algorithm(&a, &c), None);
    }
}
