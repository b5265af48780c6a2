//! Key exchange methods (RFC 4253 Section 8, RFC 8731).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 (1024-bit Oakley group 2)
//! - curve25519-sha256 and curve25519-sha256@libssh.org
//! - Exchange hash computation and session key derivation
//!
//! Both methods follow the same shape: the client sends its ephemeral public
//! value in message 30, the server answers with its host key, its own
//! ephemeral value and a signature over the exchange hash in message 31.
//! [`ClientKex`] and [`server_kex_reply`] implement the two halves.
//!
//! # Security
//!
//! - Peer DH values outside `(1, p-1)` are rejected
//! - An all-zero X25519 output is rejected
//! - Ephemeral private values are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::kex_dh::Curve25519Exchange;
//!
//! let client = Curve25519Exchange::new();
//! let server = Curve25519Exchange::new();
//!
//! let k1 = client.compute_shared_secret(server.public_key()).unwrap();
//! let k2 = server.compute_shared_secret(client.public_key()).unwrap();
//! assert_eq!(k1, k2);
//! ```

use std::fmt;
use std::sync::Arc;

use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tidewire_platform::{TidewireError, TidewireResult};
use tracing::debug;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::codec::{unsigned_mpint, Reader, Writer};
use super::hostkey::{parse_public_key, HostKey, HostKeyAlgorithm};
use super::kex::KexAlgorithm;
use super::message::{KEX_ECDH_INIT, KEX_ECDH_REPLY};

/// Oakley group 2 parameters (RFC 2409 Section 6.2).
mod dh_group1 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    const PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
FFFFFFFFFFFFFFFF";

    /// Group 1 prime (1024-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(PRIME_HEX, 16).unwrap_or_default()
    });

    /// Group 1 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Bit length of the DH private exponent.
const DH_PRIVATE_BITS: u64 = 512;

/// Hash function attached to a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-1 (20 bytes)
    Sha1,
    /// SHA-256 (32 bytes)
    Sha256,
}

impl KexHash {
    /// Output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            KexHash::Sha1 => run::<Sha1>(parts),
            KexHash::Sha256 => run::<Sha256>(parts),
        }
    }
}

impl KexAlgorithm {
    /// Hash used for the exchange hash and key derivation.
    pub fn hash(&self) -> KexHash {
        match self {
            KexAlgorithm::DiffieHellmanGroup1Sha1 => KexHash::Sha1,
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256LibSsh => {
                KexHash::Sha256
            }
        }
    }
}

/// Diffie-Hellman group 1 exchange.
pub struct DhGroup1Exchange {
    /// Private exponent x
    private_key: BigUint,
    /// Public value g^x mod p
    public_key: BigUint,
}

impl DhGroup1Exchange {
    /// Generates a new ephemeral key pair.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tidewire_proto::ssh::kex_dh::DhGroup1Exchange;
    ///
    /// let client = DhGroup1Exchange::new();
    /// let server = DhGroup1Exchange::new();
    ///
    /// let k1 = client.compute_shared_secret(server.public_key()).unwrap();
    /// let k2 = server.compute_shared_secret(client.public_key()).unwrap();
    /// assert_eq!(k1, k2);
    /// ```
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut x = rng.gen_biguint(DH_PRIVATE_BITS);
        while x < BigUint::from(2u32) {
            x = rng.gen_biguint(DH_PRIVATE_BITS);
        }
        Self::from_private(x)
    }

    fn from_private(x: BigUint) -> Self {
        let public_key = dh_group1::G.modpow(&x, &dh_group1::P);
        Self {
            private_key: x,
            public_key,
        }
    }

    /// Returns the public value.
    pub fn public_key(&self) -> &BigUint {
        &self.public_key
    }

    /// Computes K = peer^x mod p.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Protocol`] if the peer value is not in
    /// `(1, p-1)`.
    pub fn compute_shared_secret(&self, peer_public: &BigUint) -> TidewireResult<BigUint> {
        check_group1_value(peer_public)?;
        Ok(peer_public.modpow(&self.private_key, &dh_group1::P))
    }
}

impl Default for DhGroup1Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup1Exchange {
    fn drop(&mut self) {
        self.private_key = BigUint::default();
    }
}

impl fmt::Debug for DhGroup1Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhGroup1Exchange")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn check_group1_value(value: &BigUint) -> TidewireResult<()> {
    let p_minus_one = &*dh_group1::P - 1u32;
    if *value <= BigUint::from(1u32) || *value >= p_minus_one {
        return Err(TidewireError::Protocol(
            "DH value out of range (1, p-1)".to_string(),
        ));
    }
    Ok(())
}

/// Curve25519 exchange.
pub struct Curve25519Exchange {
    /// Clamped private scalar
    private_key: Zeroizing<[u8; 32]>,
    /// Public value (32 bytes)
    public_key: [u8; 32],
}

/// Clamps a scalar as X25519 requires.
pub fn clamp_scalar(mut k: [u8; 32]) -> [u8; 32] {
    k[0] &= 248;
    k[31] &= 127;
    k[31] |= 64;
    k
}

impl Curve25519Exchange {
    /// Generates a new ephemeral key pair.
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let exchange = Self::from_secret(secret);
        secret.zeroize();
        exchange
    }

    /// Builds an exchange from a fixed private scalar. The scalar is clamped.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let private_key = Zeroizing::new(clamp_scalar(secret));
        let public_key = x25519(*private_key, X25519_BASEPOINT_BYTES);
        Self {
            private_key,
            public_key,
        }
    }

    /// Returns the public value.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the 32-byte X25519 shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Protocol`] if the peer value is not 32 bytes
    /// or the result is all zeros.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> TidewireResult<[u8; 32]> {
        let peer: [u8; 32] = peer_public.try_into().map_err(|_| {
            TidewireError::Protocol(format!(
                "Curve25519 public value must be 32 bytes, got {}",
                peer_public.len()
            ))
        })?;
        let shared = x25519(*self.private_key, peer);
        if shared.iter().all(|b| *b == 0) {
            return Err(TidewireError::Protocol(
                "Curve25519 shared secret is zero".to_string(),
            ));
        }
        Ok(shared)
    }
}

impl Default for Curve25519Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Curve25519Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Curve25519Exchange")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// The fixed inputs of an exchange hash: both identification strings and
/// both raw KEXINIT payloads.
#[derive(Debug, Clone, Copy)]
pub struct KexTranscript<'a> {
    /// V_C, without CR LF
    pub client_version: &'a str,
    /// V_S, without CR LF
    pub server_version: &'a str,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: &'a [u8],
}

impl KexTranscript<'_> {
    fn prefix(&self, host_key_blob: &[u8]) -> Writer {
        let mut w = Writer::new();
        w.put_str(self.client_version);
        w.put_str(self.server_version);
        w.put_string(self.client_kexinit);
        w.put_string(self.server_kexinit);
        w.put_string(host_key_blob);
        w
    }

    /// H for diffie-hellman-group1-sha1.
    pub fn dh_exchange_hash(
        &self,
        hash: KexHash,
        host_key_blob: &[u8],
        e: &BigInt,
        f: &BigInt,
        k: &BigInt,
    ) -> Vec<u8> {
        let mut w = self.prefix(host_key_blob);
        w.put_mpint(e);
        w.put_mpint(f);
        w.put_mpint(k);
        hash.digest(&[w.as_slice()])
    }

    /// H for curve25519-sha256.
    pub fn ecdh_exchange_hash(
        &self,
        hash: KexHash,
        host_key_blob: &[u8],
        q_c: &[u8],
        q_s: &[u8],
        k: &BigInt,
    ) -> Vec<u8> {
        let mut w = self.prefix(host_key_blob);
        w.put_string(q_c);
        w.put_string(q_s);
        w.put_mpint(k);
        hash.digest(&[w.as_slice()])
    }
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// Kn = HASH(K || H || K1 || ... || Kn-1)
/// ```
///
/// K is hashed in mpint encoding.
///
/// # Arguments
///
/// * `hash` - The kex method's hash
/// * `shared_secret` - K
/// * `exchange_hash` - H of the current exchange
/// * `letter` - `b'A'` through `b'F'`
/// * `session_id` - H of the first exchange
/// * `length` - Number of bytes wanted
///
/// # Example
///
/// ```rust
/// use num_bigint::BigInt;
/// use tidewire_proto::ssh::kex_dh::{derive_key, KexHash};
///
/// let k = BigInt::from(0x42);
/// let key = derive_key(KexHash::Sha1, &k, &[1; 20], b'C', &[1; 20], 32);
/// assert_eq!(key.len(), 32);
/// ```
pub fn derive_key(
    hash: KexHash,
    shared_secret: &BigInt,
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    length: usize,
) -> Vec<u8> {
    let mut k = Writer::new();
    k.put_mpint(shared_secret);
    let k = Zeroizing::new(k.into_vec());

    let mut key = hash.digest(&[k.as_slice(), exchange_hash, &[letter], session_id]);
    while key.len() < length {
        let block = hash.digest(&[k.as_slice(), exchange_hash, key.as_slice()]);
        key.extend_from_slice(&block);
    }
    key.truncate(length);
    key
}

/// IV, cipher key and MAC key for one direction.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    /// Initial IV
    pub iv: Vec<u8>,
    /// Cipher key
    pub encryption_key: Vec<u8>,
    /// MAC key
    pub mac_key: Vec<u8>,
}

impl fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("iv", &"[REDACTED]")
            .field("encryption_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

/// Sizes of the keys a direction needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySizes {
    /// IV length
    pub iv: usize,
    /// Cipher key length
    pub encryption_key: usize,
    /// MAC key length
    pub mac_key: usize,
}

/// Derives both directions' keys: letters A, C, E for client to server and
/// B, D, F for server to client.
pub fn derive_session_keys(
    hash: KexHash,
    shared_secret: &BigInt,
    exchange_hash: &[u8],
    session_id: &[u8],
    client_to_server: KeySizes,
    server_to_client: KeySizes,
) -> (DirectionKeys, DirectionKeys) {
    let d = |letter: u8, len: usize| {
        derive_key(hash, shared_secret, exchange_hash, letter, session_id, len)
    };
    (
        DirectionKeys {
            iv: d(b'A', client_to_server.iv),
            encryption_key: d(b'C', client_to_server.encryption_key),
            mac_key: d(b'E', client_to_server.mac_key),
        },
        DirectionKeys {
            iv: d(b'B', server_to_client.iv),
            encryption_key: d(b'D', server_to_client.encryption_key),
            mac_key: d(b'F', server_to_client.mac_key),
        },
    )
}

/// Result of a completed exchange.
pub struct KexOutput {
    /// Shared secret K
    pub shared_secret: BigInt,
    /// Exchange hash H
    pub exchange_hash: Vec<u8>,
    /// The server's host key (K_S)
    pub host_key: Arc<dyn HostKey>,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput")
            .field("shared_secret", &"[REDACTED]")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .field("host_key", &self.host_key.fingerprint())
            .finish()
    }
}

impl Drop for KexOutput {
    fn drop(&mut self) {
        self.shared_secret = BigInt::default();
    }
}

fn biguint_to_bigint(v: &BigUint) -> BigInt {
    BigInt::from_biguint(Sign::Plus, v.clone())
}

fn positive(v: BigInt, what: &str) -> TidewireResult<BigUint> {
    v.to_biguint()
        .ok_or_else(|| TidewireError::Protocol(format!("Negative {}", what)))
}

enum ClientKexState {
    Dh(DhGroup1Exchange),
    Curve25519(Curve25519Exchange),
}

/// The client half of an exchange.
pub struct ClientKex {
    algorithm: KexAlgorithm,
    state: ClientKexState,
}

impl fmt::Debug for ClientKex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKex")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl ClientKex {
    /// Generates ephemeral values for `algorithm`.
    pub fn new(algorithm: KexAlgorithm) -> Self {
        let state = match algorithm {
            KexAlgorithm::DiffieHellmanGroup1Sha1 => ClientKexState::Dh(DhGroup1Exchange::new()),
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256LibSsh => {
                ClientKexState::Curve25519(Curve25519Exchange::new())
            }
        };
        Self { algorithm, state }
    }

    /// Returns the method.
    pub fn algorithm(&self) -> KexAlgorithm {
        self.algorithm
    }

    /// Builds message 30 (KEXDH_INIT or KEX_ECDH_INIT).
    pub fn init_message(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(KEX_ECDH_INIT);
        match &self.state {
            ClientKexState::Dh(dh) => w.put_mpint(&biguint_to_bigint(dh.public_key())),
            ClientKexState::Curve25519(c) => w.put_string(c.public_key()),
        }
        w.into_vec()
    }

    /// Processes message 31 and verifies the server's signature over H.
    ///
    /// The host key is checked against `host_key_algorithm` and its
    /// signature verified; trusting the key itself is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Protocol`] for malformed replies, out of
    /// range values, a host key of the wrong type or a bad signature.
    pub fn process_reply(
        &self,
        reply: &[u8],
        transcript: &KexTranscript<'_>,
        host_key_algorithm: HostKeyAlgorithm,
    ) -> TidewireResult<KexOutput> {
        let mut r = Reader::new(reply);
        let msg_type = r.get_u8()?;
        if msg_type != KEX_ECDH_REPLY {
            return Err(TidewireError::Protocol(format!(
                "Expected kex reply (31), got {}",
                msg_type
            )));
        }
        let host_key_blob = r.get_string()?;
        let host_key = parse_public_key(host_key_blob)?;
        if host_key.algorithm() != host_key_algorithm {
            return Err(TidewireError::Protocol(format!(
                "Server sent a {} host key, negotiated {}",
                host_key.algorithm_name(),
                host_key_algorithm.name()
            )));
        }

        let hash = self.algorithm.hash();
        let (shared_secret, exchange_hash) = match &self.state {
            ClientKexState::Dh(dh) => {
                let f = positive(r.get_mpint()?, "DH value")?;
                let k = biguint_to_bigint(&dh.compute_shared_secret(&f)?);
                let e = biguint_to_bigint(dh.public_key());
                let h = transcript.dh_exchange_hash(
                    hash,
                    host_key_blob,
                    &e,
                    &biguint_to_bigint(&f),
                    &k,
                );
                (k, h)
            }
            ClientKexState::Curve25519(c) => {
                let q_s = r.get_string()?;
                let shared = Zeroizing::new(c.compute_shared_secret(q_s)?);
                let k = unsigned_mpint(&shared[..]);
                let h = transcript.ecdh_exchange_hash(hash, host_key_blob, c.public_key(), q_s, &k);
                (k, h)
            }
        };
        let signature = r.get_string()?;

        if !host_key.verify(&exchange_hash, signature) {
            return Err(TidewireError::Protocol(
                "Host key signature verification failed".to_string(),
            ));
        }
        debug!(
            kex = self.algorithm.name(),
            host_key = %host_key.fingerprint(),
            "Key exchange reply verified"
        );

        Ok(KexOutput {
            shared_secret,
            exchange_hash,
            host_key,
        })
    }
}

/// The server half of an exchange: processes message 30 and returns
/// message 31 together with the exchange result.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] for a malformed init or out of range
/// client values, and [`TidewireError::Security`] if signing fails.
pub fn server_kex_reply(
    algorithm: KexAlgorithm,
    init: &[u8],
    transcript: &KexTranscript<'_>,
    host_key: Arc<dyn HostKey>,
) -> TidewireResult<(Vec<u8>, KexOutput)> {
    let mut r = Reader::new(init);
    let msg_type = r.get_u8()?;
    if msg_type != KEX_ECDH_INIT {
        return Err(TidewireError::Protocol(format!(
            "Expected kex init (30), got {}",
            msg_type
        )));
    }

    let hash = algorithm.hash();
    let host_key_blob = host_key.public_key_bytes();
    let mut reply = Writer::new();
    reply.put_u8(KEX_ECDH_REPLY);
    reply.put_string(&host_key_blob);

    let (shared_secret, exchange_hash) = match algorithm {
        KexAlgorithm::DiffieHellmanGroup1Sha1 => {
            let e = positive(r.get_mpint()?, "DH value")?;
            let dh = DhGroup1Exchange::new();
            let k = biguint_to_bigint(&dh.compute_shared_secret(&e)?);
            let f = biguint_to_bigint(dh.public_key());
            let e = biguint_to_bigint(&e);
            let h = transcript.dh_exchange_hash(hash, &host_key_blob, &e, &f, &k);
            reply.put_mpint(&f);
            (k, h)
        }
        KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256LibSsh => {
            let q_c = r.get_string()?;
            let ecdh = Curve25519Exchange::new();
            let shared = Zeroizing::new(ecdh.compute_shared_secret(q_c)?);
            let k = unsigned_mpint(&shared[..]);
            let h = transcript.ecdh_exchange_hash(hash, &host_key_blob, q_c, ecdh.public_key(), &k);
            reply.put_string(ecdh.public_key());
            (k, h)
        }
    };

    let signature = host_key.sign(&exchange_hash)?;
    reply.put_string(&signature);

    Ok((
        reply.into_vec(),
        KexOutput {
            shared_secret,
            exchange_hash,
            host_key,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{test_keys, Ed25519HostKey};

    fn hex32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    const K0: &str = "62ca760c588569cc6cdaea397ddfbe8d0a04ce69c141391abbdd24f5f473f6ab";
    const K1: &str = "1cb967a181bb05edcdd2b82e1d3bcd10bf6a83739065e247ab0798d21e387520";
    const P0: &str = "162e9fac9a1ec8853463a342d125a7d378848050030d06588e5ff7d67c828e5a";
    const P1: &str = "cb624d49243142ad79452e8f37ae77fb1235609a8336c087429a2a3998681b21";

    fn transcript() -> (Vec<u8>, Vec<u8>) {
        (b"\x14client kexinit".to_vec(), b"\x14server kexinit".to_vec())
    }

    #[test]
    fn test_group1_prime() {
        assert_eq!(dh_group1::P.bits(), 1024);
    }

    #[test]
    fn test_dh_group1_agreement() {
        let client = DhGroup1Exchange::new();
        let server = DhGroup1Exchange::new();
        let k1 = client.compute_shared_secret(server.public_key()).unwrap();
        let k2 = server.compute_shared_secret(client.public_key()).unwrap();
        assert_eq!(k1, k2);
        assert!(client.private_key.bits() <= DH_PRIVATE_BITS);
    }

    #[test]
    fn test_dh_group1_rejects_out_of_range() {
        let exchange = DhGroup1Exchange::new();
        let p = dh_group1::P.clone();
        for bad in [BigUint::from(0u32), BigUint::from(1u32), &p - 1u32, p.clone()] {
            assert!(exchange.compute_shared_secret(&bad).is_err());
        }
        assert!(exchange.compute_shared_secret(&BigUint::from(2u32)).is_ok());
    }

    #[test]
    fn test_curve25519_known_public_key() {
        let exchange = Curve25519Exchange::from_secret(hex32(K0));
        assert_eq!(exchange.public_key(), &hex32(P0));
    }

    #[test]
    fn test_curve25519_known_agreement() {
        let a = Curve25519Exchange::from_secret(hex32(K0));
        let b = Curve25519Exchange::from_secret(hex32(K1));
        assert_eq!(b.public_key(), &hex32(P1));

        let ab = a.compute_shared_secret(&hex32(P1)).unwrap();
        let ba = b.compute_shared_secret(&hex32(P0)).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_curve25519_rejects_zero_point() {
        let exchange = Curve25519Exchange::new();
        assert!(exchange.compute_shared_secret(&[0u8; 32]).is_err());
        assert!(exchange.compute_shared_secret(&[9u8; 31]).is_err());
    }

    #[test]
    fn test_clamp() {
        let k = clamp_scalar([0xff; 32]);
        assert_eq!(k[0], 0xf8);
        assert_eq!(k[31], 0x7f);
        let k = clamp_scalar([0; 32]);
        assert_eq!(k[31], 0x40);
    }

    #[test]
    fn test_derive_key_extension() {
        let k = BigInt::from(0x1234_5678u32);
        let h = [7u8; 20];
        let sid = [9u8; 20];
        let long = derive_key(KexHash::Sha1, &k, &h, b'C', &sid, 64);
        let short = derive_key(KexHash::Sha1, &k, &h, b'C', &sid, 20);
        assert_eq!(&long[..20], &short[..]);

        let mut kw = Writer::new();
        kw.put_mpint(&k);
        let k_enc = kw.into_vec();
        let k2 = KexHash::Sha1.digest(&[&k_enc, &h, &long[..20]]);
        assert_eq!(&long[20..40], &k2[..]);
        let k3 = KexHash::Sha1.digest(&[&k_enc, &h, &long[..40]]);
        assert_eq!(&long[40..60], &k3[..]);
    }

    #[test]
    fn test_derive_key_letters_differ() {
        let k = BigInt::from(99);
        let a = derive_key(KexHash::Sha256, &k, &[1; 32], b'A', &[2; 32], 16);
        let b = derive_key(KexHash::Sha256, &k, &[1; 32], b'B', &[2; 32], 16);
        assert_ne!(a, b);
    }

    fn run_exchange(algorithm: KexAlgorithm, host_key: Arc<dyn HostKey>) {
        let (ic, is) = transcript();
        let t = KexTranscript {
            client_version: "SSH-2.0-Test",
            server_version: "SSH-2.0-Test",
            client_kexinit: &ic,
            server_kexinit: &is,
        };
        let client = ClientKex::new(algorithm);
        let (reply, server_out) =
            server_kex_reply(algorithm, &client.init_message(), &t, host_key.clone()).unwrap();
        let client_out = client
            .process_reply(&reply, &t, host_key.algorithm())
            .unwrap();

        assert_eq!(client_out.exchange_hash, server_out.exchange_hash);
        assert_eq!(client_out.shared_secret, server_out.shared_secret);
        assert_eq!(client_out.exchange_hash.len(), algorithm.hash().output_len());
        assert_eq!(client_out.host_key.public_key_bytes(), host_key.public_key_bytes());
    }

    #[test]
    fn test_group1_exchange_with_dss() {
        run_exchange(
            KexAlgorithm::DiffieHellmanGroup1Sha1,
            Arc::new(test_keys::dss()),
        );
    }

    #[test]
    fn test_curve25519_exchange_with_rsa() {
        run_exchange(KexAlgorithm::Curve25519Sha256, Arc::new(test_keys::rsa()));
    }

    #[test]
    fn test_curve25519_exchange_with_ed25519() {
        run_exchange(
            KexAlgorithm::Curve25519Sha256LibSsh,
            Arc::new(Ed25519HostKey::generate().unwrap()),
        );
    }

    #[test]
    fn test_tampered_reply_rejected() {
        let (ic, is) = transcript();
        let t = KexTranscript {
            client_version: "SSH-2.0-Test",
            server_version: "SSH-2.0-Test",
            client_kexinit: &ic,
            server_kexinit: &is,
        };
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let client = ClientKex::new(KexAlgorithm::Curve25519Sha256);
        let (reply, _) = server_kex_reply(
            KexAlgorithm::Curve25519Sha256,
            &client.init_message(),
            &t,
            host_key.clone(),
        )
        .unwrap();

        // A different transcript produces a different H, so the signature fails.
        let other = KexTranscript {
            server_version: "SSH-2.0-Other",
            ..t
        };
        assert!(client
            .process_reply(&reply, &other, HostKeyAlgorithm::SshEd25519)
            .is_err());
        // Wrong negotiated host key type.
        assert!(client
            .process_reply(&reply, &t, HostKeyAlgorithm::SshRsa)
            .is_err());
    }
}
