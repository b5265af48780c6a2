//! SSH host key algorithms (RFC 4253 Section 6.6).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RFC 8709)
//! - `ssh-rsa` - RSA PKCS#1 v1.5 signature over SHA-1
//! - `ssh-dss` - DSA signature over SHA-1
//!
//! Every key type can hold only the public half (as received from a peer)
//! or the full key pair. Signing with a public-only key is an error.
//!
//! # Wire formats
//!
//! | algorithm | public blob | signature blob |
//! |-----------|-------------|----------------|
//! | `ssh-dss` | `string name, mpint p, q, g, y` | `string name, string r(20) \|\| s(20)` |
//! | `ssh-rsa` | `string name, mpint e, n` | `string name, string s` |
//! | `ssh-ed25519` | `string name, string pk(32)` | `string name, string sig(64)` |
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::hostkey::{parse_public_key, Ed25519HostKey, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate()?;
//! let signature = hostkey.sign(b"exchange hash")?;
//!
//! // The peer only sees the public blob.
//! let peer_view = parse_public_key(&hostkey.public_key_bytes())?;
//! assert!(peer_view.verify(b"exchange hash", &signature));
//! assert!(!peer_view.verify(b"another hash", &signature));
//! # Ok(())
//! # }
//! ```

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::sync::Arc;
use tidewire_platform::{TidewireError, TidewireResult};
use zeroize::Zeroizing;

use super::codec::{Reader, Writer};

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 - EdDSA signature using Ed25519
    SshEd25519,
    /// ssh-rsa - RSA with SHA-1
    SshRsa,
    /// ssh-dss - DSA with SHA-1
    SshDss,
}

impl HostKeyAlgorithm {
    /// Every supported host key algorithm, most preferred first.
    pub const ALL: [HostKeyAlgorithm; 3] = [
        HostKeyAlgorithm::SshEd25519,
        HostKeyAlgorithm::SshRsa,
        HostKeyAlgorithm::SshDss,
    ];

    /// Get the algorithm name as specified in RFC 4253
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::SshDss => "ssh-dss",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }

    /// All three algorithms can sign.
    pub fn supports_signature(&self) -> bool {
        true
    }

    /// None of the algorithms is used for key transport.
    pub fn supports_encryption(&self) -> bool {
        false
    }
}

/// Trait for host key operations
pub trait HostKey: Send + Sync + std::fmt::Debug {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Public key blob in SSH wire format
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Private key blob in SSH wire format
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] for a public-only key.
    fn private_key_bytes(&self) -> TidewireResult<Vec<u8>>;

    /// True if this key can sign.
    fn has_private_key(&self) -> bool;

    /// Sign data and return a signature blob
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] for a public-only key or if the
    /// signature primitive fails.
    fn sign(&self, data: &[u8]) -> TidewireResult<Vec<u8>>;

    /// Verify a signature blob over `data`.
    ///
    /// Malformed blobs and blobs naming a different algorithm are rejected.
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }

    /// Whether the key can produce signatures for key exchange.
    fn supports_signature(&self) -> bool {
        self.algorithm().supports_signature()
    }

    /// Whether the key can be used for key transport.
    fn supports_encryption(&self) -> bool {
        self.algorithm().supports_encryption()
    }

    /// OpenSSH style fingerprint: `SHA256:` followed by unpadded base64.
    fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public_key_bytes());
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }
}

fn missing_private(alg: HostKeyAlgorithm) -> TidewireError {
    TidewireError::Security(format!("{} key has no private part", alg.name()))
}

/// Splits a signature blob into its algorithm name and raw signature,
/// returning None if the name differs from `expected`.
fn open_signature<'a>(blob: &'a [u8], expected: HostKeyAlgorithm) -> Option<&'a [u8]> {
    let mut r = Reader::new(blob);
    let name = r.get_string().ok()?;
    if name != expected.name().as_bytes() {
        return None;
    }
    let sig = r.get_string().ok()?;
    if !r.is_empty() {
        return None;
    }
    Some(sig)
}

fn signature_blob(alg: HostKeyAlgorithm, raw: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_str(alg.name());
    w.put_string(raw);
    w.into_vec()
}

fn big(v: &BigUint) -> BigInt {
    BigInt::from_biguint(Sign::Plus, v.clone())
}

fn read_unsigned(r: &mut Reader<'_>, what: &str) -> TidewireResult<BigUint> {
    r.get_mpint()?
        .to_biguint()
        .ok_or_else(|| TidewireError::Protocol(format!("Negative {} in key blob", what)))
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> TidewireResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut csprng));
        Self::from_bytes(&secret_bytes[..])
    }

    /// Create from the 32-byte secret seed
    pub fn from_bytes(secret_bytes: &[u8]) -> TidewireResult<Self> {
        let key_bytes: [u8; 32] = secret_bytes.try_into().map_err(|_| {
            TidewireError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key: Some(signing_key),
            verifying_key,
        })
    }

    /// Create a verify-only key from the 32-byte public key
    pub fn from_public_bytes(public_key: &[u8]) -> TidewireResult<Self> {
        let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            TidewireError::Security("Ed25519 public key must be 32 bytes".to_string())
        })?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| TidewireError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
        Ok(Self {
            signing_key: None,
            verifying_key,
        })
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str("ssh-ed25519");
        w.put_string(self.verifying_key.as_bytes());
        w.into_vec()
    }

    fn private_key_bytes(&self) -> TidewireResult<Vec<u8>> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| missing_private(self.algorithm()))?;
        let mut keypair = Zeroizing::new(Vec::with_capacity(64));
        keypair.extend_from_slice(&signing_key.to_bytes());
        keypair.extend_from_slice(self.verifying_key.as_bytes());

        let mut w = Writer::new();
        w.put_str("ssh-ed25519");
        w.put_string(self.verifying_key.as_bytes());
        w.put_string(&keypair);
        Ok(w.into_vec())
    }

    fn has_private_key(&self) -> bool {
        self.signing_key.is_some()
    }

    fn sign(&self, data: &[u8]) -> TidewireResult<Vec<u8>> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| missing_private(self.algorithm()))?;
        let signature = signing_key.sign(data);
        Ok(signature_blob(self.algorithm(), &signature.to_bytes()))
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(raw) = open_signature(signature, self.algorithm()) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(raw) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        self.verifying_key.verify(data, &signature).is_ok()
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .field("has_private", &self.signing_key.is_some())
            .finish_non_exhaustive()
    }
}

/// RSA host key (ssh-rsa, PKCS#1 v1.5 with SHA-1)
///
/// Signing goes through the `rsa` crate, verification through `ring`.
#[derive(Clone)]
pub struct SshRsaHostKey {
    n: BigUint,
    e: BigUint,
    private: Option<RsaPrivate>,
}

#[derive(Clone)]
struct RsaPrivate {
    key: RsaPrivateKey,
    d: BigUint,
    p: BigUint,
    q: BigUint,
}

fn to_rsa_uint(v: &BigUint) -> rsa::BigUint {
    rsa::BigUint::from_bytes_be(&v.to_bytes_be())
}

impl SshRsaHostKey {
    /// Generate a new RSA key pair with a modulus of `bits` bits.
    pub fn generate(bits: usize) -> TidewireResult<Self> {
        use rsa::traits::{PrivateKeyParts, PublicKeyParts};

        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| TidewireError::Security(format!("RSA key generation failed: {}", e)))?;
        let primes = key.primes();
        if primes.len() != 2 {
            return Err(TidewireError::Security(
                "Generated RSA key does not have two primes".to_string(),
            ));
        }
        let conv = |v: &rsa::BigUint| BigUint::from_bytes_be(&v.to_bytes_be());
        Self::from_components(
            conv(key.n()),
            conv(key.e()),
            conv(key.d()),
            conv(&primes[0]),
            conv(&primes[1]),
        )
    }

    /// Create a key pair from its components.
    pub fn from_components(
        n: BigUint,
        e: BigUint,
        d: BigUint,
        p: BigUint,
        q: BigUint,
    ) -> TidewireResult<Self> {
        let key = RsaPrivateKey::from_components(
            to_rsa_uint(&n),
            to_rsa_uint(&e),
            to_rsa_uint(&d),
            vec![to_rsa_uint(&p), to_rsa_uint(&q)],
        )
        .map_err(|e| TidewireError::Security(format!("Invalid RSA private key: {}", e)))?;
        key.validate()
            .map_err(|e| TidewireError::Security(format!("Invalid RSA private key: {}", e)))?;

        Ok(Self {
            n,
            e,
            private: Some(RsaPrivate { key, d, p, q }),
        })
    }

    /// Create a verify-only key.
    pub fn from_public(e: BigUint, n: BigUint) -> Self {
        Self {
            n,
            e,
            private: None,
        }
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> u64 {
        self.n.bits()
    }
}

impl HostKey for SshRsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshRsa
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str("ssh-rsa");
        w.put_mpint(&big(&self.e));
        w.put_mpint(&big(&self.n));
        w.into_vec()
    }

    fn private_key_bytes(&self) -> TidewireResult<Vec<u8>> {
        let private = self
            .private
            .as_ref()
            .ok_or_else(|| missing_private(self.algorithm()))?;
        let mut w = Writer::new();
        w.put_str("ssh-rsa");
        w.put_mpint(&big(&self.n));
        w.put_mpint(&big(&self.e));
        w.put_mpint(&big(&private.d));
        w.put_mpint(&big(&private.p));
        w.put_mpint(&big(&private.q));
        Ok(w.into_vec())
    }

    fn has_private_key(&self) -> bool {
        self.private.is_some()
    }

    fn sign(&self, data: &[u8]) -> TidewireResult<Vec<u8>> {
        let private = self
            .private
            .as_ref()
            .ok_or_else(|| missing_private(self.algorithm()))?;
        let digest = Sha1::digest(data);
        let signature = private
            .key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| TidewireError::Security(format!("RSA signing failed: {}", e)))?;
        Ok(signature_blob(self.algorithm(), &signature))
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(raw) = open_signature(signature, self.algorithm()) else {
            return false;
        };
        let components = RsaPublicKeyComponents {
            n: self.n.to_bytes_be(),
            e: self.e.to_bytes_be(),
        };
        components
            .verify(&RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY, data, raw)
            .is_ok()
    }
}

impl std::fmt::Debug for SshRsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshRsaHostKey")
            .field("algorithm", &"ssh-rsa")
            .field("bits", &self.n.bits())
            .field("has_private", &self.private.is_some())
            .finish_non_exhaustive()
    }
}

/// DSA host key (ssh-dss)
///
/// Implemented directly on modular arithmetic; the subgroup order `q`
/// must be 160 bits so the raw signature is exactly 40 bytes.
#[derive(Clone)]
pub struct DssHostKey {
    p: BigUint,
    q: BigUint,
    g: BigUint,
    y: BigUint,
    x: Option<Zeroizing<Vec<u8>>>,
}

impl DssHostKey {
    /// Create a key pair from its components.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] if `q` is not 160 bits or
    /// `y != g^x mod p`.
    pub fn from_components(
        p: BigUint,
        q: BigUint,
        g: BigUint,
        y: BigUint,
        x: BigUint,
    ) -> TidewireResult<Self> {
        let key = Self::from_public(p, q, g, y)?;
        if key.g.modpow(&x, &key.p) != key.y {
            return Err(TidewireError::Security(
                "DSA private key does not match public key".to_string(),
            ));
        }
        Ok(Self {
            x: Some(Zeroizing::new(x.to_bytes_be())),
            ..key
        })
    }

    /// Create a verify-only key.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] unless `p` is odd and at least
    /// 512 bits, `q` is odd and 160 bits, `1 < g < p` and `0 < y < p`.
    pub fn from_public(p: BigUint, q: BigUint, g: BigUint, y: BigUint) -> TidewireResult<Self> {
        if p.bits() < 512 || !p.bit(0) {
            return Err(TidewireError::Security(format!(
                "DSA modulus must be odd and at least 512 bits, got {} bits",
                p.bits()
            )));
        }
        if q.bits() != 160 || !q.bit(0) {
            return Err(TidewireError::Security(format!(
                "DSA subgroup order must be odd and 160 bits, got {} bits",
                q.bits()
            )));
        }
        if g <= BigUint::from(1u32) || g >= p {
            return Err(TidewireError::Security(
                "DSA generator out of range".to_string(),
            ));
        }
        if y.bits() == 0 || y >= p {
            return Err(TidewireError::Security(
                "DSA public value out of range".to_string(),
            ));
        }
        Ok(Self {
            p,
            q,
            g,
            y,
            x: None,
        })
    }

    fn digest(&self, data: &[u8]) -> BigUint {
        BigUint::from_bytes_be(&Sha1::digest(data))
    }

    /// Modular inverse in the prime-order subgroup (Fermat).
    fn inverse_mod_q(&self, v: &BigUint) -> BigUint {
        let exp = &self.q - BigUint::from(2u32);
        v.modpow(&exp, &self.q)
    }
}

fn pad20(v: &BigUint) -> [u8; 20] {
    let bytes = v.to_bytes_be();
    let mut out = [0u8; 20];
    out[20 - bytes.len()..].copy_from_slice(&bytes);
    out
}

impl HostKey for DssHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshDss
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str("ssh-dss");
        w.put_mpint(&big(&self.p));
        w.put_mpint(&big(&self.q));
        w.put_mpint(&big(&self.g));
        w.put_mpint(&big(&self.y));
        w.into_vec()
    }

    fn private_key_bytes(&self) -> TidewireResult<Vec<u8>> {
        let x = self
            .x
            .as_ref()
            .ok_or_else(|| missing_private(self.algorithm()))?;
        let mut w = Writer::new();
        w.put_str("ssh-dss");
        w.put_mpint(&big(&self.p));
        w.put_mpint(&big(&self.q));
        w.put_mpint(&big(&self.g));
        w.put_mpint(&big(&self.y));
        w.put_mpint(&BigInt::from_bytes_be(Sign::Plus, x));
        Ok(w.into_vec())
    }

    fn has_private_key(&self) -> bool {
        self.x.is_some()
    }

    fn sign(&self, data: &[u8]) -> TidewireResult<Vec<u8>> {
        let x = self
            .x
            .as_ref()
            .map(|bytes| BigUint::from_bytes_be(bytes))
            .ok_or_else(|| missing_private(self.algorithm()))?;
        let h = self.digest(data);
        let one = BigUint::from(1u32);
        let mut rng = rand::thread_rng();

        loop {
            let k = rng.gen_biguint_range(&one, &self.q);
            let r = self.g.modpow(&k, &self.p) % &self.q;
            if r.bits() == 0 {
                continue;
            }
            let k_inv = self.inverse_mod_q(&k);
            let s = (k_inv * ((&h + &x * &r) % &self.q)) % &self.q;
            if s.bits() == 0 {
                continue;
            }

            let mut raw = Vec::with_capacity(40);
            raw.extend_from_slice(&pad20(&r));
            raw.extend_from_slice(&pad20(&s));
            return Ok(signature_blob(self.algorithm(), &raw));
        }
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(raw) = open_signature(signature, self.algorithm()) else {
            return false;
        };
        if raw.len() != 40 {
            return false;
        }
        let r = BigUint::from_bytes_be(&raw[..20]);
        let s = BigUint::from_bytes_be(&raw[20..]);
        if r.bits() == 0 || s.bits() == 0 || r >= self.q || s >= self.q {
            return false;
        }

        let w = self.inverse_mod_q(&s);
        let u1 = (self.digest(data) * &w) % &self.q;
        let u2 = (&r * &w) % &self.q;
        let v = ((self.g.modpow(&u1, &self.p) * self.y.modpow(&u2, &self.p)) % &self.p) % &self.q;
        v == r
    }
}

impl std::fmt::Debug for DssHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DssHostKey")
            .field("algorithm", &"ssh-dss")
            .field("bits", &self.p.bits())
            .field("has_private", &self.x.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds a verify-only key from a public key blob.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] for malformed blobs and
/// [`TidewireError::NotImplemented`] for unknown algorithm names.
pub fn parse_public_key(blob: &[u8]) -> TidewireResult<Arc<dyn HostKey>> {
    let mut r = Reader::new(blob);
    let name = r.get_utf8()?;
    let key: Arc<dyn HostKey> = match HostKeyAlgorithm::from_name(&name) {
        Some(HostKeyAlgorithm::SshEd25519) => {
            Arc::new(Ed25519HostKey::from_public_bytes(r.get_string()?)?)
        }
        Some(HostKeyAlgorithm::SshRsa) => {
            let e = read_unsigned(&mut r, "e")?;
            let n = read_unsigned(&mut r, "n")?;
            Arc::new(SshRsaHostKey::from_public(e, n))
        }
        Some(HostKeyAlgorithm::SshDss) => {
            let p = read_unsigned(&mut r, "p")?;
            let q = read_unsigned(&mut r, "q")?;
            let g = read_unsigned(&mut r, "g")?;
            let y = read_unsigned(&mut r, "y")?;
            Arc::new(DssHostKey::from_public(p, q, g, y)?)
        }
        None => {
            return Err(TidewireError::NotImplemented(format!(
                "Unsupported public key algorithm: {}",
                name
            )))
        }
    };
    Ok(key)
}

/// Builds a key pair from a private key blob.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] for malformed blobs,
/// [`TidewireError::Security`] for inconsistent key material and
/// [`TidewireError::NotImplemented`] for unknown algorithm names.
pub fn parse_private_key(blob: &[u8]) -> TidewireResult<Arc<dyn HostKey>> {
    let mut r = Reader::new(blob);
    let name = r.get_utf8()?;
    let key: Arc<dyn HostKey> = match HostKeyAlgorithm::from_name(&name) {
        Some(HostKeyAlgorithm::SshEd25519) => {
            let public = r.get_string()?.to_vec();
            let keypair = r.get_string()?;
            if keypair.len() != 64 || keypair[32..] != public[..] {
                return Err(TidewireError::Security(
                    "Malformed Ed25519 private key".to_string(),
                ));
            }
            Arc::new(Ed25519HostKey::from_bytes(&keypair[..32])?)
        }
        Some(HostKeyAlgorithm::SshRsa) => {
            let n = read_unsigned(&mut r, "n")?;
            let e = read_unsigned(&mut r, "e")?;
            let d = read_unsigned(&mut r, "d")?;
            let p = read_unsigned(&mut r, "p")?;
            let q = read_unsigned(&mut r, "q")?;
            Arc::new(SshRsaHostKey::from_components(n, e, d, p, q)?)
        }
        Some(HostKeyAlgorithm::SshDss) => {
            let p = read_unsigned(&mut r, "p")?;
            let q = read_unsigned(&mut r, "q")?;
            let g = read_unsigned(&mut r, "g")?;
            let y = read_unsigned(&mut r, "y")?;
            let x = read_unsigned(&mut r, "x")?;
            Arc::new(DssHostKey::from_components(p, q, g, y, x)?)
        }
        None => {
            return Err(TidewireError::NotImplemented(format!(
                "Unsupported private key algorithm: {}",
                name
            )))
        }
    };
    Ok(key)
}
