//! SSH symmetric cryptography: ciphers, MACs and compression.
//!
//! Each kind of algorithm is an enum of the supported names plus a keyed
//! object that carries per-direction state:
//!
//! | kind | names |
//! |------|-------|
//! | cipher | `none`, `aes128-ctr`, `aes256-ctr`, `aes128-cbc`, `aes256-cbc` |
//! | AEAD cipher | `chacha20-poly1305@openssh.com`, `aes{128,256}-gcm@openssh.com` |
//! | MAC | `none`, `hmac-sha1`, `hmac-sha2-256`, `hmac-sha2-512` |
//! | compression | `none` |
//!
//! Cipher state carries over from one packet to the next (the CTR counter,
//! the CBC chaining block, the GCM invocation counter), so a direction owns
//! exactly one [`Cipher`] between two NEWKEYS.
//!
//! AEAD ciphers protect a whole frame at once with [`Cipher::seal`] and
//! [`Cipher::open`] and replace the MAC, which is then `none`:
//!
//! - `aesN-gcm`: `packet_length` travels in clear as additional data; the
//!   nonce is the 4-byte fixed IV field plus a 64-bit invocation counter.
//! - `chacha20-poly1305`: the 64-byte key is split into a payload key and a
//!   length key; `packet_length` is encrypted separately and the nonce is the
//!   packet sequence number.
//!
//! # Security
//!
//! - MAC comparison is constant-time ([`subtle`])
//! - MAC keys are zeroized on drop
//! - Key material is checked against the algorithm's key size
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::crypto::{Cipher, CipherAlgorithm};
//!
//! let key = [7u8; 16];
//! let iv = [9u8; 16];
//! let mut enc = Cipher::encryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
//! let mut dec = Cipher::decryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
//!
//! let mut data = *b"sixteen byte blk";
//! enc.encrypt(&mut data).unwrap();
//! dec.decrypt(&mut data).unwrap();
//! assert_eq!(&data, b"sixteen byte blk");
//! ```

use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use ring::aead::{
    chacha20_poly1305_openssh, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey,
    UnboundKey, AES_128_GCM, AES_256_GCM,
};
use subtle::ConstantTimeEq;
use tidewire_platform::{TidewireError, TidewireResult};
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Authentication tag length of every AEAD cipher.
pub const AEAD_TAG_LEN: usize = 16;

/// GCM nonce: fixed field followed by the invocation counter, which starts
/// at the last 8 IV bytes and grows by one per packet.
struct GcmNonce {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmNonce {
    fn new(iv: &[u8]) -> Self {
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut invocation = [0u8; 8];
        invocation.copy_from_slice(&iv[4..12]);
        Self {
            fixed,
            invocation: u64::from_be_bytes(invocation),
        }
    }
}

impl NonceSequence for GcmNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce)
    }
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption (before the first NEWKEYS)
    None,
    /// AES-128 in counter mode
    Aes128Ctr,
    /// AES-256 in counter mode
    Aes256Ctr,
    /// AES-128 in CBC mode
    Aes128Cbc,
    /// AES-256 in CBC mode
    Aes256Cbc,
    /// ChaCha20-Poly1305 AEAD, OpenSSH construction
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD
    Aes128Gcm,
    /// AES-256-GCM AEAD
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Every supported cipher, most preferred first. `none` is last.
    pub const ALL: [CipherAlgorithm; 8] = [
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes256Cbc,
        CipherAlgorithm::Aes128Cbc,
        CipherAlgorithm::None,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::ChaCha20Poly1305 => chacha20_poly1305_openssh::KEY_LEN,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None | CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            _ => 16,
        }
    }

    /// Returns the block size in bytes (1 for `none`).
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 1,
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Whether the cipher authenticates frames itself, replacing the MAC.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    /// Returns the authentication tag size in bytes (0 unless AEAD).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            AEAD_TAG_LEN
        } else {
            0
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }
}

enum CipherState {
    None,
    Aes128Ctr(Box<Aes128Ctr>),
    Aes256Ctr(Box<Aes256Ctr>),
    Aes128CbcEnc(Box<Aes128CbcEnc>),
    Aes128CbcDec(Box<Aes128CbcDec>),
    Aes256CbcEnc(Box<Aes256CbcEnc>),
    Aes256CbcDec(Box<Aes256CbcDec>),
    GcmSeal(Box<SealingKey<GcmNonce>>),
    GcmOpen(Box<OpeningKey<GcmNonce>>),
    ChaChaSeal(Box<chacha20_poly1305_openssh::SealingKey>),
    ChaChaOpen(Box<chacha20_poly1305_openssh::OpeningKey>),
}

/// Keyed cipher for one direction of a connection.
pub struct Cipher {
    algorithm: CipherAlgorithm,
    state: CipherState,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn check_material(what: &str, needed: usize, got: usize) -> TidewireResult<()> {
    if got < needed {
        return Err(TidewireError::Security(format!(
            "Insufficient {} material: expected {}, got {}",
            what, needed, got
        )));
    }
    Ok(())
}

fn invalid_length(_: cipher::InvalidLength) -> TidewireError {
    TidewireError::Security("Invalid cipher key or IV length".to_string())
}

fn gcm_key(algorithm: CipherAlgorithm, key: &[u8]) -> TidewireResult<UnboundKey> {
    let aead = match algorithm {
        CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
        _ => &AES_256_GCM,
    };
    UnboundKey::new(aead, key).map_err(|_| {
        TidewireError::Security(format!("Failed to create {} key", algorithm.name()))
    })
}

fn chacha_key(key: &[u8]) -> TidewireResult<&[u8; chacha20_poly1305_openssh::KEY_LEN]> {
    key.try_into().map_err(|_| {
        TidewireError::Security("Invalid chacha20-poly1305 key length".to_string())
    })
}

fn not_aead(algorithm: CipherAlgorithm) -> TidewireError {
    TidewireError::Security(format!("{} cannot seal or open frames", algorithm.name()))
}

impl Cipher {
    /// The unencrypted cipher in effect before the first key exchange.
    pub fn none() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            state: CipherState::None,
        }
    }

    /// Creates an encrypting cipher. Extra key or IV bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] if `key` or `iv` is too short.
    pub fn encryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> TidewireResult<Self> {
        Self::build(algorithm, key, iv, true)
    }

    /// Creates a decrypting cipher. Extra key or IV bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] if `key` or `iv` is too short.
    pub fn decryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> TidewireResult<Self> {
        Self::build(algorithm, key, iv, false)
    }

    fn build(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
        encrypt: bool,
    ) -> TidewireResult<Self> {
        check_material("key", algorithm.key_size(), key.len())?;
        check_material("IV", algorithm.iv_size(), iv.len())?;
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let state = match (algorithm, encrypt) {
            (CipherAlgorithm::None, _) => CipherState::None,
            (CipherAlgorithm::Aes128Ctr, _) => CipherState::Aes128Ctr(Box::new(
                Aes128Ctr::new_from_slices(key, iv).map_err(invalid_length)?,
            )),
            (CipherAlgorithm::Aes256Ctr, _) => CipherState::Aes256Ctr(Box::new(
                Aes256Ctr::new_from_slices(key, iv).map_err(invalid_length)?,
            )),
            (CipherAlgorithm::Aes128Cbc, true) => CipherState::Aes128CbcEnc(Box::new(
                Aes128CbcEnc::new_from_slices(key, iv).map_err(invalid_length)?,
            )),
            (CipherAlgorithm::Aes128Cbc, false) => CipherState::Aes128CbcDec(Box::new(
                Aes128CbcDec::new_from_slices(key, iv).map_err(invalid_length)?,
            )),
            (CipherAlgorithm::Aes256Cbc, true) => CipherState::Aes256CbcEnc(Box::new(
                Aes256CbcEnc::new_from_slices(key, iv).map_err(invalid_length)?,
            )),
            (CipherAlgorithm::Aes256Cbc, false) => CipherState::Aes256CbcDec(Box::new(
                Aes256CbcDec::new_from_slices(key, iv).map_err(invalid_length)?,
            )),
            (CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm, true) => {
                let key = gcm_key(algorithm, key)?;
                CipherState::GcmSeal(Box::new(SealingKey::new(key, GcmNonce::new(iv))))
            }
            (CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm, false) => {
                let key = gcm_key(algorithm, key)?;
                CipherState::GcmOpen(Box::new(OpeningKey::new(key, GcmNonce::new(iv))))
            }
            (CipherAlgorithm::ChaCha20Poly1305, true) => CipherState::ChaChaSeal(Box::new(
                chacha20_poly1305_openssh::SealingKey::new(chacha_key(key)?),
            )),
            (CipherAlgorithm::ChaCha20Poly1305, false) => CipherState::ChaChaOpen(Box::new(
                chacha20_poly1305_openssh::OpeningKey::new(chacha_key(key)?),
            )),
        };

        Ok(Self { algorithm, state })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.algorithm.block_size()
    }

    /// Whether frames go through [`Cipher::seal`] / [`Cipher::open`].
    pub fn is_aead(&self) -> bool {
        self.algorithm.is_aead()
    }

    fn check_blocks(&self, data: &[u8]) -> TidewireResult<()> {
        if data.len() % self.block_size() != 0 {
            return Err(TidewireError::Protocol(format!(
                "{} bytes is not a multiple of the {} block size",
                data.len(),
                self.algorithm.name()
            )));
        }
        Ok(())
    }

    /// Encrypts `data` in place. `data` must be a whole number of blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is not block aligned or this cipher
    /// was built for decryption.
    pub fn encrypt(&mut self, data: &mut [u8]) -> TidewireResult<()> {
        self.check_blocks(data)?;
        match &mut self.state {
            CipherState::None => {}
            CipherState::Aes128Ctr(c) => c.apply_keystream(data),
            CipherState::Aes256Ctr(c) => c.apply_keystream(data),
            CipherState::Aes128CbcEnc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes256CbcEnc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes128CbcDec(_) | CipherState::Aes256CbcDec(_) => {
                return Err(TidewireError::Security(
                    "Cipher was created for decryption".to_string(),
                ))
            }
            CipherState::GcmSeal(_)
            | CipherState::GcmOpen(_)
            | CipherState::ChaChaSeal(_)
            | CipherState::ChaChaOpen(_) => {
                return Err(TidewireError::Security(format!(
                    "{} only seals whole frames",
                    self.algorithm.name()
                )))
            }
        }
        Ok(())
    }

    /// Decrypts `data` in place. `data` must be a whole number of blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is not block aligned or this cipher
    /// was built for encryption.
    pub fn decrypt(&mut self, data: &mut [u8]) -> TidewireResult<()> {
        self.check_blocks(data)?;
        match &mut self.state {
            CipherState::None => {}
            CipherState::Aes128Ctr(c) => c.apply_keystream(data),
            CipherState::Aes256Ctr(c) => c.apply_keystream(data),
            CipherState::Aes128CbcDec(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes256CbcDec(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::Aes128CbcEnc(_) | CipherState::Aes256CbcEnc(_) => {
                return Err(TidewireError::Security(
                    "Cipher was created for encryption".to_string(),
                ))
            }
            CipherState::GcmSeal(_)
            | CipherState::GcmOpen(_)
            | CipherState::ChaChaSeal(_)
            | CipherState::ChaChaOpen(_) => {
                return Err(TidewireError::Security(format!(
                    "{} only opens whole frames",
                    self.algorithm.name()
                )))
            }
        }
        Ok(())
    }

    /// Encrypts and authenticates a plaintext frame (length field included)
    /// for packet `sequence`, appending the tag.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] if this is not a sealing AEAD
    /// cipher or the GCM counter is exhausted.
    pub fn seal(&mut self, sequence: u32, frame: &mut Vec<u8>) -> TidewireResult<()> {
        if frame.len() < 4 {
            return Err(TidewireError::Protocol("Frame has no length field".to_string()));
        }
        match &mut self.state {
            CipherState::GcmSeal(key) => {
                let (length, body) = frame.split_at_mut(4);
                let tag = key
                    .seal_in_place_separate_tag(Aad::from(&*length), body)
                    .map_err(|_| TidewireError::Security("GCM sealing failed".to_string()))?;
                frame.extend_from_slice(tag.as_ref());
            }
            CipherState::ChaChaSeal(key) => {
                let mut tag = [0u8; chacha20_poly1305_openssh::TAG_LEN];
                key.seal_in_place(sequence, &mut frame[..], &mut tag);
                frame.extend_from_slice(&tag);
            }
            _ => return Err(not_aead(self.algorithm)),
        }
        Ok(())
    }

    /// Recovers `packet_length` from the first 4 received bytes of packet
    /// `sequence`. Only `chacha20-poly1305` encrypts it; other ciphers
    /// return the bytes unchanged.
    pub fn decrypt_length(&self, sequence: u32, header: [u8; 4]) -> [u8; 4] {
        match &self.state {
            CipherState::ChaChaOpen(key) => key.decrypt_packet_length(sequence, header),
            _ => header,
        }
    }

    /// Verifies and decrypts a received frame (length field and tag
    /// included) of packet `sequence`. On success `frame` holds the
    /// plaintext frame with the tag removed.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Security`] if the tag does not verify or
    /// this is not an opening AEAD cipher.
    pub fn open(&mut self, sequence: u32, frame: &mut Vec<u8>) -> TidewireResult<()> {
        if frame.len() < 4 + AEAD_TAG_LEN {
            return Err(TidewireError::Protocol(format!(
                "AEAD frame of {} bytes is too short",
                frame.len()
            )));
        }
        let body_end = frame.len() - AEAD_TAG_LEN;
        let failed = |_: ring::error::Unspecified| {
            TidewireError::Security("AEAD tag verification failed".to_string())
        };
        match &mut self.state {
            CipherState::GcmOpen(key) => {
                let (length, body) = frame.split_at_mut(4);
                key.open_in_place(Aad::from(&*length), body).map_err(failed)?;
            }
            CipherState::ChaChaOpen(key) => {
                let mut tag = [0u8; chacha20_poly1305_openssh::TAG_LEN];
                tag.copy_from_slice(&frame[body_end..]);
                let mut header = [0u8; 4];
                header.copy_from_slice(&frame[..4]);
                let length = key.decrypt_packet_length(sequence, header);
                key.open_in_place(sequence, &mut frame[..body_end], &tag)
                    .map_err(failed)?;
                frame[..4].copy_from_slice(&length);
            }
            _ => return Err(not_aead(self.algorithm)),
        }
        frame.truncate(body_end);
        Ok(())
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// No MAC (before the first NEWKEYS)
    None,
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Every supported MAC, most preferred first. `none` is last.
    pub const ALL: [MacAlgorithm; 4] = [
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha1,
        MacAlgorithm::None,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::None => "none",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::None => 0,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            MacAlgorithm::None => 0,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }
}

/// MAC key for one direction of a connection.
///
/// The packet sequence number is owned by the transport and passed in.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn hmac_error(_: hmac::digest::InvalidLength) -> TidewireError {
    TidewireError::Security("Invalid HMAC key".to_string())
}

impl MacKey {
    /// The MAC in effect before the first key exchange.
    pub fn none() -> Self {
        Self {
            algorithm: MacAlgorithm::None,
            key: Vec::new(),
        }
    }

    /// Creates a new MAC key. Extra key bytes are ignored.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> TidewireResult<Self> {
        check_material("MAC key", algorithm.key_size(), key_material.len())?;

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes `MAC(key, sequence_number || frame)`.
    ///
    /// Returns an empty vector for `none`.
    pub fn compute(&self, sequence: u32, frame: &[u8]) -> TidewireResult<Vec<u8>> {
        let seq = sequence.to_be_bytes();
        let mac = match self.algorithm {
            MacAlgorithm::None => Vec::new(),
            MacAlgorithm::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key).map_err(hmac_error)?;
                mac.update(&seq);
                mac.update(frame);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).map_err(hmac_error)?;
                mac.update(&seq);
                mac.update(frame);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key).map_err(hmac_error)?;
                mac.update(&seq);
                mac.update(frame);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(mac)
    }

    /// Checks a received MAC in constant time.
    pub fn verify(&self, sequence: u32, frame: &[u8], received: &[u8]) -> TidewireResult<bool> {
        let computed = self.compute(sequence, frame)?;
        if computed.len() != received.len() {
            return Ok(false);
        }
        Ok(computed.ct_eq(received).into())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Returns the MAC output size in bytes.
    pub fn digest_size(&self) -> usize {
        self.algorithm.digest_size()
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Compression algorithm. Only `none` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// Payloads are sent as-is
    None,
}

impl CompressionAlgorithm {
    /// Every supported compression method.
    pub const ALL: [CompressionAlgorithm; 1] = [CompressionAlgorithm::None];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
        }
    }

    /// Parses compression algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            _ => None,
        }
    }

    /// Compresses an outgoing payload.
    pub fn compress(&self, payload: Vec<u8>) -> Vec<u8> {
        match self {
            CompressionAlgorithm::None => payload,
        }
    }

    /// Decompresses an incoming payload.
    pub fn decompress(&self, payload: Vec<u8>) -> TidewireResult<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(payload),
        }
    }
}
