//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include `mac` or the length field itself
//! - padding is at least 4 bytes
//! - `packet_length + 4` is a multiple of `max(8, cipher block size)`
//! - a frame is never smaller than `max(16, cipher block size)`
//! - `packet_length + 4` never exceeds [`MAX_PACKET_LENGTH`]
//!
//! AEAD ciphers authenticate the length field instead of encrypting it as
//! part of the first block, so for them `packet_length` alone is aligned
//! and the minimum frame size does not apply (see [`aead_padding_length`]).
//!
//! Encryption and MAC computation live in [`crate::ssh::transport`]; this
//! module only knows the plaintext layout.
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"\x05payload".to_vec());
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"\x05payload");
//! ```

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tidewire_platform::{TidewireError, TidewireResult};

/// Largest accepted `packet_length + 4`, in bytes.
pub const MAX_PACKET_LENGTH: usize = 1_048_576;

/// Smallest alignment unit, used when the cipher block is smaller.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Smallest frame (length field included) ever sent or accepted.
pub const MIN_FRAME_SIZE: usize = 16;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: usize = 4;

/// Alignment unit for a cipher with the given block size.
pub fn effective_block_size(cipher_block_size: usize) -> usize {
    cipher_block_size.max(MIN_BLOCK_SIZE)
}

/// Smallest allowed frame for a cipher with the given block size.
pub fn minimum_frame_size(cipher_block_size: usize) -> usize {
    MIN_FRAME_SIZE.max(cipher_block_size)
}

/// Computes how much random padding a payload needs.
///
/// The result is at least [`MIN_PADDING_LEN`], makes the frame a multiple of
/// the effective block size, and makes the frame at least
/// [`minimum_frame_size`] long.
///
/// # Example
///
/// ```rust
/// use tidewire_proto::ssh::packet::padding_length;
///
/// // 5 header bytes + 3 payload bytes is already aligned, so a whole block is added.
/// assert_eq!(padding_length(3, 8), 8);
/// assert_eq!(padding_length(0, 16), 11);
/// ```
pub fn padding_length(payload_len: usize, cipher_block_size: usize) -> usize {
    let block = effective_block_size(cipher_block_size);
    let base = 5 + payload_len;

    let mut padding = block - (base % block);
    if padding < MIN_PADDING_LEN {
        padding += block;
    }

    let minimum = minimum_frame_size(cipher_block_size);
    if base + padding < minimum {
        padding = minimum - base;
        let rem = (base + padding) % block;
        if rem != 0 {
            padding += block - rem;
        }
        if padding < MIN_PADDING_LEN {
            padding += block;
        }
    }
    padding
}

/// Computes padding for an AEAD cipher, where `packet_length` itself (not
/// `packet_length + 4`) must be a multiple of the effective block size.
///
/// # Example
///
/// ```rust
/// use tidewire_proto::ssh::packet::aead_padding_length;
///
/// // padding_length byte + 1 payload byte, aligned to 8 with 6 bytes.
/// assert_eq!(aead_padding_length(1, 8), 6);
/// assert_eq!(aead_padding_length(12, 16), 19);
/// ```
pub fn aead_padding_length(payload_len: usize, cipher_block_size: usize) -> usize {
    let block = effective_block_size(cipher_block_size);
    let base = 1 + payload_len;

    let mut padding = block - (base % block);
    if padding < MIN_PADDING_LEN {
        padding += block;
    }
    padding
}

/// Validates a decrypted `packet_length` before the rest of the frame is read.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] if the frame would be smaller than
/// [`minimum_frame_size`], larger than [`MAX_PACKET_LENGTH`], or not aligned
/// to the block size.
pub fn check_packet_length(packet_length: u32, cipher_block_size: usize) -> TidewireResult<()> {
    let total = packet_length as usize + 4;
    if total < minimum_frame_size(cipher_block_size) {
        return Err(TidewireError::Protocol(format!(
            "Packet too small: {} bytes (minimum {})",
            total,
            minimum_frame_size(cipher_block_size)
        )));
    }
    if total > MAX_PACKET_LENGTH {
        return Err(TidewireError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            total, MAX_PACKET_LENGTH
        )));
    }
    if total % effective_block_size(cipher_block_size) != 0 {
        return Err(TidewireError::Protocol(format!(
            "Packet length {} is not a multiple of the block size {}",
            total,
            effective_block_size(cipher_block_size)
        )));
    }
    Ok(())
}

/// Validates the `packet_length` of a frame protected by an AEAD cipher.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] if the length cannot hold the padding
/// byte and minimum padding, exceeds [`MAX_PACKET_LENGTH`], or is not aligned
/// to the block size.
pub fn check_aead_packet_length(
    packet_length: u32,
    cipher_block_size: usize,
) -> TidewireResult<()> {
    let packet_length = packet_length as usize;
    let block = effective_block_size(cipher_block_size);
    if packet_length < 1 + MIN_PADDING_LEN {
        return Err(TidewireError::Protocol(format!(
            "Packet too small: packet_length {}",
            packet_length
        )));
    }
    if packet_length + 4 > MAX_PACKET_LENGTH {
        return Err(TidewireError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length + 4,
            MAX_PACKET_LENGTH
        )));
    }
    if packet_length % block != 0 {
        return Err(TidewireError::Protocol(format!(
            "Packet length {} is not a multiple of the block size {}",
            packet_length, block
        )));
    }
    Ok(())
}

/// SSH binary packet.
///
/// # Invariants
///
/// - Padding is at least 4 bytes
/// - The serialized frame (MAC excluded) is aligned to the block size it was
///   built for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
    mac: Option<Vec<u8>>,
}

impl Packet {
    /// Creates a packet padded for the unencrypted (8-byte block) case.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_block_size(payload, MIN_BLOCK_SIZE)
    }

    /// Creates a packet padded for a cipher with the given block size.
    ///
    /// Padding is filled with random bytes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tidewire_proto::ssh::Packet;
    ///
    /// let packet = Packet::with_block_size(b"\x02hi".to_vec(), 16);
    /// assert_eq!(packet.to_bytes().len() % 16, 0);
    /// ```
    pub fn with_block_size(payload: Vec<u8>, cipher_block_size: usize) -> Self {
        let padding_len = padding_length(payload.len(), cipher_block_size);
        Self::with_padding_len(payload, padding_len)
    }

    /// Creates a packet padded for an AEAD cipher with the given block size.
    pub fn for_aead(payload: Vec<u8>, cipher_block_size: usize) -> Self {
        let padding_len = aead_padding_length(payload.len(), cipher_block_size);
        Self::with_padding_len(payload, padding_len)
    }

    fn with_padding_len(payload: Vec<u8>, padding_len: usize) -> Self {
        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self {
            payload,
            padding,
            mac: None,
        }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Returns the MAC of this packet (if present).
    pub fn mac(&self) -> Option<&[u8]> {
        self.mac.as_deref()
    }

    /// Sets the MAC for this packet.
    pub fn set_mac(&mut self, mac: Vec<u8>) {
        self.mac = Some(mac);
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes the frame, MAC appended if set.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length();
        let mut buf =
            BytesMut::with_capacity(4 + packet_length + self.mac.as_ref().map_or(0, |m| m.len()));

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        if let Some(mac) = &self.mac {
            buf.put_slice(mac);
        }

        buf.to_vec()
    }

    /// Parses a plaintext frame. Bytes after the frame are kept as the MAC.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Protocol`] if:
    /// - Data is shorter than the declared `packet_length`
    /// - The length exceeds [`MAX_PACKET_LENGTH`]
    /// - Padding is shorter than 4 bytes or leaves no room for a payload
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        if data.len() < 5 {
            return Err(TidewireError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;

        if packet_length + 4 > MAX_PACKET_LENGTH {
            return Err(TidewireError::Protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length + 4,
                MAX_PACKET_LENGTH
            )));
        }

        if buf.len() < packet_length {
            return Err(TidewireError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let (payload, padding) = split_frame_body(&buf[..packet_length])?;
        let payload = payload.to_vec();
        let padding = padding.to_vec();
        buf.advance(packet_length);

        let mac = if !buf.is_empty() {
            Some(buf.to_vec())
        } else {
            None
        };

        Ok(Self {
            payload,
            padding,
            mac,
        })
    }
}

/// Splits the bytes after `packet_length` into payload and padding.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] if padding is shorter than 4 bytes or
/// leaves an empty payload.
pub fn split_frame_body(body: &[u8]) -> TidewireResult<(&[u8], &[u8])> {
    let Some((&padding_length, rest)) = body.split_first() else {
        return Err(TidewireError::Protocol("Empty packet body".to_string()));
    };
    let padding_length = padding_length as usize;

    if padding_length < MIN_PADDING_LEN {
        return Err(TidewireError::Protocol(format!(
            "Padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }
    if padding_length >= rest.len() {
        return Err(TidewireError::Protocol(format!(
            "Padding length {} leaves no payload in a {} byte packet",
            padding_length,
            body.len()
        )));
    }

    Ok(rest.split_at(rest.len() - padding_length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_invariants() {
        for block in [8usize, 16] {
            for len in 0..600 {
                let padding = padding_length(len, block);
                let frame = 5 + len + padding;
                assert!(padding >= MIN_PADDING_LEN, "len {} block {}", len, block);
                assert_eq!(frame % block, 0, "len {} block {}", len, block);
                assert!(frame >= MIN_FRAME_SIZE.max(block), "len {} block {}", len, block);
                assert!(padding < 256);
            }
        }
    }

    #[test]
    fn test_aead_padding_aligns_packet_length() {
        for block in [8usize, 16] {
            for len in 1..600 {
                let packet = Packet::for_aead(vec![0x5e; len], block);
                let padding = packet.padding().len();
                assert!(padding >= MIN_PADDING_LEN, "len {} block {}", len, block);
                assert!(padding < MIN_PADDING_LEN + block);
                assert_eq!(packet.packet_length() % block, 0, "len {} block {}", len, block);
                assert!(check_aead_packet_length(packet.packet_length() as u32, block).is_ok());
            }
        }
    }

    #[test]
    fn test_check_aead_packet_length() {
        assert!(check_aead_packet_length(8, 8).is_ok());
        assert!(check_aead_packet_length(16, 16).is_ok());
        assert!(check_aead_packet_length(4, 8).is_err());
        assert!(check_aead_packet_length(12, 8).is_err());
        assert!(check_aead_packet_length(24, 16).is_err());
        assert!(check_aead_packet_length(MAX_PACKET_LENGTH as u32, 16).is_err());
    }

    #[test]
    fn test_padding_small_cipher_block_uses_eight() {
        assert_eq!(padding_length(10, 1), padding_length(10, 8));
    }

    #[test]
    fn test_packet_alignment() {
        let packet = Packet::new(b"test".to_vec());
        assert_eq!(packet.to_bytes().len() % 8, 0);

        let packet = Packet::with_block_size(b"test".to_vec(), 16);
        assert_eq!(packet.to_bytes().len() % 16, 0);
    }

    #[test]
    fn test_packet_round_trip() {
        let payload = b"Test SSH packet payload".to_vec();
        let packet = Packet::new(payload.clone());

        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.payload(), &payload[..]);
        assert_eq!(parsed.padding().len(), packet.padding().len());
        assert!(parsed.mac().is_none());
    }

    #[test]
    fn test_packet_with_mac() {
        let mut packet = Packet::new(b"payload".to_vec());
        let mac = vec![0xaa; 20];
        packet.set_mac(mac.clone());

        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.mac(), Some(&mac[..]));
    }

    #[test]
    fn test_check_packet_length() {
        assert!(check_packet_length(12, 8).is_ok());
        assert!(check_packet_length(4, 8).is_err());
        assert!(check_packet_length(13, 8).is_err());
        assert!(check_packet_length((MAX_PACKET_LENGTH - 4) as u32, 16).is_ok());
        assert!(check_packet_length((MAX_PACKET_LENGTH + 4) as u32, 16).is_err());
        assert!(check_packet_length(12, 16).is_ok());
    }

    #[test]
    fn test_packet_invalid_too_short() {
        let result = Packet::from_bytes(&[0, 0, 0, 10]);
        assert!(matches!(result, Err(TidewireError::Protocol(_))));
    }

    #[test]
    fn test_packet_invalid_padding_too_short() {
        let data = vec![
            0, 0, 0, 8, // packet_length = 8
            2, // padding_length = 2
            0x48, 0x65, 0x6c, 0x6c, 0x6f, // "Hello"
            0x00, 0x00,
        ];
        match Packet::from_bytes(&data) {
            Err(TidewireError::Protocol(msg)) => assert!(msg.contains("Padding too short")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_packet_padding_consumes_payload() {
        let data = vec![0, 0, 0, 5, 4, 0, 0, 0, 0];
        assert!(Packet::from_bytes(&data).is_err());
    }

    #[test]
    fn test_packet_invalid_incomplete() {
        let data = vec![0, 0, 0, 20, 4, 0x48, 0x65];
        assert!(matches!(
            Packet::from_bytes(&data),
            Err(TidewireError::Protocol(_))
        ));
    }
}
