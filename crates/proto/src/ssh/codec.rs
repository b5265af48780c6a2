//! SSH binary data types (RFC 4251 Section 5).
//!
//! Every protocol message is a sequence of typed fields. This module provides
//! two views of the same encoding:
//!
//! - [`Writer`] / [`Reader`]: cursors with typed `put_*` / `get_*` methods,
//!   used by the message encoders throughout the crate.
//! - [`pack`] / [`unpack`]: a format-driven API that serializes a slice of
//!   [`Value`]s against a slice of [`FieldKind`]s.
//!
//! # Field kinds
//!
//! | kind | encoding |
//! |------|----------|
//! | byte | 1 byte |
//! | boolean | 1 byte, nonzero is true |
//! | uint32 / uint64 | big-endian |
//! | string | uint32 length + bytes |
//! | name-list | string of comma separated ASCII names |
//! | mpint | string holding a two's complement big-endian integer |
//! | fixed(n) | exactly n raw bytes |
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::codec::{pack, unpack, FieldKind, Value};
//!
//! let format = [FieldKind::Byte, FieldKind::String, FieldKind::Boolean];
//! let bytes = pack(
//!     &format,
//!     &[Value::Byte(5), Value::String(b"ssh-userauth".to_vec()), Value::Boolean(true)],
//! )
//! .unwrap();
//!
//! let (values, end) = unpack(&format, &bytes, 0).unwrap();
//! assert_eq!(end, bytes.len());
//! assert_eq!(values[1], Value::String(b"ssh-userauth".to_vec()));
//! ```

use bytes::{BufMut, BytesMut};
use num_bigint::{BigInt, BigUint, Sign};
use tidewire_platform::{TidewireError, TidewireResult};

/// Wire type of a single field in a message layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single byte.
    Byte,
    /// Single byte boolean.
    Boolean,
    /// 32-bit unsigned big-endian.
    Uint32,
    /// 64-bit unsigned big-endian.
    Uint64,
    /// Length-prefixed byte string.
    String,
    /// Length-prefixed comma separated list of names.
    NameList,
    /// Length-prefixed two's complement integer.
    Mpint,
    /// Fixed number of raw bytes.
    Fixed(usize),
}

/// A decoded (or to be encoded) field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Byte value.
    Byte(u8),
    /// Boolean value.
    Boolean(bool),
    /// 32-bit value.
    Uint32(u32),
    /// 64-bit value.
    Uint64(u64),
    /// Byte string.
    String(Vec<u8>),
    /// Name list.
    NameList(Vec<String>),
    /// Multiple precision integer.
    Mpint(BigInt),
    /// Raw bytes of a fixed width field.
    Fixed(Vec<u8>),
}

impl Value {
    /// Returns the field kind this value encodes as.
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Byte(_) => FieldKind::Byte,
            Value::Boolean(_) => FieldKind::Boolean,
            Value::Uint32(_) => FieldKind::Uint32,
            Value::Uint64(_) => FieldKind::Uint64,
            Value::String(_) => FieldKind::String,
            Value::NameList(_) => FieldKind::NameList,
            Value::Mpint(_) => FieldKind::Mpint,
            Value::Fixed(v) => FieldKind::Fixed(v.len()),
        }
    }
}

/// Serializes `values` according to `format`.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] if the number of values differs from
/// the number of fields, or a value does not match its field kind.
pub fn pack(format: &[FieldKind], values: &[Value]) -> TidewireResult<Vec<u8>> {
    if format.len() != values.len() {
        return Err(TidewireError::Protocol(format!(
            "Format has {} fields but {} values were given",
            format.len(),
            values.len()
        )));
    }

    let mut writer = Writer::new();
    for (index, (kind, value)) in format.iter().zip(values).enumerate() {
        match (kind, value) {
            (FieldKind::Byte, Value::Byte(v)) => writer.put_u8(*v),
            (FieldKind::Boolean, Value::Boolean(v)) => writer.put_bool(*v),
            (FieldKind::Uint32, Value::Uint32(v)) => writer.put_u32(*v),
            (FieldKind::Uint64, Value::Uint64(v)) => writer.put_u64(*v),
            (FieldKind::String, Value::String(v)) => writer.put_string(v),
            (FieldKind::NameList, Value::NameList(v)) => writer.put_name_list(v),
            (FieldKind::Mpint, Value::Mpint(v)) => writer.put_mpint(v),
            (FieldKind::Fixed(n), Value::Fixed(v)) if v.len() == *n => writer.put_raw(v),
            _ => {
                return Err(TidewireError::Protocol(format!(
                    "Field {} expects {:?}, got {:?}",
                    index,
                    kind,
                    value.kind()
                )))
            }
        }
    }
    Ok(writer.into_vec())
}

/// Decodes fields described by `format` from `data`, starting at `offset`.
///
/// Returns the decoded values and the offset just past the last field.
///
/// # Errors
///
/// Returns [`TidewireError::Protocol`] if the data ends before every field
/// has been read, or a name-list is not valid ASCII.
pub fn unpack(
    format: &[FieldKind],
    data: &[u8],
    offset: usize,
) -> TidewireResult<(Vec<Value>, usize)> {
    let mut reader = Reader::at(data, offset)?;
    let mut values = Vec::with_capacity(format.len());
    for kind in format {
        let value = match kind {
            FieldKind::Byte => Value::Byte(reader.get_u8()?),
            FieldKind::Boolean => Value::Boolean(reader.get_bool()?),
            FieldKind::Uint32 => Value::Uint32(reader.get_u32()?),
            FieldKind::Uint64 => Value::Uint64(reader.get_u64()?),
            FieldKind::String => Value::String(reader.get_string()?.to_vec()),
            FieldKind::NameList => Value::NameList(reader.get_name_list()?),
            FieldKind::Mpint => Value::Mpint(reader.get_mpint()?),
            FieldKind::Fixed(n) => Value::Fixed(reader.get_fixed(*n)?.to_vec()),
        };
        values.push(value);
    }
    Ok((values, reader.position()))
}

/// Encodes the body of an mpint (without the length prefix).
///
/// Zero is the empty string. Positive values whose top bit would be set get
/// a leading `0x00`, negative values keep only the sign extension they need.
///
/// # Example
///
/// ```rust
/// use num_bigint::BigInt;
/// use tidewire_proto::ssh::codec::encode_mpint;
///
/// assert_eq!(encode_mpint(&BigInt::from(0x80)), vec![0x00, 0x80]);
/// assert_eq!(encode_mpint(&BigInt::from(-1)), vec![0xff]);
/// assert!(encode_mpint(&BigInt::from(0)).is_empty());
/// ```
pub fn encode_mpint(value: &BigInt) -> Vec<u8> {
    if value.sign() == Sign::NoSign {
        return Vec::new();
    }
    value.to_signed_bytes_be()
}

/// Decodes the body of an mpint (without the length prefix).
pub fn decode_mpint(bytes: &[u8]) -> BigInt {
    if bytes.is_empty() {
        return BigInt::from(0);
    }
    BigInt::from_signed_bytes_be(bytes)
}

/// Interprets `bytes` as an unsigned big-endian integer.
pub fn unsigned_mpint(bytes: &[u8]) -> BigInt {
    BigInt::from_biguint(Sign::Plus, BigUint::from_bytes_be(bytes))
}

/// Growable buffer with typed SSH field writers.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Creates a writer whose first byte is the message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tidewire_proto::ssh::codec::Writer;
    /// use tidewire_proto::ssh::message::MessageType;
    ///
    /// let mut w = Writer::message(MessageType::ServiceRequest);
    /// w.put_str("ssh-userauth");
    /// assert_eq!(w.as_slice()[0], 5);
    /// ```
    pub fn message(msg_type: crate::ssh::message::MessageType) -> Self {
        let mut writer = Self::new();
        writer.put_u8(msg_type as u8);
        writer
    }

    /// Appends a byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Appends a boolean.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Appends a big-endian uint32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Appends a big-endian uint64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Appends a length-prefixed string.
    pub fn put_string(&mut self, v: &[u8]) {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) {
        self.put_string(v.as_bytes());
    }

    /// Appends a name-list.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined);
    }

    /// Appends an mpint.
    pub fn put_mpint(&mut self, v: &BigInt) {
        self.put_string(&encode_mpint(v));
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning the bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over a byte slice with typed SSH field readers.
///
/// Every read checks the remaining length first, so truncated input results
/// in [`TidewireError::Protocol`] rather than a panic.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Creates a reader positioned at `offset`.
    pub fn at(data: &'a [u8], offset: usize) -> TidewireResult<Self> {
        if offset > data.len() {
            return Err(TidewireError::Protocol(format!(
                "Offset {} past end of {} byte buffer",
                offset,
                data.len()
            )));
        }
        Ok(Self { data, pos: offset })
    }

    /// Current offset into the underlying slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the unread tail without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> TidewireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(TidewireError::Protocol(format!(
                "Truncated message: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Reads a byte.
    pub fn get_u8(&mut self) -> TidewireResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a boolean.
    pub fn get_bool(&mut self) -> TidewireResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn get_u32(&mut self) -> TidewireResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn get_u64(&mut self) -> TidewireResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads a length-prefixed string.
    pub fn get_string(&mut self) -> TidewireResult<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed string and decodes it as UTF-8.
    pub fn get_utf8(&mut self) -> TidewireResult<String> {
        let raw = self.get_string()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| TidewireError::Protocol("Invalid UTF-8 in string field".to_string()))
    }

    /// Reads a name-list.
    pub fn get_name_list(&mut self) -> TidewireResult<Vec<String>> {
        let raw = self.get_string()?;
        if !raw.is_ascii() {
            return Err(TidewireError::Protocol(
                "Name-list contains non-ASCII bytes".to_string(),
            ));
        }
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        // ASCII was checked above.
        let text = String::from_utf8_lossy(raw);
        Ok(text.split(',').map(String::from).collect())
    }

    /// Reads an mpint.
    pub fn get_mpint(&mut self) -> TidewireResult<BigInt> {
        Ok(decode_mpint(self.get_string()?))
    }

    /// Reads exactly `n` raw bytes.
    pub fn get_fixed(&mut self, n: usize) -> TidewireResult<&'a [u8]> {
        self.take(n)
    }
}
