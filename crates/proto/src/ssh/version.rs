//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both peers start by sending an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification; they are skipped.
//!
//! # Security
//!
//! - Maximum line length: 255 bytes including CR LF
//! - At most [`MAX_PREAMBLE_LINES`] lines before the identification
//! - No null bytes allowed in the identification
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::version::Version;
//!
//! let version = Version::new("Tidewire_0.1.0", Some("transport"));
//! assert_eq!(version.to_string(), "SSH-2.0-Tidewire_0.1.0 transport");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! assert!(parsed.is_supported());
//! ```

use tidewire_platform::{TidewireError, TidewireResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Maximum length of an identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines tolerated before the
/// identification line.
pub const MAX_PREAMBLE_LINES: usize = 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Tidewire_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
    /// The identification exactly as sent or received, without CR LF.
    /// This is what goes into the exchange hash.
    ident: String,
}

impl Version {
    /// Creates a protocol 2.0 identification.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tidewire_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Test", None);
    /// assert_eq!(version.identification(), "SSH-2.0-Test");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let mut ident = format!("SSH-2.0-{}", software);
        if let Some(c) = comments {
            ident.push(' ');
            ident.push_str(c);
        }
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            ident,
        }
    }

    /// Returns the default Tidewire identification.
    pub fn default_tidewire() -> Self {
        Self::new(&format!("Tidewire_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line.
    ///
    /// The line is split at the first space into the identification and
    /// the comments; the identification must have exactly three
    /// dash-separated fields. The protocol version is not checked here,
    /// see [`Version::is_supported`].
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Protocol`] if:
    /// - Line is too long
    /// - Line doesn't start with "SSH-"
    /// - The identification does not have three fields
    /// - Line contains null bytes
    pub fn parse(line: &str) -> TidewireResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() + 2 > MAX_VERSION_LENGTH {
            return Err(TidewireError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len() + 2,
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(TidewireError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(TidewireError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let (id, comments) = match line.split_once(' ') {
            Some((id, rest)) => (id, Some(rest.to_string())),
            None => (line, None),
        };

        let parts: Vec<&str> = id.split('-').collect();
        if parts.len() != 3 {
            return Err(TidewireError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        Ok(Self {
            proto_version: parts[1].to_string(),
            software_version: parts[2].to_string(),
            comments,
            ident: line.to_string(),
        })
    }

    /// True if the peer speaks protocol 2.0 (or 1.99, which means 2.0 too).
    pub fn is_supported(&self) -> bool {
        self.proto_version == "2.0" || self.proto_version == "1.99"
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification string without CR LF.
    pub fn identification(&self) -> &str {
        &self.ident
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.ident).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.ident)
    }
}

/// Reads lines from `reader` until one starts with `SSH-`, and returns it
/// without the line terminator.
///
/// Lines are read one byte at a time so nothing after the identification
/// is consumed; wrap the stream in a `BufReader` to keep this cheap.
///
/// # Errors
///
/// - [`TidewireError::Io`] if the stream ends first
/// - [`TidewireError::Protocol`] if a line exceeds [`MAX_VERSION_LENGTH`] or
///   more than [`MAX_PREAMBLE_LINES`] lines precede the identification
pub async fn read_identification_line<R>(reader: &mut R) -> TidewireResult<String>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..=MAX_PREAMBLE_LINES {
        let mut line = Vec::with_capacity(64);
        loop {
            let b = reader.read_u8().await?;
            if b == b'\n' {
                break;
            }
            line.push(b);
            if line.len() >= MAX_VERSION_LENGTH {
                return Err(TidewireError::Protocol(format!(
                    "Identification line exceeds {} bytes",
                    MAX_VERSION_LENGTH
                )));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if line.starts_with(b"SSH-") {
            let text = String::from_utf8(line).map_err(|_| {
                TidewireError::Protocol("Identification is not valid UTF-8".to_string())
            })?;
            debug!(ident = %text, "Received identification");
            return Ok(text);
        }
        trace!(len = line.len(), "Skipping pre-identification line");
    }

    Err(TidewireError::Protocol(format!(
        "No identification within {} lines",
        MAX_PREAMBLE_LINES
    )))
}
