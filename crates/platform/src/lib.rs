//! # Tidewire Platform
//!
//! Shared types for the Tidewire secure-shell transport.
//!
//! This crate provides:
//! - Unified error types (`TidewireError`, `TidewireResult`)
//! - The platform version string
//!
//! # Examples
//!
//! ```
//! use tidewire_platform::{TidewireError, TidewireResult};
//!
//! fn example_function() -> TidewireResult<String> {
//!     Ok("Hello, Tidewire!".to_string())
//! }
//!
//! # fn main() -> TidewireResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Tidewire!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{TidewireError, TidewireResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
