//! Crashrelay Minidump - Native crash dump discovery and parsing
//!
//! Provides:
//! - `parser`: minidump header and crashpad annotation decoding
//! - `MinidumpLoader`: discovery of dump files with in-flight tracking,
//!   age eviction and a settle wait before reading

use std::path::PathBuf;

pub mod loader;
pub mod parser;

pub use loader::{CrashDump, LoadedDump, LoaderOptions, MinidumpLoader};
pub use parser::{parse, CrashpadAnnotations, MinidumpHeader, ParsedMinidump};

/// Errors that can occur while loading a minidump
#[derive(Debug, thiserror::Error)]
pub enum MinidumpError {
    /// Buffer is below the size any real dump has
    #[error("Minidump too small: {len} bytes (minimum {min})")]
    TooSmall { len: usize, min: usize },

    /// Leading signature is not `MDMP`
    #[error("Invalid minidump signature: {0:?}")]
    BadSignature([u8; 4]),

    /// The crash facility was still writing the file when we gave up
    #[error("Minidump still being written: {}", .0.display())]
    StillWriting(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
