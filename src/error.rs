//! Error classification for the datapath.
//!
//! Parse and classification errors (the `thiserror` variants below) never
//! leave the datapath: callers match on them to decide whether to drop a
//! packet, and they are never logged above `trace`/`debug`. Resource errors
//! (tun I/O, listener setup) are reported with `anyhow` at the call sites
//! that own the pipeline lifecycle, since those are fatal and carry
//! unstructured context rather than a fixed classification.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("buffer too short for header")]
    InvalidLength,
    #[error("unsupported IP version")]
    InvalidVersion,
    #[error("header checksum mismatch")]
    InvalidChecksum,
    #[error("fragment reassembly blocked")]
    ReassembleBlocked,
    #[error("payload too large for a single datagram")]
    TooLarge,
    #[error("unsupported protocol")]
    Unsupported,
}
