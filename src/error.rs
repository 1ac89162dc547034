//! Crate & protocol level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Protocol Layer (`crate::error`)
//!
//! - [`Error`]: connection I/O and frame parsing errors
//! - [`FramingError`]: the specific ways a frame can be rejected
//!
//! ## Coordination Layer (`crate::cluster::error`)
//!
//! - [`ClusterError`](crate::cluster::ClusterError): membership, ownership,
//!   and handoff errors surfaced at the arbiter's call boundary
//!
//! Connection-local errors are recovered at the connection (close and,
//! for outbound links, reconnect); they never crash the coordinator.

use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Protocol and connection level errors.
///
/// These are low-level errors that occur during network I/O, frame
/// parsing, and connection management. For coordination errors, see
/// [`crate::cluster::ClusterError`].
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// The byte stream violated the framing rules. Connection-fatal.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Missing data or connection closed.
    #[error("missing data: {0}")]
    MissingData(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// The ways an incoming frame can be rejected by the codec.
///
/// All of these are connection-fatal: the stream is no longer at a frame
/// boundary we can trust, so the connection is dropped and closed.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum FramingError {
    /// The length prefix exceeds the configured maximum frame size.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The kind tag does not name a known message kind.
    #[error("unrecognized message kind {0:#04x}")]
    UnknownKind(u8),

    /// The payload did not parse as the shape its kind requires.
    #[error("malformed {0}")]
    Malformed(&'static str),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}
