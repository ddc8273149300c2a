//! Error taxonomy for the transport, protocol and filesystem layers.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the bulk pipe and a directory
/// listing.
///
/// The split matters for recovery: a [`Error::Protocol`] means the bulk pipe
/// is desynchronized and the session is dead, while a
/// [`Error::CommandFailed`] is an ordinary device-side failure the caller can
/// inspect with REQUEST SENSE and retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A CSW field did not match what the protocol requires (bad signature,
    /// tag echo mismatch, reserved status value). Retrying the same command
    /// will not help; the session must be torn down.
    Protocol {
        what: &'static str,
        expected: u32,
        actual: u32,
    },
    /// The device reported `bCSWStatus` = 1 (command failed). Issue REQUEST
    /// SENSE to find out why.
    CommandFailed,
    /// The device reported `bCSWStatus` = 2. The engine has already run the
    /// bulk-only reset recovery; the current operation is lost.
    PhaseError,
    /// The on-disk FAT32 structures are inconsistent (chain cycle,
    /// out-of-range cluster, bad boot sector).
    CorruptFilesystem(&'static str),
    /// Caller handed us something that can never be valid, e.g. a transfer
    /// size that is not a multiple of the block size. Detected before any
    /// bytes hit the wire.
    InvalidArgument(&'static str),
    /// No free cluster is left to allocate.
    NoSpace,
    /// The underlying USB transfer failed or timed out.
    Transfer(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol {
                what,
                expected,
                actual,
            } => write!(
                f,
                "protocol violation: {what} expected 0x{expected:08X}, got 0x{actual:08X}"
            ),
            Self::CommandFailed => write!(f, "device reported command failed"),
            Self::PhaseError => write!(f, "device reported phase error"),
            Self::CorruptFilesystem(detail) => write!(f, "corrupt filesystem: {detail}"),
            Self::InvalidArgument(detail) => write!(f, "invalid argument: {detail}"),
            Self::NoSpace => write!(f, "no free clusters left on the volume"),
            Self::Transfer(detail) => write!(f, "usb transfer failed: {detail}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Transfer(e.to_string())
    }
}
