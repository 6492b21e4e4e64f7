use std::fmt;
use std::io;

use crate::allocator::AllocError;
use crate::blockdev::BlockDeviceError;
use crate::layout::LayoutError;
use crate::log::LogError;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BlockDevice(BlockDeviceError),
    Alloc(AllocError),
    Log(LogError),
    InvalidFormat(LayoutError),
    Config(String),
    InvalidArgument(String),
}

impl Error {
    /// True when the operation failed for lack of free space
    pub fn is_exhausted(&self) -> bool {
        match self {
            Error::Alloc(e) => e.is_exhausted(),
            Error::Log(e) => e.is_exhausted(),
            _ => false,
        }
    }

    /// True when on-media state failed validation
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Log(LogError::CorruptLog { .. }) | Error::InvalidFormat(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BlockDevice(e) => write!(f, "Block device error: {}", e),
            Error::Alloc(e) => write!(f, "Allocation error: {}", e),
            Error::Log(e) => write!(f, "Extent log error: {}", e),
            Error::InvalidFormat(e) => write!(f, "Invalid volume format: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::BlockDevice(e) => Some(e),
            Error::Alloc(e) => Some(e),
            Error::Log(e) => Some(e),
            Error::InvalidFormat(e) => Some(e),
            Error::Config(_) | Error::InvalidArgument(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<BlockDeviceError> for Error {
    fn from(err: BlockDeviceError) -> Self {
        match err {
            BlockDeviceError::Io(e) => Error::Io(e),
            other => Error::BlockDevice(other),
        }
    }
}

impl From<AllocError> for Error {
    fn from(err: AllocError) -> Self {
        Error::Alloc(err)
    }
}

impl From<LogError> for Error {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Alloc(e) => Error::Alloc(e),
            LogError::BlockDevice(e) => e.into(),
            LogError::InvalidArgument(msg) => Error::InvalidArgument(msg),
            corrupt @ LogError::CorruptLog { .. } => Error::Log(corrupt),
        }
    }
}

impl From<LayoutError> for Error {
    fn from(err: LayoutError) -> Self {
        match err {
            LayoutError::Io(e) => Error::Io(e),
            other => Error::InvalidFormat(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
