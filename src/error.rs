use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Error taxonomy shared by every disk format of the crate.
///
/// Log replay never produces an error for a torn or corrupt log entry: such
/// an entry only marks where the valid log content ends.
#[derive(Debug, Error)]
pub enum DiskError {
    /// Corrupt or unsupported header, region, metadata or log structure.
    #[error("format error: {0}")]
    Format(String),

    /// A caller-supplied parameter is outside its accepted set. Carries the
    /// parameter name (e.g. `"logicalSectorSize"`).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("parent disk not found: {0}")]
    ParentNotFound(String),

    #[error("parent disk capacity {parent} is smaller than child capacity {child}")]
    ParentSizeMismatch { parent: u64, child: u64 },

    #[error("out of range: offset={offset} len={len} capacity={capacity}")]
    OutOfRange { offset: u64, len: u64, capacity: u64 },

    #[error("read-only: {0}")]
    ReadOnly(&'static str),

    #[error("unsupported disk format: {0}")]
    UnsupportedFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DiskError {
    /// Name of the offending parameter for [`DiskError::InvalidArgument`].
    pub fn param_name(&self) -> Option<&'static str> {
        match self {
            DiskError::InvalidArgument(name) => Some(name),
            _ => None,
        }
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        DiskError::Format(msg.into())
    }
}

impl From<DiskError> for io::Error {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::Io(e) => e,
            DiskError::OutOfRange { .. } | DiskError::InvalidArgument(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            DiskError::ReadOnly(_) => io::Error::new(io::ErrorKind::PermissionDenied, err),
            DiskError::ParentNotFound(_) => io::Error::new(io::ErrorKind::NotFound, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Checks that `[offset, offset + len)` fits inside `capacity`.
pub(crate) fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let out_of_range = DiskError::OutOfRange {
        offset,
        len: len as u64,
        capacity,
    };
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(out_of_range),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_range_accepts_exact_end() {
        assert!(checked_range(0, 512, 512).is_ok());
        assert!(checked_range(512, 0, 512).is_ok());
    }

    #[test]
    fn checked_range_rejects_overflow_and_overrun() {
        assert!(matches!(
            checked_range(511, 2, 512),
            Err(DiskError::OutOfRange { .. })
        ));
        assert!(matches!(
            checked_range(u64::MAX, 1, u64::MAX),
            Err(DiskError::OutOfRange { .. })
        ));
    }

    #[test]
    fn invalid_argument_exposes_param_name() {
        let err = DiskError::InvalidArgument("physicalSectorSize");
        assert_eq!(err.param_name(), Some("physicalSectorSize"));
        assert_eq!(DiskError::format("x").param_name(), None);
    }
}
