//! Error types for the cache

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the allocator, the eviction buffer and cacheable units
///
/// Three families are distinguished:
/// - allocation failures (`InvalidLength`, `OutOfSpace`), reported synchronously
///   by the allocator and never partially applied
/// - I/O failures (`Io`, `CorruptedData`) from saving or loading a unit
/// - precondition failures (`Precondition`, `RangeNotOwned`), which are
///   programming errors in the calling component
#[derive(Error, Debug)]
pub enum CacheError {
    /// IO operation on the backing file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Zero-length allocation or release
    #[error("Invalid length: {length}")]
    InvalidLength {
        /// The rejected length
        length: u64,
    },

    /// The backing file cannot be extended far enough
    #[error("Out of addressable space: requested {requested} bytes past end of file {end_of_file}")]
    OutOfSpace {
        /// Number of bytes requested
        requested: u64,
        /// End-of-file offset at the time of the request
        end_of_file: u64,
    },

    /// Released range is not currently owned by anyone
    #[error("Range not owned: offset {offset}, length {length}")]
    RangeNotOwned {
        /// Start of the range
        offset: u64,
        /// Length of the range
        length: u64,
    },

    /// On-disk record failed validation
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Operation called in a state that its contract forbids
    #[error("Precondition failed: {0}")]
    Precondition(String),
}

impl CacheError {
    /// Returns true for failures that came from the backing store
    pub fn is_io(&self) -> bool {
        matches!(self, CacheError::Io(_) | CacheError::CorruptedData(_))
    }

    /// Returns true for allocator failures
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidLength { .. } | CacheError::OutOfSpace { .. }
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Io(_) => "io",
            CacheError::InvalidLength { .. } => "invalid_length",
            CacheError::OutOfSpace { .. } => "out_of_space",
            CacheError::RangeNotOwned { .. } => "range_not_owned",
            CacheError::CorruptedData(_) => "corrupted",
            CacheError::Precondition(_) => "precondition",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = CacheError::Io(std::io::Error::other("disk gone"));
        assert!(io.is_io());
        assert!(!io.is_allocation());
        assert_eq!(io.kind(), "io");

        let alloc = CacheError::InvalidLength { length: 0 };
        assert!(alloc.is_allocation());
        assert_eq!(alloc.kind(), "invalid_length");

        let owned = CacheError::RangeNotOwned {
            offset: 10,
            length: 5,
        };
        assert!(!owned.is_io());
        assert!(!owned.is_allocation());
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = CacheError::Precondition("unit is busy".to_string()).into();
        assert!(err.to_string().contains("unit is busy"));
    }
}
