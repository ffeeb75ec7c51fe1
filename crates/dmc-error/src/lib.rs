#![forbid(unsafe_code)]
//! Error types for the dm-cache hints policy.
//!
//! # Error Taxonomy
//!
//! Every recoverable failure of a policy operation is a [`PolicyError`].
//! Broken caller contracts (double allocation of a cache block, removing an
//! origin block that is not mapped) are not errors: they panic, because the
//! cache target above the policy has already lost track of its own state.
//!
//! | Variant | errno | Raised by |
//! |---------|-------|-----------|
//! | `WouldBlock` | `EWOULDBLOCK` | contended try-lock, or a miss with migration disallowed |
//! | `NotFound` | `ENOENT` | `lookup` of an unmapped origin block |
//! | `OutOfMemory` | `ENOMEM` | `load_mapping` with the entry pool exhausted or the cache block taken |
//! | `PermissionDenied` | `EPERM` | setting the hint width a second time |
//! | `InvalidArgument` | `EINVAL` | bad config key/value, hint field overflow, malformed load input |
//! | `Mismatch` | `EINVAL` | hint bytes that did not survive a persistence round trip |
//!
//! ## Design Constraints
//!
//! - `dmc-error` does not depend on the other `dmc-*` crates; block numbers
//!   are carried as raw integers so every crate can convert into it.
//! - `Mismatch` is reported by `load_mapping` *after* the mapping is
//!   installed. Callers treat it as a warning, not as a failed load.

use thiserror::Error;

/// Unified error type for all policy operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Lock unavailable on a non-blocking path, or a miss that would need a
    /// migration the caller disallowed. Always retryable.
    #[error("operation would block")]
    WouldBlock,

    /// Origin block has no mapping.
    #[error("origin block {0} is not mapped")]
    NotFound(u64),

    /// No free entry or cache block is left for a persisted mapping.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Write-once configuration was already latched.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed configuration or input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Decoded hint field differs from the value the encoder writes.
    #[error(
        "hint mismatch in {width}-byte field {field} at offset {offset}: expected {expected:#x}, got {actual:#x}"
    )]
    Mismatch {
        width: usize,
        field: usize,
        offset: usize,
        expected: u64,
        actual: u64,
    },
}

impl PolicyError {
    /// Convert this error into a POSIX errno, as the cache target reports it.
    ///
    /// Exhaustive on purpose: a new variant fails to compile until it has an
    /// errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::NotFound(_) => libc::ENOENT,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::InvalidArgument(_) | Self::Mismatch { .. } => libc::EINVAL,
        }
    }

    /// Whether retrying the same call later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// Result alias using `PolicyError`.
pub type Result<T> = std::result::Result<T, PolicyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PolicyError, libc::c_int)> = vec![
            (PolicyError::WouldBlock, libc::EWOULDBLOCK),
            (PolicyError::NotFound(7), libc::ENOENT),
            (PolicyError::OutOfMemory("pool".into()), libc::ENOMEM),
            (PolicyError::PermissionDenied("hint_size".into()), libc::EPERM),
            (PolicyError::InvalidArgument("key".into()), libc::EINVAL),
            (
                PolicyError::Mismatch {
                    width: 8,
                    field: 0,
                    offset: 0,
                    expected: 1,
                    actual: 2,
                },
                libc::EINVAL,
            ),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn only_would_block_is_retryable() {
        assert!(PolicyError::WouldBlock.is_retryable());
        assert!(!PolicyError::NotFound(1).is_retryable());
        assert!(!PolicyError::OutOfMemory("x".into()).is_retryable());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            PolicyError::NotFound(42).to_string(),
            "origin block 42 is not mapped"
        );
        assert_eq!(
            PolicyError::WouldBlock.to_string(),
            "operation would block"
        );
        let mismatch = PolicyError::Mismatch {
            width: 4,
            field: 0,
            offset: 16,
            expected: 0x2,
            actual: 0xff,
        };
        assert_eq!(
            mismatch.to_string(),
            "hint mismatch in 4-byte field 0 at offset 16: expected 0x2, got 0xff"
        );
    }
}
