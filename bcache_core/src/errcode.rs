//! Engine error codes.
//!
//! These are deliberately coarse: each variant names a recovery strategy,
//! not a cause. `Retry` and `NoMem` are handled inside the engine (iterator
//! restart, cannibalize wait); everything else surfaces to the originating
//! bio and feeds per-device error accounting.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    /// Relock or cache-race failure; restart from the last valid ancestor.
    Retry,
    /// Node cache could not allocate and the caller didn't hold the
    /// cannibalize lock.
    NoMem,
    /// Extent has no usable pointer: every pointer stale or on a missing
    /// device.
    NoDisk,
    /// Device rejected the I/O.
    IO,
    /// Could not obtain a disk reservation for a blockdev-volume write.
    NoSpace,
    /// Device is detaching; submission refused.
    NoDev,
    /// Journal or btree check failed; the cache set is read-only.
    Inconsistent,
}

impl ErrCode {
    /// Transient errors are retried internally and should never reach a bio.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrCode::Retry | ErrCode::NoMem)
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrCode::Retry => "transaction restart required",
            ErrCode::NoMem => "btree node cache exhausted",
            ErrCode::NoDisk => "no usable pointer to data",
            ErrCode::IO => "I/O error",
            ErrCode::NoSpace => "out of cache reservation",
            ErrCode::NoDev => "device detaching",
            ErrCode::Inconsistent => "cache set inconsistent (read-only)",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ErrCode {}

pub type Result<T, E = ErrCode> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ErrCode::Retry.is_transient());
        assert!(ErrCode::NoMem.is_transient());
        assert!(!ErrCode::IO.is_transient());
        assert!(!ErrCode::Inconsistent.is_transient());
    }
}
