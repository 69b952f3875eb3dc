//! Domain error taxonomy.
//!
//! Everything above the dialect layer speaks these variants and nothing
//! else: transient driver failures are retried inside the store, and
//! backend-specific error codes are translated at the dialect boundary.

use thiserror::Error;

/// Wire-observable errors of the key/value engine.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Key absent at the requested revision.
    #[error("key not found")]
    NotFound,

    /// Compare-and-swap failure or uniqueness collision.
    #[error("key exists")]
    KeyExists,

    /// Requested revision is older than the compact watermark.
    #[error("required revision has been compacted")]
    Compacted,

    /// Unknown or already-expired lease.
    #[error("lease not found: {0}")]
    LeaseNotFound(i64),

    /// Watcher queue overflow; the stream is terminated.
    #[error("watch stream cancelled: watcher is too slow")]
    SlowWatcher,

    /// Transient backend failure that survived the retry budget.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Schema or invariant violation. Fatal to the operation, not the process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the CAS/uniqueness conflict that unconditional writes
    /// may retry on.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KeyExists)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(Error::KeyExists.is_conflict());
        assert!(!Error::NotFound.is_conflict());
        assert!(!Error::Compacted.is_conflict());
    }

    #[test]
    fn test_display_is_wire_stable() {
        assert_eq!(Error::NotFound.to_string(), "key not found");
        assert_eq!(Error::KeyExists.to_string(), "key exists");
        assert_eq!(
            Error::Compacted.to_string(),
            "required revision has been compacted"
        );
    }
}
