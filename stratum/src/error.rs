//! Error types
//!
//! Every fallible operation in the crate reports one of a fixed set of error kinds. None of the
//! codecs retry: a failure is returned to the caller, which decides whether to abort.

use thiserror::Error;

use crate::cache::CacheError;
use crate::freespace::MemType;

/// Result type used throughout the crate.
pub type Result<T, E = MetadataError> = std::result::Result<T, E>;

/// Stratum specific errors.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// A read or write would have run past the end of the supplied buffer
    #[error("ran off end of {len} byte buffer: need {need} bytes at offset {offset}")]
    BufferOverflow {
        /// Position of the access which failed
        offset: usize,
        /// Number of bytes the access needed
        need: usize,
        /// Length of the buffer
        len: usize,
    },

    /// Magic bytes did not match
    #[error("wrong {0} signature")]
    BadSignature(&'static str),

    /// Version byte not recognised
    #[error("bad {what} version: {found}")]
    BadVersion {
        /// Structure being decoded
        what: &'static str,
        /// Version found in the image
        found: u8,
    },

    /// A field violates a structural invariant
    #[error("bad value: {0}")]
    BadValue(String),

    /// A textual field is not in the expected format
    #[error("badly formatted {0}")]
    BadFormat(&'static str),

    /// File space could not be allocated
    #[error("unable to allocate {size} bytes of {mem} file space")]
    Allocation {
        /// Type of file memory requested
        mem: MemType,
        /// Requested size
        size: u64,
    },

    /// A shared reference count could not be adjusted
    #[error("reference count: {0}")]
    Refcount(String),

    /// Metadata cache misuse
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Storage read or write failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A bincode encoded structure could not be processed
    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

impl MetadataError {
    pub(crate) fn bad_value(msg: impl Into<String>) -> Self {
        MetadataError::BadValue(msg.into())
    }
}
