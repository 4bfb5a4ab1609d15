#![warn(missing_docs)]
//! Stratum
//!
//! Metadata engine for a self-describing hierarchical file format.
//!
//! # Implementation Details
//!
//! Every piece of file metadata (B-tree nodes, symbol table nodes, object headers, local heaps and
//! free space section lists) lives at a file address as an "image": a run of bytes with a layout
//! that is fixed by the format. In memory, each of those structures is a "cache client": a type
//! which knows how large its image is, how to decode itself from an image and how to encode
//! itself back into one.
//!
//! The [`cache::MetadataCache`] keeps decoded objects keyed by file address. If an object isn't
//! present in the cache, it is read from backing storage on demand, using the client to work out
//! how many bytes to read and how to decode them. Objects are protected while in use, can be
//! pinned so that they aren't evicted, and are written back when the cache is flushed.
//!
//! Images are encoded with bounds checked cursors ([`format::Decoder`] and [`format::Encoder`])
//! which honour the address width, length width and byte order that a file was created with.
//!
//! The [`Stratum`] file handle ties the cache, the storage file and the file space allocator
//! together and provides a few higher level operations (groups, links, debugging dumps).
//!
//! All of this is single threaded per file handle. A writer flushes metadata before the file header
//! so that a concurrent reader, which only ever discovers structures by following addresses, never
//! sees an address before the bytes it points to.
//!

pub mod btree;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod freespace;
pub mod group;
pub mod heap;
mod io;
pub mod ohdr;
mod sparse;
pub mod stratum;

// Re-export
pub use self::config::FileConfig;
pub use self::error::{MetadataError, Result};
pub use self::format::Addr;
pub use self::stratum::{OpenMode, Stratum};

use bincode::config::AllowTrailing;
use bincode::config::FixintEncoding;
use bincode::config::WithOtherIntEncoding;
use bincode::config::WithOtherTrailing;
use bincode::{DefaultOptions, Options};
use std::sync::LazyLock;

static BINCODER: LazyLock<
    WithOtherIntEncoding<WithOtherTrailing<DefaultOptions, AllowTrailing>, FixintEncoding>,
> = LazyLock::new(|| {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .with_fixint_encoding()
});
