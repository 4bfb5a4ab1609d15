use strum::Display;

use super::CacheThing;
use crate::config::FileConfig;
use crate::error::Result;
use crate::heap::HeapArena;

/// Identifies each kind of cache client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ClientId {
    /// B-tree node
    BTree,
    /// Symbol table node
    SymbolNode,
    /// Local heap prefix
    HeapPrefix,
    /// Local heap data block
    HeapDataBlock,
    /// Object header chunk 0
    ObjectHeader,
    /// Object header continuation chunk
    OhdrChunk,
    /// Free space section list
    FreeSpace,
}

/// Events a client is told about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum NotifyAction {
    /// Entry was inserted into the cache
    AfterInsert,
    /// Entry was read from storage
    AfterLoad,
    /// Entry image was written to storage
    AfterFlush,
    /// Entry is about to leave the cache
    BeforeEvict,
}

/// Cache state handed to clients.
///
/// Clients never perform I/O. They see the file configuration and the local heap arena, which
/// holds state shared between heap prefixes and data blocks.
#[derive(Debug)]
pub struct ClientContext<'a> {
    /// File configuration
    pub config: &'a FileConfig,
    /// Local heaps
    pub heaps: &'a mut HeapArena,
}

/// The contract between the metadata cache and each kind of metadata object.
pub trait CacheClient: Sized {
    /// Client identifier.
    const ID: ClientId;

    /// Extra information needed to decode an image.
    type UserData;

    /// Number of bytes to read before decoding.
    fn initial_load_size(udata: &Self::UserData, ctx: &ClientContext<'_>) -> usize;

    /// Number of bytes actually needed, worked out from the initial image.
    ///
    /// `None` means the initial read was enough.
    fn final_load_size(
        _image: &[u8],
        _udata: &Self::UserData,
        _ctx: &ClientContext<'_>,
    ) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Decode an image.
    fn deserialize(
        image: &[u8],
        udata: &Self::UserData,
        ctx: &mut ClientContext<'_>,
    ) -> Result<Self>;

    /// Exact size of the image [`serialize`](Self::serialize) will produce.
    fn image_len(&self, ctx: &ClientContext<'_>) -> usize;

    /// Encode into `image`, which is exactly [`image_len`](Self::image_len) bytes long.
    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()>;

    /// React to a cache event.
    fn notify(&mut self, _action: NotifyAction, _ctx: &mut ClientContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Release the in-core representation.
    fn free_icr(self, _ctx: &mut ClientContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Wrap in the cache's sum type.
    fn into_thing(self) -> CacheThing;

    /// Unwrap from the cache's sum type.
    fn from_thing(thing: &CacheThing) -> Option<&Self>;

    /// Mutably unwrap from the cache's sum type.
    fn from_thing_mut(thing: &mut CacheThing) -> Option<&mut Self>;
}

/// Implement the sum type conversions of [`CacheClient`] for a client.
macro_rules! cache_thing {
    ($variant:ident) => {
        fn into_thing(self) -> $crate::cache::CacheThing {
            $crate::cache::CacheThing::$variant(self)
        }

        fn from_thing(thing: &$crate::cache::CacheThing) -> Option<&Self> {
            match thing {
                $crate::cache::CacheThing::$variant(inner) => Some(inner),
                _ => None,
            }
        }

        fn from_thing_mut(thing: &mut $crate::cache::CacheThing) -> Option<&mut Self> {
            match thing {
                $crate::cache::CacheThing::$variant(inner) => Some(inner),
                _ => None,
            }
        }
    };
}

pub(crate) use cache_thing;
