//! Metadata cache
//!
//! Decoded metadata objects are kept in a [`MetadataCache`] keyed by file address. Each kind of
//! object implements [`CacheClient`], which tells the cache how many bytes to read for an image,
//! how to decode it and how to encode it again.
//!
//! The set of clients is closed: every resident object is one of the [`CacheThing`] variants,
//! and the cache dispatches over them with exhaustive matches.

pub use self::client::{CacheClient, ClientContext, ClientId, NotifyAction};
pub use self::store::{MemoryStore, MetadataStore};

pub(crate) use self::client::cache_thing;

mod client;
mod store;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::btree::BTreeNode;
use crate::config::FileConfig;
use crate::error::Result;
use crate::format::Addr;
use crate::freespace::FreeSpaceManager;
use crate::group::SymbolNode;
use crate::heap::{DataBlock, HeapArena, HeapPrefix};
use crate::ohdr::{ObjectHeader, OhdrChunk};

/// Cache misuse.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    /// No entry at this address
    #[error("no entry at address {0}")]
    NotResident(Addr),
    /// Address already occupied
    #[error("entry already resident at address {0}")]
    AlreadyResident(Addr),
    /// Entry is protected
    #[error("entry at address {0} is protected")]
    Protected(Addr),
    /// Entry is not protected
    #[error("entry at address {0} is not protected")]
    NotProtected(Addr),
    /// Entry belongs to a different client
    #[error("entry at address {addr} is a {found}, not a {wanted}")]
    WrongType {
        /// Entry address
        addr: Addr,
        /// Client that was asked for
        wanted: ClientId,
        /// Client actually resident
        found: ClientId,
    },
    /// Entry is pinned
    #[error("entry at address {0} is pinned")]
    Pinned(Addr),
    /// Entry is not pinned
    #[error("entry at address {0} is not pinned")]
    NotPinned(Addr),
    /// Cache was opened read only
    #[error("cannot write entry at address {0}: cache is read only")]
    ReadOnly(Addr),
}

/// Every kind of object the cache can hold.
#[derive(Debug)]
pub enum CacheThing {
    /// B-tree node
    BTree(BTreeNode),
    /// Symbol table node
    SymbolNode(SymbolNode),
    /// Local heap prefix, possibly with its data block
    HeapPrefix(HeapPrefix),
    /// Separate local heap data block
    HeapDataBlock(DataBlock),
    /// Object header chunk 0
    ObjectHeader(ObjectHeader),
    /// Object header continuation chunk
    OhdrChunk(OhdrChunk),
    /// Free space section list
    FreeSpace(FreeSpaceManager),
}

// Forward a call to whichever client a thing holds.
macro_rules! dispatch {
    ($thing:expr, $inner:ident => $body:expr) => {
        match $thing {
            CacheThing::BTree($inner) => $body,
            CacheThing::SymbolNode($inner) => $body,
            CacheThing::HeapPrefix($inner) => $body,
            CacheThing::HeapDataBlock($inner) => $body,
            CacheThing::ObjectHeader($inner) => $body,
            CacheThing::OhdrChunk($inner) => $body,
            CacheThing::FreeSpace($inner) => $body,
        }
    };
}

impl CacheThing {
    /// Client this thing belongs to.
    pub fn id(&self) -> ClientId {
        match self {
            CacheThing::BTree(_) => ClientId::BTree,
            CacheThing::SymbolNode(_) => ClientId::SymbolNode,
            CacheThing::HeapPrefix(_) => ClientId::HeapPrefix,
            CacheThing::HeapDataBlock(_) => ClientId::HeapDataBlock,
            CacheThing::ObjectHeader(_) => ClientId::ObjectHeader,
            CacheThing::OhdrChunk(_) => ClientId::OhdrChunk,
            CacheThing::FreeSpace(_) => ClientId::FreeSpace,
        }
    }

    fn image_len(&self, ctx: &ClientContext<'_>) -> usize {
        dispatch!(self, c => c.image_len(ctx))
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        dispatch!(self, c => c.serialize(ctx, image))
    }

    fn notify(&mut self, action: NotifyAction, ctx: &mut ClientContext<'_>) -> Result<()> {
        dispatch!(self, c => c.notify(action, ctx))
    }

    fn free_icr(self, ctx: &mut ClientContext<'_>) -> Result<()> {
        dispatch!(self, c => c.free_icr(ctx))
    }
}

#[derive(Debug)]
struct CacheEntry {
    size: usize,
    thing: CacheThing,
    dirty: bool,
    pinned: bool,
    protected: bool,
}

/// Decoded metadata, keyed by file address.
#[derive(Debug)]
pub struct MetadataCache {
    config: FileConfig,
    entries: BTreeMap<Addr, CacheEntry>,
    heaps: HeapArena,
    read_only: bool,
}

impl MetadataCache {
    /// Create an empty cache for a file with `config`.
    pub fn new(config: FileConfig, read_only: bool) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            heaps: HeapArena::default(),
            read_only,
        }
    }

    /// File configuration.
    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    /// Local heaps referenced by resident entries.
    pub fn heaps(&self) -> &HeapArena {
        &self.heaps
    }

    /// Mutable access to local heaps.
    pub fn heaps_mut(&mut self) -> &mut HeapArena {
        &mut self.heaps
    }

    /// Is this cache read only?
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Is there an entry at `addr`?
    pub fn contains(&self, addr: Addr) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Client of the entry at `addr`, if resident.
    pub fn client_at(&self, addr: Addr) -> Option<ClientId> {
        self.entries.get(&addr).map(|e| e.thing.id())
    }

    /// Addresses of resident entries, in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Addr> + '_ {
        self.entries.keys().copied()
    }

    fn entry(&self, addr: Addr) -> Result<&CacheEntry> {
        self.entries
            .get(&addr)
            .ok_or_else(|| CacheError::NotResident(addr).into())
    }

    fn entry_mut(&mut self, addr: Addr) -> Result<&mut CacheEntry> {
        self.entries
            .get_mut(&addr)
            .ok_or_else(|| CacheError::NotResident(addr).into())
    }

    /// Size of the image registered for the entry at `addr`.
    pub fn entry_size(&self, addr: Addr) -> Result<usize> {
        self.entry(addr).map(|e| e.size)
    }

    /// Is the entry at `addr` pinned?
    pub fn is_pinned(&self, addr: Addr) -> Result<bool> {
        self.entry(addr).map(|e| e.pinned)
    }

    /// Is the entry at `addr` dirty?
    pub fn is_dirty(&self, addr: Addr) -> Result<bool> {
        self.entry(addr).map(|e| e.dirty)
    }

    /// Is the entry at `addr` protected?
    pub fn is_protected(&self, addr: Addr) -> Result<bool> {
        self.entry(addr).map(|e| e.protected)
    }

    /// Make sure the object at `addr` is resident, reading it from `store` if required.
    pub async fn load<T: CacheClient, S: MetadataStore>(
        &mut self,
        store: &mut S,
        addr: Addr,
        udata: &T::UserData,
    ) -> Result<()> {
        if let Some(entry) = self.entries.get(&addr) {
            let found = entry.thing.id();
            if found != T::ID {
                return Err(CacheError::WrongType {
                    addr,
                    wanted: T::ID,
                    found,
                }
                .into());
            }
            return Ok(());
        }
        if !addr.is_defined() {
            return Err(CacheError::NotResident(addr).into());
        }

        let mut ctx = ClientContext {
            config: &self.config,
            heaps: &mut self.heaps,
        };
        let len = T::initial_load_size(udata, &ctx);
        let mut image = store.read(addr, len).await?;
        if let Some(final_len) = T::final_load_size(&image, udata, &ctx)? {
            if final_len != len {
                tracing::debug!(%addr, len, final_len, client = %T::ID, "re-reading image");
                image = store.read(addr, final_len).await?;
            }
        }
        let client = T::deserialize(&image, udata, &mut ctx)?;
        let mut thing = client.into_thing();
        thing.notify(NotifyAction::AfterLoad, &mut ctx)?;
        tracing::debug!(%addr, size = image.len(), client = %T::ID, "loaded");
        self.entries.insert(
            addr,
            CacheEntry {
                size: image.len(),
                thing,
                dirty: false,
                pinned: false,
                protected: false,
            },
        );
        Ok(())
    }

    /// Load (if required) and protect the object at `addr`, returning it for modification.
    ///
    /// The entry can't be evicted, moved or expunged until it is released with
    /// [`unprotect`](Self::unprotect).
    pub async fn protect<'a, T: CacheClient + 'a, S: MetadataStore>(
        &'a mut self,
        store: &mut S,
        addr: Addr,
        udata: &T::UserData,
    ) -> Result<&'a mut T> {
        self.load::<T, S>(store, addr, udata).await?;
        let entry = self.entry_mut(addr)?;
        if entry.protected {
            return Err(CacheError::Protected(addr).into());
        }
        entry.protected = true;
        let found = entry.thing.id();
        T::from_thing_mut(&mut entry.thing).ok_or_else(|| {
            CacheError::WrongType {
                addr,
                wanted: T::ID,
                found,
            }
            .into()
        })
    }

    /// Release a protected entry, marking it dirty if it was modified.
    pub fn unprotect(&mut self, addr: Addr, dirty: bool) -> Result<()> {
        let entry = self.entry_mut(addr)?;
        if !entry.protected {
            return Err(CacheError::NotProtected(addr).into());
        }
        entry.protected = false;
        entry.dirty |= dirty;
        Ok(())
    }

    /// Borrow a resident entry.
    pub fn get<T: CacheClient>(&self, addr: Addr) -> Result<&T> {
        let entry = self.entry(addr)?;
        T::from_thing(&entry.thing).ok_or_else(|| {
            CacheError::WrongType {
                addr,
                wanted: T::ID,
                found: entry.thing.id(),
            }
            .into()
        })
    }

    /// Mutably borrow a resident entry. The caller must mark the entry dirty if it changes it.
    pub fn get_mut<T: CacheClient>(&mut self, addr: Addr) -> Result<&mut T> {
        let entry = self.entry_mut(addr)?;
        let found = entry.thing.id();
        T::from_thing_mut(&mut entry.thing).ok_or_else(|| {
            CacheError::WrongType {
                addr,
                wanted: T::ID,
                found,
            }
            .into()
        })
    }

    /// Add a newly created object to the cache. New entries are dirty.
    pub fn insert<T: CacheClient>(&mut self, addr: Addr, client: T, pinned: bool) -> Result<()> {
        if self.entries.contains_key(&addr) {
            return Err(CacheError::AlreadyResident(addr).into());
        }
        let mut ctx = ClientContext {
            config: &self.config,
            heaps: &mut self.heaps,
        };
        let mut thing = client.into_thing();
        let size = thing.image_len(&ctx);
        thing.notify(NotifyAction::AfterInsert, &mut ctx)?;
        tracing::debug!(%addr, size, pinned, client = %T::ID, "inserted");
        self.entries.insert(
            addr,
            CacheEntry {
                size,
                thing,
                dirty: true,
                pinned,
                protected: false,
            },
        );
        Ok(())
    }

    /// Change the registered image size of an entry.
    pub fn resize(&mut self, addr: Addr, size: usize) -> Result<()> {
        let entry = self.entry_mut(addr)?;
        tracing::debug!(%addr, from = entry.size, to = size, "resized");
        entry.size = size;
        entry.dirty = true;
        Ok(())
    }

    /// Move an entry to a new address.
    pub fn move_entry(&mut self, old: Addr, new: Addr) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.entries.contains_key(&new) {
            return Err(CacheError::AlreadyResident(new).into());
        }
        if self.entry(old)?.protected {
            return Err(CacheError::Protected(old).into());
        }
        let mut entry = self
            .entries
            .remove(&old)
            .ok_or(CacheError::NotResident(old))?;
        entry.dirty = true;
        tracing::debug!(%old, %new, "moved");
        self.entries.insert(new, entry);
        Ok(())
    }

    /// Pin an entry so that eviction leaves it alone.
    pub fn pin(&mut self, addr: Addr) -> Result<()> {
        let entry = self.entry_mut(addr)?;
        if entry.pinned {
            return Err(CacheError::Pinned(addr).into());
        }
        entry.pinned = true;
        Ok(())
    }

    /// Unpin an entry.
    pub fn unpin(&mut self, addr: Addr) -> Result<()> {
        let entry = self.entry_mut(addr)?;
        if !entry.pinned {
            return Err(CacheError::NotPinned(addr).into());
        }
        entry.pinned = false;
        Ok(())
    }

    /// Mark an entry as needing to be written.
    pub fn mark_dirty(&mut self, addr: Addr) -> Result<()> {
        self.entry_mut(addr)?.dirty = true;
        Ok(())
    }

    /// Write every dirty entry to `store`, in ascending address order.
    pub async fn flush<S: MetadataStore>(&mut self, store: &mut S) -> Result<()> {
        let mut ctx = ClientContext {
            config: &self.config,
            heaps: &mut self.heaps,
        };
        let mut written = 0;
        for (addr, entry) in self.entries.iter_mut() {
            if !entry.dirty {
                continue;
            }
            if self.read_only {
                return Err(CacheError::ReadOnly(*addr).into());
            }
            if entry.protected {
                return Err(CacheError::Protected(*addr).into());
            }
            let len = entry.thing.image_len(&ctx);
            if len != entry.size {
                tracing::warn!(%addr, registered = entry.size, len, "image size differs from entry size");
                entry.size = len;
            }
            let mut image = vec![0; len];
            entry.thing.serialize(&ctx, &mut image)?;
            store.write(*addr, &image).await?;
            entry.dirty = false;
            entry.thing.notify(NotifyAction::AfterFlush, &mut ctx)?;
            written += 1;
        }
        tracing::debug!(written, "flushed cache");
        Ok(())
    }

    /// Flush, then drop every entry which is neither pinned nor protected.
    pub async fn evict<S: MetadataStore>(&mut self, store: &mut S) -> Result<()> {
        self.flush(store).await?;
        let victims: Vec<Addr> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned && !e.protected)
            .map(|(a, _)| *a)
            .collect();
        for addr in victims {
            self.destroy(addr, NotifyAction::BeforeEvict)?;
        }
        Ok(())
    }

    /// Drop every clean entry which is neither pinned nor protected. Nothing is written.
    pub fn evict_clean(&mut self) -> Result<()> {
        let victims: Vec<Addr> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned && !e.protected && !e.dirty)
            .map(|(a, _)| *a)
            .collect();
        for addr in victims {
            self.destroy(addr, NotifyAction::BeforeEvict)?;
        }
        Ok(())
    }

    /// Drop the entry at `addr` without writing it.
    pub fn expunge(&mut self, addr: Addr) -> Result<()> {
        let entry = self.entry(addr)?;
        if entry.protected {
            return Err(CacheError::Protected(addr).into());
        }
        if entry.pinned {
            return Err(CacheError::Pinned(addr).into());
        }
        tracing::debug!(%addr, client = %entry.thing.id(), "expunged");
        self.destroy(addr, NotifyAction::BeforeEvict)
    }

    fn destroy(&mut self, addr: Addr, action: NotifyAction) -> Result<()> {
        let mut entry = self
            .entries
            .remove(&addr)
            .ok_or(CacheError::NotResident(addr))?;
        let mut ctx = ClientContext {
            config: &self.config,
            heaps: &mut self.heaps,
        };
        entry.thing.notify(action, &mut ctx)?;
        entry.thing.free_icr(&mut ctx)
    }
}

#[cfg(test)]
pub(crate) mod tests;
