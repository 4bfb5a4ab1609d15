//! File handle
//!
//! This is the main data structure exposed by the library. It owns the storage file, the
//! metadata cache and the file space allocator of one open file.
//!

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use strum::{Display, EnumString};

use crate::btree::{self, BTreeShared};
use crate::cache::{CacheError, MetadataCache, MetadataStore};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{Addr, SIZEOF_MAGIC};
use crate::freespace::{self, FileSpace, FsBucket, FsLocation};
use crate::group::{self, EntryCache};
use crate::heap;
use crate::io::file::{FileHeader, StorageFile, HEADER_SIZE};
use crate::ohdr::{self, Message, MtimeNew, ObjectHeader, SymbolTable};

/// Field width used by the debug dumps.
pub const DEBUG_FIELD_WIDTH: usize = 40;

/// How a file is opened.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum OpenMode {
    /// Changes are written back on flush.
    ReadWrite,
    /// Nothing is ever written. The handle can follow a concurrent writer with
    /// [`Stratum::refresh`].
    ReadOnly,
}

/// Structures which can be printed with [`Stratum::debug`].
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DebugKind {
    /// Group B-tree node
    BTree,
    /// Symbol table node
    Snode,
    /// Local heap
    Heap,
    /// Object header
    Ohdr,
    /// Free space manager
    Fs,
}

/// An open file.
#[derive(Debug)]
pub struct Stratum {
    path: PathBuf,
    mode: OpenMode,
    storage: StorageFile,
    cache: MetadataCache,
    space: FileSpace,
    header: FileHeader,
    closed: bool,
}

impl Stratum {
    /// Create a new file at the specified path, containing an empty root group.
    pub async fn try_new<P: AsRef<Path>>(origin: P, config: FileConfig) -> Result<Self> {
        config.validate()?;
        let path: &Path = origin.as_ref();

        tracing::info!("Creating file at: {}", path.display());

        let storage = StorageFile::try_new(path).await?;
        let mut this = Self {
            path: path.into(),
            mode: OpenMode::ReadWrite,
            storage,
            cache: MetadataCache::new(config.clone(), false),
            space: FileSpace::new(&config, HEADER_SIZE),
            header: FileHeader::new(config),
            closed: false,
        };
        this.header.root = this.new_group_header().await?;
        this.flush().await?;
        Ok(this)
    }

    /// Open an existing file at the specified path.
    pub async fn try_open<P: AsRef<Path>>(origin: P, mode: OpenMode) -> Result<Self> {
        let path: &Path = origin.as_ref();

        tracing::info!("Opening file ({mode}) at: {}", path.display());

        let read_only = mode == OpenMode::ReadOnly;
        let mut storage = StorageFile::try_open(path, read_only).await?;
        let header = storage.read_header().await?;
        let mut cache = MetadataCache::new(header.config.clone(), read_only);
        let mut space =
            FileSpace::with_locations(&header.config, header.eoa, header.fs_locations.clone());
        if !read_only {
            space.open_managers(&mut cache, &mut storage).await?;
        }
        tracing::debug!(root = %header.root, eoa = header.eoa, "read file header");

        Ok(Self {
            path: path.into(),
            mode,
            storage,
            cache,
            space,
            header,
            closed: false,
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How the file was opened.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// File configuration.
    pub fn config(&self) -> &FileConfig {
        &self.header.config
    }

    /// Object header of the root group.
    pub fn root(&self) -> Addr {
        self.header.root
    }

    /// End of allocated file space.
    pub fn eoa(&self) -> u64 {
        self.space.eoa()
    }

    /// Where each persisted free space manager lives, as of the last flush or refresh.
    pub fn free_space_managers(&self) -> impl Iterator<Item = (&FsBucket, &FsLocation)> {
        self.header.fs_locations.iter()
    }

    /// The metadata cache.
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Write all changes to disk.
    ///
    /// Metadata goes first and the file header last, each followed by a sync, so that a reader
    /// following addresses from the header only ever finds structures which have been written.
    pub async fn flush(&mut self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Ok(());
        }
        self.space.persist(&mut self.cache)?;
        self.cache.flush(&mut self.storage).await?;
        self.storage.sync().await?;
        self.space.mark_serialized();

        self.header.eoa = self.space.eoa();
        self.header.fs_locations = self.space.locations().clone();
        self.storage.write_header(&self.header).await?;
        self.storage.sync().await?;
        tracing::info!(eoa = self.header.eoa, "flushed {}", self.path.display());
        Ok(())
    }

    /// Flush and close the file.
    pub async fn close(mut self) -> Result<()> {
        self.flush().await?;
        self.closed = true;
        Ok(())
    }

    /// Pick up changes made by a concurrent writer.
    ///
    /// Clean entries are dropped from the cache and the file header is read again. Only a read
    /// only handle can refresh.
    pub async fn refresh(&mut self) -> Result<()> {
        if self.mode != OpenMode::ReadOnly {
            return Err(MetadataError::bad_value(
                "only a read only file can be refreshed",
            ));
        }
        self.cache.evict_clean()?;
        let header = self.storage.read_header().await?;
        if header.config != self.header.config {
            return Err(MetadataError::bad_value(
                "file configuration changed underneath reader",
            ));
        }
        self.space =
            FileSpace::with_locations(&header.config, header.eoa, header.fs_locations.clone());
        tracing::debug!(root = %header.root, eoa = header.eoa, "refreshed file header");
        self.header = header;
        Ok(())
    }

    fn ensure_writable(&self, addr: Addr) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(CacheError::ReadOnly(addr).into()),
        }
    }

    // Object header for a new, empty group.
    async fn new_group_header(&mut self) -> Result<Addr> {
        let stab = group::create(&mut self.cache, &mut self.storage, &mut self.space).await?;
        let messages = vec![
            Message::SymbolTable(stab),
            Message::MtimeNew(MtimeNew {
                secs: Utc::now().timestamp(),
            }),
        ];
        ohdr::create(&mut self.cache, &mut self.space, messages)
    }

    /// The group B-tree and heap of the object at `addr`.
    pub async fn group_of(&mut self, addr: Addr) -> Result<SymbolTable> {
        let messages = ohdr::read_messages(&mut self.cache, &mut self.storage, addr).await?;
        messages
            .into_iter()
            .find_map(|(_, message)| match message {
                Message::SymbolTable(stab) => Some(stab),
                _ => None,
            })
            .ok_or_else(|| MetadataError::bad_value(format!("object at {addr} is not a group")))
    }

    /// Create a group called `name` in the group `parent`. Returns the new group's object
    /// header.
    pub async fn create_group(&mut self, parent: Addr, name: &str) -> Result<Addr> {
        self.ensure_writable(parent)?;
        let parent_stab = self.group_of(parent).await?;
        let addr = self.new_group_header().await?;
        let stab = self.group_of(addr).await?;
        let hint = EntryCache::Stab {
            btree: stab.btree,
            heap: stab.heap,
        };
        group::insert(
            &mut self.cache,
            &mut self.storage,
            &mut self.space,
            &parent_stab,
            name,
            addr,
            hint,
        )
        .await?;
        tracing::debug!(%parent, name, %addr, "created group");
        Ok(addr)
    }

    /// Link the object at `target` into the group `parent` as `name`.
    pub async fn insert_link(&mut self, parent: Addr, name: &str, target: Addr) -> Result<()> {
        self.ensure_writable(parent)?;
        let parent_stab = self.group_of(parent).await?;
        self.cache
            .load::<ObjectHeader, _>(&mut self.storage, target, &())
            .await?;
        group::insert(
            &mut self.cache,
            &mut self.storage,
            &mut self.space,
            &parent_stab,
            name,
            target,
            EntryCache::Nothing,
        )
        .await?;
        self.cache.get_mut::<ObjectHeader>(target)?.nlink += 1;
        self.cache.mark_dirty(target)
    }

    /// Object header linked as `name` in the group `parent`.
    pub async fn lookup(&mut self, parent: Addr, name: &str) -> Result<Option<Addr>> {
        let stab = self.group_of(parent).await?;
        let entry = group::lookup(&mut self.cache, &mut self.storage, &stab, name).await?;
        Ok(entry.map(|e| e.header))
    }

    /// Object header at a `/` separated path from the root group.
    pub async fn lookup_path(&mut self, path: &str) -> Result<Option<Addr>> {
        let mut addr = self.root();
        for name in path.split('/').filter(|n| !n.is_empty()) {
            match self.lookup(addr, name).await? {
                Some(next) => addr = next,
                None => return Ok(None),
            }
        }
        Ok(Some(addr))
    }

    /// Every link in the group `parent`, in name order.
    pub async fn links(&mut self, parent: Addr) -> Result<Vec<(String, Addr)>> {
        let stab = self.group_of(parent).await?;
        let links = group::links(&mut self.cache, &mut self.storage, &stab).await?;
        Ok(links
            .into_iter()
            .map(|(name, entry)| (name, entry.header))
            .collect())
    }

    /// Messages in the object header at `addr`.
    pub async fn messages(&mut self, addr: Addr) -> Result<Vec<Message>> {
        let messages = ohdr::read_messages(&mut self.cache, &mut self.storage, addr).await?;
        Ok(messages.into_iter().map(|(_, m)| m).collect())
    }

    /// Print the structure of `kind` at `addr`.
    pub async fn debug(&mut self, addr: Addr, kind: DebugKind, out: &mut dyn Write) -> Result<()> {
        let fwidth = DEBUG_FIELD_WIDTH;
        match kind {
            DebugKind::BTree => {
                let shared = BTreeShared::group(self.config());
                btree::debug(&mut self.cache, &mut self.storage, &shared, addr, out, 0, fwidth)
                    .await
            }
            DebugKind::Snode => self.symbol_node_debug(addr, None, out).await,
            DebugKind::Heap => {
                heap::debug(&mut self.cache, &mut self.storage, addr, out, 0, fwidth).await
            }
            DebugKind::Ohdr => self.object_header_debug(addr, out).await,
            DebugKind::Fs => self.sects_debug(addr, out).await,
        }
    }

    /// Work out which kind of structure is stored at `addr` from its signature.
    ///
    /// Anything without a recognised signature is assumed to be an object header. Only what
    /// has been written to storage is examined.
    pub async fn detect(&mut self, addr: Addr) -> Result<DebugKind> {
        if self.space.locations().values().any(|loc| loc.addr == addr) {
            return Ok(DebugKind::Fs);
        }
        let magic = self.storage.read(addr, SIZEOF_MAGIC).await?;
        let kind = match &magic[..] {
            b"TREE" => DebugKind::BTree,
            b"SNOD" => DebugKind::Snode,
            b"HEAP" => DebugKind::Heap,
            b"FSSE" => DebugKind::Fs,
            _ => DebugKind::Ohdr,
        };
        tracing::debug!(%addr, %kind, "detected structure");
        Ok(kind)
    }

    /// Print the symbol table node at `addr`, resolving link names through the local heap at
    /// `heap` when one is given.
    pub async fn symbol_node_debug(
        &mut self,
        addr: Addr,
        heap: Option<Addr>,
        out: &mut dyn Write,
    ) -> Result<()> {
        group::debug(
            &mut self.cache,
            &mut self.storage,
            addr,
            heap,
            out,
            0,
            DEBUG_FIELD_WIDTH,
        )
        .await
    }

    /// Print the object header at `addr` and its messages.
    pub async fn object_header_debug(&mut self, addr: Addr, out: &mut dyn Write) -> Result<()> {
        ohdr::debug(
            &mut self.cache,
            &mut self.storage,
            addr,
            out,
            0,
            DEBUG_FIELD_WIDTH,
        )
        .await
    }

    /// Print the sections of the free space manager stored at `manager_addr`.
    pub async fn sects_debug(&mut self, manager_addr: Addr, out: &mut dyn Write) -> Result<()> {
        freespace::sects_debug(
            &mut self.cache,
            &mut self.storage,
            &self.space,
            manager_addr,
            out,
            0,
            DEBUG_FIELD_WIDTH,
        )
        .await
    }

    /// Print the file header.
    pub fn header_debug(&self, out: &mut dyn Write) -> Result<()> {
        let w = DEBUG_FIELD_WIDTH;
        let config = &self.header.config;
        writeln!(out, "File Header...")?;
        writeln!(out, "{:<w$} {}", "File name:", self.path.display())?;
        writeln!(out, "{:<w$} {}", "Version:", self.header.version)?;
        writeln!(out, "{:<w$} {}", "Size of file offsets:", config.sizeof_addr)?;
        writeln!(out, "{:<w$} {}", "Size of file lengths:", config.sizeof_size)?;
        writeln!(out, "{:<w$} {}", "Byte order:", config.byte_order)?;
        writeln!(out, "{:<w$} {}", "Symbol table leaf node 1/2 rank:", config.sym_leaf_k)?;
        writeln!(out, "{:<w$} {}", "Group B-tree 1/2 rank:", config.group_btree_k)?;
        writeln!(out, "{:<w$} {}", "Chunk B-tree 1/2 rank:", config.chunk_btree_k)?;
        match config.page_size {
            Some(page) => writeln!(out, "{:<w$} {}", "File space page size:", page)?,
            None => writeln!(out, "{:<w$} none", "File space page size:")?,
        }
        writeln!(out, "{:<w$} {}", "End of allocated space:", self.header.eoa)?;
        writeln!(out, "{:<w$} {}", "Root object header address:", self.header.root)?;
        for (bucket, loc) in &self.header.fs_locations {
            writeln!(
                out,
                "{:<w$} {} ({} bytes)",
                format!("Free space manager ({bucket}):"),
                loc.addr,
                loc.size
            )?;
        }
        Ok(())
    }
}

impl Drop for Stratum {
    fn drop(&mut self) {
        if self.closed || self.mode == OpenMode::ReadOnly {
            return;
        }
        std::thread::scope(|s| {
            let hdl = s.spawn(|| match tokio::runtime::Builder::new_current_thread().build() {
                Ok(runtime) => {
                    if let Err(e) = runtime.block_on(self.flush()) {
                        tracing::warn!("could not flush file to disk: {}", e);
                    }
                }
                Err(e) => tracing::warn!("could not start runtime to flush file: {}", e),
            });
            if hdl.join().is_err() {
                tracing::error!("flush on drop panicked");
            }
        });
    }
}

#[cfg(test)]
mod tests;
