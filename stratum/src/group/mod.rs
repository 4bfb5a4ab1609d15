//! Groups
//!
//! A group maps link names to object headers. Names live in the group's local heap. The group's
//! B-tree is keyed by heap offsets of names and its leaf children are symbol table nodes, each
//! holding a sorted run of [`SymbolEntry`] records.
//!
//! Link insertion works within one level of the B-tree: new names are added to the symbol node
//! which covers them, or appended in a new symbol node after the last one. Nodes are never split.

pub use self::node::SymbolNode;

mod node;

use std::cmp::Ordering;
use std::io::Write;
use std::ops::ControlFlow;

use crate::btree::{self, BTreeNode, BTreeShared, NativeKey};
use crate::cache::{MetadataCache, MetadataStore};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{Addr, Decoder, Encoder};
use crate::freespace::{FileAllocator, MemType};
use crate::heap::{self, HeapId};
use crate::ohdr::SymbolTable;

/// Initial size of a new group's local heap.
pub const HEAP_SIZE_HINT: u64 = 256;

const SCRATCH_SIZE: usize = 16;

/// Information cached in a symbol table entry, saving a trip to the object header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryCache {
    /// Nothing cached
    Nothing,
    /// The object is a group with this B-tree and heap
    Stab {
        /// Group B-tree
        btree: Addr,
        /// Group heap
        heap: Addr,
    },
    /// The link is symbolic; its value is at this heap offset
    SymLink {
        /// Heap offset of the link value
        offset: u32,
    },
}

impl EntryCache {
    fn id(&self) -> u32 {
        match self {
            EntryCache::Nothing => 0,
            EntryCache::Stab { .. } => 1,
            EntryCache::SymLink { .. } => 2,
        }
    }
}

/// One link in a symbol table node.
///
/// ```text
/// [name offset] [object header address] [cache type: u32] [reserved: u32] [16 byte scratch pad]
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Heap offset of the link name
    pub name_off: u64,
    /// Object header of the link target
    pub header: Addr,
    /// Cached information about the target
    pub cache: EntryCache,
}

impl SymbolEntry {
    /// Encoded size of an entry.
    pub fn raw_size(config: &FileConfig) -> usize {
        config.sizeof_size() + config.sizeof_addr() + 4 + 4 + SCRATCH_SIZE
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.ensure(Self::raw_size(dec.config()))?;
        let name_off = dec.length()?;
        let header = dec.addr()?;
        let kind = dec.u32()?;
        dec.skip(4)?;

        let scratch = dec.position();
        let cache = match kind {
            0 => EntryCache::Nothing,
            1 => EntryCache::Stab {
                btree: dec.addr()?,
                heap: dec.addr()?,
            },
            2 => EntryCache::SymLink { offset: dec.u32()? },
            other => {
                return Err(MetadataError::bad_value(format!(
                    "unknown symbol table entry cache type {other}"
                )))
            }
        };
        dec.seek(scratch + SCRATCH_SIZE)?;
        Ok(Self {
            name_off,
            header,
            cache,
        })
    }

    pub(crate) fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        enc.length(self.name_off)?;
        enc.addr(self.header)?;
        enc.u32(self.cache.id())?;
        enc.u32(0)?;

        let scratch = enc.position();
        match self.cache {
            EntryCache::Nothing => (),
            EntryCache::Stab { btree, heap } => {
                enc.addr(btree)?;
                enc.addr(heap)?;
            }
            EntryCache::SymLink { offset } => enc.u32(offset)?,
        }
        enc.zeros(scratch + SCRATCH_SIZE - enc.position())
    }
}

/// Create the B-tree and local heap of an empty group.
///
/// The heap starts with an empty name at offset 0, which serves as the left-most B-tree key.
pub async fn create<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    space: &mut dyn FileAllocator,
) -> Result<SymbolTable> {
    let shared = BTreeShared::group(cache.config());
    let btree = btree::create(cache, space, &shared)?;
    let heap_addr = heap::create(cache, space, HEAP_SIZE_HINT)?;

    let id = heap::protect(cache, store, heap_addr).await?;
    let inserted = heap::insert(cache, space, id, b"\0");
    heap::unprotect(cache, id)?;
    let offset = inserted?;
    if offset != 0 {
        return Err(MetadataError::bad_value(format!(
            "empty name stored at heap offset {offset}"
        )));
    }
    tracing::debug!(%btree, heap = %heap_addr, "created group");
    Ok(SymbolTable {
        btree,
        heap: heap_addr,
    })
}

/// Find the entry for `name`.
pub async fn lookup<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    stab: &SymbolTable,
    name: &str,
) -> Result<Option<SymbolEntry>> {
    let id = heap::protect(cache, store, stab.heap).await?;
    let found = lookup_in(cache, store, stab, id, name).await;
    heap::unprotect(cache, id)?;
    found
}

async fn lookup_in<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    stab: &SymbolTable,
    id: HeapId,
    name: &str,
) -> Result<Option<SymbolEntry>> {
    let shared = BTreeShared::group(cache.config());
    let names = cache.heaps().heap(id)?.data().to_vec();
    let found = btree::find(cache, store, &shared, stab.btree, |left, right| {
        compare_name(&names, name, left, right)
    })
    .await?;
    let Some(found) = found else {
        return Ok(None);
    };

    cache
        .load::<SymbolNode, S>(store, found.child, &())
        .await?;
    for entry in cache.get::<SymbolNode>(found.child)?.entries() {
        if name_in(&names, entry.name_off)? == name {
            return Ok(Some(entry.clone()));
        }
    }
    Ok(None)
}

/// Add a link called `name` to the object header at `header`.
pub async fn insert<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    space: &mut dyn FileAllocator,
    stab: &SymbolTable,
    name: &str,
    header: Addr,
    hint: EntryCache,
) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(MetadataError::bad_value(format!(
            "invalid link name {name:?}"
        )));
    }
    let id = heap::protect(cache, store, stab.heap).await?;
    let inserted = insert_in(cache, store, space, stab, id, name, header, hint).await;
    heap::unprotect(cache, id)?;
    inserted
}

#[allow(clippy::too_many_arguments)]
async fn insert_in<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    space: &mut dyn FileAllocator,
    stab: &SymbolTable,
    id: HeapId,
    name: &str,
    header: Addr,
    hint: EntryCache,
) -> Result<()> {
    if lookup_in(cache, store, stab, id, name).await?.is_some() {
        return Err(MetadataError::bad_value(format!(
            "link {name:?} already exists"
        )));
    }

    let mut stored = name.as_bytes().to_vec();
    stored.push(0);
    let name_off = heap::insert(cache, space, id, &stored)?;
    let entry = SymbolEntry {
        name_off,
        header,
        cache: hint,
    };

    let shared = BTreeShared::group(cache.config());
    let capacity = SymbolNode::capacity(cache.config());
    let names = cache.heaps().heap(id)?.data().to_vec();
    let found = btree::find(cache, store, &shared, stab.btree, |left, right| {
        compare_name(&names, name, left, right)
    })
    .await?;

    match found {
        Some(found) => {
            let node = cache
                .protect::<SymbolNode, S>(store, found.child, &())
                .await?;
            if node.entries.len() >= capacity {
                cache.unprotect(found.child, false)?;
                return Err(MetadataError::bad_value(format!(
                    "symbol table node at {} is full",
                    found.child
                )));
            }
            let mut idx = Ok(node.entries.len());
            for (i, e) in node.entries.iter().enumerate() {
                match name_in(&names, e.name_off) {
                    Ok(n) if n > name => {
                        idx = Ok(i);
                        break;
                    }
                    Ok(_) => (),
                    Err(err) => {
                        idx = Err(err);
                        break;
                    }
                }
            }
            match idx {
                Ok(i) => {
                    node.entries.insert(i, entry);
                    cache.unprotect(found.child, true)
                }
                Err(e) => {
                    cache.unprotect(found.child, false)?;
                    Err(e)
                }
            }
        }
        None => {
            cache
                .protect::<BTreeNode, S>(store, stab.btree, &shared)
                .await?;
            let appended = append(cache, store, space, stab.btree, capacity, entry).await;
            cache.unprotect(stab.btree, appended.is_ok())?;
            appended
        }
    }
}

// Add an entry which sorts after every name in the tree. The root must be protected.
async fn append<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    space: &mut dyn FileAllocator,
    root: Addr,
    capacity: usize,
    entry: SymbolEntry,
) -> Result<()> {
    let key = NativeKey::Group {
        heap_offset: entry.name_off,
    };
    let node = cache.get::<BTreeNode>(root)?;
    if node.level() != 0 {
        return Err(MetadataError::bad_value(
            "link insertion into multi-level group B-trees is not supported",
        ));
    }
    let (last, full) = (node.children().last().copied(), node.is_full());

    if let Some(last) = last {
        let snod = cache.protect::<SymbolNode, S>(store, last, &()).await?;
        if snod.entries.len() < capacity {
            snod.entries.push(entry);
            cache.unprotect(last, true)?;
            if let Some(right) = cache.get_mut::<BTreeNode>(root)?.keys_mut().last_mut() {
                *right = key;
            }
            return Ok(());
        }
        cache.unprotect(last, false)?;
    }

    if full {
        return Err(MetadataError::bad_value(format!(
            "group B-tree at {root} is full"
        )));
    }
    let addr = space.alloc(MemType::BTree, SymbolNode::image_size(cache.config()) as u64)?;
    cache.insert(addr, SymbolNode::new(vec![entry]), false)?;
    let node = cache.get_mut::<BTreeNode>(root)?;
    if node.children().is_empty() {
        node.push_first(NativeKey::Group { heap_offset: 0 });
    }
    node.push(addr, key);
    tracing::debug!(%addr, btree = %root, "added symbol table node");
    Ok(())
}

/// Every link in the group, in name order.
pub async fn links<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    stab: &SymbolTable,
) -> Result<Vec<(String, SymbolEntry)>> {
    let shared = BTreeShared::group(cache.config());
    let mut nodes = vec![];
    let _ = btree::iterate(cache, store, &shared, stab.btree, |_, child, _| {
        nodes.push(child);
        ControlFlow::Continue(())
    })
    .await?;

    let id = heap::protect(cache, store, stab.heap).await?;
    let names = cache.heaps().heap(id).map(|h| h.data().to_vec());
    heap::unprotect(cache, id)?;
    let names = names?;

    let mut links = vec![];
    for addr in nodes {
        cache.load::<SymbolNode, S>(store, addr, &()).await?;
        for entry in cache.get::<SymbolNode>(addr)?.entries() {
            links.push((name_in(&names, entry.name_off)?.to_string(), entry.clone()));
        }
    }
    Ok(links)
}

/// Print the symbol table node at `addr`. With the group's `heap`, link names are printed too.
pub async fn debug<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    addr: Addr,
    heap: Option<Addr>,
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
) -> Result<()> {
    cache.load::<SymbolNode, S>(store, addr, &()).await?;
    let entries = cache.get::<SymbolNode>(addr)?.entries().to_vec();
    let names = match heap {
        Some(heap_addr) => {
            let id = heap::protect(cache, store, heap_addr).await?;
            let names = cache.heaps().heap(id).map(|h| h.data().to_vec());
            heap::unprotect(cache, id)?;
            Some(names?)
        }
        None => None,
    };

    writeln!(out, "{:indent$}Symbol Table Node...", "")?;
    writeln!(
        out,
        "{:indent$}{:<fwidth$} {}/{}",
        "",
        "Number of Symbols:",
        entries.len(),
        SymbolNode::capacity(cache.config())
    )?;
    let (inner, inner_width) = (indent + 3, fwidth.saturating_sub(3));
    for (i, entry) in entries.iter().enumerate() {
        writeln!(out, "{:indent$}Symbol {i}:", "")?;
        if let Some(names) = &names {
            match name_in(names, entry.name_off) {
                Ok(name) => writeln!(out, "{:inner$}{:<inner_width$} `{}'", "", "Name:", name)?,
                Err(e) => tracing::warn!(offset = entry.name_off, "bad link name: {e}"),
            }
        }
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Name offset into private heap:", entry.name_off)?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Object header address:", entry.header)?;
        match &entry.cache {
            EntryCache::Nothing => {
                writeln!(out, "{:inner$}{:<inner_width$} Nothing Cached", "", "Cache info type:")?
            }
            EntryCache::Stab { btree, heap } => {
                writeln!(out, "{:inner$}{:<inner_width$} Symbol Table", "", "Cache info type:")?;
                writeln!(out, "{:inner$}{:<inner_width$} {}", "", "B-tree address:", btree)?;
                writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Heap address:", heap)?;
            }
            EntryCache::SymLink { offset } => {
                writeln!(out, "{:inner$}{:<inner_width$} Symbolic Link", "", "Cache info type:")?;
                writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Link value offset:", offset)?;
            }
        }
    }
    Ok(())
}

fn name_in(data: &[u8], offset: u64) -> Result<&str> {
    let bytes = data.get(offset as usize..).ok_or_else(|| {
        MetadataError::bad_value(format!("name offset {offset} is outside the heap"))
    })?;
    let end = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| MetadataError::bad_value(format!("unterminated name at offset {offset}")))?;
    std::str::from_utf8(&bytes[..end])
        .map_err(|_| MetadataError::bad_value(format!("name at offset {offset} is not UTF-8")))
}

// A name belongs to the child between two keys when left < name <= right.
fn compare_name(
    names: &[u8],
    name: &str,
    left: &NativeKey,
    right: &NativeKey,
) -> Result<Ordering> {
    let (NativeKey::Group { heap_offset: l }, NativeKey::Group { heap_offset: r }) = (left, right)
    else {
        return Err(MetadataError::bad_value("chunk key in group B-tree"));
    };
    if name <= name_in(names, *l)? {
        Ok(Ordering::Less)
    } else if name > name_in(names, *r)? {
        Ok(Ordering::Greater)
    } else {
        Ok(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::freespace::FileSpace;
    use crate::heap::HeapPrefix;

    struct Fixture {
        cache: MetadataCache,
        store: MemoryStore,
        space: FileSpace,
        stab: SymbolTable,
    }

    async fn fixture(sym_leaf_k: u16, group_btree_k: u16) -> Fixture {
        let config = FileConfig {
            sym_leaf_k,
            group_btree_k,
            ..Default::default()
        };
        let mut cache = MetadataCache::new(config.clone(), false);
        let mut store = MemoryStore::new();
        let mut space = FileSpace::new(&config, 512);
        let stab = create(&mut cache, &mut store, &mut space)
            .await
            .expect("creates group");
        Fixture {
            cache,
            store,
            space,
            stab,
        }
    }

    async fn add(f: &mut Fixture, name: &str, header: u64) -> Result<()> {
        insert(
            &mut f.cache,
            &mut f.store,
            &mut f.space,
            &f.stab,
            name,
            Addr::new(header),
            EntryCache::Nothing,
        )
        .await
    }

    #[test_log::test(tokio::test)]
    async fn it_inserts_and_looks_up() {
        let mut f = fixture(4, 16).await;
        for (i, name) in ["delta", "alpha", "charlie", "bravo"].iter().enumerate() {
            add(&mut f, name, 1000 + i as u64).await.expect("inserts");
        }
        let found = lookup(&mut f.cache, &mut f.store, &f.stab, "charlie")
            .await
            .expect("looks up")
            .expect("found");
        assert_eq!(found.header, Addr::new(1002));
        assert_eq!(
            lookup(&mut f.cache, &mut f.store, &f.stab, "echo")
                .await
                .expect("looks up"),
            None
        );

        let names: Vec<String> = links(&mut f.cache, &mut f.store, &f.stab)
            .await
            .expect("lists")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie", "delta"]);
    }

    #[tokio::test]
    async fn it_rejects_duplicates_and_bad_names() {
        let mut f = fixture(4, 16).await;
        add(&mut f, "alpha", 1000).await.expect("inserts");
        assert!(matches!(
            add(&mut f, "alpha", 2000).await,
            Err(MetadataError::BadValue(_))
        ));
        assert!(add(&mut f, "", 2000).await.is_err());
        assert!(add(&mut f, "a\0b", 2000).await.is_err());
        // heap protection is released on failure
        let id = f
            .cache
            .get::<HeapPrefix>(f.stab.heap)
            .expect("heap prefix")
            .heap();
        assert_eq!(f.cache.heaps().heap(id).expect("heap").prots(), 0);
        assert!(!f.cache.is_protected(f.stab.heap).expect("resident"));
    }

    #[tokio::test]
    async fn it_appends_symbol_nodes() {
        let mut f = fixture(1, 16).await;
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            add(&mut f, name, 1000 + i as u64).await.expect("inserts");
        }
        let root = f.cache.get::<BTreeNode>(f.stab.btree).expect("root");
        assert_eq!(root.children().len(), 3);
        assert_eq!(root.keys().len(), 4);

        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let found = lookup(&mut f.cache, &mut f.store, &f.stab, name)
                .await
                .expect("looks up")
                .expect("found");
            assert_eq!(found.header, Addr::new(1000 + i as u64));
        }

        // a name between two full nodes has nowhere to go
        assert!(matches!(
            add(&mut f, "bb", 2000).await,
            Err(MetadataError::BadValue(_))
        ));
    }

    #[tokio::test]
    async fn it_fills_the_tree() {
        let mut f = fixture(1, 1).await;
        add(&mut f, "a", 1000).await.expect("inserts");
        add(&mut f, "b", 1001).await.expect("inserts");
        add(&mut f, "c", 1002).await.expect("inserts");
        add(&mut f, "d", 1003).await.expect("inserts");
        assert!(matches!(
            add(&mut f, "e", 1004).await,
            Err(MetadataError::BadValue(_))
        ));
    }

    #[tokio::test]
    async fn it_reads_group_back() {
        let mut f = fixture(4, 16).await;
        for name in ["one", "two", "three"] {
            add(&mut f, name, 4096).await.expect("inserts");
        }
        f.cache.evict(&mut f.store).await.expect("evicts");
        assert!(f.cache.is_empty());

        let names: Vec<String> = links(&mut f.cache, &mut f.store, &f.stab)
            .await
            .expect("lists")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn it_prints_symbol_node() {
        let mut f = fixture(4, 16).await;
        add(&mut f, "alpha", 800).await.expect("adds");
        let shared = BTreeShared::group(f.cache.config());
        let mut nodes = vec![];
        let _ = btree::iterate(&mut f.cache, &mut f.store, &shared, f.stab.btree, |_, c, _| {
            nodes.push(c);
            ControlFlow::Continue(())
        })
        .await
        .expect("iterates");

        let mut out = vec![];
        let heap = Some(f.stab.heap);
        debug(&mut f.cache, &mut f.store, nodes[0], heap, &mut out, 0, 32)
            .await
            .expect("prints");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("Symbol Table Node...\n"));
        assert!(text.contains("1/8"));
        assert!(text.contains("`alpha'"));
        assert!(text.contains("Nothing Cached"));
    }
}
