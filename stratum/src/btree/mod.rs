//! B-trees
//!
//! Version 1 B-tree nodes index either group symbol table nodes or dataset chunks. Every node of
//! a tree shares one [`BTreeShared`] descriptor, which fixes the key format and the node size.
//!
//! Node layout:
//!
//! ```text
//! "TREE" [type] [level] [nchildren: u16] [left sibling] [right sibling]
//! [key 0] [child 0] [key 1] [child 1] ... [child n-1] [key n]
//! zero padding to the node size
//! ```

pub use self::node::BTreeNode;

mod node;

use std::cmp::Ordering;
use std::fmt;
use std::io::Write;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::cache::{MetadataCache, MetadataStore};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{Addr, Decoder, Encoder};
use crate::freespace::{FileAllocator, MemType};

/// Kind of B-tree, which selects the key format.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum BTreeKind {
    /// Keys are link name offsets into a local heap
    Group,
    /// Keys describe dataset chunks
    Chunk,
}

impl BTreeKind {
    /// Type byte stored in each node.
    pub fn id(self) -> u8 {
        match self {
            BTreeKind::Group => 0,
            BTreeKind::Chunk => 1,
        }
    }
}

/// A decoded B-tree key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeKey {
    /// Offset of a link name in the group's local heap
    Group {
        /// Heap offset
        heap_offset: u64,
    },
    /// Chunk description
    Chunk {
        /// Size of the stored chunk
        nbytes: u32,
        /// Filters which were skipped for this chunk
        filter_mask: u32,
        /// Chunk origin, one entry per dimension plus one
        offsets: Vec<u64>,
    },
}

/// Information shared by every node of one tree.
#[derive(Debug, PartialEq, Eq)]
pub struct BTreeShared {
    kind: BTreeKind,
    two_k: usize,
    sizeof_rkey: usize,
    sizeof_rnode: usize,
    chunk_dims: Vec<u64>,
}

impl BTreeShared {
    /// Descriptor for a group tree.
    pub fn group(config: &FileConfig) -> Arc<Self> {
        Self::build(config, BTreeKind::Group, vec![])
    }

    /// Descriptor for a chunk tree of a dataset with chunks of `chunk_dims`.
    pub fn chunk(config: &FileConfig, chunk_dims: Vec<u64>) -> Arc<Self> {
        Self::build(config, BTreeKind::Chunk, chunk_dims)
    }

    fn build(config: &FileConfig, kind: BTreeKind, chunk_dims: Vec<u64>) -> Arc<Self> {
        let two_k = 2 * config.btree_k(kind) as usize;
        let sizeof_rkey = match kind {
            BTreeKind::Group => config.sizeof_size(),
            // nbytes, filter mask, then one offset per dimension plus one
            BTreeKind::Chunk => 4 + 4 + 8 * (chunk_dims.len() + 1),
        };
        let sizeof_addr = config.sizeof_addr();
        let sizeof_rnode =
            8 + 2 * sizeof_addr + two_k * sizeof_addr + (two_k + 1) * sizeof_rkey;
        Arc::new(Self {
            kind,
            two_k,
            sizeof_rkey,
            sizeof_rnode,
            chunk_dims,
        })
    }

    /// Tree kind.
    pub fn kind(&self) -> BTreeKind {
        self.kind
    }

    /// Maximum children per node.
    pub fn two_k(&self) -> usize {
        self.two_k
    }

    /// Encoded key size.
    pub fn sizeof_rkey(&self) -> usize {
        self.sizeof_rkey
    }

    /// Encoded node size.
    pub fn sizeof_rnode(&self) -> usize {
        self.sizeof_rnode
    }

    /// Chunk dimensions, for chunk trees.
    pub fn chunk_dims(&self) -> &[u64] {
        &self.chunk_dims
    }

    fn decode_key(&self, dec: &mut Decoder<'_>) -> Result<NativeKey> {
        dec.ensure(self.sizeof_rkey)?;
        match self.kind {
            BTreeKind::Group => Ok(NativeKey::Group {
                heap_offset: dec.length()?,
            }),
            BTreeKind::Chunk => {
                let nbytes = dec.u32()?;
                let filter_mask = dec.u32()?;
                let offsets = (0..=self.chunk_dims.len())
                    .map(|_| dec.u64())
                    .collect::<Result<Vec<u64>>>()?;
                Ok(NativeKey::Chunk {
                    nbytes,
                    filter_mask,
                    offsets,
                })
            }
        }
    }

    fn encode_key(&self, enc: &mut Encoder<'_>, key: &NativeKey) -> Result<()> {
        match (self.kind, key) {
            (BTreeKind::Group, NativeKey::Group { heap_offset }) => enc.length(*heap_offset),
            (
                BTreeKind::Chunk,
                NativeKey::Chunk {
                    nbytes,
                    filter_mask,
                    offsets,
                },
            ) => {
                if offsets.len() != self.chunk_dims.len() + 1 {
                    return Err(MetadataError::bad_value(format!(
                        "chunk key has {} offsets, tree needs {}",
                        offsets.len(),
                        self.chunk_dims.len() + 1
                    )));
                }
                enc.u32(*nbytes)?;
                enc.u32(*filter_mask)?;
                offsets.iter().try_for_each(|o| enc.u64(*o))
            }
            _ => Err(MetadataError::bad_value(format!(
                "key {key:?} does not belong in a {} tree",
                self.kind
            ))),
        }
    }
}

/// A child found by [`find`], with the keys either side of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundChild {
    /// Key before the child
    pub left: NativeKey,
    /// Child address
    pub child: Addr,
    /// Key after the child
    pub right: NativeKey,
}

/// Allocate and cache an empty leaf. Returns its address.
pub fn create(
    cache: &mut MetadataCache,
    space: &mut dyn FileAllocator,
    shared: &Arc<BTreeShared>,
) -> Result<Addr> {
    let addr = space.alloc(MemType::BTree, shared.sizeof_rnode as u64)?;
    cache.insert(addr, BTreeNode::new(shared.clone(), 0), false)?;
    tracing::debug!(%addr, kind = %shared.kind, "created B-tree");
    Ok(addr)
}

/// Search from `root` for the leaf child whose key range `cmp` accepts.
///
/// `cmp` is given the keys either side of a child and says whether the target sorts before
/// them, between them or after them.
pub async fn find<S, F>(
    cache: &mut MetadataCache,
    store: &mut S,
    shared: &Arc<BTreeShared>,
    root: Addr,
    mut cmp: F,
) -> Result<Option<FoundChild>>
where
    S: MetadataStore,
    F: FnMut(&NativeKey, &NativeKey) -> Result<Ordering>,
{
    let mut addr = root;
    loop {
        cache.load::<BTreeNode, S>(store, addr, shared).await?;
        let node = cache.get::<BTreeNode>(addr)?;
        let (mut lt, mut rt) = (0, node.children().len());
        let mut found = None;
        while lt < rt {
            let idx = (lt + rt) / 2;
            match cmp(&node.keys()[idx], &node.keys()[idx + 1])? {
                Ordering::Less => rt = idx,
                Ordering::Greater => lt = idx + 1,
                Ordering::Equal => {
                    found = Some(idx);
                    break;
                }
            }
        }
        let Some(idx) = found else {
            return Ok(None);
        };
        if node.level() == 0 {
            return Ok(Some(FoundChild {
                left: node.keys()[idx].clone(),
                child: node.children()[idx],
                right: node.keys()[idx + 1].clone(),
            }));
        }
        addr = node.children()[idx];
    }
}

/// Visit every leaf child, left to right, until `f` breaks.
pub async fn iterate<S, F>(
    cache: &mut MetadataCache,
    store: &mut S,
    shared: &Arc<BTreeShared>,
    root: Addr,
    mut f: F,
) -> Result<ControlFlow<()>>
where
    S: MetadataStore,
    F: FnMut(&NativeKey, Addr, &NativeKey) -> ControlFlow<()>,
{
    // leftmost path down to level 0
    let mut addr = root;
    loop {
        cache.load::<BTreeNode, S>(store, addr, shared).await?;
        let node = cache.get::<BTreeNode>(addr)?;
        if node.level() == 0 {
            break;
        }
        match node.children().first() {
            Some(child) => addr = *child,
            None => return Ok(ControlFlow::Continue(())),
        }
    }

    while addr.is_defined() {
        cache.load::<BTreeNode, S>(store, addr, shared).await?;
        let node = cache.get::<BTreeNode>(addr)?;
        for (i, child) in node.children().iter().enumerate() {
            if f(&node.keys()[i], *child, &node.keys()[i + 1]).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        addr = node.right();
    }
    Ok(ControlFlow::Continue(()))
}

/// A chunk located by [`find_chunk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Chunk address
    pub addr: Addr,
    /// Stored size
    pub nbytes: u32,
    /// Skipped filters
    pub filter_mask: u32,
    /// Chunk origin
    pub offsets: Vec<u64>,
}

/// Find the chunk containing the element at `coords`.
pub async fn find_chunk<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    shared: &Arc<BTreeShared>,
    root: Addr,
    coords: &[u64],
) -> Result<Option<ChunkRecord>> {
    if shared.kind != BTreeKind::Chunk || coords.len() != shared.chunk_dims.len() {
        return Err(MetadataError::bad_value(format!(
            "{} coordinates don't address a {} tree of rank {}",
            coords.len(),
            shared.kind,
            shared.chunk_dims.len()
        )));
    }
    let rank = coords.len();
    let origin = |key: &NativeKey| -> Result<Vec<u64>> {
        match key {
            NativeKey::Chunk { offsets, .. } => Ok(offsets[..rank].to_vec()),
            NativeKey::Group { .. } => Err(MetadataError::bad_value("group key in chunk tree")),
        }
    };
    let found = find(cache, store, shared, root, |left, right| {
        let coords = coords.to_vec();
        if coords < origin(left)? {
            Ok(Ordering::Less)
        } else if coords >= origin(right)? {
            Ok(Ordering::Greater)
        } else {
            Ok(Ordering::Equal)
        }
    })
    .await?;

    let Some(found) = found else {
        return Ok(None);
    };
    let NativeKey::Chunk {
        nbytes,
        filter_mask,
        offsets,
    } = found.left
    else {
        return Err(MetadataError::bad_value("group key in chunk tree"));
    };
    let inside = coords
        .iter()
        .zip(offsets.iter().zip(shared.chunk_dims.iter()))
        .all(|(c, (o, d))| *c >= *o && *c < o + d);
    if !inside {
        return Ok(None);
    }
    Ok(Some(ChunkRecord {
        addr: found.child,
        nbytes,
        filter_mask,
        offsets,
    }))
}

impl fmt::Display for NativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeKey::Group { heap_offset } => write!(f, "heap offset {heap_offset}"),
            NativeKey::Chunk {
                nbytes,
                filter_mask,
                offsets,
            } => write!(f, "{nbytes} bytes, filter mask {filter_mask:#x}, offsets {offsets:?}"),
        }
    }
}

/// Print the node at `addr`.
pub async fn debug<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    shared: &Arc<BTreeShared>,
    addr: Addr,
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
) -> Result<()> {
    cache.load::<BTreeNode, S>(store, addr, shared).await?;
    let node = cache.get::<BTreeNode>(addr)?;

    writeln!(out, "{:indent$}B-tree Node...", "")?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Tree type ID:", shared.kind())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Size of node:", shared.sizeof_rnode())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Size of raw (disk) key:", shared.sizeof_rkey())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Level:", node.level())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Address of left sibling:", node.left())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Address of right sibling:", node.right())?;
    writeln!(
        out,
        "{:indent$}{:<fwidth$} {} ({})",
        "",
        "Number of children (max):",
        node.children().len(),
        shared.two_k()
    )?;

    let (inner, inner_width) = (indent + 3, fwidth.saturating_sub(3));
    let keys = node.keys().windows(2);
    for (i, (child, pair)) in node.children().iter().zip(keys).enumerate() {
        writeln!(out, "{:indent$}Child {i}...", "")?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Address:", child)?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Left Key:", pair[0])?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Right Key:", pair[1])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn chunk_key(offsets: &[u64]) -> NativeKey {
        let mut offsets = offsets.to_vec();
        offsets.push(0);
        NativeKey::Chunk {
            nbytes: 400,
            filter_mask: 0,
            offsets,
        }
    }

    #[test]
    fn it_sizes_nodes_from_config() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        assert_eq!(shared.two_k(), 32);
        assert_eq!(shared.sizeof_rkey(), 8);
        assert_eq!(shared.sizeof_rnode(), 8 + 16 + 32 * 8 + 33 * 8);

        let shared = BTreeShared::chunk(&config, vec![10, 10]);
        assert_eq!(shared.two_k(), 64);
        assert_eq!(shared.sizeof_rkey(), 4 + 4 + 24);
    }

    // Two leaves under one root; the right leaf holds chunks starting at row 20.
    async fn chunk_tree() -> (MetadataCache, MemoryStore, Arc<BTreeShared>, Addr) {
        let config = FileConfig::default();
        let shared = BTreeShared::chunk(&config, vec![10, 10]);
        let mut cache = MetadataCache::new(config, false);
        let mut store = MemoryStore::new();
        let (root, left, right) = (Addr::new(0), Addr::new(4096), Addr::new(8192));

        let mut leaf = BTreeNode::new(shared.clone(), 0);
        leaf.push_first(chunk_key(&[0, 0]));
        leaf.push(Addr::new(100), chunk_key(&[0, 10]));
        leaf.push(Addr::new(200), chunk_key(&[10, 0]));
        leaf.push(Addr::new(300), chunk_key(&[20, 0]));
        leaf.set_siblings(Addr::UNDEF, right);
        cache.insert(left, leaf, false).expect("inserts");

        let mut leaf = BTreeNode::new(shared.clone(), 0);
        leaf.push_first(chunk_key(&[20, 0]));
        leaf.push(Addr::new(400), chunk_key(&[20, 10]));
        leaf.push(Addr::new(500), chunk_key(&[30, 0]));
        leaf.set_siblings(left, Addr::UNDEF);
        cache.insert(right, leaf, false).expect("inserts");

        let mut node = BTreeNode::new(shared.clone(), 1);
        node.push_first(chunk_key(&[0, 0]));
        node.push(left, chunk_key(&[20, 0]));
        node.push(right, chunk_key(&[30, 0]));
        cache.insert(root, node, false).expect("inserts");

        cache.evict(&mut store).await.expect("evicts");
        (cache, store, shared, root)
    }

    #[tokio::test]
    async fn it_iterates_leaves_in_order() {
        let (mut cache, mut store, shared, root) = chunk_tree().await;
        let mut children = vec![];
        let flow = iterate(&mut cache, &mut store, &shared, root, |_, child, _| {
            children.push(child.value());
            ControlFlow::Continue(())
        })
        .await
        .expect("iterates");
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(children, vec![100, 200, 300, 400, 500]);
    }

    #[tokio::test]
    async fn it_stops_iterating_on_break() {
        let (mut cache, mut store, shared, root) = chunk_tree().await;
        let mut seen = 0;
        let flow = iterate(&mut cache, &mut store, &shared, root, |_, _, _| {
            seen += 1;
            if seen == 4 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
        .expect("iterates");
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn it_finds_chunks() {
        let (mut cache, mut store, shared, root) = chunk_tree().await;
        let found = find_chunk(&mut cache, &mut store, &shared, root, &[5, 13])
            .await
            .expect("searches")
            .expect("found");
        assert_eq!(found.addr, Addr::new(200));
        assert_eq!(found.offsets, vec![0, 10, 0]);

        let found = find_chunk(&mut cache, &mut store, &shared, root, &[25, 12])
            .await
            .expect("searches")
            .expect("found");
        assert_eq!(found.addr, Addr::new(500));

        let missing = find_chunk(&mut cache, &mut store, &shared, root, &[40, 0])
            .await
            .expect("searches");
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn it_prints_node() {
        let (mut cache, mut store, shared, root) = chunk_tree().await;
        let mut out = vec![];
        debug(&mut cache, &mut store, &shared, root, &mut out, 0, 30)
            .await
            .expect("prints");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("B-tree Node...\n"));
        assert!(text.contains("Chunk"));
        assert!(text.contains("2 (64)"));
        assert!(text.contains("Child 1..."));
        assert!(text.contains("offsets [30, 0, 0]"));
    }

    #[tokio::test]
    async fn it_rejects_wrong_rank() {
        let (mut cache, mut store, shared, root) = chunk_tree().await;
        assert!(matches!(
            find_chunk(&mut cache, &mut store, &shared, root, &[1]).await,
            Err(MetadataError::BadValue(_))
        ));
    }

    #[tokio::test]
    async fn it_iterates_empty_tree() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let mut cache = MetadataCache::new(config, false);
        let mut store = MemoryStore::new();
        let mut space = crate::freespace::FileSpace::new(cache.config(), 512);
        let root = create(&mut cache, &mut space, &shared).expect("creates");
        let flow = iterate(&mut cache, &mut store, &shared, root, |_, _, _| {
            panic!("no children")
        })
        .await
        .expect("iterates");
        assert_eq!(flow, ControlFlow::Continue(()));
    }
}
