use std::sync::Arc;

use super::{BTreeShared, NativeKey};
use crate::cache::{cache_thing, CacheClient, ClientContext, ClientId};
use crate::error::{MetadataError, Result};
use crate::format::{Addr, Decoder, Encoder, SIZEOF_MAGIC};

const TREE_MAGIC: &[u8; SIZEOF_MAGIC] = b"TREE";

/// One B-tree node.
///
/// A node with `n` children holds `n + 1` keys. A node with no children holds no keys.
#[derive(Clone, Debug, PartialEq)]
pub struct BTreeNode {
    shared: Arc<BTreeShared>,
    level: u32,
    left: Addr,
    right: Addr,
    children: Vec<Addr>,
    keys: Vec<NativeKey>,
}

impl BTreeNode {
    /// An empty node at `level`, with no siblings.
    pub fn new(shared: Arc<BTreeShared>, level: u32) -> Self {
        Self {
            shared,
            level,
            left: Addr::UNDEF,
            right: Addr::UNDEF,
            children: vec![],
            keys: vec![],
        }
    }

    /// Shared tree information.
    pub fn shared(&self) -> &Arc<BTreeShared> {
        &self.shared
    }

    /// Height above the leaves.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Left sibling.
    pub fn left(&self) -> Addr {
        self.left
    }

    /// Right sibling.
    pub fn right(&self) -> Addr {
        self.right
    }

    /// Child addresses.
    pub fn children(&self) -> &[Addr] {
        &self.children
    }

    /// Keys. There is one more key than there are children.
    pub fn keys(&self) -> &[NativeKey] {
        &self.keys
    }

    /// Mutable keys, for updating bounds in place.
    pub fn keys_mut(&mut self) -> &mut [NativeKey] {
        &mut self.keys
    }

    /// Set the sibling links.
    pub fn set_siblings(&mut self, left: Addr, right: Addr) {
        self.left = left;
        self.right = right;
    }

    /// Set the left-most key of an empty node.
    pub fn push_first(&mut self, key: NativeKey) {
        self.keys.clear();
        self.keys.push(key);
    }

    /// Append a child and the key after it.
    pub fn push(&mut self, child: Addr, right_key: NativeKey) {
        self.children.push(child);
        self.keys.push(right_key);
    }

    /// Insert a child and the key after it at position `idx`.
    pub fn insert_at(&mut self, idx: usize, child: Addr, right_key: NativeKey) {
        self.children.insert(idx, child);
        self.keys.insert(idx + 1, right_key);
    }

    /// Is the node at capacity?
    pub fn is_full(&self) -> bool {
        self.children.len() >= self.shared.two_k()
    }
}

impl CacheClient for BTreeNode {
    const ID: ClientId = ClientId::BTree;

    type UserData = Arc<BTreeShared>;

    fn initial_load_size(udata: &Arc<BTreeShared>, _ctx: &ClientContext<'_>) -> usize {
        udata.sizeof_rnode()
    }

    fn deserialize(
        image: &[u8],
        udata: &Arc<BTreeShared>,
        ctx: &mut ClientContext<'_>,
    ) -> Result<Self> {
        let mut dec = Decoder::new(image, ctx.config);
        dec.signature(TREE_MAGIC, "B-tree node")?;

        let kind = dec.u8()?;
        if kind != udata.kind().id() {
            return Err(MetadataError::bad_value(format!(
                "B-tree node type {kind}, expected {}",
                udata.kind().id()
            )));
        }
        let level = dec.u8()? as u32;
        let nchildren = dec.u16()? as usize;
        if nchildren > udata.two_k() {
            return Err(MetadataError::bad_value(format!(
                "B-tree node has {nchildren} children, at most {} allowed",
                udata.two_k()
            )));
        }
        let left = dec.addr()?;
        let right = dec.addr()?;

        let mut children = Vec::with_capacity(nchildren);
        let mut keys = Vec::with_capacity(nchildren + 1);
        for _ in 0..nchildren {
            keys.push(udata.decode_key(&mut dec)?);
            children.push(dec.addr()?);
        }
        if nchildren > 0 {
            keys.push(udata.decode_key(&mut dec)?);
        }

        Ok(Self {
            shared: udata.clone(),
            level,
            left,
            right,
            children,
            keys,
        })
    }

    fn image_len(&self, _ctx: &ClientContext<'_>) -> usize {
        self.shared.sizeof_rnode()
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        let level = u8::try_from(self.level).map_err(|_| {
            MetadataError::bad_value(format!("B-tree level {} doesn't fit in a byte", self.level))
        })?;
        let nchildren = self.children.len();
        if nchildren > self.shared.two_k() {
            return Err(MetadataError::bad_value(format!(
                "B-tree node has {nchildren} children, at most {} allowed",
                self.shared.two_k()
            )));
        }
        let expected_keys = if nchildren == 0 { 0 } else { nchildren + 1 };
        if self.keys.len() < expected_keys {
            return Err(MetadataError::bad_value(format!(
                "B-tree node has {nchildren} children but only {} keys",
                self.keys.len()
            )));
        }

        let mut enc = Encoder::new(image, ctx.config);
        enc.bytes(TREE_MAGIC)?;
        enc.u8(self.shared.kind().id())?;
        enc.u8(level)?;
        enc.u16(nchildren as u16)?;
        enc.addr(self.left)?;
        enc.addr(self.right)?;
        for (key, child) in self.keys.iter().zip(self.children.iter()) {
            self.shared.encode_key(&mut enc, key)?;
            enc.addr(*child)?;
        }
        if nchildren > 0 {
            self.shared.encode_key(&mut enc, &self.keys[nchildren])?;
        }
        enc.zero_fill();
        Ok(())
    }

    cache_thing!(BTree);
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::config::FileConfig;
    use crate::heap::HeapArena;

    fn group_leaf(shared: &Arc<BTreeShared>, n: usize) -> BTreeNode {
        let mut node = BTreeNode::new(shared.clone(), 0);
        node.push_first(NativeKey::Group { heap_offset: 0 });
        for i in 0..n {
            node.push(
                Addr::new(1000 + 328 * i as u64),
                NativeKey::Group {
                    heap_offset: 8 * (i as u64 + 1),
                },
            );
        }
        node.set_siblings(Addr::UNDEF, Addr::new(77));
        node
    }

    fn encode(node: &BTreeNode, config: &FileConfig) -> Result<Vec<u8>> {
        let mut heaps = HeapArena::default();
        let ctx = ClientContext {
            config,
            heaps: &mut heaps,
        };
        let mut image = vec![0xaa; node.image_len(&ctx)];
        node.serialize(&ctx, &mut image)?;
        Ok(image)
    }

    fn decode(image: &[u8], shared: &Arc<BTreeShared>, config: &FileConfig) -> Result<BTreeNode> {
        let mut heaps = HeapArena::default();
        let mut ctx = ClientContext {
            config,
            heaps: &mut heaps,
        };
        BTreeNode::deserialize(image, shared, &mut ctx)
    }

    #[test]
    fn it_encodes_group_leaf() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let node = group_leaf(&shared, 2);
        let image = encode(&node, &config).expect("encodes");
        assert_eq!(image.len(), shared.sizeof_rnode());
        assert_eq!(&image[..8], b"TREE\x00\x00\x02\x00");
        // left sibling undefined
        assert_eq!(&image[8..16], &[0xff; 8]);
        assert_eq!(&image[16..24], &77u64.to_le_bytes());
        // key 0, child 0, key 1
        assert_eq!(&image[24..32], &0u64.to_le_bytes());
        assert_eq!(&image[32..40], &1000u64.to_le_bytes());
        assert_eq!(&image[40..48], &8u64.to_le_bytes());
        // padding is zeroed
        assert!(image[24 + 5 * 8..].iter().all(|b| *b == 0));

        let decoded = decode(&image, &shared, &config).expect("decodes");
        assert_eq!(decoded, node);
    }

    #[test]
    fn it_encodes_chunk_node() {
        let config = FileConfig::default();
        let shared = BTreeShared::chunk(&config, vec![4, 4]);
        let mut node = BTreeNode::new(shared.clone(), 3);
        node.push_first(NativeKey::Chunk {
            nbytes: 64,
            filter_mask: 0,
            offsets: vec![0, 0, 0],
        });
        node.push(
            Addr::new(4096),
            NativeKey::Chunk {
                nbytes: 48,
                filter_mask: 2,
                offsets: vec![0, 4, 0],
            },
        );
        let image = encode(&node, &config).expect("encodes");
        assert_eq!(image[4], 1);
        assert_eq!(image[5], 3);
        let decoded = decode(&image, &shared, &config).expect("decodes");
        assert_eq!(decoded, node);
    }

    #[test]
    fn it_handles_childless_node() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let node = BTreeNode::new(shared.clone(), 0);
        let image = encode(&node, &config).expect("encodes");
        assert!(image[24..].iter().all(|b| *b == 0));
        let decoded = decode(&image, &shared, &config).expect("decodes");
        assert!(decoded.children().is_empty());
        assert!(decoded.keys().is_empty());
    }

    #[test]
    fn it_handles_full_node() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let node = group_leaf(&shared, shared.two_k());
        assert!(node.is_full());
        let image = encode(&node, &config).expect("encodes");
        let decoded = decode(&image, &shared, &config).expect("decodes");
        assert_eq!(decoded.children().len(), shared.two_k());
        assert_eq!(decoded.keys().len(), shared.two_k() + 1);
    }

    #[test]
    fn it_rejects_too_many_children() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let node = group_leaf(&shared, shared.two_k());
        let mut image = encode(&node, &config).expect("encodes");
        image[6..8].copy_from_slice(&(shared.two_k() as u16 + 1).to_le_bytes());
        assert!(matches!(
            decode(&image, &shared, &config),
            Err(MetadataError::BadValue(_))
        ));

        let over = group_leaf(&shared, shared.two_k() + 1);
        assert!(matches!(
            encode(&over, &config),
            Err(MetadataError::BadValue(_))
        ));
    }

    #[test]
    fn it_rejects_wide_level() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let node = BTreeNode::new(shared, 256);
        assert!(matches!(
            encode(&node, &config),
            Err(MetadataError::BadValue(_))
        ));
    }

    #[test]
    fn it_rejects_bad_magic_and_type() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let image = encode(&group_leaf(&shared, 1), &config).expect("encodes");

        let mut bad = image.clone();
        bad[0] = b'X';
        assert!(matches!(
            decode(&bad, &shared, &config),
            Err(MetadataError::BadSignature(_))
        ));

        let mut bad = image;
        bad[4] = 1;
        assert!(matches!(
            decode(&bad, &shared, &config),
            Err(MetadataError::BadValue(_))
        ));
    }

    #[test]
    fn it_rejects_truncated_images() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let node = group_leaf(&shared, 3);
        let image = encode(&node, &config).expect("encodes");
        // magic, header, siblings, then 3 key/child pairs and a trailing key
        let used = 24 + 7 * 8;
        for len in 0..used {
            assert!(
                matches!(
                    decode(&image[..len], &shared, &config),
                    Err(MetadataError::BufferOverflow { .. })
                ),
                "decoded {len} bytes"
            );
        }
        decode(&image[..used], &shared, &config).expect("decodes used prefix");
    }

    #[test]
    fn it_rejects_mismatched_keys() {
        let config = FileConfig::default();
        let shared = BTreeShared::group(&config);
        let mut node = BTreeNode::new(shared, 0);
        node.push_first(NativeKey::Chunk {
            nbytes: 0,
            filter_mask: 0,
            offsets: vec![0],
        });
        node.push(Addr::new(8), NativeKey::Group { heap_offset: 8 });
        assert!(matches!(
            encode(&node, &config),
            Err(MetadataError::BadValue(_))
        ));
    }

    #[test]
    fn it_decodes_random_nodes() {
        let mut rng = rand::thread_rng();
        let config = FileConfig {
            sizeof_addr: 4,
            sizeof_size: 4,
            ..Default::default()
        };
        let shared = BTreeShared::group(&config);
        for _ in 0..100 {
            let n = rng.gen_range(0..=shared.two_k());
            let mut node = BTreeNode::new(shared.clone(), rng.gen_range(0..256));
            if n > 0 {
                node.push_first(NativeKey::Group {
                    heap_offset: rng.gen_range(0..u32::MAX as u64),
                });
            }
            for _ in 0..n {
                node.push(
                    Addr::new(rng.gen_range(0..u32::MAX as u64)),
                    NativeKey::Group {
                        heap_offset: rng.gen_range(0..u32::MAX as u64),
                    },
                );
            }
            node.set_siblings(
                Addr::new(rng.gen_range(0..u32::MAX as u64)),
                Addr::UNDEF,
            );
            let image = encode(&node, &config).expect("encodes");
            assert_eq!(decode(&image, &shared, &config).expect("decodes"), node);
        }
    }
}
