use super::SymbolEntry;
use crate::cache::{cache_thing, CacheClient, ClientContext, ClientId};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{Decoder, Encoder, SIZEOF_MAGIC};

const SNOD_MAGIC: &[u8; SIZEOF_MAGIC] = b"SNOD";
const SNOD_VERSION: u8 = 1;

/// A symbol table node: the entries of one leaf of a group's B-tree, sorted by name.
///
/// ```text
/// "SNOD" [version 1] [reserved] [nsyms: u16] [entry] ... zero padding
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolNode {
    pub(crate) entries: Vec<SymbolEntry>,
}

impl SymbolNode {
    /// Node holding `entries`.
    pub fn new(entries: Vec<SymbolEntry>) -> Self {
        Self { entries }
    }

    /// Entries, in name order.
    pub fn entries(&self) -> &[SymbolEntry] {
        &self.entries
    }

    /// Most entries a node can hold.
    pub fn capacity(config: &FileConfig) -> usize {
        2 * config.sym_leaf_k as usize
    }

    /// Encoded node size. It depends only on the file configuration.
    pub fn image_size(config: &FileConfig) -> usize {
        SIZEOF_MAGIC + 4 + Self::capacity(config) * SymbolEntry::raw_size(config)
    }
}

impl CacheClient for SymbolNode {
    const ID: ClientId = ClientId::SymbolNode;

    type UserData = ();

    fn initial_load_size(_udata: &(), ctx: &ClientContext<'_>) -> usize {
        Self::image_size(ctx.config)
    }

    fn deserialize(image: &[u8], _udata: &(), ctx: &mut ClientContext<'_>) -> Result<Self> {
        let mut dec = Decoder::new(image, ctx.config);
        dec.signature(SNOD_MAGIC, "symbol table node")?;
        let version = dec.u8()?;
        if version != SNOD_VERSION {
            return Err(MetadataError::BadVersion {
                what: "symbol table node",
                found: version,
            });
        }
        dec.skip(1)?;
        let nsyms = dec.u16()? as usize;
        let capacity = Self::capacity(ctx.config);
        if nsyms > capacity {
            return Err(MetadataError::bad_value(format!(
                "symbol table node has {nsyms} entries, at most {capacity} allowed"
            )));
        }
        let entries = (0..nsyms)
            .map(|_| SymbolEntry::decode(&mut dec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    fn image_len(&self, ctx: &ClientContext<'_>) -> usize {
        Self::image_size(ctx.config)
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        let capacity = Self::capacity(ctx.config);
        if self.entries.len() > capacity {
            return Err(MetadataError::bad_value(format!(
                "symbol table node has {} entries, at most {capacity} allowed",
                self.entries.len()
            )));
        }
        let mut enc = Encoder::new(image, ctx.config);
        enc.bytes(SNOD_MAGIC)?;
        enc.u8(SNOD_VERSION)?;
        enc.u8(0)?;
        enc.u16(self.entries.len() as u16)?;
        self.entries.iter().try_for_each(|e| e.encode(&mut enc))?;
        enc.zero_fill();
        Ok(())
    }

    cache_thing!(SymbolNode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Addr;
    use crate::group::EntryCache;
    use crate::heap::HeapArena;

    fn entries() -> Vec<SymbolEntry> {
        vec![
            SymbolEntry {
                name_off: 8,
                header: Addr::new(800),
                cache: EntryCache::Stab {
                    btree: Addr::new(1000),
                    heap: Addr::new(2000),
                },
            },
            SymbolEntry {
                name_off: 16,
                header: Addr::new(900),
                cache: EntryCache::Nothing,
            },
            SymbolEntry {
                name_off: 24,
                header: Addr::UNDEF,
                cache: EntryCache::SymLink { offset: 32 },
            },
        ]
    }

    fn encode(node: &SymbolNode, config: &FileConfig) -> Result<Vec<u8>> {
        let mut heaps = HeapArena::default();
        let ctx = ClientContext {
            config,
            heaps: &mut heaps,
        };
        let mut image = vec![0x55; node.image_len(&ctx)];
        node.serialize(&ctx, &mut image)?;
        Ok(image)
    }

    fn decode(image: &[u8], config: &FileConfig) -> Result<SymbolNode> {
        let mut heaps = HeapArena::default();
        let mut ctx = ClientContext {
            config,
            heaps: &mut heaps,
        };
        SymbolNode::deserialize(image, &(), &mut ctx)
    }

    #[test]
    fn it_sizes_node_from_config() {
        let config = FileConfig::default();
        assert_eq!(SymbolEntry::raw_size(&config), 40);
        assert_eq!(SymbolNode::image_size(&config), 8 + 8 * 40);
    }

    #[test]
    fn it_round_trips_with_padding() {
        let config = FileConfig::default();
        let node = SymbolNode::new(entries());
        let image = encode(&node, &config).expect("encodes");
        assert_eq!(&image[..8], b"SNOD\x01\x00\x03\x00");
        // first entry: name offset, header, stab hint
        assert_eq!(&image[8..16], &8u64.to_le_bytes());
        assert_eq!(&image[16..24], &800u64.to_le_bytes());
        assert_eq!(&image[24..28], &1u32.to_le_bytes());
        assert_eq!(&image[32..40], &1000u64.to_le_bytes());
        assert_eq!(&image[40..48], &2000u64.to_le_bytes());
        assert!(image[8 + 3 * 40..].iter().all(|b| *b == 0));
        assert_eq!(decode(&image, &config).expect("decodes"), node);
    }

    #[test]
    fn it_round_trips_narrow_widths() {
        let config = FileConfig {
            sizeof_addr: 4,
            sizeof_size: 2,
            sym_leaf_k: 2,
            ..Default::default()
        };
        let node = SymbolNode::new(entries());
        let image = encode(&node, &config).expect("encodes");
        assert_eq!(image.len(), 8 + 4 * 30);
        assert_eq!(decode(&image, &config).expect("decodes"), node);
    }

    #[test]
    fn it_rejects_bad_version() {
        let config = FileConfig::default();
        let mut image = encode(&SymbolNode::new(entries()), &config).expect("encodes");
        image[4] = 2;
        assert!(matches!(
            decode(&image, &config),
            Err(MetadataError::BadVersion { found: 2, .. })
        ));
    }

    #[test]
    fn it_rejects_too_many_entries() {
        let config = FileConfig::default();
        let mut image = encode(&SymbolNode::new(entries()), &config).expect("encodes");
        image[6] = 9;
        assert!(matches!(
            decode(&image, &config),
            Err(MetadataError::BadValue(_))
        ));
    }

    #[test]
    fn it_rejects_unknown_hint() {
        let config = FileConfig::default();
        let mut image = encode(&SymbolNode::new(entries()), &config).expect("encodes");
        image[24] = 7;
        assert!(matches!(
            decode(&image, &config),
            Err(MetadataError::BadValue(_))
        ));
    }

    #[test]
    fn it_rejects_truncated_images() {
        let config = FileConfig::default();
        let image = encode(&SymbolNode::new(entries()), &config).expect("encodes");
        for len in 0..8 + 3 * 40 {
            assert!(
                matches!(
                    decode(&image[..len], &config),
                    Err(MetadataError::BufferOverflow { .. })
                ),
                "decoded {len} bytes"
            );
        }
    }
}
