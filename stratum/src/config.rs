//! File configuration
//!
//! Parameters fixed when a file is created. They are stored in the file header and shape the
//! layout of every metadata image in the file.

use serde::{Deserialize, Serialize};

use crate::btree::BTreeKind;
use crate::error::{MetadataError, Result};
use crate::format::ByteOrder;

const DEFAULT_SYM_LEAF_K: u16 = 4;
const DEFAULT_GROUP_BTREE_K: u16 = 16;
const DEFAULT_CHUNK_BTREE_K: u16 = 32;

/// File-wide encoding parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Width in bytes of an encoded file address (2, 4 or 8).
    pub sizeof_addr: u8,
    /// Width in bytes of an encoded length (2, 4 or 8).
    pub sizeof_size: u8,
    /// Byte order of multi-byte integers.
    pub byte_order: ByteOrder,
    /// Half the capacity of a symbol table node.
    pub sym_leaf_k: u16,
    /// Half the fan-out of group B-tree nodes.
    pub group_btree_k: u16,
    /// Half the fan-out of chunk B-tree nodes.
    pub chunk_btree_k: u16,
    /// Page size, when paged aggregation of file space is enabled.
    pub page_size: Option<u64>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            sizeof_addr: 8,
            sizeof_size: 8,
            byte_order: ByteOrder::Little,
            sym_leaf_k: DEFAULT_SYM_LEAF_K,
            group_btree_k: DEFAULT_GROUP_BTREE_K,
            chunk_btree_k: DEFAULT_CHUNK_BTREE_K,
            page_size: None,
        }
    }
}

impl FileConfig {
    /// Check that the configuration describes a file we can encode.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.sizeof_addr, 2 | 4 | 8) {
            return Err(MetadataError::bad_value(format!(
                "address width {} not supported",
                self.sizeof_addr
            )));
        }
        if !matches!(self.sizeof_size, 2 | 4 | 8) {
            return Err(MetadataError::bad_value(format!(
                "length width {} not supported",
                self.sizeof_size
            )));
        }
        if self.sym_leaf_k == 0 || self.group_btree_k == 0 || self.chunk_btree_k == 0 {
            return Err(MetadataError::bad_value("node fan-out must be >= 1"));
        }
        // nchildren is stored in 16 bits
        if self.group_btree_k > u16::MAX / 2 || self.chunk_btree_k > u16::MAX / 2 {
            return Err(MetadataError::bad_value("B-tree fan-out must fit in 16 bits"));
        }
        if self.sym_leaf_k > u16::MAX / 2 {
            return Err(MetadataError::bad_value(
                "symbol node capacity must fit in 16 bits",
            ));
        }
        if let Some(page) = self.page_size {
            if page < 512 {
                return Err(MetadataError::bad_value(format!(
                    "page size {page} must be >= 512"
                )));
            }
        }
        Ok(())
    }

    /// Half the fan-out of a B-tree of this kind.
    pub fn btree_k(&self, kind: BTreeKind) -> u16 {
        match kind {
            BTreeKind::Group => self.group_btree_k,
            BTreeKind::Chunk => self.chunk_btree_k,
        }
    }

    /// Address width in bytes.
    pub fn sizeof_addr(&self) -> usize {
        self.sizeof_addr as usize
    }

    /// Length width in bytes.
    pub fn sizeof_size(&self) -> usize {
        self.sizeof_size as usize
    }

    /// Is paged aggregation enabled?
    pub fn paged(&self) -> bool {
        self.page_size.is_some()
    }
}
