//! Free space
//!
//! File space is handed out by [`FileSpace`], which keeps one section list per allocation bucket.
//! Section lists are cache clients so that they can be persisted in the file and read back when
//! it is reopened.
//!
//! An image is the signature, a 32 bit body length and a bincode encoded body:
//!
//! ```text
//! "FSSE" [body length] [bucket, sections...]
//! ```

pub use self::debug::sects_debug;
pub use self::space::{FileAllocator, FileSpace, FsLocation};

mod debug;
mod space;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;

use bincode::Options;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::cache::{cache_thing, CacheClient, ClientContext, ClientId, NotifyAction};
use crate::error::{MetadataError, Result};
use crate::format::{Addr, Decoder, Encoder, SIZEOF_MAGIC};
use crate::BINCODER;

const FSSE_MAGIC: &[u8; SIZEOF_MAGIC] = b"FSSE";
const FSSE_PREFIX_SIZE: usize = SIZEOF_MAGIC + 4;

/// Type of file memory being allocated.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum MemType {
    /// File header and other file-wide structures
    Super,
    /// B-tree nodes
    BTree,
    /// Raw data
    Draw,
    /// Global heap collections
    GHeap,
    /// Local heaps
    LHeap,
    /// Object headers
    Ohdr,
}

/// The free space manager an allocation is served from.
///
/// Without paging there is one bucket per [`MemType`]. With paging, small requests are packed
/// into pages by size class and anything at least a page long is served in whole pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FsBucket {
    /// One memory type
    Mem(MemType),
    /// Small metadata, paged
    SmallMeta,
    /// Small raw data, paged
    SmallRaw,
    /// Whole pages
    Large,
}

impl FsBucket {
    fn section_type(self) -> SectionType {
        match self {
            FsBucket::Mem(_) => SectionType::Simple,
            FsBucket::SmallMeta | FsBucket::SmallRaw => SectionType::Small,
            FsBucket::Large => SectionType::Large,
        }
    }

    fn is_small(self) -> bool {
        matches!(self, FsBucket::SmallMeta | FsBucket::SmallRaw)
    }
}

impl fmt::Display for FsBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsBucket::Mem(mem) => write!(f, "{mem}"),
            FsBucket::SmallMeta => write!(f, "small metadata"),
            FsBucket::SmallRaw => write!(f, "small raw data"),
            FsBucket::Large => write!(f, "large"),
        }
    }
}

/// Kind of section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionType {
    /// Unpaged
    Simple,
    /// Part of a page
    Small,
    /// Whole pages
    Large,
    /// Not recognised
    Unknown(u8),
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            SectionType::Simple => "simple",
            SectionType::Small => "small",
            SectionType::Large => "large",
            SectionType::Unknown(_) => "unknown",
        };
        f.write_str(tag)
    }
}

/// Has a section been written to the file since it last changed?
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SectionState {
    /// Only in memory
    Live,
    /// Matches its persisted image
    Serialized,
}

/// A free range of file space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    /// First free byte
    pub addr: Addr,
    /// Number of free bytes
    pub size: u64,
    /// Persistence state
    pub state: SectionState,
    /// Kind of section
    pub kind: SectionType,
}

impl Section {
    /// Address of the last byte in the section.
    pub fn end(&self) -> u64 {
        self.addr.value() + self.size - 1
    }
}

#[derive(Serialize, Deserialize)]
struct SectionRecord {
    addr: u64,
    size: u64,
    kind: SectionType,
}

#[derive(Serialize, Deserialize)]
struct SectionListImage {
    bucket: FsBucket,
    sections: Vec<SectionRecord>,
}

/// The free sections of one bucket.
#[derive(Clone, Debug)]
pub struct FreeSpaceManager {
    bucket: FsBucket,
    sections: BTreeMap<Addr, Section>,
}

impl FreeSpaceManager {
    /// Create an empty manager.
    pub fn new(bucket: FsBucket) -> Self {
        Self {
            bucket,
            sections: BTreeMap::new(),
        }
    }

    /// Bucket served by this manager.
    pub fn bucket(&self) -> FsBucket {
        self.bucket
    }

    /// Number of sections.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Are there no sections?
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Total free bytes.
    pub fn total(&self) -> u64 {
        self.sections.values().map(|s| s.size).sum()
    }

    /// Visit every section once, until `f` breaks.
    pub fn sect_iterate<F>(&self, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(&Section) -> ControlFlow<()>,
    {
        for section in self.sections.values() {
            f(section)?;
        }
        ControlFlow::Continue(())
    }

    fn add(&mut self, addr: Addr, size: u64) {
        let kind = self.bucket.section_type();
        self.sections.insert(
            addr,
            Section {
                addr,
                size,
                state: SectionState::Live,
                kind,
            },
        );
    }

    fn remove(&mut self, addr: Addr) -> Option<Section> {
        self.sections.remove(&addr)
    }

    // Section immediately before `addr` which ends where `addr` starts.
    fn adjacent_before(&self, addr: Addr) -> Option<&Section> {
        self.sections
            .range(..addr)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.addr.value() + s.size == addr.value())
    }

    fn first_fit(&self, size: u64) -> Option<Addr> {
        self.sections
            .values()
            .find(|s| s.size >= size)
            .map(|s| s.addr)
    }

    fn section_ending_at(&self, end: u64) -> Option<Addr> {
        self.sections
            .values()
            .find(|s| s.addr.value() + s.size == end)
            .map(|s| s.addr)
    }

    fn mark_serialized(&mut self) {
        for section in self.sections.values_mut() {
            section.state = SectionState::Serialized;
        }
    }

    fn image_size(&self) -> usize {
        // sizing plain records can't fail
        let body = BINCODER.serialized_size(&self.body()).unwrap_or(0) as usize;
        FSSE_PREFIX_SIZE + body
    }

    fn body(&self) -> SectionListImage {
        SectionListImage {
            bucket: self.bucket,
            sections: self
                .sections
                .values()
                .map(|s| SectionRecord {
                    addr: s.addr.value(),
                    size: s.size,
                    kind: s.kind,
                })
                .collect(),
        }
    }
}

impl CacheClient for FreeSpaceManager {
    const ID: ClientId = ClientId::FreeSpace;

    type UserData = ();

    fn initial_load_size(_udata: &(), _ctx: &ClientContext<'_>) -> usize {
        FSSE_PREFIX_SIZE
    }

    fn final_load_size(image: &[u8], _udata: &(), ctx: &ClientContext<'_>) -> Result<Option<usize>> {
        let mut dec = Decoder::new(image, ctx.config);
        dec.signature(FSSE_MAGIC, "free space section list")?;
        let body = dec.u32()? as usize;
        Ok(Some(FSSE_PREFIX_SIZE + body))
    }

    fn deserialize(image: &[u8], _udata: &(), ctx: &mut ClientContext<'_>) -> Result<Self> {
        let mut dec = Decoder::new(image, ctx.config);
        dec.signature(FSSE_MAGIC, "free space section list")?;
        let len = dec.u32()? as usize;
        let body: SectionListImage = BINCODER.deserialize(dec.bytes(len)?)?;
        let mut sections = BTreeMap::new();
        for record in body.sections {
            if record.size == 0 {
                return Err(MetadataError::bad_value("empty free space section"));
            }
            let addr = Addr::new(record.addr);
            sections.insert(
                addr,
                Section {
                    addr,
                    size: record.size,
                    state: SectionState::Serialized,
                    kind: record.kind,
                },
            );
        }
        Ok(Self {
            bucket: body.bucket,
            sections,
        })
    }

    fn image_len(&self, _ctx: &ClientContext<'_>) -> usize {
        self.image_size()
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        let body = BINCODER.serialize(&self.body())?;
        let len = u32::try_from(body.len())
            .map_err(|_| MetadataError::bad_value("free space section list too large"))?;
        let mut enc = Encoder::new(image, ctx.config);
        enc.bytes(FSSE_MAGIC)?;
        enc.u32(len)?;
        enc.bytes(&body)?;
        enc.zero_fill();
        Ok(())
    }

    fn notify(&mut self, action: NotifyAction, _ctx: &mut ClientContext<'_>) -> Result<()> {
        if action == NotifyAction::AfterFlush {
            self.mark_serialized();
        }
        Ok(())
    }

    cache_thing!(FreeSpace);
}
