//! Local heaps
//!
//! A local heap stores the link names of one group. It has a fixed size prefix and a data block.
//! When the data block sits directly after the prefix, both are cached as a single entry
//! ("combined"). Otherwise the data block is a cache entry of its own ("separate") and is pinned
//! while the heap is protected.
//!
//! The prefix and data block reference the same [`LocalHeap`], which lives in a [`HeapArena`]
//! owned by the cache. The heap is reference counted: one reference from the prefix and one from
//! the data block, if it has one.
//!
//! Prefix layout:
//!
//! ```text
//! "HEAP" [version 0] [3 reserved] [data size] [free list head] [data address]
//! ```
//!
//! Free blocks are recorded inside the data image, at the offset of each free block:
//! `[next free offset] [size]`. An offset of 1 ends the list.

pub use self::dblk::{dblk_dest, dblk_new, realloc, DataBlock};

mod dblk;

use std::collections::HashMap;
use std::io::Write;

use crate::cache::{
    cache_thing, CacheClient, ClientContext, ClientId, MetadataCache, MetadataStore,
};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{align8, Addr, Decoder, Encoder, SIZEOF_MAGIC};
use crate::freespace::{FileAllocator, MemType};
use crate::sparse::BuildIdHasher;

const HEAP_MAGIC: &[u8; SIZEOF_MAGIC] = b"HEAP";
const HEAP_VERSION: u8 = 0;

/// Free list terminator. No free block can start at offset 1.
const FREE_NULL: u64 = 1;

/// Size of the heap prefix.
pub fn prefix_size(config: &FileConfig) -> usize {
    align8(SIZEOF_MAGIC + 4 + 2 * config.sizeof_size() + config.sizeof_addr())
}

/// Smallest free block which can hold a free list record.
pub fn sizeof_free(config: &FileConfig) -> u64 {
    align8(2 * config.sizeof_size()) as u64
}

/// Identifies a heap in a [`HeapArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

/// Identifies a data block in a [`HeapArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

/// A free range in a heap's data block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeBlock {
    /// Offset into the data block
    pub offset: u64,
    /// Length of the range
    pub size: u64,
}

/// In-memory state of one local heap.
#[derive(Debug)]
pub struct LocalHeap {
    prfx_addr: Addr,
    prfx_size: usize,
    dblk_addr: Addr,
    dblk_size: u64,
    single_cache_obj: bool,
    free_head: u64,
    free_list: Vec<FreeBlock>,
    image: Vec<u8>,
    rc: usize,
    prots: usize,
    dblk: Option<BlockId>,
}

impl LocalHeap {
    /// Prefix address.
    pub fn prfx_addr(&self) -> Addr {
        self.prfx_addr
    }

    /// Prefix size.
    pub fn prfx_size(&self) -> usize {
        self.prfx_size
    }

    /// Data block address.
    pub fn dblk_addr(&self) -> Addr {
        self.dblk_addr
    }

    /// Data block size.
    pub fn dblk_size(&self) -> u64 {
        self.dblk_size
    }

    /// Are prefix and data block cached as one entry?
    pub fn single_cache_obj(&self) -> bool {
        self.single_cache_obj
    }

    /// Free ranges in the data block.
    pub fn free_list(&self) -> &[FreeBlock] {
        &self.free_list
    }

    /// Contents of the data block.
    pub fn data(&self) -> &[u8] {
        &self.image
    }

    /// Number of cache objects referencing this heap.
    pub fn rc(&self) -> usize {
        self.rc
    }

    /// Number of outstanding protects.
    pub fn prots(&self) -> usize {
        self.prots
    }

    /// Data block object, when the data block is separate and resident.
    pub fn block(&self) -> Option<BlockId> {
        self.dblk
    }

    fn decode_free_list(&mut self, config: &FileConfig) -> Result<()> {
        let mut free_list = vec![];
        let mut offset = self.free_head;
        let limit = self.dblk_size / sizeof_free(config) + 1;
        while offset != FREE_NULL {
            if offset >= self.dblk_size || free_list.len() as u64 >= limit {
                return Err(MetadataError::bad_value(format!(
                    "bad heap free list offset {offset}"
                )));
            }
            let record = self.image.get(offset as usize..).ok_or_else(|| {
                MetadataError::bad_value(format!("heap free list offset {offset} past data"))
            })?;
            let mut dec = Decoder::new(record, config);
            let next = dec.length()?;
            let size = dec.length()?;
            if size == 0 || offset.checked_add(size).map_or(true, |end| end > self.dblk_size) {
                return Err(MetadataError::bad_value(format!(
                    "heap free block at {offset} runs past end of heap"
                )));
            }
            free_list.push(FreeBlock { offset, size });
            offset = next;
        }
        self.free_list = free_list;
        Ok(())
    }

    // Data image with the free list records written into it.
    fn encode_data(&self, config: &FileConfig, out: &mut [u8]) -> Result<()> {
        let len = out.len().min(self.image.len());
        out[..len].copy_from_slice(&self.image[..len]);
        out[len..].fill(0);
        for (i, fl) in self.free_list.iter().enumerate() {
            let next = self
                .free_list
                .get(i + 1)
                .map(|n| n.offset)
                .unwrap_or(FREE_NULL);
            let mut enc = Encoder::new(&mut out[fl.offset as usize..], config);
            enc.length(next)?;
            enc.length(fl.size)?;
        }
        Ok(())
    }

    fn free_head(&self) -> u64 {
        self.free_list.first().map(|f| f.offset).unwrap_or(FREE_NULL)
    }
}

/// Owner of every [`LocalHeap`] known to a cache.
#[derive(Debug, Default)]
pub struct HeapArena {
    heaps: HashMap<HeapId, LocalHeap, BuildIdHasher>,
    blocks: HashMap<BlockId, Option<HeapId>, BuildIdHasher>,
    next: usize,
}

impl HeapArena {
    fn next_id(&mut self) -> usize {
        self.next += 1;
        self.next
    }

    fn add(&mut self, heap: LocalHeap) -> HeapId {
        let id = HeapId(self.next_id());
        self.heaps.insert(id, heap);
        id
    }

    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.next_id());
        self.blocks.insert(id, None);
        id
    }

    /// Number of live heaps.
    pub fn len(&self) -> usize {
        self.heaps.len()
    }

    /// Are there no live heaps?
    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }

    /// Number of live data blocks.
    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Look up a heap.
    pub fn heap(&self, id: HeapId) -> Result<&LocalHeap> {
        self.heaps
            .get(&id)
            .ok_or_else(|| MetadataError::bad_value(format!("no local heap {}", id.0)))
    }

    /// Look up a heap for modification.
    pub fn heap_mut(&mut self, id: HeapId) -> Result<&mut LocalHeap> {
        self.heaps
            .get_mut(&id)
            .ok_or_else(|| MetadataError::bad_value(format!("no local heap {}", id.0)))
    }

    /// Heap a data block belongs to.
    pub fn block_heap(&self, block: BlockId) -> Option<HeapId> {
        self.blocks.get(&block).copied().flatten()
    }

    pub(crate) fn inc_rc(&mut self, id: HeapId) -> Result<()> {
        let heap = self
            .heaps
            .get_mut(&id)
            .ok_or_else(|| MetadataError::Refcount(format!("no local heap {}", id.0)))?;
        heap.rc += 1;
        Ok(())
    }

    /// Drop a reference. The heap is destroyed with its last reference.
    pub(crate) fn dec_rc(&mut self, id: HeapId) -> Result<()> {
        let heap = self
            .heaps
            .get_mut(&id)
            .ok_or_else(|| MetadataError::Refcount(format!("no local heap {}", id.0)))?;
        if heap.rc == 0 {
            return Err(MetadataError::Refcount(format!(
                "local heap {} has no references",
                id.0
            )));
        }
        heap.rc -= 1;
        if heap.rc == 0 {
            tracing::debug!(heap = id.0, "destroying local heap");
            self.heaps.remove(&id);
        }
        Ok(())
    }
}

/// Cache object for a heap prefix, and for the data block when it is combined.
#[derive(Debug)]
pub struct HeapPrefix {
    heap: HeapId,
}

impl HeapPrefix {
    /// The heap this prefix describes.
    pub fn heap(&self) -> HeapId {
        self.heap
    }
}

struct PrefixFields {
    dblk_size: u64,
    free_head: u64,
    dblk_addr: Addr,
}

fn decode_prefix(dec: &mut Decoder<'_>) -> Result<PrefixFields> {
    dec.signature(HEAP_MAGIC, "local heap")?;
    let version = dec.u8()?;
    if version != HEAP_VERSION {
        return Err(MetadataError::BadVersion {
            what: "local heap",
            found: version,
        });
    }
    dec.skip(3)?;
    let dblk_size = dec.length()?;
    let free_head = dec.length()?;
    let dblk_addr = dec.addr()?;
    Ok(PrefixFields {
        dblk_size,
        free_head,
        dblk_addr,
    })
}

impl CacheClient for HeapPrefix {
    const ID: ClientId = ClientId::HeapPrefix;

    /// Prefix address
    type UserData = Addr;

    fn initial_load_size(_udata: &Addr, ctx: &ClientContext<'_>) -> usize {
        prefix_size(ctx.config)
    }

    fn final_load_size(
        image: &[u8],
        udata: &Addr,
        ctx: &ClientContext<'_>,
    ) -> Result<Option<usize>> {
        let fields = decode_prefix(&mut Decoder::new(image, ctx.config))?;
        let prfx_size = prefix_size(ctx.config);
        if udata.offset(prfx_size as u64) == Some(fields.dblk_addr) {
            let total = usize::try_from(fields.dblk_size)
                .ok()
                .and_then(|size| size.checked_add(prfx_size))
                .ok_or_else(|| {
                    MetadataError::bad_value(format!("local heap of {} bytes", fields.dblk_size))
                })?;
            Ok(Some(total))
        } else {
            Ok(None)
        }
    }

    fn deserialize(image: &[u8], udata: &Addr, ctx: &mut ClientContext<'_>) -> Result<Self> {
        let mut dec = Decoder::new(image, ctx.config);
        let fields = decode_prefix(&mut dec)?;
        let prfx_size = prefix_size(ctx.config);
        dec.seek(prfx_size)?;
        let single_cache_obj = udata.offset(prfx_size as u64) == Some(fields.dblk_addr);

        let mut heap = LocalHeap {
            prfx_addr: *udata,
            prfx_size,
            dblk_addr: fields.dblk_addr,
            dblk_size: fields.dblk_size,
            single_cache_obj,
            free_head: fields.free_head,
            free_list: vec![],
            image: vec![],
            rc: 0,
            prots: 0,
            dblk: None,
        };
        if single_cache_obj {
            heap.image = dec.bytes(fields.dblk_size as usize)?.to_vec();
            heap.decode_free_list(ctx.config)?;
        }

        let id = ctx.heaps.add(heap);
        ctx.heaps.inc_rc(id)?;
        Ok(Self { heap: id })
    }

    fn image_len(&self, ctx: &ClientContext<'_>) -> usize {
        let prfx_size = prefix_size(ctx.config);
        match ctx.heaps.heap(self.heap) {
            Ok(heap) if heap.single_cache_obj => prfx_size + heap.dblk_size as usize,
            _ => prfx_size,
        }
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        let heap = ctx.heaps.heap(self.heap)?;
        let mut enc = Encoder::new(image, ctx.config);
        enc.bytes(HEAP_MAGIC)?;
        enc.u8(HEAP_VERSION)?;
        enc.zeros(3)?;
        enc.length(heap.dblk_size)?;
        enc.length(heap.free_head())?;
        enc.addr(heap.dblk_addr)?;
        if heap.single_cache_obj {
            let prfx_size = heap.prfx_size;
            enc.zeros(prfx_size - enc.position())?;
            heap.encode_data(ctx.config, &mut image[prfx_size..])?;
        } else {
            enc.zero_fill();
        }
        Ok(())
    }

    fn free_icr(self, ctx: &mut ClientContext<'_>) -> Result<()> {
        ctx.heaps.dec_rc(self.heap)
    }

    cache_thing!(HeapPrefix);
}

/// Create a heap with room for `size_hint` bytes of data. Returns the prefix address.
///
/// The data block is allocated directly after the prefix and the pair is cached as a single
/// entry.
pub fn create(
    cache: &mut MetadataCache,
    space: &mut dyn FileAllocator,
    size_hint: u64,
) -> Result<Addr> {
    let config = cache.config();
    let prfx_size = prefix_size(config);
    let dblk_size = align8(size_hint.max(sizeof_free(config)) as usize) as u64;
    let total = prfx_size as u64 + dblk_size;
    let addr = space.alloc(MemType::LHeap, total)?;
    let dblk_addr = addr
        .offset(prfx_size as u64)
        .ok_or(MetadataError::Allocation {
            mem: MemType::LHeap,
            size: total,
        })?;

    let heap = LocalHeap {
        prfx_addr: addr,
        prfx_size,
        dblk_addr,
        dblk_size,
        single_cache_obj: true,
        free_head: 0,
        free_list: vec![FreeBlock {
            offset: 0,
            size: dblk_size,
        }],
        image: vec![0; dblk_size as usize],
        rc: 0,
        prots: 0,
        dblk: None,
    };
    let heaps = cache.heaps_mut();
    let id = heaps.add(heap);
    heaps.inc_rc(id)?;
    if let Err(e) = cache.insert(addr, HeapPrefix { heap: id }, false) {
        cache.heaps_mut().dec_rc(id)?;
        space.free(MemType::LHeap, addr, total)?;
        return Err(e);
    }
    tracing::debug!(%addr, dblk_size, "created local heap");
    Ok(addr)
}

/// Protect the heap with its prefix at `addr`. A separate data block is loaded and pinned.
pub async fn protect<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    addr: Addr,
) -> Result<HeapId> {
    let id = cache.protect::<HeapPrefix, S>(store, addr, &addr).await?.heap;
    let heap = cache.heaps().heap(id)?;
    let (single, prots, dblk_addr) = (heap.single_cache_obj, heap.prots, heap.dblk_addr);
    if !single && prots == 0 {
        if let Err(e) = pin_data_block(cache, store, id, dblk_addr).await {
            cache.unprotect(addr, false)?;
            return Err(e);
        }
    }
    cache.heaps_mut().heap_mut(id)?.prots += 1;
    Ok(id)
}

async fn pin_data_block<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    id: HeapId,
    dblk_addr: Addr,
) -> Result<()> {
    cache.protect::<DataBlock, S>(store, dblk_addr, &id).await?;
    if !cache.is_pinned(dblk_addr)? {
        cache.pin(dblk_addr)?;
    }
    cache.unprotect(dblk_addr, false)
}

/// Release a heap protected with [`protect`].
pub fn unprotect(cache: &mut MetadataCache, id: HeapId) -> Result<()> {
    let heap = cache.heaps_mut().heap_mut(id)?;
    if heap.prots == 0 {
        return Err(MetadataError::bad_value("local heap is not protected"));
    }
    heap.prots -= 1;
    let (prots, single, prfx_addr, dblk_addr) = (
        heap.prots,
        heap.single_cache_obj,
        heap.prfx_addr,
        heap.dblk_addr,
    );
    if prots == 0 && !single && cache.is_pinned(dblk_addr)? {
        cache.unpin(dblk_addr)?;
    }
    cache.unprotect(prfx_addr, false)
}

fn dirty(cache: &mut MetadataCache, id: HeapId) -> Result<()> {
    let heap = cache.heaps().heap(id)?;
    let (single, prfx_addr, dblk_addr) = (heap.single_cache_obj, heap.prfx_addr, heap.dblk_addr);
    if !single {
        cache.mark_dirty(dblk_addr)?;
    }
    cache.mark_dirty(prfx_addr)
}

fn ensure_protected(heap: &LocalHeap) -> Result<()> {
    if heap.prots == 0 {
        return Err(MetadataError::bad_value("local heap is not protected"));
    }
    Ok(())
}

/// Copy `data` into the heap, returning its offset. The heap must be protected.
///
/// Space is taken first-fit from the free list. When nothing fits, the data block grows by the
/// larger of the space needed and its current size.
pub fn insert(
    cache: &mut MetadataCache,
    space: &mut dyn FileAllocator,
    id: HeapId,
    data: &[u8],
) -> Result<u64> {
    if data.is_empty() {
        return Err(MetadataError::bad_value("can't insert nothing into a local heap"));
    }
    let min_free = sizeof_free(cache.config());
    let need = align8(data.len()) as u64;
    let heap = cache.heaps_mut().heap_mut(id)?;
    ensure_protected(heap)?;

    let mut found = None;
    // highest free block, which might end at the end of the heap
    let mut last: Option<usize> = None;
    for (i, fl) in heap.free_list.iter().enumerate() {
        if fl.size > need && fl.size - need >= min_free {
            found = Some((i, false));
            break;
        } else if fl.size == need {
            found = Some((i, true));
            break;
        } else if last.map_or(true, |l| heap.free_list[l].offset < fl.offset) {
            last = Some(i);
        }
    }

    let offset = match found {
        Some((i, false)) => {
            let fl = &mut heap.free_list[i];
            let offset = fl.offset;
            fl.offset += need;
            fl.size -= need;
            offset
        }
        Some((i, true)) => heap.free_list.remove(i).offset,
        None => {
            let saved = heap.free_list.clone();
            let old_size = heap.dblk_size;
            let more = need.max(old_size);
            let offset = match last {
                Some(l) if heap.free_list[l].offset + heap.free_list[l].size == old_size => {
                    let fl = &mut heap.free_list[l];
                    let offset = fl.offset;
                    fl.offset += need;
                    fl.size += more - need;
                    if fl.size < min_free {
                        heap.free_list.remove(l);
                    }
                    offset
                }
                _ => {
                    if more - need >= min_free {
                        heap.free_list.push(FreeBlock {
                            offset: old_size + need,
                            size: more - need,
                        });
                    }
                    old_size
                }
            };
            tracing::debug!(heap = id.0, from = old_size, to = old_size + more, "growing local heap");
            if let Err(e) = realloc(cache, space, id, old_size + more) {
                // realloc has already restored the address and size
                cache.heaps_mut().heap_mut(id)?.free_list = saved;
                return Err(e);
            }
            offset
        }
    };

    let heap = cache.heaps_mut().heap_mut(id)?;
    let start = offset as usize;
    heap.image[start..start + data.len()].copy_from_slice(data);
    heap.image[start + data.len()..start + need as usize].fill(0);
    dirty(cache, id)?;
    Ok(offset)
}

/// Return `size` bytes at `offset` to the heap's free list. The heap must be protected.
pub fn remove(cache: &mut MetadataCache, id: HeapId, offset: u64, size: u64) -> Result<()> {
    let min_free = sizeof_free(cache.config());
    let heap = cache.heaps_mut().heap_mut(id)?;
    ensure_protected(heap)?;
    let dblk_size = heap.dblk_size;
    let out_of_range = || {
        MetadataError::bad_value(format!(
            "can't remove {size} bytes at offset {offset} from {dblk_size} byte heap"
        ))
    };
    if size == 0 || size > dblk_size {
        return Err(out_of_range());
    }
    let size = align8(size as usize) as u64;
    if offset.checked_add(size).map_or(true, |end| end > dblk_size) {
        return Err(out_of_range());
    }

    let list = &mut heap.free_list;
    let mut merged = None;
    for (i, fl) in list.iter_mut().enumerate() {
        if offset + size == fl.offset {
            fl.offset = offset;
            fl.size += size;
            merged = Some(i);
            break;
        } else if fl.offset + fl.size == offset {
            fl.size += size;
            merged = Some(i);
            break;
        }
    }
    match merged {
        Some(i) => {
            // the grown block may now touch another one
            let (start, end) = (list[i].offset, list[i].offset + list[i].size);
            if let Some(j) = list
                .iter()
                .position(|o| o.offset == end || o.offset + o.size == start)
            {
                let other = list.remove(j);
                let i = if j < i { i - 1 } else { i };
                list[i].offset = list[i].offset.min(other.offset);
                list[i].size += other.size;
            }
        }
        None if size < min_free => {
            tracing::warn!(heap = id.0, offset, size, "heap block too small to free, space lost");
        }
        None => list.insert(0, FreeBlock { offset, size }),
    }
    dirty(cache, id)
}

/// Bytes of the heap starting at `offset`.
pub fn offset_into(heaps: &HeapArena, id: HeapId, offset: u64) -> Result<&[u8]> {
    let heap = heaps.heap(id)?;
    if offset >= heap.dblk_size || offset as usize >= heap.image.len() {
        return Err(MetadataError::bad_value(format!(
            "offset {offset} is outside {} byte heap",
            heap.dblk_size
        )));
    }
    Ok(&heap.image[offset as usize..])
}

/// Null terminated string stored at `offset`.
pub fn name_at(heaps: &HeapArena, id: HeapId, offset: u64) -> Result<String> {
    let bytes = offset_into(heaps, id, offset)?;
    let end = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| MetadataError::bad_value(format!("unterminated name at offset {offset}")))?;
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| MetadataError::bad_value(format!("name at offset {offset} is not UTF-8")))
}

/// Print the heap with its prefix at `addr`.
pub async fn debug<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    addr: Addr,
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
) -> Result<()> {
    let id = protect(cache, store, addr).await?;
    let printed = cache
        .heaps()
        .heap(id)
        .and_then(|heap| print_heap(heap, out, indent, fwidth));
    unprotect(cache, id)?;
    printed
}

fn print_heap(heap: &LocalHeap, out: &mut dyn Write, indent: usize, fwidth: usize) -> Result<()> {
    writeln!(out, "{:indent$}Local Heap...", "")?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Header size (in bytes):", heap.prfx_size)?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Address of heap data:", heap.dblk_addr)?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Data bytes allocated for heap:", heap.dblk_size)?;
    let layout = if heap.single_cache_obj { "combined" } else { "separate" };
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Data block layout:", layout)?;

    let (inner, inner_width) = (indent + 3, fwidth.saturating_sub(3));
    let mut free = 0;
    for (i, block) in heap.free_list.iter().enumerate() {
        writeln!(out, "{:indent$}Free Block #{i}:", "")?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Offset:", block.offset)?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Length:", block.size)?;
        free += block.size;
    }
    if heap.dblk_size > 0 {
        let used = heap.dblk_size - free.min(heap.dblk_size);
        let used = 100.0 * used as f64 / heap.dblk_size as f64;
        writeln!(out, "{:indent$}{:<fwidth$} {used:.2}%", "", "Percent of heap used:")?;
    }
    Ok(())
}
