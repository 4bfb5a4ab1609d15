use super::{BlockId, HeapArena, HeapId};
use crate::cache::{
    cache_thing, CacheClient, CacheError, ClientContext, ClientId, MetadataCache,
};
use crate::error::{MetadataError, Result};
use crate::format::Addr;
use crate::freespace::{FileAllocator, MemType};

/// Cache object for a heap data block stored apart from its prefix.
#[derive(Debug)]
pub struct DataBlock {
    block: BlockId,
}

impl DataBlock {
    /// Arena id of this block.
    pub fn id(&self) -> BlockId {
        self.block
    }
}

/// Create a data block for `heap`, linking the two together.
pub fn dblk_new(heaps: &mut HeapArena, heap: HeapId) -> Result<DataBlock> {
    let block = heaps.new_block();
    if let Err(e) = heaps.inc_rc(heap) {
        heaps.blocks.remove(&block);
        return Err(e);
    }
    heaps.blocks.insert(block, Some(heap));
    heaps.heap_mut(heap)?.dblk = Some(block);
    Ok(DataBlock { block })
}

/// Destroy a data block, unlinking it from its heap.
///
/// The block is always released, even if dropping the heap reference fails.
pub fn dblk_dest(heaps: &mut HeapArena, block: DataBlock) -> Result<()> {
    let mut result = Ok(());
    if let Some(heap) = heaps.block_heap(block.block) {
        if let Ok(h) = heaps.heap_mut(heap) {
            h.dblk = None;
        }
        result = heaps.dec_rc(heap);
        heaps.blocks.insert(block.block, None);
    }
    heaps.blocks.remove(&block.block);
    result
}

impl CacheClient for DataBlock {
    const ID: ClientId = ClientId::HeapDataBlock;

    /// Heap the block belongs to
    type UserData = HeapId;

    fn initial_load_size(udata: &HeapId, ctx: &ClientContext<'_>) -> usize {
        match ctx.heaps.heap(*udata) {
            Ok(h) => h.dblk_size as usize,
            Err(e) => {
                tracing::warn!(heap = ?udata, %e, "loading data block of unknown heap");
                0
            }
        }
    }

    fn deserialize(image: &[u8], udata: &HeapId, ctx: &mut ClientContext<'_>) -> Result<Self> {
        let block = dblk_new(ctx.heaps, *udata)?;
        let decoded = ctx.heaps.heap_mut(*udata).and_then(|heap| {
            heap.image = image.to_vec();
            heap.decode_free_list(ctx.config)
        });
        if let Err(e) = decoded {
            dblk_dest(ctx.heaps, block)?;
            return Err(e);
        }
        Ok(block)
    }

    fn image_len(&self, ctx: &ClientContext<'_>) -> usize {
        ctx.heaps
            .block_heap(self.block)
            .and_then(|id| ctx.heaps.heap(id).ok())
            .map(|h| h.dblk_size as usize)
            .unwrap_or(0)
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        let id = ctx
            .heaps
            .block_heap(self.block)
            .ok_or_else(|| MetadataError::bad_value("data block has no heap"))?;
        ctx.heaps.heap(id)?.encode_data(ctx.config, image)
    }

    fn free_icr(self, ctx: &mut ClientContext<'_>) -> Result<()> {
        dblk_dest(ctx.heaps, self)
    }

    cache_thing!(HeapDataBlock);
}

/// Resize a heap's data block to `new_size` bytes.
///
/// The old range is freed and a new one allocated. If the allocator hands back the same address
/// the cache entry is resized in place. Otherwise a combined heap is split, with the data block
/// inserted as a new pinned entry, and a separate data block is resized and moved.
///
/// If updating the cache fails, the heap's recorded address and size are put back and the cache
/// entries keep their old sizes. The file space operations are not undone.
pub fn realloc(
    cache: &mut MetadataCache,
    space: &mut dyn FileAllocator,
    heap: HeapId,
    new_size: u64,
) -> Result<()> {
    let h = cache.heaps().heap(heap)?;
    let (old_addr, old_size) = (h.dblk_addr, h.dblk_size);

    space.free(MemType::LHeap, old_addr, old_size)?;
    let new_addr = space.alloc(MemType::LHeap, new_size)?;

    let h = cache.heaps_mut().heap_mut(heap)?;
    h.dblk_addr = new_addr;
    h.dblk_size = new_size;

    match relocate(cache, heap, old_addr, new_addr, new_size) {
        Ok(()) => {
            cache
                .heaps_mut()
                .heap_mut(heap)?
                .image
                .resize(new_size as usize, 0);
            tracing::debug!(
                %old_addr,
                %new_addr,
                old_size,
                new_size,
                "reallocated heap data block"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(%old_addr, %new_addr, %e, "heap data block reallocation failed");
            let h = cache.heaps_mut().heap_mut(heap)?;
            h.dblk_addr = old_addr;
            h.dblk_size = old_size;
            Err(e)
        }
    }
}

fn relocate(
    cache: &mut MetadataCache,
    heap: HeapId,
    old_addr: Addr,
    new_addr: Addr,
    new_size: u64,
) -> Result<()> {
    let h = cache.heaps().heap(heap)?;
    let (single, prfx_addr, prfx_size) = (h.single_cache_obj, h.prfx_addr, h.prfx_size);

    if new_addr == old_addr {
        return if single {
            cache.resize(prfx_addr, prfx_size + new_size as usize)
        } else {
            cache.resize(old_addr, new_size as usize)
        };
    }

    if single {
        if cache.contains(new_addr) {
            return Err(CacheError::AlreadyResident(new_addr).into());
        }
        let block = dblk_new(cache.heaps_mut(), heap)?;
        let id = block.id();
        if let Err(e) = cache.insert(new_addr, block, true) {
            dblk_dest(cache.heaps_mut(), DataBlock { block: id })?;
            return Err(e);
        }
        cache.heaps_mut().heap_mut(heap)?.single_cache_obj = false;
        cache.resize(prfx_addr, prfx_size)
    } else {
        cache.move_entry(old_addr, new_addr)?;
        cache.resize(new_addr, new_size as usize)
    }
}
