use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{FreeSpaceManager, FsBucket, MemType};
use crate::cache::{ClientId, MetadataCache, MetadataStore};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::Addr;

/// Hands out and takes back ranges of file space.
pub trait FileAllocator {
    /// Allocate `size` bytes for `mem`.
    fn alloc(&mut self, mem: MemType, size: u64) -> Result<Addr>;

    /// Return `size` bytes at `addr`, previously allocated for `mem`.
    fn free(&mut self, mem: MemType, addr: Addr, size: u64) -> Result<()>;
}

/// Where a bucket's section list is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsLocation {
    /// Image address
    pub addr: Addr,
    /// Allocated size of the image
    pub size: u64,
}

/// File space allocator.
///
/// Space is served first-fit from the free sections of the request's bucket, and otherwise by
/// extending the end of allocated space (EOA). Freed ranges merge with their neighbours, and a
/// freed range which reaches the EOA shrinks it instead of becoming a section.
#[derive(Debug)]
pub struct FileSpace {
    eoa: u64,
    page_size: Option<u64>,
    managers: BTreeMap<FsBucket, FreeSpaceManager>,
    locations: BTreeMap<FsBucket, FsLocation>,
}

impl FileSpace {
    /// Allocator for a new file whose fixed structures end at `base`.
    pub fn new(config: &FileConfig, base: u64) -> Self {
        let eoa = match config.page_size {
            Some(page) => base.div_ceil(page) * page,
            None => base,
        };
        Self {
            eoa,
            page_size: config.page_size,
            managers: BTreeMap::new(),
            locations: BTreeMap::new(),
        }
    }

    /// Allocator for an existing file.
    pub fn with_locations(
        config: &FileConfig,
        eoa: u64,
        locations: BTreeMap<FsBucket, FsLocation>,
    ) -> Self {
        Self {
            eoa,
            page_size: config.page_size,
            managers: BTreeMap::new(),
            locations,
        }
    }

    /// End of allocated space.
    pub fn eoa(&self) -> u64 {
        self.eoa
    }

    /// Where each persisted section list lives.
    pub fn locations(&self) -> &BTreeMap<FsBucket, FsLocation> {
        &self.locations
    }

    /// The open manager for `bucket`, if any.
    pub fn manager(&self, bucket: FsBucket) -> Option<&FreeSpaceManager> {
        self.managers.get(&bucket)
    }

    /// Total free bytes held in sections.
    pub fn total_free(&self) -> u64 {
        self.managers.values().map(|m| m.total()).sum()
    }

    /// Bucket serving a request.
    pub fn bucket_for(&self, mem: MemType, size: u64) -> FsBucket {
        match self.page_size {
            None => FsBucket::Mem(mem),
            Some(page) if size >= page => FsBucket::Large,
            Some(_) if mem == MemType::Draw => FsBucket::SmallRaw,
            Some(_) => FsBucket::SmallMeta,
        }
    }

    /// Read every persisted section list which isn't already open.
    pub async fn open_managers<S: MetadataStore>(
        &mut self,
        cache: &mut MetadataCache,
        store: &mut S,
    ) -> Result<()> {
        let pending: Vec<(FsBucket, FsLocation)> = self
            .locations
            .iter()
            .filter(|(b, _)| !self.managers.contains_key(*b))
            .map(|(b, l)| (*b, *l))
            .collect();
        for (bucket, loc) in pending {
            let resident = cache.contains(loc.addr);
            cache
                .load::<FreeSpaceManager, S>(store, loc.addr, &())
                .await?;
            let manager = cache.get::<FreeSpaceManager>(loc.addr)?.clone();
            if !resident {
                cache.expunge(loc.addr)?;
            }
            if manager.bucket() != bucket {
                return Err(MetadataError::bad_value(format!(
                    "section list at {} is for {}, not {bucket}",
                    loc.addr,
                    manager.bucket()
                )));
            }
            tracing::debug!(%bucket, sections = manager.len(), "opened free space manager");
            self.managers.insert(bucket, manager);
        }
        Ok(())
    }

    /// Write every non-empty section list into `cache`, recording where each one went.
    ///
    /// The space held by previously persisted lists is released first. New images are placed at
    /// the end of allocated space so that placing them doesn't change any section list.
    pub fn persist(&mut self, cache: &mut MetadataCache) -> Result<()> {
        let old = std::mem::take(&mut self.locations);
        for loc in old.into_values() {
            if cache.client_at(loc.addr) == Some(ClientId::FreeSpace) {
                cache.expunge(loc.addr)?;
            }
            self.free(MemType::Super, loc.addr, loc.size)?;
        }

        let buckets: Vec<FsBucket> = self
            .managers
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(b, _)| *b)
            .collect();
        for bucket in buckets {
            let Some(manager) = self.managers.get(&bucket).cloned() else {
                continue;
            };
            let size = manager.image_size() as u64;
            let size = match self.page_size {
                Some(page) => size.div_ceil(page) * page,
                None => size,
            };
            let addr = self.extend(MemType::Super, size)?;
            tracing::debug!(%bucket, %addr, size, "persisting free space manager");
            cache.insert(addr, manager, false)?;
            self.locations.insert(bucket, FsLocation { addr, size });
        }
        Ok(())
    }

    /// Every section has now been written.
    pub fn mark_serialized(&mut self) {
        for manager in self.managers.values_mut() {
            manager.mark_serialized();
        }
    }

    fn extend(&mut self, mem: MemType, size: u64) -> Result<Addr> {
        let end = self
            .eoa
            .checked_add(size)
            .filter(|end| *end < u64::MAX)
            .ok_or(MetadataError::Allocation { mem, size })?;
        let addr = Addr::new(self.eoa);
        self.eoa = end;
        Ok(addr)
    }

    fn take(&mut self, bucket: FsBucket, size: u64) -> Option<Addr> {
        let manager = self.managers.get_mut(&bucket)?;
        let addr = manager.first_fit(size)?;
        let section = manager.remove(addr)?;
        if section.size > size {
            manager.add(Addr::new(addr.value() + size), section.size - size);
        }
        Some(addr)
    }

    fn free_small(&mut self, bucket: FsBucket, addr: Addr, size: u64, page: u64) -> Result<()> {
        let page_start = addr.value() / page * page;
        let manager = self
            .managers
            .entry(bucket)
            .or_insert_with(|| FreeSpaceManager::new(bucket));
        let mut start = addr.value();
        let mut len = size;
        if let Some(prev) = manager.adjacent_before(addr).map(|s| (s.addr, s.size)) {
            if prev.0.value() >= page_start {
                manager.remove(prev.0);
                start = prev.0.value();
                len += prev.1;
            }
        }
        let next_addr = Addr::new(addr.value() + size);
        if let Some(next) = manager.sections.get(&next_addr).map(|s| s.size) {
            if next_addr.value() + next <= page_start + page {
                manager.remove(next_addr);
                len += next;
            }
        }
        if start == page_start && len == page {
            // whole page is free again
            return self.free_whole(FsBucket::Large, Addr::new(start), len);
        }
        manager.add(Addr::new(start), len);
        Ok(())
    }

    fn free_whole(&mut self, bucket: FsBucket, addr: Addr, size: u64) -> Result<()> {
        let manager = self
            .managers
            .entry(bucket)
            .or_insert_with(|| FreeSpaceManager::new(bucket));
        let mut start = addr.value();
        let mut len = size;
        if let Some((prev, prev_size)) = manager.adjacent_before(addr).map(|s| (s.addr, s.size)) {
            manager.remove(prev);
            start = prev.value();
            len += prev_size;
        }
        let next_addr = Addr::new(addr.value() + size);
        if let Some(next) = manager.remove(next_addr) {
            len += next.size;
        }
        if start + len == self.eoa {
            self.eoa = start;
            self.shrink();
        } else {
            manager.add(Addr::new(start), len);
        }
        Ok(())
    }

    // Pull the EOA back over any unpaged or whole page sections which now end at it.
    fn shrink(&mut self) {
        loop {
            let eoa = self.eoa;
            let found = self
                .managers
                .values_mut()
                .filter(|m| !m.bucket().is_small())
                .find_map(|m| m.section_ending_at(eoa).map(|addr| (m, addr)));
            match found {
                Some((manager, addr)) => {
                    manager.remove(addr);
                    tracing::debug!(from = eoa, to = addr.value(), "shrank end of allocation");
                    self.eoa = addr.value();
                }
                None => break,
            }
        }
    }
}

impl FileAllocator for FileSpace {
    fn alloc(&mut self, mem: MemType, size: u64) -> Result<Addr> {
        if size == 0 {
            return Err(MetadataError::Allocation { mem, size });
        }
        let bucket = self.bucket_for(mem, size);
        let size = match (bucket, self.page_size) {
            (FsBucket::Large, Some(page)) => size.div_ceil(page) * page,
            _ => size,
        };
        if let Some(addr) = self.take(bucket, size) {
            tracing::debug!(%mem, %addr, size, "allocated from free space");
            return Ok(addr);
        }
        let addr = match (bucket.is_small(), self.page_size) {
            (true, Some(page)) => {
                let page_addr = self.extend(mem, page)?;
                if page > size {
                    self.managers
                        .entry(bucket)
                        .or_insert_with(|| FreeSpaceManager::new(bucket))
                        .add(Addr::new(page_addr.value() + size), page - size);
                }
                page_addr
            }
            _ => self.extend(mem, size)?,
        };
        tracing::debug!(%mem, %addr, size, "allocated at end of file");
        Ok(addr)
    }

    fn free(&mut self, mem: MemType, addr: Addr, size: u64) -> Result<()> {
        if !addr.is_defined() || size == 0 {
            return Err(MetadataError::bad_value(format!(
                "can't free {size} bytes at {addr}"
            )));
        }
        if addr.value() + size > self.eoa {
            return Err(MetadataError::bad_value(format!(
                "freeing {size} bytes at {addr} runs past end of allocation {}",
                self.eoa
            )));
        }
        let bucket = self.bucket_for(mem, size);
        tracing::debug!(%mem, %addr, size, %bucket, "freeing");
        match (bucket, self.page_size) {
            (FsBucket::SmallMeta | FsBucket::SmallRaw, Some(page)) => {
                self.free_small(bucket, addr, size, page)
            }
            (FsBucket::Large, Some(page)) => {
                self.free_whole(bucket, addr, size.div_ceil(page) * page)
            }
            _ => self.free_whole(bucket, addr, size),
        }
    }
}
