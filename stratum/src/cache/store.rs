use crate::error::Result;
use crate::format::Addr;

/// Byte addressable backing storage for metadata images.
///
/// Once a write has completed, every later read must observe it.
#[allow(async_fn_in_trait)]
pub trait MetadataStore {
    /// Read `len` bytes at `addr`. Bytes past the end of storage read as zero.
    async fn read(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>>;

    /// Write `bytes` at `addr`.
    async fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()>;
}

/// Store held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    bytes: Vec<u8>,
    writes: Vec<Addr>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Addresses written so far, oldest first.
    pub fn writes(&self) -> &[Addr] {
        &self.writes
    }
}

impl MetadataStore for MemoryStore {
    async fn read(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        let start = addr.value() as usize;
        let mut out = vec![0; len];
        if start < self.bytes.len() {
            let end = (start + len).min(self.bytes.len());
            out[..end - start].copy_from_slice(&self.bytes[start..end]);
        }
        Ok(out)
    }

    async fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        let start = addr.value() as usize;
        let end = start + bytes.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(bytes);
        self.writes.push(addr);
        Ok(())
    }
}
