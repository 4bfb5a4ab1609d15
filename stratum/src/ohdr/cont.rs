use std::io::Write;

use super::{MessageCodec, CONT_ID};
use crate::cache::MetadataCache;
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{Addr, Decoder, Encoder};
use crate::freespace::{FileAllocator, MemType};

/// The rest of an object header lives in another chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Continuation {
    /// Chunk address
    pub addr: Addr,
    /// Chunk size
    pub size: u64,
    /// Index of the chunk within its header. Assigned each time the header is loaded.
    pub chunkno: usize,
}

impl MessageCodec for Continuation {
    const ID: u16 = CONT_ID;
    const NAME: &'static str = "continuation";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            addr: dec.addr()?,
            size: dec.length()?,
            chunkno: 0,
        })
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        if !self.addr.is_defined() || self.size == 0 {
            return Err(MetadataError::bad_value(format!(
                "continuation to {} of {} bytes",
                self.addr, self.size
            )));
        }
        enc.addr(self.addr)?;
        enc.length(self.size)
    }

    fn size(&self, config: &FileConfig) -> usize {
        config.sizeof_addr() + config.sizeof_size()
    }

    fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()> {
        writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Continuation address:", self.addr)?;
        writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Continuation size in bytes:", self.size)?;
        writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Points to chunk number:", self.chunkno)
    }

    fn delete(&self, cache: &mut MetadataCache, space: &mut dyn FileAllocator) -> Result<()> {
        if cache.contains(self.addr) {
            cache.expunge(self.addr)?;
        }
        space.free(MemType::Ohdr, self.addr, self.size)?;
        tracing::debug!(addr = %self.addr, size = self.size, "released object header chunk");
        Ok(())
    }
}
