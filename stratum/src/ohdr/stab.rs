use std::io::Write;

use super::{MessageCodec, STAB_ID};
use crate::config::FileConfig;
use crate::error::Result;
use crate::format::{Addr, Decoder, Encoder};

/// Marks an object as a group and locates its B-tree and name heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolTable {
    /// Group B-tree
    pub btree: Addr,
    /// Local heap holding link names
    pub heap: Addr,
}

impl MessageCodec for SymbolTable {
    const ID: u16 = STAB_ID;
    const NAME: &'static str = "stab";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            btree: dec.addr()?,
            heap: dec.addr()?,
        })
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        enc.addr(self.btree)?;
        enc.addr(self.heap)
    }

    fn size(&self, config: &FileConfig) -> usize {
        2 * config.sizeof_addr()
    }

    fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()> {
        writeln!(out, "{:indent$}{:<fwidth$} {}", "", "B-tree address:", self.btree)?;
        writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Name heap address:", self.heap)
    }
}
