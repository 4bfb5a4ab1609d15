use std::io::Write;

use super::{MessageCodec, SHMESG_ID};
use crate::config::FileConfig;
use crate::error::Result;
use crate::format::{Addr, Decoder, Encoder};

/// Where the file's shared message table lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedMessageTable {
    /// Table version, stored as found
    pub version: u8,
    /// Table address
    pub addr: Addr,
    /// Number of indexes in the table
    pub nindexes: u8,
}

impl MessageCodec for SharedMessageTable {
    const ID: u16 = SHMESG_ID;
    const NAME: &'static str = "shared message table";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            version: dec.u8()?,
            addr: dec.addr()?,
            nindexes: dec.u8()?,
        })
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        enc.u8(self.version)?;
        enc.addr(self.addr)?;
        enc.u8(self.nindexes)
    }

    fn size(&self, config: &FileConfig) -> usize {
        1 + config.sizeof_addr() + 1
    }

    fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()> {
        writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Version:", self.version)?;
        writeln!(
            out,
            "{:indent$}{:<fwidth$} {} (rel)",
            "", "Shared message table address:", self.addr
        )?;
        writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Number of indexes:", self.nindexes)
    }
}
