use std::io::Write;

use super::{MessageCodec, BOGUS_ID};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{Decoder, Encoder};

/// The only value a bogus message may hold.
pub const BOGUS_VALUE: u32 = 0xdeadbeef;

/// A message no real file contains, used to exercise unknown message handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bogus {
    /// Decoded value. Encoding ignores it and always writes [`BOGUS_VALUE`].
    pub value: u32,
}

impl Default for Bogus {
    fn default() -> Self {
        Self { value: BOGUS_VALUE }
    }
}

impl MessageCodec for Bogus {
    const ID: u16 = BOGUS_ID;
    const NAME: &'static str = "bogus";

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let value = dec.u32()?;
        if value != BOGUS_VALUE {
            return Err(MetadataError::bad_value(format!(
                "bogus message holds {value:#x}"
            )));
        }
        Ok(Self { value })
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        enc.u32(BOGUS_VALUE)
    }

    fn size(&self, _config: &FileConfig) -> usize {
        4
    }

    fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()> {
        writeln!(out, "{:indent$}{:<fwidth$} `{}'", "", "Bogus Value:", BOGUS_VALUE)
    }
}
