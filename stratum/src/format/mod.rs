//! On-disk encoding primitives
//!
//! Addresses, lengths and integers are encoded with the widths and byte order recorded in a
//! file's [`FileConfig`](crate::FileConfig). All reads and writes go through bounds checked
//! cursors.

pub use self::addr::Addr;
pub use self::cursor::{Decoder, Encoder};

mod addr;
mod cursor;

use serde::{Deserialize, Serialize};
use strum::EnumString;

/// Size of every structure signature.
pub const SIZEOF_MAGIC: usize = 4;

/// Byte order of multi-byte integers in a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, strum::Display)]
#[strum(ascii_case_insensitive)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

/// Round up to the next multiple of 8.
pub const fn align8(value: usize) -> usize {
    (value + 7) & !7
}
