use std::fmt;

use serde::{Deserialize, Serialize};

/// A file address.
///
/// The all ones value is reserved to mean "undefined" (no address). When encoded, an undefined
/// address becomes all 0xff bytes at whatever width the file uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr(u64);

impl Addr {
    /// The undefined address.
    pub const UNDEF: Addr = Addr(u64::MAX);

    /// Create an address from a byte offset.
    pub const fn new(offset: u64) -> Self {
        Addr(offset)
    }

    /// Byte offset of this address.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Is this a real address?
    pub const fn is_defined(self) -> bool {
        self.0 != u64::MAX
    }

    /// Address `len` bytes further on, if defined and not overflowing.
    pub fn offset(self, len: u64) -> Option<Addr> {
        if !self.is_defined() {
            return None;
        }
        self.0
            .checked_add(len)
            .filter(|v| *v != u64::MAX)
            .map(Addr)
    }
}

impl Default for Addr {
    fn default() -> Self {
        Addr::UNDEF
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_defined() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "UNDEF")
        }
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value)
    }
}
