//! Hashing for arena ids
//!
//! Heap and data block ids are handed out sequentially, so they are already well spread and can
//! be used as their own hash.

use core::hash::{BuildHasherDefault, Hasher};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IdHasher(u64);

impl Hasher for IdHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(*byte);
        }
    }

    fn write_usize(&mut self, id: usize) {
        self.0 = id as u64;
    }
}

pub(crate) type BuildIdHasher = BuildHasherDefault<IdHasher>;
