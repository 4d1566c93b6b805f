//! Lock-free presence bitmap.

use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-length set of block indices.
///
/// Bits are only ever set, never cleared, so readers need no lock.
#[derive(Debug)]
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    len: u64,
}

impl Bitmap {
    /// A bitmap of `len` unset bits.
    #[must_use]
    pub fn new(len: u64) -> Self {
        let words = len.div_ceil(64);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            len,
        }
    }

    /// Number of bits.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the bitmap has no bits at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn locate(index: u64) -> (usize, u64) {
        ((index / 64) as usize, 1 << (index % 64))
    }

    /// Whether `index` is set. Out-of-range indices are never set.
    #[must_use]
    pub fn is_set(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, mask) = Self::locate(index);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Set `index`. Out-of-range indices are ignored.
    pub fn set(&self, index: u64) {
        if index >= self.len {
            return;
        }
        let (word, mask) = Self::locate(index);
        self.words[word].fetch_or(mask, Ordering::Release);
    }

    /// Whether every index in `range` is set.
    #[must_use]
    pub fn all_set(&self, range: std::ops::RangeInclusive<u64>) -> bool {
        range.into_iter().all(|i| self.is_set(i))
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Acquire).count_ones()))
            .sum()
    }
}
