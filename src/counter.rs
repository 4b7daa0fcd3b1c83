//! Packed saturating counters.

use std::fmt;

use crate::sort::SortError;

const WORD_BITS: u32 = u64::BITS;

/// Counter width in bits. Only widths dividing a 64-bit word are supported so that a counter
/// never straddles two words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterBits(u32);

impl CounterBits {
    /// Validates a counter width. Supported widths are 1, 2, 4, 8, 16 and 32 bits.
    pub fn new(bits: u32) -> Result<Self, SortError> {
        match bits {
            1 | 2 | 4 | 8 | 16 | 32 => Ok(CounterBits(bits)),
            _ => Err(SortError::Config(format!(
                "unsupported counter width {} (expected 1, 2, 4, 8, 16 or 32 bits)",
                bits
            ))),
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Largest value a counter of this width can hold (`MaxMultiplicity - 1`).
    pub fn max_count(self) -> u32 {
        ((1u64 << self.0) - 1) as u32
    }

    fn per_word(self) -> usize {
        (WORD_BITS / self.0) as usize
    }
}

impl Default for CounterBits {
    fn default() -> Self {
        CounterBits(4)
    }
}

impl fmt::Display for CounterBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bits", self.0)
    }
}

/// Fixed-size array of saturating counters, one per key of a range.
///
/// Counters are packed into 64-bit words. A counter never exceeds [`CounterBits::max_count`]:
/// increments past the cap are rejected rather than wrapping into the neighbouring counter.
pub struct PackedCounterMap {
    words: Vec<u64>,
    width: usize,
    bits: CounterBits,
    mask: u64,
}

impl PackedCounterMap {
    /// Creates a zeroed map for `width` local keys.
    pub fn new(width: usize, bits: CounterBits) -> Self {
        let per_word = bits.per_word();
        let words = (width + per_word - 1) / per_word;

        PackedCounterMap {
            words: vec![0; words],
            width,
            bits,
            mask: bits.max_count() as u64,
        }
    }

    #[inline]
    fn locate(&self, local: usize) -> (usize, u32) {
        let per_word = self.bits.per_word();
        let shift = (local % per_word) as u32 * self.bits.get();
        (local / per_word, shift)
    }

    /// Increments the counter of `local`.
    /// Returns `false` if the counter is already saturated and the occurrence was not recorded.
    #[inline]
    pub fn increment(&mut self, local: usize) -> bool {
        debug_assert!(local < self.width, "local key {} out of width {}", local, self.width);

        let (idx, shift) = self.locate(local);
        let word = &mut self.words[idx];
        if (*word >> shift) & self.mask == self.mask {
            return false;
        }
        *word += 1 << shift;

        return true;
    }

    /// Returns the current counter value of `local`.
    #[inline]
    pub fn count(&self, local: usize) -> u32 {
        debug_assert!(local < self.width, "local key {} out of width {}", local, self.width);

        let (idx, shift) = self.locate(local);
        ((self.words[idx] >> shift) & self.mask) as u32
    }

    /// Zeroes all counters.
    pub fn reset(&mut self) {
        self.words.fill(0);
    }

    /// Number of local keys the map covers.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn max_count(&self) -> u32 {
        self.bits.max_count()
    }

    /// Allocated storage in bits (rounded up to whole words).
    pub fn size_bits(&self) -> u64 {
        self.words.len() as u64 * WORD_BITS as u64
    }
}
