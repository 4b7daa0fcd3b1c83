//! Single range pass over the input.

use std::io::prelude::*;

use crate::counter::PackedCounterMap;
use crate::input::{Token, Tokens};
use crate::partition::KeyRange;
use crate::sink::{RangeSink, SinkCodec};
use crate::sort::SortError;

/// Behaviour when a key occurs more often than a counter can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Extra occurrences are dropped and reported in [`PassStats::truncated`].
    Saturate,
    /// The sort fails with [`SortError::MultiplicityOverflow`].
    Fail,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Saturate
    }
}

/// Range pass statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Tokens read from the input.
    pub scanned: u64,
    /// Malformed or out-of-universe tokens.
    pub skipped: u64,
    /// Keys written to the sink.
    pub emitted: u64,
    /// Occurrences lost to saturated counters.
    pub truncated: u64,
}

/// Counts the keys of one range during a full input scan and emits them in ascending order.
pub struct RangePass {
    range: KeyRange,
    universe_bound: u64,
    overflow: OverflowPolicy,
}

impl RangePass {
    pub fn new(range: KeyRange, universe_bound: u64, overflow: OverflowPolicy) -> Self {
        RangePass {
            range,
            universe_bound,
            overflow,
        }
    }

    /// Rewinds `input`, scans it to the end and writes the keys of the range to `sink`.
    ///
    /// # Arguments
    /// * `input` - Input handle; it is rewound before scanning
    /// * `counters` - Counter map at least as wide as the range; it is reset before scanning
    /// * `sink` - Destination of the range keys
    pub fn run<R, C>(
        &self,
        input: &mut R,
        counters: &mut PackedCounterMap,
        sink: &mut RangeSink<C>,
    ) -> Result<PassStats, SortError>
    where
        R: BufRead + Seek,
        C: SinkCodec,
    {
        debug_assert!(counters.width() as u64 >= self.range.width());

        input.rewind().map_err(|err| SortError::Seek(err))?;
        counters.reset();

        let mut stats = PassStats::default();

        for token in Tokens::new(&mut *input) {
            stats.scanned += 1;

            let key = match token.map_err(|err| SortError::InputError(err))? {
                Token::Key(key) if key < self.universe_bound => key,
                Token::Key(key) => {
                    log::trace!("key {} is out of universe [0, {}), skipped", key, self.universe_bound);
                    stats.skipped += 1;
                    continue;
                }
                Token::Malformed(token) => {
                    log::trace!("malformed token {:?} skipped", token);
                    stats.skipped += 1;
                    continue;
                }
            };

            if !self.range.contains(key) {
                continue;
            }

            if !counters.increment((key - self.range.low) as usize) {
                match self.overflow {
                    OverflowPolicy::Saturate => stats.truncated += 1,
                    OverflowPolicy::Fail => return Err(SortError::MultiplicityOverflow { key }),
                }
            }
        }

        for local in 0..self.range.width() as usize {
            let count = counters.count(local);
            if count > 0 {
                sink.push_repeated(self.range.low + local as u64, count)?;
                stats.emitted += count as u64;
            }
        }
        sink.finish()?;

        log::debug!(
            "range {} pass done (scanned: {}, emitted: {}, skipped: {}, truncated: {})",
            self.range,
            stats.scanned,
            stats.emitted,
            stats.skipped,
            stats.truncated
        );

        return Ok(stats);
    }
}
