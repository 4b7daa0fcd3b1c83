//! Key universe partitioning.

use std::fmt;

use crate::counter::CounterBits;
use crate::sort::SortError;

/// Half-open key interval `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub low: u64,
    pub high: u64,
}

impl KeyRange {
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high);
        KeyRange { low, high }
    }

    pub fn width(&self) -> u64 {
        self.high - self.low
    }

    pub fn contains(&self, key: u64) -> bool {
        key >= self.low && key < self.high
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

/// Returns the number of keys a single range may cover so that its counters fit `memory_budget_bits`.
pub fn max_range_width(memory_budget_bits: u64, counter_bits: CounterBits) -> Result<u64, SortError> {
    let width = memory_budget_bits / counter_bits.get() as u64;
    if width == 0 {
        return Err(SortError::Config(format!(
            "memory budget of {} bits cannot hold a single {} counter",
            memory_budget_bits, counter_bits
        )));
    }

    return Ok(width);
}

/// Splits `[0, universe_bound)` into the minimal number of equal-width ranges whose counter maps fit
/// the memory budget. The last range may be narrower. Ranges are ordered by their lower bound.
///
/// # Arguments
/// * `universe_bound` - Exclusive upper bound of the key space
/// * `memory_budget_bits` - Counter memory available to a single range
/// * `counter_bits` - Counter width (`log2(MaxMultiplicity)`)
pub fn plan(universe_bound: u64, memory_budget_bits: u64, counter_bits: u32) -> Result<Vec<KeyRange>, SortError> {
    let counter_bits = CounterBits::new(counter_bits)?;
    if universe_bound == 0 {
        return Err(SortError::Config("key universe is empty".to_string()));
    }

    let width = max_range_width(memory_budget_bits, counter_bits)?.min(universe_bound);
    let ranges_number = universe_bound / width + (universe_bound % width != 0) as u64;

    let ranges = Vec::from_iter((0..ranges_number).map(|idx| {
        let low = idx * width;
        KeyRange::new(low, low + width.min(universe_bound - low))
    }));

    log::debug!(
        "planned {} range(s) of width {} over [0, {}) ({} counters)",
        ranges.len(),
        width,
        universe_bound,
        counter_bits
    );

    return Ok(ranges);
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{plan, KeyRange};
    use crate::sort::SortError;

    #[rstest]
    #[case(10, 20, 4, vec![KeyRange::new(0, 5), KeyRange::new(5, 10)])]
    #[case(10, 40, 4, vec![KeyRange::new(0, 10)])]
    #[case(10, 1000, 4, vec![KeyRange::new(0, 10)])]
    #[case(10, 16, 4, vec![KeyRange::new(0, 4), KeyRange::new(4, 8), KeyRange::new(8, 10)])]
    #[case(3, 1, 1, vec![KeyRange::new(0, 1), KeyRange::new(1, 2), KeyRange::new(2, 3)])]
    fn test_plan(
        #[case] universe_bound: u64,
        #[case] budget: u64,
        #[case] bits: u32,
        #[case] expected: Vec<KeyRange>,
    ) {
        assert_eq!(plan(universe_bound, budget, bits).unwrap(), expected);
    }

    #[rstest]
    #[case(10_000_000, 8_000_000, 4)]
    #[case(1_000_003, 4_096, 2)]
    #[case(97, 13, 1)]
    #[case(u64::MAX, u64::MAX / 3, 32)]
    fn test_plan_tiles_universe(#[case] universe_bound: u64, #[case] budget: u64, #[case] bits: u32) {
        let first = plan(universe_bound, budget, bits).unwrap();
        let second = plan(universe_bound, budget, bits).unwrap();
        assert_eq!(first, second);

        assert_eq!(first.first().unwrap().low, 0);
        assert_eq!(first.last().unwrap().high, universe_bound);
        for pair in first.windows(2) {
            assert_eq!(pair[0].high, pair[1].low);
        }
        let max_width = budget / bits as u64;
        assert!(first.iter().all(|range| range.width() > 0 && range.width() <= max_width));
    }

    #[rstest]
    #[case(10, 3, 4)]
    #[case(10, 0, 1)]
    #[case(0, 100, 4)]
    #[case(10, 100, 5)]
    fn test_plan_config_error(#[case] universe_bound: u64, #[case] budget: u64, #[case] bits: u32) {
        assert!(matches!(plan(universe_bound, budget, bits), Err(SortError::Config(_))));
    }
}
