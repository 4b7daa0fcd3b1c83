//! `bitmap-sort` is a rust external sort implementation for bounded non-negative integer keys.
//!
//! Instead of sorting chunks and merging them, the key universe `[0, universe_bound)` is split into contiguous
//! ranges small enough for a bitmap of per-key counters to fit the memory budget. The input is scanned once per
//! range: keys of the range are counted, then emitted in ascending order (each repeated as many times as it
//! was counted) to a temporary range sink. Since ranges are disjoint and ordered, concatenating the range sinks
//! yields the sorted output. Working memory depends only on the budget, never on the input size, at the cost
//! of one input scan per range. For more information see *Programming Pearls*, column 1.
//!
//! # Overview
//!
//! `bitmap-sort` supports the following features:
//!
//! * **Duplicates:**
//!   keys are counted with packed saturating counters of a configurable width (1 to 32 bits). Occurrences past the
//!   counter capacity are either reported as truncated or rejected, see [`OverflowPolicy`].
//! * **Malformed input tolerance:**
//!   tokens that are not non-negative integers or fall outside the universe are skipped and counted.
//! * **Multithreading support:**
//!   ranges may be scanned in parallel, each worker using its own input handle and counter map.
//! * **Clean temporary storage:**
//!   range sinks live in a scratch directory owned by a single sort call and are removed on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use log;
//!
//! use bitmap_sort::{BitmapSorter, BitmapSorterBuilder};
//!
//! fn main() {
//!     let sorter: BitmapSorter = BitmapSorterBuilder::new()
//!         .with_universe_bound(10_000_000)
//!         .with_memory_budget(8_000_000)
//!         .with_counter_bits(4)
//!         .with_tmp_dir(Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter
//!         .sort_file(Path::new("input.txt"), Path::new("output.txt"))
//!         .unwrap();
//!
//!     log::info!("{} keys written in {} passes", stats.keys_written, stats.ranges);
//! }
//! ```

pub mod counter;
pub mod input;
pub mod merger;
pub mod partition;
pub mod pass;
pub mod sink;
pub mod sort;

pub use counter::{CounterBits, PackedCounterMap};
pub use input::{InputSource, Token, Tokens};
pub use merger::SinkMerger;
pub use partition::{plan, KeyRange};
pub use pass::{OverflowPolicy, PassStats, RangePass};
pub use sink::{RangeSink, RmpCodec, SinkCodec, TextCodec};
pub use sort::{BitmapSorter, BitmapSorterBuilder, SortError, SortStats};
