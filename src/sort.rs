//! Range-partitioned bitmap sorter.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::counter::{CounterBits, PackedCounterMap};
use crate::input::InputSource;
use crate::merger::SinkMerger;
use crate::partition::{self, KeyRange};
use crate::pass::{OverflowPolicy, PassStats, RangePass};
use crate::sink::{discard_all, RangeSink, RmpCodec, SinkCodec};

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Invalid universe, memory budget or counter width.
    Config(String),
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input, output or sink file could not be opened.
    Open(io::Error),
    /// Input could not be rewound to its start.
    Seek(io::Error),
    /// Input data stream error.
    InputError(io::Error),
    /// Sink or output write error.
    IO(io::Error),
    /// Sink data serialization error.
    SerializationError(Box<dyn Error + Send + Sync>),
    /// Sink data deserialization error.
    DeserializationError(Box<dyn Error + Send + Sync>),
    /// Temporary data could not be removed.
    Cleanup(io::Error),
    /// A key occurred more often than its counter can hold.
    MultiplicityOverflow { key: u64 },
    /// Sorting was cancelled between two range passes.
    Cancelled,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::Open(err) => Some(err),
            SortError::Seek(err) => Some(err),
            SortError::InputError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::SerializationError(err) => Some(&**err),
            SortError::DeserializationError(err) => Some(&**err),
            SortError::Cleanup(err) => Some(err),
            SortError::Config(_) | SortError::MultiplicityOverflow { .. } | SortError::Cancelled => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Open(err) => write!(f, "file opening failed: {}", err),
            SortError::Seek(err) => write!(f, "input rewind failed: {}", err),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            SortError::Cleanup(err) => write!(f, "temporary data not removed: {}", err),
            SortError::MultiplicityOverflow { key } => write!(f, "key {} exceeds the counter capacity", key),
            SortError::Cancelled => write!(f, "sorting cancelled"),
        }
    }
}

/// Sorting statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Number of planned ranges (input passes).
    pub ranges: usize,
    /// Keys written to the output.
    pub keys_written: u64,
    /// Malformed or out-of-universe input tokens.
    pub skipped_tokens: u64,
    /// Key occurrences dropped because their counter was saturated.
    pub truncated_occurrences: u64,
}

enum Phase {
    Init,
    Planning,
    Scanning(usize),
    ScanningParallel(usize),
    Merging,
    Done,
    Failed(String),
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => write!(f, "init"),
            Phase::Planning => write!(f, "planning"),
            Phase::Scanning(index) => write!(f, "scanning range {}", index),
            Phase::ScanningParallel(ranges) => write!(f, "scanning {} ranges in parallel", ranges),
            Phase::Merging => write!(f, "merging"),
            Phase::Done => write!(f, "done"),
            Phase::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

struct PhaseTracker {
    phase: Phase,
}

impl PhaseTracker {
    fn new() -> Self {
        PhaseTracker { phase: Phase::Init }
    }

    fn enter(&mut self, next: Phase) {
        log::debug!("sort state: {} -> {}", self.phase, next);
        self.phase = next;
    }
}

#[derive(Default)]
struct ScanTotals {
    skipped: u64,
    truncated: u64,
}

impl ScanTotals {
    fn add(&mut self, index: usize, stats: &PassStats) {
        // every pass reads the same tokens, so skipped ones are counted once
        if index == 0 {
            self.skipped = stats.skipped;
        }
        self.truncated += stats.truncated;
    }
}

/// Bitmap sorter builder. Provides methods for [`BitmapSorter`] initialization.
#[derive(Clone)]
pub struct BitmapSorterBuilder<C = RmpCodec>
where
    C: SinkCodec,
{
    /// Exclusive upper bound of the key universe.
    universe_bound: u64,
    /// Counter memory available to a single range pass.
    memory_budget_bits: u64,
    /// Bits per key counter.
    counter_bits: u32,
    /// Saturated counter behaviour.
    overflow: OverflowPolicy,
    /// Output number width.
    pad_width: usize,
    /// Number of threads to be used to scan ranges in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Sink file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Cancellation flag checked between range passes.
    cancel_flag: Option<Arc<AtomicBool>>,

    /// Sink codec type.
    codec: PhantomData<C>,
}

impl<C> BitmapSorterBuilder<C>
where
    C: SinkCodec,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        BitmapSorterBuilder::default()
    }

    /// Builds a [`BitmapSorter`] instance using provided configuration.
    pub fn build(self) -> Result<BitmapSorter<C>, SortError> {
        BitmapSorter::new(
            self.universe_bound,
            self.memory_budget_bits,
            self.counter_bits,
            self.overflow,
            self.pad_width,
            self.threads_number,
            self.tmp_dir,
            self.rw_buf_size,
            self.cancel_flag,
        )
    }

    /// Sets the exclusive upper bound of the key universe.
    pub fn with_universe_bound(mut self, universe_bound: u64) -> BitmapSorterBuilder<C> {
        self.universe_bound = universe_bound;
        return self;
    }

    /// Sets counter memory (in bits) a single range pass may use.
    pub fn with_memory_budget(mut self, memory_budget_bits: u64) -> BitmapSorterBuilder<C> {
        self.memory_budget_bits = memory_budget_bits;
        return self;
    }

    /// Sets counter width in bits. A key is counted up to `2^counter_bits - 1` times.
    pub fn with_counter_bits(mut self, counter_bits: u32) -> BitmapSorterBuilder<C> {
        self.counter_bits = counter_bits;
        return self;
    }

    /// Sets saturated counter behaviour.
    pub fn with_overflow_policy(mut self, overflow: OverflowPolicy) -> BitmapSorterBuilder<C> {
        self.overflow = overflow;
        return self;
    }

    /// Sets the number of digits output keys are zero-padded to.
    pub fn with_pad_width(mut self, pad_width: usize) -> BitmapSorterBuilder<C> {
        self.pad_width = pad_width;
        return self;
    }

    /// Sets number of threads to be used to scan ranges in parallel.
    /// Every thread allocates its own counter map.
    pub fn with_threads_number(mut self, threads_number: usize) -> BitmapSorterBuilder<C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> BitmapSorterBuilder<C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets sink read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> BitmapSorterBuilder<C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets a flag that cancels sorting at the next range boundary once raised.
    pub fn with_cancel_flag(mut self, cancel_flag: Arc<AtomicBool>) -> BitmapSorterBuilder<C> {
        self.cancel_flag = Some(cancel_flag);
        return self;
    }
}

impl<C> Default for BitmapSorterBuilder<C>
where
    C: SinkCodec,
{
    fn default() -> Self {
        BitmapSorterBuilder {
            universe_bound: 10_000_000,
            memory_budget_bits: 8_000_000,
            counter_bits: CounterBits::default().get(),
            overflow: OverflowPolicy::default(),
            pad_width: 7,
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            cancel_flag: None,
            codec: PhantomData,
        }
    }
}

/// External bitmap sorter.
///
/// The key universe is split into ranges whose counter maps fit the memory budget. The input is scanned
/// once per range, keys of the range are counted and written to a range sink in ascending order, and
/// the sinks are finally concatenated into the output.
pub struct BitmapSorter<C = RmpCodec>
where
    C: SinkCodec,
{
    universe_bound: u64,
    memory_budget_bits: u64,
    counter_bits: CounterBits,
    overflow: OverflowPolicy,
    pad_width: usize,
    /// Range scanning thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory the per-sort scratch directories are created in.
    tmp_dir: Option<Box<Path>>,
    rw_buf_size: Option<usize>,
    cancel_flag: Option<Arc<AtomicBool>>,

    codec: PhantomData<C>,
}

impl<C> BitmapSorter<C>
where
    C: SinkCodec,
{
    /// Creates a new bitmap sorter instance.
    ///
    /// # Arguments
    /// * `universe_bound` - Exclusive upper bound of the keys to be sorted.
    /// * `memory_budget_bits` - Counter memory available to a single range pass.
    /// * `counter_bits` - Bits per key counter, one of 1, 2, 4, 8, 16, 32.
    /// * `overflow` - Behaviour for keys occurring more often than a counter can hold.
    /// * `pad_width` - Output keys zero-padding width.
    /// * `threads_number` - Number of threads to be used to scan ranges in parallel. If the parameter is [`None`]
    ///   ranges are scanned sequentially.
    /// * `tmp_dir` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `rw_buf_size` - Sink files read/write buffer size.
    /// * `cancel_flag` - Flag checked before each range pass.
    pub fn new(
        universe_bound: u64,
        memory_budget_bits: u64,
        counter_bits: u32,
        overflow: OverflowPolicy,
        pad_width: usize,
        threads_number: Option<usize>,
        tmp_dir: Option<Box<Path>>,
        rw_buf_size: Option<usize>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> Result<Self, SortError> {
        let counter_bits = CounterBits::new(counter_bits)?;
        if universe_bound == 0 {
            return Err(SortError::Config("key universe is empty".to_string()));
        }
        partition::max_range_width(memory_budget_bits, counter_bits)?;

        return Ok(BitmapSorter {
            universe_bound,
            memory_budget_bits,
            counter_bits,
            overflow,
            pad_width,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir,
            rw_buf_size,
            cancel_flag,
            codec: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let threads_number = threads_number.unwrap_or(1);
        log::info!("initializing thread-pool (threads: {})", threads_number);

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads_number)
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_scratch_dir(&self) -> Result<tempfile::TempDir, SortError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bitmap-sort-");

        let scratch_dir = if let Some(tmp_path) = &self.tmp_dir {
            builder.tempdir_in(tmp_path)
        } else {
            builder.tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", scratch_dir.path().display());

        return Ok(scratch_dir);
    }

    /// Sorts the file at `input` into a newly created file at `output`.
    /// The output file is removed if sorting fails, unless the failure is [`SortError::Cleanup`]: that one is
    /// only reported once the output is complete.
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortStats, SortError> {
        // the output is not created (truncated) unless the input can be opened
        fs::File::open(input).map_err(|err| SortError::Open(err))?;
        let output_file = fs::File::create(output).map_err(|err| SortError::Open(err))?;

        let mut output_writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, output_file),
            None => io::BufWriter::new(output_file),
        };

        let result = self.sort(input, &mut output_writer);
        if matches!(&result, Err(err) if !matches!(err, SortError::Cleanup(_))) {
            drop(output_writer);
            if let Err(err) = fs::remove_file(output) {
                log::warn!("partial output {} not removed: {}", output.display(), err);
            }
        }

        return result;
    }

    /// Sorts keys from the input and writes them to `output`, one zero-padded key per line.
    /// Returns sorting statistics.
    ///
    /// # Arguments
    /// * `source` - Input to be scanned once per planned range
    /// * `output` - Sorted keys destination
    pub fn sort<S, W>(&self, source: &S, output: &mut W) -> Result<SortStats, SortError>
    where
        S: InputSource + ?Sized,
        W: Write,
    {
        let mut phase = PhaseTracker::new();

        let result = self.run(source, output, &mut phase);
        match &result {
            Ok(_) => phase.enter(Phase::Done),
            Err(err) => phase.enter(Phase::Failed(err.to_string())),
        }

        return result;
    }

    fn run<S, W>(&self, source: &S, output: &mut W, phase: &mut PhaseTracker) -> Result<SortStats, SortError>
    where
        S: InputSource + ?Sized,
        W: Write,
    {
        phase.enter(Phase::Planning);
        let plan = partition::plan(self.universe_bound, self.memory_budget_bits, self.counter_bits.get())?;
        log::info!(
            "sorting keys of [0, {}) in {} range pass(es)",
            self.universe_bound,
            plan.len()
        );

        let scratch_dir = self.init_scratch_dir()?;

        let (sinks, totals) = if self.thread_pool.current_num_threads() > 1 && plan.len() > 1 {
            self.scan_parallel(source, &plan, scratch_dir.path(), phase)?
        } else {
            self.scan_sequential(source, &plan, scratch_dir.path(), phase)?
        };

        if totals.skipped > 0 {
            log::warn!("{} malformed or out-of-universe token(s) skipped", totals.skipped);
        }
        if totals.truncated > 0 {
            log::warn!(
                "{} key occurrence(s) dropped: counters saturate at {}",
                totals.truncated,
                self.counter_bits.max_count()
            );
        }

        phase.enter(Phase::Merging);
        let merged = SinkMerger::new(sinks).write_to(output, self.pad_width);
        let closed = scratch_dir.close().map_err(|err| SortError::Cleanup(err));

        let keys_written = merged?;
        closed?;

        return Ok(SortStats {
            ranges: plan.len(),
            keys_written,
            skipped_tokens: totals.skipped,
            truncated_occurrences: totals.truncated,
        });
    }

    fn counters_width(plan: &[KeyRange]) -> Result<usize, SortError> {
        let widest = plan.iter().map(|range| range.width()).max().unwrap_or(0);
        usize::try_from(widest).map_err(|_| SortError::Config(format!("range width {} is not addressable", widest)))
    }

    fn check_cancelled(&self) -> Result<(), SortError> {
        match &self.cancel_flag {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(SortError::Cancelled),
            _ => Ok(()),
        }
    }

    fn scan_sequential<S>(
        &self,
        source: &S,
        plan: &[KeyRange],
        dir: &Path,
        phase: &mut PhaseTracker,
    ) -> Result<(Vec<RangeSink<C>>, ScanTotals), SortError>
    where
        S: InputSource + ?Sized,
    {
        let mut input = source.open().map_err(|err| SortError::Open(err))?;
        let mut counters = PackedCounterMap::new(Self::counters_width(plan)?, self.counter_bits);

        let mut sinks = Vec::with_capacity(plan.len());
        let mut totals = ScanTotals::default();

        for (index, range) in plan.iter().enumerate() {
            phase.enter(Phase::Scanning(index));

            let result = self
                .check_cancelled()
                .and_then(|_| self.scan_range(&mut input, &mut counters, dir, index, *range));

            match result {
                Ok((sink, stats)) => {
                    totals.add(index, &stats);
                    sinks.push(sink);
                }
                Err(err) => {
                    discard_all(sinks);
                    return Err(err);
                }
            }
        }

        return Ok((sinks, totals));
    }

    fn scan_parallel<S>(
        &self,
        source: &S,
        plan: &[KeyRange],
        dir: &Path,
        phase: &mut PhaseTracker,
    ) -> Result<(Vec<RangeSink<C>>, ScanTotals), SortError>
    where
        S: InputSource + ?Sized,
    {
        let width = Self::counters_width(plan)?;
        phase.enter(Phase::ScanningParallel(plan.len()));

        let results: Vec<Result<(RangeSink<C>, PassStats), SortError>> = self.thread_pool.install(|| {
            plan.par_iter()
                .enumerate()
                .map(|(index, range)| {
                    self.check_cancelled()?;
                    log::debug!("scanning range {} {}", index, range);

                    let mut input = source.open().map_err(|err| SortError::Open(err))?;
                    let mut counters = PackedCounterMap::new(width, self.counter_bits);
                    self.scan_range(&mut input, &mut counters, dir, index, *range)
                })
                .collect()
        });

        let mut sinks = Vec::with_capacity(plan.len());
        let mut totals = ScanTotals::default();
        let mut first_error = None;

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok((sink, stats)) => {
                    totals.add(index, &stats);
                    sinks.push(sink);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            discard_all(sinks);
            return Err(err);
        }

        return Ok((sinks, totals));
    }

    fn scan_range<R>(
        &self,
        input: &mut R,
        counters: &mut PackedCounterMap,
        dir: &Path,
        index: usize,
        range: KeyRange,
    ) -> Result<(RangeSink<C>, PassStats), SortError>
    where
        R: BufRead + Seek,
    {
        let mut sink = RangeSink::create(dir, index, range, self.rw_buf_size)?;
        let stats = RangePass::new(range, self.universe_bound, self.overflow).run(input, counters, &mut sink)?;

        return Ok((sink, stats));
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::{self, prelude::*};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{BitmapSorter, BitmapSorterBuilder, SortError};
    use crate::input::InputSource;
    use crate::pass::OverflowPolicy;
    use crate::sink::test::VanishingCodec;
    use crate::sink::TextCodec;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn is_empty_dir(dir: &tempfile::TempDir) -> bool {
        fs::read_dir(dir.path()).unwrap().count() == 0
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn test_two_range_scenario(tmp_dir: tempfile::TempDir, #[case] threads: usize) {
        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_memory_budget(20)
            .with_counter_bits(4)
            .with_threads_number(threads)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let stats = sorter.sort(&&b"4 1 4 9 2 6 5 3"[..], &mut output).unwrap();

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "0000001\n0000002\n0000003\n0000004\n0000004\n0000005\n0000006\n0000009\n"
        );
        assert_eq!(stats.ranges, 2);
        assert_eq!(stats.keys_written, 8);
        assert_eq!(stats.skipped_tokens, 0);
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    #[case("3 -5 7")]
    #[case("3 15 7")]
    #[case("3\n7 abc")]
    fn test_malformed_token_skipped(tmp_dir: tempfile::TempDir, #[case] input: &str) {
        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_memory_budget(20)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let stats = sorter.sort(&input.as_bytes(), &mut output).unwrap();

        assert_eq!(String::from_utf8(output).unwrap(), "0000003\n0000007\n");
        assert_eq!(stats.skipped_tokens, 1);
    }

    #[rstest]
    #[case(1, 40)]
    #[case(1, 4000)]
    #[case(3, 40)]
    #[case(4, 1000)]
    fn test_random_multiset(tmp_dir: tempfile::TempDir, #[case] threads: usize, #[case] budget: u64) {
        let mut rng = rand::thread_rng();
        let universe_bound = 1000;

        let mut input = Vec::new();
        for key in 0..universe_bound {
            for _ in 0..rng.gen_range(0..=15) {
                input.push(key);
            }
        }
        let mut expected = input.clone();
        input.shuffle(&mut rng);

        let input = Vec::from_iter(input.iter().map(|key| key.to_string())).join("\n");

        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(universe_bound)
            .with_memory_budget(budget)
            .with_threads_number(threads)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let stats = sorter.sort(&input.as_bytes(), &mut output).unwrap();

        expected.sort();
        let actual = Vec::from_iter(String::from_utf8(output).unwrap().lines().map(|line| line.parse::<u64>().unwrap()));

        assert_eq!(actual, expected);
        assert!(actual.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(stats.ranges as u64, (universe_bound + budget / 4 - 1) / (budget / 4));
        assert_eq!(stats.truncated_occurrences, 0);
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_text_codec_sorter(tmp_dir: tempfile::TempDir) {
        let sorter: BitmapSorter<TextCodec> = BitmapSorterBuilder::new()
            .with_universe_bound(100)
            .with_memory_budget(64)
            .with_pad_width(3)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        sorter.sort(&&b"42 7 99 0 42"[..], &mut output).unwrap();

        assert_eq!(String::from_utf8(output).unwrap(), "000\n007\n042\n042\n099\n");
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_overflow_truncation_is_reported(tmp_dir: tempfile::TempDir) {
        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_memory_budget(20)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let input = format!("{} 8", vec!["3"; 20].join(" "));
        let mut output = Vec::new();
        let stats = sorter.sort(&input.as_bytes(), &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(output.lines().filter(|line| *line == "0000003").count(), 15);
        assert_eq!(stats.keys_written, 16);
        assert_eq!(stats.truncated_occurrences, 5);
    }

    #[rstest]
    fn test_overflow_fails(tmp_dir: tempfile::TempDir) {
        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_memory_budget(10)
            .with_counter_bits(1)
            .with_overflow_policy(OverflowPolicy::Fail)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let result = sorter.sort(&&b"1 2 2"[..], &mut output);

        assert!(matches!(result, Err(SortError::MultiplicityOverflow { key: 2 })));
        assert!(output.is_empty());
        assert!(is_empty_dir(&tmp_dir));
    }

    struct FlakySource {
        data: Vec<u8>,
        fail_on_seek: usize,
        seeks: Arc<AtomicUsize>,
    }

    struct FlakyReader {
        inner: io::Cursor<Vec<u8>>,
        fail_on_seek: usize,
        seeks: Arc<AtomicUsize>,
    }

    impl InputSource for FlakySource {
        type Reader = FlakyReader;

        fn open(&self) -> io::Result<FlakyReader> {
            Ok(FlakyReader {
                inner: io::Cursor::new(self.data.clone()),
                fail_on_seek: self.fail_on_seek,
                seeks: self.seeks.clone(),
            })
        }
    }

    impl io::Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl io::BufRead for FlakyReader {
        fn fill_buf(&mut self) -> io::Result<&[u8]> {
            self.inner.fill_buf()
        }

        fn consume(&mut self, amt: usize) {
            self.inner.consume(amt)
        }
    }

    impl io::Seek for FlakyReader {
        fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
            if self.seeks.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on_seek {
                return Err(io::Error::new(io::ErrorKind::Other, "test error"));
            }
            self.inner.seek(pos)
        }
    }

    #[rstest]
    fn test_failed_pass_removes_sinks(tmp_dir: tempfile::TempDir) {
        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(9)
            .with_memory_budget(12)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let seeks = Arc::new(AtomicUsize::new(0));
        let source = FlakySource {
            data: b"8 0 4 1 7".to_vec(),
            fail_on_seek: 3,
            seeks: seeks.clone(),
        };

        let mut output = Vec::new();
        let result = sorter.sort(&source, &mut output);

        assert!(matches!(result, Err(SortError::Seek(_))));
        assert_eq!(seeks.load(Ordering::SeqCst), 3);
        assert!(output.is_empty());
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_failed_parallel_pass_removes_sinks(tmp_dir: tempfile::TempDir) {
        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(9)
            .with_memory_budget(12)
            .with_threads_number(3)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let source = FlakySource {
            data: b"8 0 4 1 7".to_vec(),
            fail_on_seek: 2,
            seeks: Arc::new(AtomicUsize::new(0)),
        };

        let mut output = Vec::new();
        let result = sorter.sort(&source, &mut output);

        assert!(matches!(result, Err(SortError::Seek(_))));
        assert!(output.is_empty());
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_cancelled(tmp_dir: tempfile::TempDir) {
        let cancel_flag = Arc::new(AtomicBool::new(true));
        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_memory_budget(20)
            .with_cancel_flag(cancel_flag.clone())
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let result = sorter.sort(&&b"1 2 3"[..], &mut output);
        assert!(matches!(result, Err(SortError::Cancelled)));
        assert!(is_empty_dir(&tmp_dir));

        cancel_flag.store(false, Ordering::Relaxed);
        sorter.sort(&&b"1 2 3"[..], &mut output).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "0000001\n0000002\n0000003\n");
    }

    #[rstest]
    #[case(10, 20, 3)]
    #[case(10, 3, 4)]
    #[case(0, 20, 4)]
    fn test_config_error(#[case] universe_bound: u64, #[case] budget: u64, #[case] bits: u32) {
        let result: Result<BitmapSorter, _> = BitmapSorterBuilder::new()
            .with_universe_bound(universe_bound)
            .with_memory_budget(budget)
            .with_counter_bits(bits)
            .build();

        assert!(matches!(result, Err(SortError::Config(_))));
    }

    #[rstest]
    fn test_sort_file(tmp_dir: tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let input_path = work_dir.path().join("input.txt");
        let output_path = work_dir.path().join("output.txt");
        fs::write(&input_path, "9\n3\n3\n0\n").unwrap();

        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_memory_budget(8)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let stats = sorter.sort_file(&input_path, &output_path).unwrap();

        assert_eq!(stats.ranges, 5);
        assert_eq!(fs::read_to_string(&output_path).unwrap(), "0000000\n0000003\n0000003\n0000009\n");
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_sort_file_failure_removes_output(tmp_dir: tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let input_path = work_dir.path().join("input.txt");
        let output_path = work_dir.path().join("output.txt");
        fs::write(&input_path, "1 1 1 1").unwrap();

        let sorter: BitmapSorter = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_counter_bits(2)
            .with_overflow_policy(OverflowPolicy::Fail)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let result = sorter.sort_file(&input_path, &output_path);

        assert!(matches!(result, Err(SortError::MultiplicityOverflow { key: 1 })));
        assert!(!output_path.exists());
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_sort_file_missing_input(tmp_dir: tempfile::TempDir) {
        let output_path = tmp_dir.path().join("output.txt");

        let sorter: BitmapSorter = BitmapSorterBuilder::new().build().unwrap();
        let result = sorter.sort_file(&tmp_dir.path().join("missing.txt"), &output_path);

        assert!(matches!(result, Err(SortError::Open(_))));
        assert!(!output_path.exists());
    }

    #[rstest]
    fn test_sort_file_cleanup_failure_keeps_output(tmp_dir: tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let input_path = work_dir.path().join("input.txt");
        let output_path = work_dir.path().join("output.txt");
        fs::write(&input_path, "4 1 4 9 2 6 5 3").unwrap();

        let sorter: BitmapSorter<VanishingCodec> = BitmapSorterBuilder::new()
            .with_universe_bound(10)
            .with_memory_budget(20)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        VanishingCodec::arm(tmp_dir.path());
        let result = sorter.sort_file(&input_path, &output_path);

        assert!(matches!(result, Err(SortError::Cleanup(_))));
        assert_eq!(
            fs::read_to_string(&output_path).unwrap(),
            "0000001\n0000002\n0000003\n0000004\n0000004\n0000005\n0000006\n0000009\n"
        );
        assert!(is_empty_dir(&tmp_dir));
    }
}
