use std::path;
use std::process;
use std::time::Instant;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;
use rand::Rng;

use bitmap_sort::{BitmapSorter, BitmapSorterBuilder, OverflowPolicy, SortError};

#[derive(Copy, Clone)]
enum ExitCode {
    Ok = 0,
    OpenFailure = 1,
    SeekFailure = 2,
    CleanupFailure = 3,
    BadArgument = 4,
    SortFailure = 5,
}

impl From<&SortError> for ExitCode {
    fn from(err: &SortError) -> Self {
        match err {
            SortError::Config(_) => ExitCode::BadArgument,
            SortError::Open(_) | SortError::TempDir(_) => ExitCode::OpenFailure,
            SortError::Seek(_) => ExitCode::SeekFailure,
            SortError::Cleanup(_) => ExitCode::CleanupFailure,
            _ => ExitCode::SortFailure,
        }
    }
}

fn exit(code: ExitCode) -> ! {
    process::exit(code as i32)
}

fn main() {
    let arg_parser = match build_arg_parser().try_get_matches() {
        Ok(arg_parser) => arg_parser,
        Err(err) => {
            let _ = err.print();
            match err.kind() {
                clap::ErrorKind::DisplayHelp
                | clap::ErrorKind::DisplayVersion
                | clap::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => exit(ExitCode::Ok),
                _ => exit(ExitCode::BadArgument),
            }
        }
    };

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let universe_bound: u64 = arg_parser.value_of_t_or_exit("universe");
    let counter_bits: u32 = arg_parser.value_of_t_or_exit("counter_bits");
    let pad_width: usize = arg_parser.value_of_t_or_exit("pad_width");
    let overflow: Overflow = arg_parser.value_of_t_or_exit("overflow");
    let memory = arg_parser.value_of("memory").expect("value is required");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let mut sorter_builder = BitmapSorterBuilder::new()
        .with_universe_bound(universe_bound)
        .with_memory_budget(memory.parse::<ByteSize>().expect("value is pre-validated").as_u64().saturating_mul(8))
        .with_counter_bits(counter_bits)
        .with_pad_width(pad_width)
        .with_overflow_policy(match overflow {
            Overflow::Saturate => OverflowPolicy::Saturate,
            Overflow::Fail => OverflowPolicy::Fail,
        });

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    let sorter: BitmapSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            exit(ExitCode::from(&err));
        }
    };

    if arg_parser.is_present("self_test") {
        exit(self_test(&sorter, universe_bound, counter_bits));
    }

    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");

    match sorter.sort_file(path::Path::new(input), path::Path::new(output)) {
        Ok(stats) => {
            log::info!(
                "{} keys written to {} ({} passes, {} tokens skipped, {} occurrences truncated)",
                stats.keys_written,
                output,
                stats.ranges,
                stats.skipped_tokens,
                stats.truncated_occurrences
            );
            exit(ExitCode::Ok);
        }
        Err(err) => {
            log::error!("data sorting error: {}", err);
            exit(ExitCode::from(&err));
        }
    }
}

fn self_test(sorter: &BitmapSorter, universe_bound: u64, counter_bits: u32) -> ExitCode {
    const KEYS_NUMBER: usize = 1_000_000;

    let mut rng = rand::thread_rng();
    let keys = Vec::from_iter((0..KEYS_NUMBER).map(|_| rng.gen_range(0..universe_bound)));
    let input = Vec::from_iter(keys.iter().map(|key| key.to_string())).join("\n");

    let started = Instant::now();
    let mut output = Vec::new();
    let stats = match sorter.sort(&input.as_bytes(), &mut output) {
        Ok(stats) => stats,
        Err(err) => {
            log::error!("self-test sorting error: {}", err);
            return ExitCode::from(&err);
        }
    };
    let elapsed = started.elapsed();

    // the sorter keeps at most `2^counter_bits - 1` copies of a key
    let cap = ((1u64 << counter_bits) - 1) as usize;
    let mut expected = keys;
    expected.sort_unstable();
    let mut capped = Vec::with_capacity(expected.len());
    let mut run = 0;
    for (idx, &key) in expected.iter().enumerate() {
        run = if idx > 0 && expected[idx - 1] == key { run + 1 } else { 1 };
        if run <= cap {
            capped.push(key);
        }
    }

    let actual: Result<Vec<u64>, _> = String::from_utf8_lossy(&output).lines().map(|line| line.parse()).collect();
    if actual.ok().as_ref() != Some(&capped) {
        println!("self-test FAILED ({} keys, {} passes)", KEYS_NUMBER, stats.ranges);
        return ExitCode::SortFailure;
    }

    println!(
        "self-test passed: {} keys, {} passes, {:.4}s",
        KEYS_NUMBER,
        stats.ranges,
        elapsed.as_secs_f64()
    );

    return ExitCode::Ok;
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Overflow {
    Saturate,
    Fail,
}

impl Overflow {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Overflow::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Overflow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Overflow as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::App<'static> {
    clap::App::new("bitmap-sort")
        .about("range-partitioned bitmap sorter for bounded integer keys")
        .arg_required_else_help(true)
        .arg(
            clap::Arg::new("input")
                .index(1)
                .help("file to be sorted")
                .required_unless_present("self_test")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .takes_value(true)
                .default_value("sort_result.txt"),
        )
        .arg(
            clap::Arg::new("self_test")
                .long("self-test")
                .help("sort random keys and verify the result"),
        )
        .arg(
            clap::Arg::new("universe")
                .short('u')
                .long("universe")
                .help("exclusive upper bound of the keys")
                .takes_value(true)
                .default_value("10000000")
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|err| err.to_string())),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("counter memory of a single range pass")
                .takes_value(true)
                .default_value("1MB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("counter_bits")
                .short('b')
                .long("counter-bits")
                .help("bits per key counter, a key is kept up to 2^bits - 1 times")
                .takes_value(true)
                .default_value("4")
                .possible_values(["1", "2", "4", "8", "16", "32"]),
        )
        .arg(
            clap::Arg::new("pad_width")
                .short('w')
                .long("pad-width")
                .help("output keys zero-padding width")
                .takes_value(true)
                .default_value("7")
                .validator(|v| v.parse::<usize>().map(|_| ()).map_err(|err| err.to_string())),
        )
        .arg(
            clap::Arg::new("overflow")
                .long("overflow")
                .help("behaviour for keys repeated more often than a counter can hold")
                .takes_value(true)
                .default_value("saturate")
                .possible_values(Overflow::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel range scanning")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
