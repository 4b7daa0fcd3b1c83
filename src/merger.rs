//! Range sinks merger.

use std::io::prelude::*;

use crate::sink::{discard_all, RangeSink, SinkCodec};
use crate::sort::SortError;

/// Concatenating merger.
/// Range sinks are disjoint and individually sorted, so appending them in plan order yields a sorted output
/// without any comparisons. Every sink is deleted as soon as it has been copied.
pub struct SinkMerger<C: SinkCodec> {
    sinks: Vec<RangeSink<C>>,
}

impl<C: SinkCodec> SinkMerger<C> {
    /// Creates an instance of a merger.
    ///
    /// # Arguments
    /// * `sinks` - Range sinks ordered by their range lower bound
    pub fn new<I>(sinks: I) -> Self
    where
        I: IntoIterator<Item = RangeSink<C>>,
    {
        let sinks = Vec::from_iter(sinks);
        debug_assert!(sinks.windows(2).all(|pair| pair[0].range().high <= pair[1].range().low));

        return SinkMerger { sinks };
    }

    /// Writes all sink keys to `writer` as decimal lines zero-padded to `pad_width` digits.
    /// Returns the number of written keys.
    ///
    /// On a read or write failure the remaining sinks are discarded; sinks that were already released stay released.
    /// A sink that cannot be removed does not stop the merge: the output is completed and flushed first, then the
    /// removal failure is returned as [`SortError::Cleanup`].
    pub fn write_to<W: Write>(self, writer: &mut W, pad_width: usize) -> Result<u64, SortError> {
        let mut written = 0;
        let mut cleanup_error = None;
        let mut sinks = self.sinks.into_iter();

        while let Some(mut sink) = sinks.next() {
            match Self::copy(&mut sink, writer, pad_width) {
                Ok(count) => written += count,
                Err(err) => {
                    discard_all(std::iter::once(sink).chain(sinks));
                    return Err(err);
                }
            }

            let path = sink.path().to_path_buf();
            log::debug!("sink {} merged, releasing", path.display());
            if let Err(err) = sink.release() {
                log::warn!("sink {} not removed: {}", path.display(), err);
                cleanup_error.get_or_insert(err);
            }
        }

        writer.flush().map_err(|err| SortError::IO(err))?;

        return match cleanup_error {
            Some(err) => Err(SortError::Cleanup(err)),
            None => Ok(written),
        };
    }

    fn copy<W: Write>(sink: &mut RangeSink<C>, writer: &mut W, pad_width: usize) -> Result<u64, SortError> {
        let mut count = 0;
        for key in sink.reader()? {
            let key = key?;
            writeln!(writer, "{:0width$}", key, width = pad_width).map_err(|err| SortError::IO(err))?;
            count += 1;
        }

        return Ok(count);
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;

    use rstest::*;

    use super::SinkMerger;
    use crate::partition::KeyRange;
    use crate::sink::test::VanishingCodec;
    use crate::sink::{RangeSink, RmpCodec, SinkCodec};
    use crate::sort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn build_sinks<C: SinkCodec>(tmp_dir: &tempfile::TempDir, contents: Vec<Vec<u64>>) -> Vec<RangeSink<C>> {
        Vec::from_iter(contents.into_iter().enumerate().map(|(idx, keys)| {
            let low = idx as u64 * 10;
            let mut sink = RangeSink::create(tmp_dir.path(), idx, KeyRange::new(low, low + 10), None).unwrap();
            for key in keys {
                sink.push(key).unwrap();
            }
            sink
        }))
    }

    #[rstest]
    #[case(vec![], 7, "")]
    #[case(vec![vec![], vec![]], 7, "")]
    #[case(
        vec![vec![1, 4, 4], vec![], vec![25, 29]],
        7,
        "0000001\n0000004\n0000004\n0000025\n0000029\n",
    )]
    #[case(vec![vec![3], vec![12]], 0, "3\n12\n")]
    #[case(vec![vec![3], vec![12]], 3, "003\n012\n")]
    fn test_merger(
        tmp_dir: tempfile::TempDir,
        #[case] contents: Vec<Vec<u64>>,
        #[case] pad_width: usize,
        #[case] expected: &str,
    ) {
        let merger = SinkMerger::new(build_sinks::<RmpCodec>(&tmp_dir, contents));

        let mut output = Vec::new();
        let written = merger.write_to(&mut output, pad_width).unwrap();

        assert_eq!(String::from_utf8(output).unwrap(), expected);
        assert_eq!(written, expected.lines().count() as u64);
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_merger_corrupted_sink(tmp_dir: tempfile::TempDir) {
        let mut sinks = build_sinks::<RmpCodec>(&tmp_dir, vec![vec![1, 2], vec![11], vec![21]]);
        sinks[1].finish().unwrap();
        fs::write(sinks[1].path(), b"\xc1").unwrap();

        let mut output = Vec::new();
        let result = SinkMerger::new(sinks).write_to(&mut output, 7);

        assert!(matches!(result, Err(SortError::DeserializationError(_))));
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_merger_output_error(tmp_dir: tempfile::TempDir) {
        struct BrokenWriter;

        impl io::Write for BrokenWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "test error"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sinks = build_sinks::<RmpCodec>(&tmp_dir, vec![vec![1], vec![11]]);
        let result = SinkMerger::new(sinks).write_to(&mut BrokenWriter, 7);

        assert!(matches!(result, Err(SortError::IO(_))));
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_merger_release_failure_keeps_output(tmp_dir: tempfile::TempDir) {
        let sinks = build_sinks::<VanishingCodec>(&tmp_dir, vec![vec![1, 2], vec![11], vec![21]]);
        VanishingCodec::arm(tmp_dir.path());

        let mut output = Vec::new();
        let result = SinkMerger::new(sinks).write_to(&mut output, 7);

        assert!(matches!(result, Err(SortError::Cleanup(_))));
        assert_eq!(String::from_utf8(output).unwrap(), "0000001\n0000002\n0000011\n0000021\n");
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }
}
