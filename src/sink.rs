//! Per-range intermediate sinks.

use std::error::Error;
use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::partition::KeyRange;
use crate::sort::SortError;

pub type CodecError = Box<dyn Error + Send + Sync>;

/// Sink codec interface. Defines how keys are laid out in an intermediate sink file.
pub trait SinkCodec: Send + Sync {
    /// Writes a single key.
    fn encode<W: Write>(writer: &mut W, key: u64) -> Result<(), CodecError>;

    /// Reads the next key or returns `None` at the end of the sink.
    fn decode<R: BufRead>(reader: &mut R) -> Result<Option<u64>, CodecError>;
}

/// RMP (Rust MessagePack) sink codec.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmpCodec;

impl SinkCodec for RmpCodec {
    fn encode<W: Write>(writer: &mut W, key: u64) -> Result<(), CodecError> {
        rmp_serde::encode::write(writer, &key)?;
        return Ok(());
    }

    fn decode<R: BufRead>(reader: &mut R) -> Result<Option<u64>, CodecError> {
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        return Ok(Some(rmp_serde::decode::from_read(reader)?));
    }
}

/// Plain text sink codec: one decimal key per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl SinkCodec for TextCodec {
    fn encode<W: Write>(writer: &mut W, key: u64) -> Result<(), CodecError> {
        writeln!(writer, "{}", key)?;
        return Ok(());
    }

    fn decode<R: BufRead>(reader: &mut R) -> Result<Option<u64>, CodecError> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        return Ok(Some(line.trim_end().parse()?));
    }
}

/// Ordered append-only sequence of keys produced by a single range pass.
///
/// The sink file is named after the range index and lives in the scratch directory of one sort run.
/// It is deleted by [`RangeSink::release`] or, if never released, when the sink is dropped.
pub struct RangeSink<C: SinkCodec> {
    index: usize,
    range: KeyRange,
    path: PathBuf,
    writer: Option<io::BufWriter<fs::File>>,
    rw_buf_size: Option<usize>,
    len: u64,
    released: bool,

    codec: PhantomData<C>,
}

impl<C: SinkCodec> RangeSink<C> {
    /// Creates the sink file `temp<index>` in `dir`.
    ///
    /// # Arguments
    /// * `dir` - Scratch directory of the current sort
    /// * `index` - Range index in the plan
    /// * `range` - Key range the sink holds
    /// * `rw_buf_size` - Sink file read/write buffer size
    pub fn create(dir: &Path, index: usize, range: KeyRange, rw_buf_size: Option<usize>) -> Result<Self, SortError> {
        let path = dir.join(format!("temp{}", index));
        let file = fs::File::create(&path).map_err(|err| SortError::Open(err))?;

        let writer = match rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        return Ok(RangeSink {
            index,
            range,
            path,
            writer: Some(writer),
            rw_buf_size,
            len: 0,
            released: false,
            codec: PhantomData,
        });
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of keys written to the sink.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn writer(&mut self) -> Result<&mut io::BufWriter<fs::File>, SortError> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(SortError::IO(io::Error::new(
                io::ErrorKind::Other,
                format!("sink {} is already finished", self.path.display()),
            ))),
        }
    }

    /// Appends `key` to the sink `count` times.
    pub fn push_repeated(&mut self, key: u64, count: u32) -> Result<(), SortError> {
        let writer = self.writer()?;
        for _ in 0..count {
            C::encode(writer, key).map_err(|err| SortError::SerializationError(err))?;
        }
        self.len += count as u64;

        return Ok(());
    }

    pub fn push(&mut self, key: u64) -> Result<(), SortError> {
        self.push_repeated(key, 1)
    }

    /// Flushes and closes the write side of the sink. Further pushes fail.
    pub fn finish(&mut self) -> Result<(), SortError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|err| SortError::IO(err))?;
        }
        return Ok(());
    }

    /// Opens the sink for reading from its beginning. Pending writes are flushed first.
    pub fn reader(&mut self) -> Result<SinkReader<C>, SortError> {
        self.finish()?;

        let file = fs::File::open(&self.path).map_err(|err| SortError::Open(err))?;
        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(SinkReader {
            reader,
            codec: PhantomData,
        });
    }

    /// Deletes the sink file.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        self.writer.take();
        fs::remove_file(&self.path)
    }
}

impl<C: SinkCodec> Drop for RangeSink<C> {
    fn drop(&mut self) {
        if !self.released {
            self.writer.take();
            if let Err(err) = fs::remove_file(&self.path) {
                log::warn!("sink {} not removed: {}", self.path.display(), err);
            }
        }
    }
}

/// Sequential reader over a sink's keys.
pub struct SinkReader<C: SinkCodec> {
    reader: io::BufReader<fs::File>,

    codec: PhantomData<C>,
}

impl<C: SinkCodec> Iterator for SinkReader<C> {
    type Item = Result<u64, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        match C::decode(&mut self.reader) {
            Ok(Some(key)) => Some(Ok(key)),
            Ok(None) => None,
            Err(err) => Some(Err(SortError::DeserializationError(err))),
        }
    }
}

/// Releases every sink, logging the ones that could not be removed.
pub(crate) fn discard_all<C: SinkCodec>(sinks: impl IntoIterator<Item = RangeSink<C>>) {
    for sink in sinks {
        let path = sink.path().to_path_buf();
        if let Err(err) = sink.release() {
            log::warn!("sink {} not removed: {}", path.display(), err);
        }
    }
}
