//! Input sources and key tokenizer.

use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

/// Re-readable input. Every call to [`InputSource::open`] returns an independent handle positioned
/// at the start of the data, so that several range passes may scan the same input concurrently.
pub trait InputSource: Sync {
    type Reader: BufRead + Seek + Send;

    /// Opens a new handle to the input.
    fn open(&self) -> io::Result<Self::Reader>;
}

impl InputSource for Path {
    type Reader = io::BufReader<fs::File>;

    fn open(&self) -> io::Result<Self::Reader> {
        Ok(io::BufReader::new(fs::File::open(self)?))
    }
}

impl InputSource for PathBuf {
    type Reader = io::BufReader<fs::File>;

    fn open(&self) -> io::Result<Self::Reader> {
        self.as_path().open()
    }
}

impl<'a> InputSource for &'a [u8] {
    type Reader = io::Cursor<&'a [u8]>;

    fn open(&self) -> io::Result<Self::Reader> {
        Ok(io::Cursor::new(*self))
    }
}

/// Number of leading bytes of a malformed token kept for diagnostics.
pub const MALFORMED_PREVIEW_LEN: usize = 32;

/// Input token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Non-negative decimal integer.
    Key(u64),
    /// Anything else (signs, letters, values not fitting `u64`).
    /// Holds at most [`MALFORMED_PREVIEW_LEN`] leading bytes of the token, followed by `...` if it was cut.
    Malformed(String),
}

/// Splits a byte stream into whitespace-separated tokens.
///
/// Digits are accumulated as they stream through the reader buffer, so memory use does not depend on token length:
/// the whole input may be a single line or a single token.
pub struct Tokens<R> {
    reader: R,
    preview: Vec<u8>,
}

impl<R: BufRead> Tokens<R> {
    pub fn new(reader: R) -> Self {
        Tokens {
            reader,
            preview: Vec::with_capacity(MALFORMED_PREVIEW_LEN),
        }
    }
}

impl<R: BufRead> Iterator for Tokens<R> {
    type Item = io::Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        self.preview.clear();
        let mut token_len: u64 = 0;
        // `None` once the token is known to be malformed
        let mut value: Option<u64> = Some(0);

        loop {
            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Some(Err(err)),
            };
            if buf.is_empty() {
                break;
            }

            let mut consumed = 0;
            let mut complete = false;
            for &byte in buf {
                consumed += 1;
                if byte.is_ascii_whitespace() {
                    if token_len > 0 {
                        complete = true;
                        break;
                    }
                    continue;
                }

                token_len += 1;
                if self.preview.len() < MALFORMED_PREVIEW_LEN {
                    self.preview.push(byte);
                }
                value = value.and_then(|value| push_digit(value, byte));
            }
            self.reader.consume(consumed);

            if complete {
                break;
            }
        }

        if token_len == 0 {
            return None;
        }

        return Some(Ok(match value {
            Some(key) => Token::Key(key),
            None => {
                let mut preview = String::from_utf8_lossy(&self.preview).into_owned();
                if token_len > self.preview.len() as u64 {
                    preview.push_str("...");
                }
                Token::Malformed(preview)
            }
        }));
    }
}

fn push_digit(value: u64, byte: u8) -> Option<u64> {
    let digit = match byte {
        b'0'..=b'9' => (byte - b'0') as u64,
        _ => return None,
    };
    value.checked_mul(10)?.checked_add(digit)
}
