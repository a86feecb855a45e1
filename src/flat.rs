//! Module implement the flat record file, the storage behind metadata
//! chains, statistics and error logs.
//!
//! A flat file is a sequence of text records appended one after the
//! other, optionally gzip compressed. Records start with a known
//! prefix word (`File` for metadata) at the beginning of a line; the
//! reader splits on that boundary and leaves per-field parsing to the
//! caller. Despite looking like text the content is binary safe, paths
//! are raw bytes.

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use std::{
    ffi,
    io::{BufRead, BufReader, Read, Write},
    path::Path,
};

use crate::{util, Error, Result};

// gzip writes are slow, batch records before they hit the encoder.
const MAX_BUFFERED_RECORDS: usize = 100;

enum Sink {
    Plain(std::fs::File),
    Gz(GzEncoder<std::fs::File>),
}

/// Append-only writer of prefixed records.
pub struct FlatWriter {
    out: Option<Sink>,
    loc: ffi::OsString,
    buffer: Vec<Vec<u8>>,
}

impl FlatWriter {
    /// Create the flat file at `loc`. Compression is decided by the
    /// caller and should agree with the file name's `.gz` suffix.
    pub fn new(loc: &Path, compress: bool) -> Result<FlatWriter> {
        let fd = util::create_file_rw(loc.as_os_str())?;
        let out = if compress {
            Sink::Gz(GzEncoder::new(fd, Compression::default()))
        } else {
            Sink::Plain(fd)
        };
        Ok(FlatWriter {
            out: Some(out),
            loc: loc.as_os_str().to_os_string(),
            buffer: vec![],
        })
    }

    pub fn write_record(&mut self, record: Vec<u8>) -> Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= MAX_BUFFERED_RECORDS {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        let out = match self.out.as_mut() {
            Some(out) => out,
            None => return Ok(()),
        };
        for record in self.buffer.drain(..) {
            let res = match out {
                Sink::Plain(fd) => fd.write_all(&record),
                Sink::Gz(enc) => enc.write_all(&record),
            };
            err_at!(IOError, res, "{:?}", self.loc)?;
        }
        Ok(())
    }

    /// Flush buffered records, finish the stream and sync to disk.
    pub fn close(mut self) -> Result<()> {
        self.flush_buffer()?;
        let fd = match self.out.take() {
            Some(Sink::Plain(fd)) => fd,
            Some(Sink::Gz(enc)) => err_at!(IOError, enc.finish(), "{:?}", self.loc)?,
            None => return Ok(()),
        };
        err_at!(IOError, fd.sync_all(), "{:?}", self.loc)
    }
}

/// Iterator over the records of a flat file, split at lines starting
/// with the record prefix.
pub struct RecordReader {
    input: BufReader<Box<dyn Read>>,
    prefix: &'static [u8],
    pending: Option<Vec<u8>>,
    done: bool,
}

impl RecordReader {
    /// Open `loc`, decompressing when the name ends in `.gz`.
    /// `prefix` is the record boundary word, e.g. b"File ".
    pub fn open(loc: &Path, prefix: &'static [u8]) -> Result<RecordReader> {
        let fd = util::open_file_r(loc.as_os_str())?;
        let compressed = match loc.extension() {
            Some(ext) => ext == "gz",
            None => false,
        };
        let input: Box<dyn Read> = if compressed {
            Box::new(GzDecoder::new(fd))
        } else {
            Box::new(fd)
        };
        Ok(RecordReader {
            input: BufReader::new(input),
            prefix,
            pending: None,
            done: false,
        })
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = vec![];
        let n = err_at!(IOError, self.input.read_until(b'\n', &mut line))?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }
}

impl Iterator for RecordReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut record = match self.pending.take() {
            Some(first_line) => first_line,
            None => {
                // skip anything before the first boundary line.
                loop {
                    match self.read_line() {
                        Ok(Some(line)) => {
                            if line.starts_with(self.prefix) {
                                break line;
                            }
                        }
                        Ok(None) => {
                            self.done = true;
                            return None;
                        }
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                }
            }
        };

        loop {
            match self.read_line() {
                Ok(Some(line)) => {
                    if line.starts_with(self.prefix) {
                        self.pending = Some(line);
                        break;
                    }
                    record.extend_from_slice(&line);
                }
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }

        Some(Ok(record))
    }
}

#[cfg(test)]
#[path = "flat_test.rs"]
mod flat_test;
