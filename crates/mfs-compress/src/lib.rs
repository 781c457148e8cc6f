//! A byte pipe that leaves the first `HEADER_LEN` bytes of a stream
//! untouched and deflates (or inflates) everything after it.
//!
//! Backup/restore headers need to be readable without committing to a
//! compression level first — `CompressingWriter`/`DecompressingReader`
//! let the header bytes flow straight through while everything else is
//! wrapped in a [`flate2`] stream.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Bytes passed through uncompressed at the start of every stream: one
/// MFS sector, matching the backup stream's own header record.
pub const HEADER_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compression stream error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

enum WriteState<W: Write> {
    Header { writer: W, written: usize },
    Body(DeflateEncoder<W>),
    /// Header not yet flushed through, but compression is disabled.
    Passthrough(W),
    /// Placeholder occupied only while a transition between the above
    /// states is in progress.
    Transitioning,
}

/// Wraps `W`: the first [`HEADER_LEN`] bytes written pass straight
/// through; everything after that is deflated at `level`, if `Some`.
pub struct CompressingWriter<W: Write> {
    state: WriteState<W>,
    level: Option<u32>,
}

impl<W: Write> CompressingWriter<W> {
    pub fn new(writer: W, level: Option<u32>) -> Self {
        CompressingWriter {
            state: WriteState::Header { writer, written: 0 },
            level,
        }
    }

    /// Finishes the underlying deflate stream (if one was started) and
    /// returns the wrapped writer.
    pub fn finish(self) -> Result<W> {
        match self.state {
            WriteState::Header { writer, .. } | WriteState::Passthrough(writer) => Ok(writer),
            WriteState::Body(enc) => Ok(enc.finish()?),
            WriteState::Transitioning => unreachable!("transient state observed outside write()"),
        }
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            WriteState::Body(enc) => return enc.write(buf),
            WriteState::Passthrough(writer) => return writer.write(buf),
            WriteState::Header { written, .. } if *written >= HEADER_LEN => {}
            WriteState::Header { .. } => {
                let WriteState::Header { writer, written } = &mut self.state else { unreachable!() };
                let take = buf.len().min(HEADER_LEN - *written);
                let n = writer.write(&buf[..take])?;
                *written += n;
                return Ok(n);
            }
            WriteState::Transitioning => unreachable!("transient state observed outside write()"),
        }

        // Header quota exhausted: transition into compressed (or
        // passthrough, if disabled) body mode before writing `buf`.
        let state = core::mem::replace(&mut self.state, WriteState::Transitioning);
        let WriteState::Header { writer, .. } = state else { unreachable!() };
        self.state = match self.level {
            Some(level) => WriteState::Body(DeflateEncoder::new(writer, Compression::new(level))),
            None => WriteState::Passthrough(writer),
        };
        self.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            WriteState::Header { writer, .. } | WriteState::Passthrough(writer) => writer.flush(),
            WriteState::Body(enc) => enc.flush(),
            WriteState::Transitioning => Ok(()),
        }
    }
}

enum ReadState<R: Read> {
    Header { reader: R, read: usize },
    Body(DeflateDecoder<R>),
    Passthrough(R),
    Transitioning,
}

/// Mirrors [`CompressingWriter`] on read: the first [`HEADER_LEN`] bytes
/// are returned as-is; the caller then decides (by inspecting the parsed
/// header) whether to call [`DecompressingReader::begin_inflate`] before
/// reading the remainder.
pub struct DecompressingReader<R: Read> {
    state: ReadState<R>,
}

impl<R: Read> DecompressingReader<R> {
    pub fn new(reader: R) -> Self {
        DecompressingReader {
            state: ReadState::Header { reader, read: 0 },
        }
    }

    /// Switches the stream into inflate mode for everything read from
    /// here on. Must be called (if at all) only once the header quota
    /// has been fully consumed; a premature call is a logic error in the
    /// caller, not a stream-format error.
    pub fn begin_inflate(&mut self) {
        let state = core::mem::replace(&mut self.state, ReadState::Transitioning);
        let ReadState::Header { reader, read } = state else {
            panic!("begin_inflate called outside the header-read phase");
        };
        debug_assert_eq!(read, HEADER_LEN);
        self.state = ReadState::Body(DeflateDecoder::new(reader));
    }

    /// Declines compression for the remainder of the stream: reads pass
    /// straight through the inner reader from here on.
    pub fn skip_inflate(&mut self) {
        let state = core::mem::replace(&mut self.state, ReadState::Transitioning);
        let ReadState::Header { reader, .. } = state else {
            panic!("skip_inflate called outside the header-read phase");
        };
        self.state = ReadState::Passthrough(reader);
    }
}

impl<R: Read> Read for DecompressingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            ReadState::Body(dec) => dec.read(buf),
            ReadState::Passthrough(reader) => reader.read(buf),
            ReadState::Header { reader, read } => {
                let take = buf.len().min(HEADER_LEN - *read);
                let n = reader.read(&mut buf[..take])?;
                *read += n;
                Ok(n)
            }
            ReadState::Transitioning => Err(io::Error::new(io::ErrorKind::Other, "stream stuck mid-transition")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_bytes_pass_through_uncompressed() {
        let mut out = Vec::new();
        let mut w = CompressingWriter::new(&mut out, Some(6));
        let header = [0x42u8; HEADER_LEN];
        w.write_all(&header).unwrap();
        w.write_all(b"payload payload payload").unwrap();
        w.finish().unwrap();
        assert_eq!(&out[..HEADER_LEN], &header[..]);
        assert_ne!(&out[HEADER_LEN..], b"payload payload payload");
    }

    #[test]
    fn round_trips_through_deflate() {
        let header = [0xAAu8; HEADER_LEN];
        let body = b"the quick brown fox jumps over the lazy dog".repeat(20);

        let mut compressed = Vec::new();
        let mut w = CompressingWriter::new(&mut compressed, Some(9));
        w.write_all(&header).unwrap();
        w.write_all(&body).unwrap();
        w.finish().unwrap();

        let mut r = DecompressingReader::new(Cursor::new(compressed));
        let mut got_header = [0u8; HEADER_LEN];
        r.read_exact(&mut got_header).unwrap();
        assert_eq!(got_header, header);
        r.begin_inflate();
        let mut got_body = Vec::new();
        r.read_to_end(&mut got_body).unwrap();
        assert_eq!(got_body, body);
    }

    #[test]
    fn passthrough_mode_skips_compression_entirely() {
        let header = [0x11u8; HEADER_LEN];
        let body = b"uncompressed body";

        let mut plain = Vec::new();
        let mut w = CompressingWriter::new(&mut plain, None);
        w.write_all(&header).unwrap();
        w.write_all(body).unwrap();
        w.finish().unwrap();

        let mut r = DecompressingReader::new(Cursor::new(plain));
        let mut got_header = [0u8; HEADER_LEN];
        r.read_exact(&mut got_header).unwrap();
        r.skip_inflate();
        let mut got_body = Vec::new();
        r.read_to_end(&mut got_body).unwrap();
        assert_eq!(got_body, body);
    }
}
