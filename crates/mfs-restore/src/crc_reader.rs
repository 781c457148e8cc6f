//! A transparent `Read` wrapper that accumulates a running CRC-32 over
//! every byte that passes through it, so the final accumulated value can be
//! checked against [`mfs_common::alg::hash::CRC32_RESIDUAL`] once the whole
//! stream, trailer included, has been consumed.

use std::io::{self, Read};

use mfs_common::alg::hash::RunningCrc32;

pub struct CrcReader<R> {
    inner: R,
    crc: RunningCrc32,
}

impl<R: Read> CrcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            crc: RunningCrc32::new(),
        }
    }

    pub fn finalize(self) -> u32 {
        self.crc.finalize()
    }

    /// Reaches into the wrapped reader, e.g. to toggle a
    /// [`mfs_compress::DecompressingReader`]'s inflate mode once the caller
    /// has read enough of the stream to know whether compression was used.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_common::alg::hash::CRC32_RESIDUAL;

    #[test]
    fn residual_holds_through_the_reader() {
        let mut block = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let crc = mfs_common::alg::hash::Crc32HasherIsoHdlc::checksum(&block);
        block.extend_from_slice(&crc.to_be_bytes());

        let mut reader = CrcReader::new(block.as_slice());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(reader.finalize(), CRC32_RESIDUAL);
    }
}
