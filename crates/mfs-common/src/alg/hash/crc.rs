use crc::{Crc, CRC_32_ISO_HDLC};

const HASHER_ISO_HDLC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The value a CRC-32/ISO-HDLC checksum evaluates to over a block immediately
/// followed by its own (correct) CRC. Used to validate backup stream
/// trailers without separately parsing out the stored CRC.
pub const CRC32_RESIDUAL: u32 = 0xdebb20e3;

/// The magic value substituted into the checksum field while computing or
/// verifying a DVR CRC, so the field can be both read and written without a
/// chicken-and-egg dependency on its own prior contents.
const CRC_MAGIC: u32 = 0xDEADF00D;

/// A CRC-32 checksum with the ISO-HDLC polynomial.
#[derive(Debug, Copy, Clone)]
pub struct Crc32HasherIsoHdlc;

impl Crc32HasherIsoHdlc {
    pub fn checksum(data: &[u8]) -> u32 {
        HASHER_ISO_HDLC.checksum(data)
    }
}

/// An incremental CRC-32/ISO-HDLC accumulator, for sealing a running
/// checksum over a stream too large (or too incrementally produced) to
/// hold in memory at once, e.g. a backup stream's trailing residual.
pub struct RunningCrc32 {
    digest: crc::Digest<'static, u32>,
}

impl RunningCrc32 {
    pub fn new() -> Self {
        RunningCrc32 { digest: HASHER_ISO_HDLC.digest() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for RunningCrc32 {
    fn default() -> Self {
        Self::new()
    }
}

fn with_magic(data: &[u8], off: usize) -> alloc::vec::Vec<u8> {
    let mut scratch = data.to_vec();
    scratch[off..off + 4].copy_from_slice(&CRC_MAGIC.to_be_bytes());
    scratch
}

/// Computes the DVR CRC-32 of `data` with the 4-byte field at byte offset
/// `off` treated as the magic `0xDEADF00D` during computation.
pub fn dvr_crc32(data: &[u8], off: usize) -> u32 {
    Crc32HasherIsoHdlc::checksum(&with_magic(data, off))
}

/// Computes the DVR CRC-32 of `data` and writes it (big-endian) into the
/// 4-byte field at byte offset `off`.
pub fn dvr_crc32_update(data: &mut [u8], off: usize) {
    let crc = dvr_crc32(data, off);
    data[off..off + 4].copy_from_slice(&crc.to_be_bytes());
}

/// Verifies the DVR CRC-32 stored (big-endian) at byte offset `off` against
/// a fresh computation over `data`.
pub fn dvr_crc32_check(data: &[u8], off: usize) -> bool {
    let stored = u32::from_be_bytes(data[off..off + 4].try_into().unwrap());
    stored == dvr_crc32(data, off)
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec;

    #[test]
    fn update_then_check_round_trips() {
        let mut block = vec![0u8; 512];
        block[4] = 0x42;
        dvr_crc32_update(&mut block, 8);
        assert!(dvr_crc32_check(&block, 8));
        block[4] = 0x43;
        assert!(!dvr_crc32_check(&block, 8));
    }

    #[test]
    fn residual_identity_holds() {
        let mut block = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let crc = Crc32HasherIsoHdlc::checksum(&block);
        block.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(Crc32HasherIsoHdlc::checksum(&block), CRC32_RESIDUAL);
    }
}
