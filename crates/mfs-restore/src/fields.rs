//! Endian-aware primitive reads for the part of a stream that has to be
//! decoded *before* a [`mfs_common::types::endian::Endianness`] choice can
//! be made: the header magic itself decides whether the rest of the header
//! was authored with the reader's own byte order or the opposite one.
//!
//! Everything past the header is plain `U32<BigEndian>`/`bytemuck::Pod`, the
//! same as the producer writes it, *provided* the bytes are first corrected
//! for the detected swap. [`FieldReader`] does that correction inline so
//! callers never juggle two code paths.

/// Reads big-endian (or, if `swap` is set, the opposite) integers out of a
/// byte cursor, advancing as it goes.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    pub swap: bool,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8], swap: bool) -> Self {
        Self { buf, pos: 0, swap }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        let raw: [u8; 2] = self.take(2)?.try_into().ok()?;
        Some(if self.swap {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    pub fn u32(&mut self) -> Option<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(if self.swap {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        self.take(n)
    }
}

/// Byte-reverses every 4-byte word of `buf` in place. Used to turn an
/// opposite-endian-authored record into one that can be cast straight
/// through the normal `U32<BigEndian>`/`bytemuck::Pod` path, mirroring the
/// word-swap `mfs-volume` applies to whole sectors.
pub fn reverse_u32_words(buf: &mut [u8]) {
    for chunk in buf.chunks_exact_mut(4) {
        chunk.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_native_order() {
        let buf = [0x00, 0x00, 0x01, 0x02, 0xAB];
        let mut r = FieldReader::new(&buf, false);
        assert_eq!(r.u32(), Some(0x0000_0102));
        assert_eq!(r.u8(), Some(0xAB));
    }

    #[test]
    fn reads_swapped_order() {
        let buf = [0x02, 0x01, 0x00, 0x00];
        let mut r = FieldReader::new(&buf, true);
        assert_eq!(r.u32(), Some(0x0000_0102));
    }

    #[test]
    fn reverse_u32_words_round_trips() {
        let mut buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        reverse_u32_words(&mut buf);
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01, 0x08, 0x07, 0x06, 0x05]);
        reverse_u32_words(&mut buf);
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }
}
