//! Fixed-width, NUL-padded ASCII strings used by on-disk name/type fields
//! (partition names, partition types, zone-map partition-name lists).

use core::fmt;

/// A fixed-size, NUL-padded ASCII string embedded directly in an on-disk
/// struct, e.g. the 32-byte partition name/type fields of an APM entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FixedAsciiStr<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> FixedAsciiStr<N> {
    pub const EMPTY: Self = Self { data: [0u8; N] };

    /// Builds a fixed string, truncating the input if it doesn't fit.
    pub fn new(s: &str) -> Self {
        let mut data = [0u8; N];
        let bytes = s.as_bytes();
        let len = bytes.len().min(N);
        data[..len].copy_from_slice(&bytes[..len]);
        Self { data }
    }

    /// The string up to the first NUL byte (or the full buffer if unterminated).
    pub fn as_str(&self) -> &str {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(N);
        core::str::from_utf8(&self.data[..end]).unwrap_or("")
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.data
    }
}

impl<const N: usize> Default for FixedAsciiStr<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<const N: usize> fmt::Debug for FixedAsciiStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FixedAsciiStr").field(&self.as_str()).finish()
    }
}

impl<const N: usize> PartialEq for FixedAsciiStr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
impl<const N: usize> Eq for FixedAsciiStr<N> {}

#[cfg(feature = "bytemuck")]
unsafe impl<const N: usize> bytemuck::Zeroable for FixedAsciiStr<N> {}
#[cfg(feature = "bytemuck")]
unsafe impl<const N: usize> bytemuck::Pod for FixedAsciiStr<N> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_and_pads() {
        let s = FixedAsciiStr::<8>::new("abcdefghij");
        assert_eq!(s.as_str(), "abcdefgh");
        let s = FixedAsciiStr::<8>::new("ab");
        assert_eq!(s.as_str(), "ab");
        assert_eq!(s.as_bytes(), &[b'a', b'b', 0, 0, 0, 0, 0, 0]);
    }
}
