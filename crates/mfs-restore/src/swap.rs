//! Builds the signature a rebuilt swap partition needs before the kernel
//! will treat it as usable swap space.
//!
//! Two generations exist: the original ("v0") signature, good for swap
//! areas up to 128 MiB, and the newer ("v1") signature used above that
//! size. `RestoreFlags::SWAP_V1` (via [`crate::options::RestoreOptions`])
//! forces v1 regardless of size.

pub const PAGE_SIZE: usize = 4096;
const SIG_LEN: usize = 10;
const SIG_V0: &[u8; SIG_LEN] = b"SWAP-SPACE";
const SIG_V1: &[u8; SIG_LEN] = b"SWAPSPACE2";

const V0_MAX_SECTORS: u64 = (128 * 1024 * 1024) / 512;

/// Returns which signature a swap partition of `sectors` sectors should
/// carry, absent an explicit override.
pub fn signature_for_size(sectors: u64, force_v1: bool) -> &'static [u8; SIG_LEN] {
    if force_v1 || sectors > V0_MAX_SECTORS {
        SIG_V1
    } else {
        SIG_V0
    }
}

/// Stamps the swap signature into the last 10 bytes of the first page of
/// `buf`, which must be at least one page long. Everything else in the
/// page (the "last 2 pages" of the swap header proper, beyond this
/// signature) is left to the caller.
pub fn write_signature(buf: &mut [u8], sectors: u64, force_v1: bool) {
    assert!(buf.len() >= PAGE_SIZE, "swap signature needs a full page");
    let sig = signature_for_size(sectors, force_v1);
    let off = PAGE_SIZE - SIG_LEN;
    buf[off..off + SIG_LEN].copy_from_slice(sig);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_partition_gets_v0() {
        assert_eq!(signature_for_size(1000, false), SIG_V0);
    }

    #[test]
    fn large_partition_gets_v1() {
        assert_eq!(signature_for_size(V0_MAX_SECTORS + 1, false), SIG_V1);
    }

    #[test]
    fn force_v1_overrides_size() {
        assert_eq!(signature_for_size(10, true), SIG_V1);
    }

    #[test]
    fn write_signature_lands_at_page_minus_ten() {
        let mut buf = vec![0u8; PAGE_SIZE];
        write_signature(&mut buf, 10, true);
        assert_eq!(&buf[PAGE_SIZE - SIG_LEN..], SIG_V1);
    }
}
