//! Knobs a caller sets before handing a stream to [`crate::RestoreConsumer`].

pub use mfs_backup::format::RestoreFlags;

/// How to size the swap partition restore (re)creates.
///
/// A value of zero means "leave it out"; `Auto` mirrors the source stream's
/// own swap partition when one was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapSize {
    #[default]
    Auto,
    Sectors(u64),
    None,
}

/// Options controlling how a restore is carried out, mirroring the knobs a
/// caller would otherwise have to thread through every state-machine step by
/// hand.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Force the rebuilt volume to a specific bitness regardless of what the
    /// stream was produced as (`REBUILDBITS`). `None` keeps the stream's own
    /// bitness.
    pub mfs64: Option<bool>,
    /// Sectors reserved for the "var" partition, if one is (re)created.
    pub var_sectors: u64,
    /// Sectors reserved for a database partition, if the target calls for
    /// one outside the MFS application/media pairs.
    pub db_sectors: u64,
    pub swap_size: SwapSize,
    /// Use the legacy (pre-V1) swap-partition signature layout.
    pub swap_v1: bool,
    /// Byte-swap every MFS-typed partition relative to the source
    /// (`RestoreFlags::ENDIAN` override, independent of auto-detection).
    pub force_bswap: Option<bool>,
    /// Minimum allocation unit handed to newly appended zones.
    pub min_alloc: u32,
    /// Largest number of partitions [`crate::layout`] will place on a
    /// single target device before spilling to a second device.
    pub max_partitions_per_disk: usize,
    /// Zero every sector of a newly created non-MFS partition before
    /// copying data into it (`RestoreFlags::ZERO_PART`).
    pub zero_part: bool,
    /// Center the application/media split across devices instead of
    /// packing greedily (`RestoreFlags::BALANCE`).
    pub balance: bool,
    /// Skip filling the tail of a grown partition with zeros
    /// (`RestoreFlags::NO_FILL`).
    pub no_fill: bool,
    /// Treat `K`-suffixed options the way the original tool's `-k` flag
    /// did: keep existing partitions that already match in place
    /// (`RestoreFlags::KOPT`).
    pub kopt: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            mfs64: None,
            var_sectors: 0,
            db_sectors: 0,
            swap_size: SwapSize::Auto,
            swap_v1: false,
            force_bswap: None,
            min_alloc: 1,
            max_partitions_per_disk: 16,
            zero_part: false,
            balance: false,
            no_fill: false,
            kopt: false,
        }
    }
}

impl RestoreOptions {
    pub fn flags(&self) -> RestoreFlags {
        let mut flags = RestoreFlags::INITIALIZED;
        if self.zero_part {
            flags |= RestoreFlags::ZERO_PART;
        }
        if self.balance {
            flags |= RestoreFlags::BALANCE;
        }
        if self.no_fill {
            flags |= RestoreFlags::NO_FILL;
        }
        if self.swap_v1 {
            flags |= RestoreFlags::SWAP_V1;
        }
        if self.kopt {
            flags |= RestoreFlags::KOPT;
        }
        flags
    }
}
