//! `TryDev`: decides which target device each MFS application/media
//! partition pair (and each carried-through raw partition) lands on.
//!
//! The source stream may have spread its MFS partitions over more than one
//! physical device; a restore target might have a different number of
//! devices, different sizes, or both. This module brute-forces an
//! assignment that respects each device's free space and partition-count
//! ceiling, optionally centering the split (`BALANCE`) instead of packing
//! greedily from the front.

use crate::error::{Error, Result};

/// One MFS application/media pair as carried in the stream, sized in
/// sectors. Device/partition numbers from the source are advisory only —
/// `TryDev` is free to relocate a pair to any device with room.
#[derive(Debug, Clone, Copy)]
pub struct PairSize {
    pub app_sectors: u64,
    pub media_sectors: u64,
}

/// A target device `TryDev` can place partitions on.
#[derive(Debug, Clone, Copy)]
pub struct TargetDevice {
    pub free_sectors: u64,
    pub max_partitions: usize,
    /// Partitions already committed to this device before `TryDev` runs
    /// (e.g. boot/var), consuming both space and the partition budget.
    pub reserved_partitions: usize,
}

/// Where a given pair ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairPlacement {
    pub device: usize,
}

/// The result of a successful `TryDev` run: one placement per input pair,
/// in input order.
#[derive(Debug, Clone)]
pub struct Layout {
    pub placements: Vec<PairPlacement>,
}

/// Finds an assignment of `pairs` to `devices` such that every device's
/// sector and partition budgets hold. Tries every 2-outcome-per-pair
/// assignment when there are at most two devices (the common case: a
/// restore target is rarely split across more than a pair of disks);
/// falls back to a greedy first-fit across more devices.
pub fn try_dev(
    pairs: &[PairSize],
    devices: &[TargetDevice],
    balance: bool,
) -> Result<Layout> {
    if devices.is_empty() {
        return Err(Error::NoFeasibleLayout {
            needed: pairs.len(),
        });
    }

    if devices.len() <= 2 {
        if let Some(layout) = brute_force(pairs, devices, balance) {
            return Ok(layout);
        }
        return Err(Error::NoFeasibleLayout {
            needed: pairs.len(),
        });
    }

    greedy_first_fit(pairs, devices).ok_or(Error::NoFeasibleLayout {
        needed: pairs.len(),
    })
}

fn pair_sectors(p: &PairSize) -> u64 {
    p.app_sectors + p.media_sectors
}

fn fits(devices: &[TargetDevice], used_sectors: &[u64], used_parts: &[usize]) -> bool {
    devices.iter().enumerate().all(|(i, d)| {
        used_sectors[i] <= d.free_sectors
            && used_parts[i] + d.reserved_partitions <= d.max_partitions
    })
}

fn score_balance(devices: &[TargetDevice], used_sectors: &[u64]) -> u64 {
    // Smaller spread between devices' remaining free space is better.
    let remaining: Vec<i128> = devices
        .iter()
        .zip(used_sectors)
        .map(|(d, u)| d.free_sectors as i128 - *u as i128)
        .collect();
    let max = remaining.iter().copied().max().unwrap_or(0);
    let min = remaining.iter().copied().min().unwrap_or(0);
    (max - min).unsigned_abs() as u64
}

fn brute_force(pairs: &[PairSize], devices: &[TargetDevice], balance: bool) -> Option<Layout> {
    let n = pairs.len();
    if n > 24 {
        // Astronomically unlikely in practice; fall back rather than spin.
        return greedy_first_fit(pairs, devices);
    }
    let ndev = devices.len();
    let mut best: Option<(u64, Vec<usize>)> = None;

    'outer: for mask in 0u64..(ndev as u64).pow(n as u32).max(1) {
        let mut assignment = vec![0usize; n];
        let mut m = mask;
        for slot in assignment.iter_mut() {
            *slot = (m % ndev as u64) as usize;
            m /= ndev as u64;
        }

        let mut used_sectors = vec![0u64; ndev];
        let mut used_parts = vec![0usize; ndev];
        for (pair, &dev) in pairs.iter().zip(&assignment) {
            used_sectors[dev] += pair_sectors(pair);
            used_parts[dev] += 2; // app + media partitions
        }
        if !fits(devices, &used_sectors, &used_parts) {
            continue 'outer;
        }

        let score = if balance {
            score_balance(devices, &used_sectors)
        } else {
            // Prefer packing device 0 first: minimize sectors used on the
            // highest-indexed device.
            used_sectors.iter().enumerate().map(|(i, s)| (i as u64) * s).sum()
        };

        if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
            best = Some((score, assignment));
        }
    }

    best.map(|(_, assignment)| Layout {
        placements: assignment
            .into_iter()
            .map(|device| PairPlacement { device })
            .collect(),
    })
}

fn greedy_first_fit(pairs: &[PairSize], devices: &[TargetDevice]) -> Option<Layout> {
    let mut used_sectors = vec![0u64; devices.len()];
    let mut used_parts = vec![0usize; devices.len()];
    let mut placements = Vec::with_capacity(pairs.len());

    for pair in pairs {
        let need = pair_sectors(pair);
        let slot = devices.iter().enumerate().position(|(i, d)| {
            used_sectors[i] + need <= d.free_sectors
                && used_parts[i] + 2 + d.reserved_partitions <= d.max_partitions
        })?;
        used_sectors[slot] += need;
        used_parts[slot] += 2;
        placements.push(PairPlacement { device: slot });
    }

    Some(Layout { placements })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(free: u64, max_parts: usize) -> TargetDevice {
        TargetDevice {
            free_sectors: free,
            max_partitions: max_parts,
            reserved_partitions: 0,
        }
    }

    #[test]
    fn single_device_single_pair_fits() {
        let pairs = [PairSize {
            app_sectors: 100,
            media_sectors: 200,
        }];
        let devices = [dev(1000, 16)];
        let layout = try_dev(&pairs, &devices, false).unwrap();
        assert_eq!(layout.placements[0].device, 0);
    }

    #[test]
    fn splits_across_two_devices_when_one_is_too_small() {
        let pairs = [
            PairSize {
                app_sectors: 100,
                media_sectors: 800,
            },
            PairSize {
                app_sectors: 100,
                media_sectors: 800,
            },
        ];
        let devices = [dev(1000, 16), dev(1000, 16)];
        let layout = try_dev(&pairs, &devices, false).unwrap();
        assert_ne!(layout.placements[0].device, layout.placements[1].device);
    }

    #[test]
    fn reports_infeasible_when_nothing_fits() {
        let pairs = [PairSize {
            app_sectors: 10_000,
            media_sectors: 10_000,
        }];
        let devices = [dev(100, 16)];
        assert!(try_dev(&pairs, &devices, false).is_err());
    }

    #[test]
    fn partition_budget_is_respected() {
        let pairs = [
            PairSize {
                app_sectors: 10,
                media_sectors: 10,
            },
            PairSize {
                app_sectors: 10,
                media_sectors: 10,
            },
        ];
        let devices = [dev(1_000_000, 2)];
        // Each pair needs 2 partition slots; the single device only has
        // room for one pair.
        assert!(try_dev(&pairs, &devices, false).is_err());
    }
}
