//! Exercises `scan_mfs`/`coalesce_blocks` against a hand-built single-volume
//! MFS handle: a stream inode with real extents plus an inline-only file
//! inode, checked against threshold filtering.

use mfs_backup::{scan_mfs, BackupOptions};
use mfs_backup::scan::coalesce_blocks;
use mfs_core::handle::MfsHandle;
use mfs_core::header::VolumeHeader;
use mfs_core::inode::{FsidType, Inode};
use mfs_core::zonemap::ZoneType;
use mfs_io::{Disk, SECTOR_SIZE};
use mfs_volume::{VolumeOptions, VolumeSet};

const VOLUME_SECTORS: u64 = 8192;
const INODE_REGION_SECTORS: u64 = 64;

fn build_handle() -> MfsHandle {
    let mut vols = VolumeSet::new();
    vols.add_volume(
        Box::new(vec![0u8; VOLUME_SECTORS as usize * SECTOR_SIZE]) as Box<dyn Disk>,
        VolumeOptions { writable: true, ..Default::default() },
    );

    let log_start = 1;
    let unk_start = log_start + 8;
    let inode_start = unk_start + 4;
    let app_data_start = inode_start + INODE_REGION_SECTORS;
    let app_data_size = 1024 - app_data_start;

    let mut header = VolumeHeader::new(false);
    header.set_total_sectors(VOLUME_SECTORS);
    header.set_log_region(log_start, 8);
    header.set_unk_region(unk_start, 4);
    header.set_firstpartsize(1);
    assert!(header.set_partition_list("MFS-app-0 MFS-media-0"));

    let mut handle = MfsHandle::bootstrap(vols, header, false);
    handle.append_zone(ZoneType::Inode, inode_start, INODE_REGION_SECTORS, 2).unwrap();
    handle.append_zone(ZoneType::Application, app_data_start, app_data_size, 1).unwrap();
    handle.append_zone(ZoneType::Media, 1024, VOLUME_SECTORS - 1024, 1).unwrap();
    handle.write_volume_header().unwrap();

    let extents = handle.allocate(ZoneType::Media, 4).unwrap();
    let mut stream_inode = Inode::decode(&[0u8; SECTOR_SIZE], false);
    stream_inode.fsid = 42;
    stream_inode.refcount = 1;
    stream_inode.fsid_type = FsidType::Stream;
    stream_inode.blocksize = SECTOR_SIZE as u32;
    stream_inode.blockused = 4;
    stream_inode.size = (4 * SECTOR_SIZE) as u64;
    stream_inode.extents = extents;
    handle.write_inode(0, &mut stream_inode).unwrap();

    let mut file_inode = Inode::decode(&[0u8; SECTOR_SIZE], false);
    file_inode.fsid = 7;
    file_inode.refcount = 1;
    file_inode.fsid_type = FsidType::File;
    file_inode.inline_data = b"hello world".to_vec();
    file_inode.size = file_inode.inline_data.len() as u64;
    handle.write_inode(1, &mut file_inode).unwrap();

    handle
}

#[test]
fn scan_keeps_both_inodes_with_no_threshold() {
    let handle = build_handle();
    let result = scan_mfs(&handle, &BackupOptions::default()).unwrap();
    assert_eq!(result.inode_indices.len(), 2);
    assert_eq!(result.stream_slots().count(), 1);
}

#[test]
fn scan_drops_the_stream_past_a_tight_threshold() {
    let handle = build_handle();
    let opts = BackupOptions { threshold_sectors: Some(2), ..Default::default() };
    let result = scan_mfs(&handle, &opts).unwrap();
    // The stream's 4 used sectors exceed the threshold; the file inode
    // (not a stream) is always kept regardless.
    assert_eq!(result.inode_indices.len(), 1);
    assert_eq!(result.stream_slots().count(), 0);
}

#[test]
fn coalesce_merges_adjacent_extents() {
    let handle = build_handle();
    let result = scan_mfs(&handle, &BackupOptions::default()).unwrap();
    let runs = coalesce_blocks(&handle, &result);
    let total: u64 = runs.iter().map(|(_, len)| *len).sum();
    assert_eq!(total, 4);
}
