//! End-to-end backup/restore round trip over in-memory `Vec<u8>` disks: a
//! hand-built MFS volume goes through `BackupProducer` and comes back out
//! through `RestoreConsumer`.

use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;

use mfs_backup::{BackupFormat, BackupOptions, BackupProducer, SourceDevice};
use mfs_core::handle::MfsHandle;
use mfs_core::header::VolumeHeader;
use mfs_core::inode::{FsidType, Inode};
use mfs_core::translog::TransactionLog;
use mfs_core::zonemap::ZoneType;
use mfs_io::{Disk, Reader, SECTOR_SIZE};
use mfs_part::{PartitionTable, PartitionView, Width};
use mfs_restore::{RestoreConsumer, RestoreOptions, SwapSize};
use mfs_volume::{VolumeOptions, VolumeSet};

const DEVICE_SECTORS: u64 = 1 << 16;
const INODE_REGION_SECTORS: u64 = 64;

/// Builds a single-device image: an Apple partition map with a raw "boot"
/// partition plus one MFS application/media pair, and a minimal but live
/// MFS volume (header, zone maps, transaction log, two populated inodes)
/// inside that pair.
fn build_source_image() -> Vec<u8> {
    let disk: Vec<u8> = vec![0u8; (DEVICE_SECTORS * SECTOR_SIZE as u64) as usize];
    let mut table = PartitionTable::initialize(disk, Width::Bits32, false).unwrap();
    table.add(64, 0, "Apple", "Apple_partition_map").unwrap();
    table.add(32, table.count(), "boot", "Tivo_boot").unwrap();
    let app_partno = table.add(4096, table.count(), "MFS-app-0", "MFS").unwrap();
    let media_partno = table.add(16384, table.count(), "MFS-media-0", "MFS").unwrap();

    let (app_start, app_len, _, _) = table.partition(app_partno).unwrap();
    let (media_start, media_len, _, _) = table.partition(media_partno).unwrap();

    let disk = table.into_disk();
    let shared: Rc<RefCell<Box<dyn Disk>>> = Rc::new(RefCell::new(Box::new(disk)));

    let mut vols = VolumeSet::new();
    let app_view = Box::new(PartitionView::new(shared.clone(), app_start, app_len));
    let app_vstart = vols.add_volume(app_view, VolumeOptions { writable: true, ..Default::default() });
    let app_size = vols.volume_size(app_vstart);
    let media_view = Box::new(PartitionView::new(shared.clone(), media_start, media_len));
    let media_vstart = vols.add_volume(media_view, VolumeOptions { writable: true, ..Default::default() });
    let media_size = vols.volume_size(media_vstart);

    let total_sectors = vols.volume_set_size();
    let log_start = app_vstart + 1;
    let unk_start = log_start + 8;
    let inode_start = unk_start + 4;
    let app_data_start = inode_start + INODE_REGION_SECTORS;
    let app_data_size = app_size - (app_data_start - app_vstart);

    let mut header = VolumeHeader::new(false);
    header.set_total_sectors(total_sectors);
    header.set_root_fsid(100);
    header.set_next_fsid(101);
    header.set_log_region(log_start, 8);
    header.set_unk_region(unk_start, 4);
    header.set_firstpartsize(app_size / 1024);
    assert!(header.set_partition_list("MFS-app-0 MFS-media-0"));

    let mut handle = MfsHandle::bootstrap(vols, header, false);
    handle.append_zone(ZoneType::Inode, inode_start, INODE_REGION_SECTORS, 2).unwrap();
    handle.append_zone(ZoneType::Application, app_data_start, app_data_size, 1).unwrap();
    handle.append_zone(ZoneType::Media, media_vstart, media_size, 1).unwrap();
    handle.write_volume_header().unwrap();

    let log = TransactionLog { first_sector: log_start, nsectors: 8 };
    log.init_blank(&mut handle.vols).unwrap();

    // A stream inode backed by real media-zone extents.
    let data: Vec<u8> = (0..4 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
    let extents = handle.allocate(ZoneType::Media, 4).unwrap();
    let mut offset = 0usize;
    for extent in &extents {
        let len = (extent.count * SECTOR_SIZE as u64) as usize;
        handle.vols.write_data(&data[offset..offset + len], extent.sector, extent.count).unwrap();
        offset += len;
    }
    let mut stream_inode = Inode::decode(&[0u8; SECTOR_SIZE], false);
    stream_inode.fsid = 42;
    stream_inode.refcount = 1;
    stream_inode.inode_num = 0;
    stream_inode.fsid_type = FsidType::Stream;
    stream_inode.size = data.len() as u64;
    stream_inode.blocksize = SECTOR_SIZE as u32;
    stream_inode.blockused = 4;
    stream_inode.extents = extents;
    handle.write_inode(0, &mut stream_inode).unwrap();

    // A file inode carried purely by inline data, no extents.
    let mut file_inode = Inode::decode(&[0u8; SECTOR_SIZE], false);
    file_inode.fsid = 7;
    file_inode.refcount = 1;
    file_inode.inode_num = 1;
    file_inode.fsid_type = FsidType::File;
    file_inode.inline_data = b"hello world".to_vec();
    file_inode.size = file_inode.inline_data.len() as u64;
    handle.write_inode(1, &mut file_inode).unwrap();

    drop(handle);
    let total = shared.borrow().sector_count();
    let mut snapshot = vec![0u8; (total * SECTOR_SIZE as u64) as usize];
    shared.borrow().read_sectors(0, &mut snapshot).unwrap();
    snapshot
}

fn backup_stream(image: &[u8], format: BackupFormat) -> Vec<u8> {
    let source = SourceDevice::open(Box::new(image.to_vec())).unwrap();

    let shared: Rc<RefCell<Box<dyn Disk>>> = Rc::new(RefCell::new(Box::new(image.to_vec())));
    let mut vols = VolumeSet::new();
    for (app, media) in source.mfs_pairs() {
        let app_view = Box::new(PartitionView::new(shared.clone(), app.record.start_block, app.record.block_count));
        vols.add_volume(app_view, VolumeOptions::default());
        let media_view = Box::new(PartitionView::new(shared.clone(), media.record.start_block, media.record.block_count));
        vols.add_volume(media_view, VolumeOptions::default());
    }
    let handle = MfsHandle::init(vols, 0).unwrap();

    let opts = BackupOptions { format, ..Default::default() };
    let mut producer = BackupProducer::new(handle, &source, opts).unwrap();
    let mut stream = Vec::new();
    producer.read_to_end(&mut stream).unwrap();
    stream
}

#[test]
fn v3_backup_restores_onto_a_blank_device() {
    let image = build_source_image();
    let stream = backup_stream(&image, BackupFormat::V3);
    assert!(!stream.is_empty());

    let target: Vec<u8> = vec![0u8; (DEVICE_SECTORS * SECTOR_SIZE as u64) as usize];
    let devices: Vec<Box<dyn Disk>> = vec![Box::new(target)];

    let mut opts = RestoreOptions::default();
    opts.swap_size = SwapSize::None;
    let report = RestoreConsumer::new(opts).restore(stream.as_slice(), devices).unwrap();

    assert!(!report.is_64);
    assert!(report.total_sectors > 0);
}

#[test]
fn v1_backup_restores_onto_a_blank_device() {
    let image = build_source_image();
    let stream = backup_stream(&image, BackupFormat::V1);
    assert!(!stream.is_empty());

    let target: Vec<u8> = vec![0u8; (DEVICE_SECTORS * SECTOR_SIZE as u64) as usize];
    let devices: Vec<Box<dyn Disk>> = vec![Box::new(target)];

    let mut opts = RestoreOptions::default();
    opts.swap_size = SwapSize::None;
    let report = RestoreConsumer::new(opts).restore(stream.as_slice(), devices).unwrap();

    assert!(!report.is_64);
    assert!(report.total_sectors > 0);
}

#[test]
fn truncated_stream_is_rejected_by_crc() {
    let image = build_source_image();
    let mut stream = backup_stream(&image, BackupFormat::V3);
    stream.truncate(stream.len() - 8);

    let target: Vec<u8> = vec![0u8; (DEVICE_SECTORS * SECTOR_SIZE as u64) as usize];
    let devices: Vec<Box<dyn Disk>> = vec![Box::new(target)];

    let result = RestoreConsumer::new(RestoreOptions::default()).restore(stream.as_slice(), devices);
    assert!(result.is_err());
}
