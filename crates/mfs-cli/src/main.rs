//! Thin `backup`/`restore` command-line frontend over the `mfs-*` crates.
//! Flags map directly onto `BackupOptions`/`RestoreOptions`; no backup or
//! restore logic lives here beyond opening devices and wiring the pieces.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use mfs_backup::{BackupFormat, BackupOptions, BackupProducer, SourceDevice};
use mfs_core::handle::MfsHandle;
use mfs_io::{Disk, FileDisk, SECTOR_SIZE};
use mfs_part::PartitionView;
use mfs_restore::{RestoreConsumer, RestoreOptions, SwapSize};
use mfs_volume::{VolumeOptions, VolumeSet};

#[derive(Parser)]
#[command(name = "mfs", about = "Backup and restore TiVo MFS storage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a live MFS device to a backup file.
    Backup {
        /// Source device or disk image.
        device: PathBuf,
        /// Destination backup stream; `-` writes to stdout.
        output: PathBuf,
        #[arg(long, value_enum, default_value = "v3")]
        format: FormatArg,
        /// Deflate compression level (0-9); omit to leave the stream raw.
        #[arg(long)]
        compress: Option<u32>,
        /// Skip everything outside the MFS application/media partitions.
        #[arg(long)]
        mfs_only: bool,
        /// Carry partition 9 (/var) alongside the MFS partitions.
        #[arg(long)]
        backup_var: bool,
        /// Stream inodes below this many sectors are eligible for backup.
        #[arg(long)]
        threshold: Option<u64>,
        /// Compare the threshold against a stream's total allocation.
        #[arg(long)]
        threshold_total: bool,
        /// Once a stream passes the threshold, back up its total allocation.
        #[arg(long)]
        stream_total: bool,
        /// Target size (sectors) the restore side should shrink/grow to.
        #[arg(long)]
        target_size: Option<u64>,
    },
    /// Rebuild partitions and a live MFS volume from a backup stream.
    Restore {
        /// Backup stream to read; `-` reads from stdin.
        input: PathBuf,
        /// Target devices or disk images, in placement order.
        #[arg(required = true)]
        devices: Vec<PathBuf>,
        /// Force the rebuilt volume to a specific bitness.
        #[arg(long)]
        mfs64: Option<bool>,
        #[arg(long, default_value_t = 0)]
        var_sectors: u64,
        #[arg(long, default_value_t = 0)]
        db_sectors: u64,
        #[arg(long, value_enum, default_value = "auto")]
        swap: SwapArg,
        #[arg(long)]
        swap_sectors: Option<u64>,
        #[arg(long)]
        swap_v1: bool,
        #[arg(long)]
        force_bswap: Option<bool>,
        #[arg(long, default_value_t = 1)]
        min_alloc: u32,
        #[arg(long, default_value_t = 16)]
        max_partitions_per_disk: usize,
        #[arg(long)]
        zero_part: bool,
        #[arg(long)]
        balance: bool,
        #[arg(long)]
        no_fill: bool,
        #[arg(long)]
        kopt: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    V1,
    V3,
}

#[derive(Clone, Copy, ValueEnum)]
enum SwapArg {
    Auto,
    Sectors,
    None,
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Backup {
            device,
            output,
            format,
            compress,
            mfs_only,
            backup_var,
            threshold,
            threshold_total,
            stream_total,
            target_size,
        } => run_backup(device, output, format, compress, mfs_only, backup_var, threshold, threshold_total, stream_total, target_size),
        Command::Restore {
            input,
            devices,
            mfs64,
            var_sectors,
            db_sectors,
            swap,
            swap_sectors,
            swap_v1,
            force_bswap,
            min_alloc,
            max_partitions_per_disk,
            zero_part,
            balance,
            no_fill,
            kopt,
        } => run_restore(
            input,
            devices,
            mfs64,
            var_sectors,
            db_sectors,
            swap,
            swap_sectors,
            swap_v1,
            force_bswap,
            min_alloc,
            max_partitions_per_disk,
            zero_part,
            balance,
            no_fill,
            kopt,
        ),
    }
}

fn open_disk_rw(path: &PathBuf) -> Result<FileDisk<File>> {
    let file = OpenOptions::new().read(true).write(true).open(path).with_context(|| format!("opening {}", path.display()))?;
    let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
    Ok(FileDisk::open(file, sectors))
}

#[allow(clippy::too_many_arguments)]
fn run_backup(
    device: PathBuf,
    output: PathBuf,
    format: FormatArg,
    compress: Option<u32>,
    mfs_only: bool,
    backup_var: bool,
    threshold: Option<u64>,
    threshold_total: bool,
    stream_total: bool,
    target_size: Option<u64>,
) -> Result<()> {
    let file = File::open(&device).with_context(|| format!("opening {}", device.display()))?;
    let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
    let disk_for_source = FileDisk::open(file.try_clone().context("duplicating device handle")?, sectors);
    let disk_for_volumes = FileDisk::open(file, sectors);

    let source = SourceDevice::open(Box::new(disk_for_source))?;

    let shared: Rc<RefCell<Box<dyn Disk>>> = Rc::new(RefCell::new(Box::new(disk_for_volumes)));
    let mut vols = VolumeSet::new();
    for (app, media) in source.mfs_pairs() {
        let app_view = Box::new(PartitionView::new(shared.clone(), app.record.start_block, app.record.block_count));
        vols.add_volume(app_view, VolumeOptions::default());
        let media_view = Box::new(PartitionView::new(shared.clone(), media.record.start_block, media.record.block_count));
        vols.add_volume(media_view, VolumeOptions::default());
    }

    let handle = MfsHandle::init(vols, 0)?;
    let opts = BackupOptions {
        format: match format {
            FormatArg::V1 => BackupFormat::V1,
            FormatArg::V3 => BackupFormat::V3,
        },
        mfs_only,
        compression_level: compress,
        target_size,
        threshold_sectors: threshold,
        threshold_is_total: threshold_total,
        stream_total,
        backup_var,
        truncated: false,
    };

    let mut producer = BackupProducer::new(handle, &source, opts)?;
    let mut out: Box<dyn io::Write> = if output.as_os_str() == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(File::create(&output).with_context(|| format!("creating {}", output.display()))?)
    };
    io::copy(&mut producer, &mut out).context("writing backup stream")?;
    log::info!("backup of {} written to {}", device.display(), output.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_restore(
    input: PathBuf,
    devices: Vec<PathBuf>,
    mfs64: Option<bool>,
    var_sectors: u64,
    db_sectors: u64,
    swap: SwapArg,
    swap_sectors: Option<u64>,
    swap_v1: bool,
    force_bswap: Option<bool>,
    min_alloc: u32,
    max_partitions_per_disk: usize,
    zero_part: bool,
    balance: bool,
    no_fill: bool,
    kopt: bool,
) -> Result<()> {
    let swap_size = match swap {
        SwapArg::Auto => SwapSize::Auto,
        SwapArg::None => SwapSize::None,
        SwapArg::Sectors => SwapSize::Sectors(swap_sectors.context("--swap=sectors requires --swap-sectors")?),
    };

    let opts = RestoreOptions {
        mfs64,
        var_sectors,
        db_sectors,
        swap_size,
        swap_v1,
        force_bswap,
        min_alloc,
        max_partitions_per_disk,
        zero_part,
        balance,
        no_fill,
        kopt,
    };

    let target_disks: Vec<Box<dyn Disk>> = devices.iter().map(|path| -> Result<Box<dyn Disk>> { Ok(Box::new(open_disk_rw(path)?)) }).collect::<Result<_>>()?;

    let reader: Box<dyn io::Read> = if input.as_os_str() == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(&input).with_context(|| format!("opening {}", input.display()))?)
    };

    let report = RestoreConsumer::new(opts).restore(reader, target_disks)?;
    log::info!(
        "restore complete: {}-bit volume, {} sectors, swap partition {:?}",
        if report.is_64 { 64 } else { 32 },
        report.total_sectors,
        report.swap_partition
    );
    Ok(())
}
