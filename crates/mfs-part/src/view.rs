//! A sector-range window onto a shared disk handle, so one partition can
//! be handed to a [`mfs_volume::VolumeSet`] as its own [`mfs_io::Disk`]
//! without the caller giving up the rest of the device.

use alloc::rc::Rc;
use core::cell::RefCell;

use mfs_io::{Disk, Reader, Result, Writer, SECTOR_SIZE};

/// `[start, start+length)` sectors of `disk`, shared so several views (one
/// per partition) can coexist over the same backing device.
pub struct PartitionView<D> {
    disk: Rc<RefCell<D>>,
    start: u64,
    length: u64,
}

impl<D: Disk> PartitionView<D> {
    pub fn new(disk: Rc<RefCell<D>>, start: u64, length: u64) -> Self {
        Self { disk, start, length }
    }
}

impl<D: Disk> Reader for PartitionView<D> {
    fn sector_count(&self) -> u64 {
        self.length
    }

    fn read_sector(&self, index: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        if index >= self.length {
            return Err(mfs_io::Error::OutOfBounds { index, len: self.length });
        }
        self.disk.borrow().read_sector(self.start + index, buf)
    }
}

impl<D: Disk> Writer for PartitionView<D> {
    fn write_sector(&mut self, index: u64, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        if index >= self.length {
            return Err(mfs_io::Error::OutOfBounds { index, len: self.length });
        }
        self.disk.borrow_mut().write_sector(self.start + index, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    #[test]
    fn view_offsets_into_the_shared_disk() {
        let backing: Rc<RefCell<Box<dyn Disk>>> = Rc::new(RefCell::new(Box::new(vec![0u8; 4096 * SECTOR_SIZE])));
        let mut view = PartitionView::new(backing.clone(), 100, 50);
        let sector = [0x11u8; SECTOR_SIZE];
        view.write_sector(0, &sector).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        backing.borrow().read_sector(100, &mut out).unwrap();
        assert_eq!(out, sector);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let backing: Rc<RefCell<Box<dyn Disk>>> = Rc::new(RefCell::new(Box::new(vec![0u8; 4096 * SECTOR_SIZE])));
        let view = PartitionView::new(backing, 100, 50);
        let mut out = [0u8; SECTOR_SIZE];
        assert!(view.read_sector(50, &mut out).is_err());
    }
}
