//! Physical page 0 of the database file: allocation summary across extents.
//!
//! | Field                | Offset       | Size |
//! |----------------------|--------------|------|
//! | magic                | 0            | 4    |
//! | allocated pages      | 4            | 4    |
//! | extent count         | 8            | 4    |
//! | used pages of extent | 12 + 4 * i   | 4    |

use crate::common::PAGE_SIZE;

const MAGIC_NUMBER: u32 = 0x4B53_4D54; // "KSMT"

const MAGIC_OFFSET: usize = 0;
const ALLOCATED_OFFSET: usize = 4;
const EXTENTS_OFFSET: usize = 8;
const EXTENT_USED_OFFSET: usize = 12;

/// Number of extents the meta page can describe.
pub const MAX_EXTENTS: u32 = ((PAGE_SIZE - EXTENT_USED_OFFSET) / 4) as u32;

pub struct DiskMetaPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> DiskMetaPage<B> {
    pub fn new(data: B) -> Self {
        assert_eq!(data.as_ref().len(), PAGE_SIZE);
        Self { data }
    }

    pub fn is_valid(&self) -> bool {
        self.read_u32(MAGIC_OFFSET) == MAGIC_NUMBER
    }

    /// True for a page that was never written.
    pub fn is_blank(&self) -> bool {
        self.data.as_ref().iter().all(|&b| b == 0)
    }

    pub fn allocated_pages(&self) -> u32 {
        self.read_u32(ALLOCATED_OFFSET)
    }

    pub fn num_extents(&self) -> u32 {
        self.read_u32(EXTENTS_OFFSET)
    }

    pub fn extent_used(&self, extent: u32) -> u32 {
        self.read_u32(Self::extent_offset(extent))
    }

    fn extent_offset(extent: u32) -> usize {
        assert!(extent < MAX_EXTENTS, "extent {} out of range", extent);
        EXTENT_USED_OFFSET + extent as usize * 4
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let bytes: [u8; 4] = self.data.as_ref()[offset..offset + 4]
            .try_into()
            .expect("slice is 4 bytes");
        u32::from_le_bytes(bytes)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> DiskMetaPage<B> {
    pub fn init(&mut self) {
        self.data.as_mut().fill(0);
        self.write_u32(MAGIC_OFFSET, MAGIC_NUMBER);
    }

    pub fn set_num_extents(&mut self, extents: u32) {
        self.write_u32(EXTENTS_OFFSET, extents);
    }

    /// Records one more allocated page in `extent`.
    pub fn record_allocation(&mut self, extent: u32) {
        let used = self.extent_used(extent);
        self.write_u32(Self::extent_offset(extent), used + 1);
        let total = self.allocated_pages();
        self.write_u32(ALLOCATED_OFFSET, total + 1);
    }

    /// Records one freed page in `extent`.
    pub fn record_deallocation(&mut self, extent: u32) {
        let used = self.extent_used(extent);
        self.write_u32(Self::extent_offset(extent), used.saturating_sub(1));
        let total = self.allocated_pages();
        self.write_u32(ALLOCATED_OFFSET, total.saturating_sub(1));
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data.as_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_meta_page_counts() {
        let mut data = [0u8; PAGE_SIZE];
        let mut meta = DiskMetaPage::new(&mut data[..]);
        assert!(meta.is_blank());
        assert!(!meta.is_valid());

        meta.init();
        assert!(meta.is_valid());
        meta.set_num_extents(2);
        meta.record_allocation(0);
        meta.record_allocation(1);
        meta.record_allocation(1);
        meta.record_deallocation(1);

        assert_eq!(meta.num_extents(), 2);
        assert_eq!(meta.allocated_pages(), 2);
        assert_eq!(meta.extent_used(0), 1);
        assert_eq!(meta.extent_used(1), 1);
    }
}
