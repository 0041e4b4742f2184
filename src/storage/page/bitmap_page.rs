//! Free-space bitmap for one allocation extent.
//!
//! Layout:
//!
//! | Field           | Offset | Size |
//! |-----------------|--------|------|
//! | magic           | 0      | 4    |
//! | allocated count | 4      | 4    |
//! | bits            | 8      | rest |
//!
//! One bit per data page of the extent, least significant bit first; a zero
//! bit means the page is free.

use crate::common::PAGE_SIZE;

const MAGIC_NUMBER: u32 = 0x4249_544D; // "BITM"

const MAGIC_OFFSET: usize = 0;
const ALLOCATED_OFFSET: usize = 4;
const BITS_OFFSET: usize = 8;

/// Number of data pages tracked by a full-size bitmap page.
pub const BITMAP_CAPACITY: u32 = ((PAGE_SIZE - BITS_OFFSET) * 8) as u32;

pub struct BitmapPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> BitmapPage<B> {
    /// Wraps a page buffer. The buffer may be smaller than `PAGE_SIZE`;
    /// capacity follows its length.
    pub fn new(data: B) -> Self {
        assert!(data.as_ref().len() > BITS_OFFSET);
        Self { data }
    }

    pub fn is_valid(&self) -> bool {
        self.read_u32(MAGIC_OFFSET) == MAGIC_NUMBER
    }

    /// Number of pages this bitmap can track.
    pub fn capacity(&self) -> u32 {
        ((self.data.as_ref().len() - BITS_OFFSET) * 8) as u32
    }

    pub fn allocated_count(&self) -> u32 {
        self.read_u32(ALLOCATED_OFFSET)
    }

    pub fn is_full(&self) -> bool {
        self.allocated_count() >= self.capacity()
    }

    /// Returns true if the page at `offset` is free. Offsets past the end
    /// are never free.
    pub fn is_page_free(&self, offset: u32) -> bool {
        if offset >= self.capacity() {
            return false;
        }
        let (byte, bit) = Self::locate(offset);
        self.data.as_ref()[byte] & (1 << bit) == 0
    }

    fn locate(offset: u32) -> (usize, u32) {
        (BITS_OFFSET + (offset / 8) as usize, offset % 8)
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let bytes: [u8; 4] = self.data.as_ref()[offset..offset + 4]
            .try_into()
            .expect("slice is 4 bytes");
        u32::from_le_bytes(bytes)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BitmapPage<B> {
    /// Formats an empty bitmap.
    pub fn init(&mut self) {
        self.data.as_mut().fill(0);
        self.write_u32(MAGIC_OFFSET, MAGIC_NUMBER);
        self.write_u32(ALLOCATED_OFFSET, 0);
    }

    /// Marks the lowest free page as allocated and returns its offset, or
    /// `None` when every page is in use.
    pub fn allocate_page(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }

        let bits = &self.data.as_ref()[BITS_OFFSET..];
        let byte_index = bits.iter().position(|&b| b != 0xFF)?;
        let bit = (!bits[byte_index]).trailing_zeros();
        let offset = byte_index as u32 * 8 + bit;

        self.data.as_mut()[BITS_OFFSET + byte_index] |= 1 << bit;
        let count = self.allocated_count();
        self.write_u32(ALLOCATED_OFFSET, count + 1);
        Some(offset)
    }

    /// Frees the page at `offset`. Returns false if it is out of range or
    /// already free.
    pub fn deallocate_page(&mut self, offset: u32) -> bool {
        if offset >= self.capacity() || self.is_page_free(offset) {
            return false;
        }

        let (byte, bit) = Self::locate(offset);
        self.data.as_mut()[byte] &= !(1 << bit);
        let count = self.allocated_count();
        self.write_u32(ALLOCATED_OFFSET, count - 1);
        true
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data.as_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
