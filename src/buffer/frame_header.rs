use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// One slot of the buffer pool: a page-sized buffer plus the bookkeeping the
/// pool needs to share and evict it.
///
/// Metadata changes (page id, pin count) happen while the pool lock is held.
/// The byte buffer has its own latch so page contents can be read or written
/// without holding the pool lock.
pub struct FrameHeader {
    frame_id: FrameId,
    page_id: AtomicU32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    /// Page latch guarding the contents
    pub(crate) data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl FrameHeader {
    /// Creates an empty, unpinned frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU32::new(INVALID_PAGE_ID.as_u32()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    /// Returns the frame ID.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Page currently held, or `INVALID_PAGE_ID` for an empty frame.
    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    /// Sets the page held by this frame.
    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.as_u32(), Ordering::Release);
    }

    /// Returns the pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value, or `None` if the
    /// frame was not pinned.
    pub fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    /// Returns true if the contents differ from the page on disk.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// ORs `dirty` into the flag; a dirty frame stays dirty until flushed.
    pub fn mark_dirty(&self, dirty: bool) {
        if dirty {
            self.is_dirty.store(true, Ordering::Release);
        }
    }

    /// Clears the dirty flag after a write-back.
    pub fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Release);
    }

    /// Takes the page latch in shared mode.
    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Takes the page latch in exclusive mode.
    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Snapshot of the page bytes, taken under the shared latch.
    pub fn snapshot(&self) -> Box<[u8; PAGE_SIZE]> {
        self.data.read().clone()
    }

    /// Installs `page_id` with the given contents, clean and pinned once.
    pub(crate) fn load(&self, page_id: PageId, contents: &[u8; PAGE_SIZE]) {
        self.data.write().copy_from_slice(contents);
        self.set_page_id(page_id);
        self.clear_dirty();
        self.pin_count.store(1, Ordering::Release);
    }

    /// Returns the frame to its empty state with zeroed contents.
    pub fn reset(&self) {
        self.set_page_id(INVALID_PAGE_ID);
        self.pin_count.store(0, Ordering::Release);
        self.clear_dirty();
        self.data.write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_new() {
        let frame = FrameHeader::new(FrameId::new(3));
        assert_eq!(frame.frame_id(), FrameId::new(3));
        assert_eq!(frame.page_id(), INVALID_PAGE_ID);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_header_unpin_never_underflows() {
        let frame = FrameHeader::new(FrameId::new(0));

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert_eq!(frame.unpin(), Some(1));
        assert_eq!(frame.unpin(), Some(0));
        assert_eq!(frame.unpin(), None);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_frame_header_dirty_is_sticky() {
        let frame = FrameHeader::new(FrameId::new(0));

        frame.mark_dirty(true);
        frame.mark_dirty(false);
        assert!(frame.is_dirty());

        frame.clear_dirty();
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_header_load_and_reset() {
        let frame = FrameHeader::new(FrameId::new(0));
        let mut contents = Box::new([0u8; PAGE_SIZE]);
        contents[0] = 42;
        contents[PAGE_SIZE - 1] = 7;

        frame.mark_dirty(true);
        frame.load(PageId::new(9), &contents);
        assert_eq!(frame.page_id(), PageId::new(9));
        assert_eq!(frame.pin_count(), 1);
        assert!(!frame.is_dirty());
        assert_eq!(frame.snapshot()[0], 42);
        assert_eq!(frame.read_data()[PAGE_SIZE - 1], 7);

        frame.write_data()[1] = 1;
        frame.reset();
        assert_eq!(frame.page_id(), INVALID_PAGE_ID);
        assert_eq!(frame.pin_count(), 0);
        assert!(frame.read_data().iter().all(|&b| b == 0));
    }
}
