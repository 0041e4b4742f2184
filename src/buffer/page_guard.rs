use std::ops::{Deref, DerefMut};

use log::warn;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::{BufferPoolManager, FrameHeader};

/// Holds one pin on a page and gives it back on drop.
struct PinGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    is_dirty: bool,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.bpm.unpin_page(self.page_id, self.is_dirty) {
            warn!("page guard failed to unpin {}: {}", self.page_id, e);
        }
    }
}

/// Shared access to a pinned page.
///
/// Dropping the guard releases the page latch and then the pin.
pub struct ReadPageGuard<'a> {
    // Declared before `pin` so the latch is released first.
    data: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
    pin: PinGuard<'a>,
}

impl<'a> ReadPageGuard<'a> {
    /// Latches `frame`, which the caller has already pinned for `bpm`.
    pub(crate) fn new(bpm: &'a BufferPoolManager, frame: &'a FrameHeader) -> Self {
        let page_id = frame.page_id();
        let pin = PinGuard {
            bpm,
            page_id,
            is_dirty: false,
        };
        Self {
            data: frame.data.read(),
            pin,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

/// Exclusive access to a pinned page.
///
/// The page is unpinned dirty if `data_mut` or `mark_dirty` was called.
pub struct WritePageGuard<'a> {
    data: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
    pin: PinGuard<'a>,
}

impl<'a> WritePageGuard<'a> {
    /// Latches `frame`, which the caller has already pinned for `bpm`.
    pub(crate) fn new(bpm: &'a BufferPoolManager, frame: &'a FrameHeader) -> Self {
        let page_id = frame.page_id();
        let pin = PinGuard {
            bpm,
            page_id,
            is_dirty: false,
        };
        Self {
            data: frame.data.write(),
            pin,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Mutable page bytes. Marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.pin.is_dirty = true;
        &mut self.data[..]
    }

    /// Marks the page dirty without touching its bytes.
    pub fn mark_dirty(&mut self) {
        self.pin.is_dirty = true;
    }

    /// Returns true if this guard has written to the page.
    pub fn is_dirty(&self) -> bool {
        self.pin.is_dirty
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        (BufferPoolManager::new(pool_size, dm), temp_file)
    }

    #[test]
    fn test_read_page_guard_unpins_on_drop() {
        let (bpm, _temp) = create_bpm(4);
        let page_id = bpm.new_page().unwrap().page_id();

        let guard = bpm.fetch_page_read(page_id).unwrap();
        let second = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.page_id(), page_id);
        assert_eq!(bpm.get_pin_count(page_id), Some(2));

        drop(guard);
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        second.drop_guard();
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
        assert!(bpm.check_all_unpinned());
    }

    #[test]
    fn test_write_page_guard_marks_dirty() {
        let (bpm, _temp) = create_bpm(4);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            assert!(!guard.is_dirty());
            guard.page_id()
        };
        bpm.flush_page(page_id).unwrap();

        {
            let guard = bpm.fetch_page_write(page_id).unwrap();
            assert_eq!(guard[0], 0);
        }
        assert_eq!(bpm.is_dirty(page_id), Some(false));

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard[0] = 42;
            assert!(guard.is_dirty());
        }
        assert_eq!(bpm.is_dirty(page_id), Some(true));

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }
}
