use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{error, trace, warn};
use parking_lot::Mutex;

use crate::common::{FrameId, KeystoneError, PageId, Result, INVALID_PAGE_ID};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{FrameHeader, LruReplacer, ReadPageGuard, Replacer, WritePageGuard};

/// Bookkeeping guarded by the pool lock.
struct PoolInner {
    /// Page table: maps resident page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames not holding any page
    free_list: VecDeque<FrameId>,
    replacer: Box<dyn Replacer>,
}

/// BufferPoolManager caches disk pages in a fixed array of frames.
///
/// A page is resident while it is mapped in the page table. Frames are pinned
/// by `fetch_page`/`new_page_raw` (or a page guard) and become evictable once
/// every pin is released. When a frame is needed the free list is tried
/// first, then the replacer; a dirty victim is written back before reuse.
///
/// All metadata changes happen under a single pool lock. Page contents are
/// protected by the per-frame latch, which is never acquired while waiting
/// on a pinned frame under the pool lock.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FrameHeader>,
    inner: Mutex<PoolInner>,
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a pool of `pool_size` frames using LRU replacement.
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::with_replacer(pool_size, disk_manager, Box::new(LruReplacer::new(pool_size)))
    }

    /// Creates a pool of `pool_size` frames with a custom replacement policy.
    pub fn with_replacer(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        replacer: Box<dyn Replacer>,
    ) -> Self {
        let frames = (0..pool_size)
            .map(|i| FrameHeader::new(FrameId::new(i as u32)))
            .collect();
        let free_list = (0..pool_size).map(|i| FrameId::new(i as u32)).collect();

        Self {
            pool_size,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
                replacer,
            }),
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Pins `page_id` in the pool, reading it from disk if it is not resident.
    ///
    /// Every successful call must be balanced by one `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&FrameHeader> {
        if page_id == INVALID_PAGE_ID {
            return Err(KeystoneError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = self.frame(frame_id);
            frame.pin();
            inner.replacer.pin(frame_id);
            return Ok(frame);
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = self.frame(frame_id);
        match self.disk_scheduler.schedule_read_sync(page_id) {
            Ok(data) => {
                frame.load(page_id, &data);
                inner.page_table.insert(page_id, frame_id);
                trace!("loaded {} into {}", page_id, frame_id);
                Ok(frame)
            }
            Err(e) => {
                inner.free_list.push_back(frame_id);
                Err(e)
            }
        }
    }

    /// Allocates a fresh zeroed page and pins it.
    ///
    /// The new page starts dirty so its zeroed contents reach disk even if it
    /// is never written.
    pub fn new_page_raw(&self) -> Result<(PageId, &FrameHeader)> {
        let mut inner = self.inner.lock();
        let frame_id = self.acquire_frame(&mut inner)?;

        let page_id = match self.disk_scheduler.disk_manager().allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                inner.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        let frame = self.frame(frame_id);
        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();
        frame.mark_dirty(true);
        inner.page_table.insert(page_id, frame_id);
        trace!("created {} in {}", page_id, frame_id);

        Ok((page_id, frame))
    }

    /// Releases one pin on `page_id`, OR-ing `is_dirty` into its dirty flag.
    ///
    /// Returns `Ok(false)` if the page was not pinned and
    /// `Err(PageNotFound)` if it is not resident.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        let frame_id = *inner
            .page_table
            .get(&page_id)
            .ok_or(KeystoneError::PageNotFound(page_id))?;

        let frame = self.frame(frame_id);
        match frame.unpin() {
            None => Ok(false),
            Some(remaining) => {
                frame.mark_dirty(is_dirty);
                if remaining == 0 {
                    inner.replacer.unpin(frame_id);
                }
                Ok(true)
            }
        }
    }

    /// Drops `page_id` from the pool and releases it on disk.
    ///
    /// Returns `Ok(false)` if the page is still pinned. A page that is not
    /// resident is released on disk directly.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(KeystoneError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();
        let disk_manager = self.disk_scheduler.disk_manager();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            disk_manager.deallocate_page(page_id)?;
            return Ok(true);
        };

        let frame = self.frame(frame_id);
        if frame.pin_count() > 0 {
            return Ok(false);
        }

        if frame.is_dirty() {
            self.disk_scheduler
                .schedule_write_sync(page_id, frame.snapshot())?;
        }
        disk_manager.deallocate_page(page_id)?;
        inner.page_table.remove(&page_id);
        inner.replacer.pin(frame_id);
        frame.reset();
        inner.free_list.push_back(frame_id);
        trace!("deleted {} from {}", page_id, frame_id);

        Ok(true)
    }

    /// Writes `page_id` to disk and clears its dirty flag.
    ///
    /// Returns `Ok(false)` if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(KeystoneError::InvalidPageId(page_id));
        }

        // Pin so the frame stays put while the latch is taken outside the
        // pool lock.
        let frame = {
            let mut inner = self.inner.lock();
            let Some(&frame_id) = inner.page_table.get(&page_id) else {
                return Ok(false);
            };
            let frame = self.frame(frame_id);
            frame.pin();
            inner.replacer.pin(frame_id);
            frame
        };

        let data = {
            let latch = frame.read_data();
            frame.clear_dirty();
            latch.clone()
        };
        let result = self.disk_scheduler.schedule_write_sync(page_id, data);
        if result.is_err() {
            frame.mark_dirty(true);
        }
        trace!("flushed {}", page_id);

        self.unpin_page(page_id, false)?;
        result.map(|_| true)
    }

    /// Flushes every resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let resident: Vec<PageId> = self.inner.lock().page_table.keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Fetches a page and takes its shared latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(ReadPageGuard::new(self, frame))
    }

    /// Fetches a page and takes its exclusive latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(WritePageGuard::new(self, frame))
    }

    /// Allocates a zeroed page and returns it exclusively latched.
    pub fn new_page(&self) -> Result<WritePageGuard<'_>> {
        let (_, frame) = self.new_page_raw()?;
        Ok(WritePageGuard::new(self, frame))
    }

    /// Debug check that no frame is pinned. Logs every offender.
    pub fn check_all_unpinned(&self) -> bool {
        let _inner = self.inner.lock();
        let mut all_unpinned = true;
        for frame in &self.frames {
            let pins = frame.pin_count();
            if pins > 0 {
                error!(
                    "{} holding {} is still pinned {} times",
                    frame.frame_id(),
                    frame.page_id(),
                    pins
                );
                all_unpinned = false;
            }
        }
        all_unpinned
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.frame(frame_id).pin_count())
    }

    /// Returns the dirty flag for a resident page.
    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        let inner = self.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.frame(frame_id).is_dirty())
    }

    /// True if `page_id` is not allocated on disk.
    pub fn is_page_free(&self, page_id: PageId) -> Result<bool> {
        self.disk_scheduler.disk_manager().is_page_free(page_id)
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of frames holding no page.
    pub fn free_frame_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Returns the disk manager behind the scheduler.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    fn frame(&self, frame_id: FrameId) -> &FrameHeader {
        &self.frames[frame_id.as_usize()]
    }

    /// Finds a frame for a new resident page: the free list first, then a
    /// victim from the replacer. A dirty victim is written back and unmapped.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = inner
            .replacer
            .victim()
            .ok_or(KeystoneError::CacheExhausted)?;
        let frame = self.frame(frame_id);
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            if let Err(e) = self
                .disk_scheduler
                .schedule_write_sync(old_page_id, frame.snapshot())
            {
                warn!("write-back of {} failed: {}", old_page_id, e);
                inner.replacer.unpin(frame_id);
                return Err(e);
            }
        }

        inner.page_table.remove(&old_page_id);
        frame.reset();
        trace!("evicted {} from {}", old_page_id, frame_id);
        Ok(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PAGE_SIZE;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, dm);
        (bpm, temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
        assert!(bpm.check_all_unpinned());
    }

    #[test]
    fn test_buffer_pool_manager_new_page_is_pinned() {
        let (bpm, _temp) = create_bpm(10);

        let (page_id, frame) = bpm.new_page_raw().unwrap();
        assert_eq!(page_id, PageId::new(0));
        assert_eq!(frame.page_id(), page_id);
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);
        assert!(!bpm.check_all_unpinned());

        assert!(bpm.unpin_page(page_id, false).unwrap());
        assert!(!bpm.unpin_page(page_id, false).unwrap());
        assert!(bpm.check_all_unpinned());
    }

    #[test]
    fn test_buffer_pool_manager_unpin_unknown_page() {
        let (bpm, _temp) = create_bpm(2);
        assert!(matches!(
            bpm.unpin_page(PageId::new(5), true),
            Err(KeystoneError::PageNotFound(_))
        ));
    }

    #[test]
    fn test_buffer_pool_manager_invalid_page_id() {
        let (bpm, _temp) = create_bpm(2);
        assert!(matches!(
            bpm.fetch_page(INVALID_PAGE_ID),
            Err(KeystoneError::InvalidPageId(_))
        ));
        assert!(matches!(
            bpm.flush_page(INVALID_PAGE_ID),
            Err(KeystoneError::InvalidPageId(_))
        ));
    }

    #[test]
    fn test_buffer_pool_manager_flush_clears_dirty() {
        let (bpm, _temp) = create_bpm(4);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 9;
            guard.page_id()
        };
        assert_eq!(bpm.is_dirty(page_id), Some(true));

        assert!(bpm.flush_page(page_id).unwrap());
        assert_eq!(bpm.is_dirty(page_id), Some(false));
        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        let mut on_disk = [0u8; PAGE_SIZE];
        bpm.disk_manager().read_page(page_id, &mut on_disk).unwrap();
        assert_eq!(on_disk[0], 9);

        assert!(!bpm.flush_page(PageId::new(99)).unwrap());
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(4);
        let (page_id, _) = bpm.new_page_raw().unwrap();

        assert!(!bpm.delete_page(page_id).unwrap());
        bpm.unpin_page(page_id, false).unwrap();

        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), 4);
        assert!(bpm.is_page_free(page_id).unwrap());

        // Deleting a page that is no longer resident succeeds.
        assert!(bpm.delete_page(page_id).unwrap());
    }

    #[test]
    fn test_buffer_pool_manager_deleted_frame_is_not_evicted() {
        let (bpm, _temp) = create_bpm(1);
        let (first, _) = bpm.new_page_raw().unwrap();
        bpm.unpin_page(first, true).unwrap();
        assert!(bpm.delete_page(first).unwrap());

        // The only frame comes back from the free list, not the replacer.
        let (second, _) = bpm.new_page_raw().unwrap();
        assert_eq!(second, first);
        assert!(matches!(bpm.new_page_raw(), Err(KeystoneError::CacheExhausted)));
        bpm.unpin_page(second, false).unwrap();
    }

    #[test]
    fn test_buffer_pool_manager_fetch_failure_returns_frame() {
        let (bpm, _temp) = create_bpm(1);
        let beyond = PageId::new(crate::storage::disk::MAX_LOGICAL_PAGES);
        assert!(bpm.fetch_page(beyond).is_err());
        assert_eq!(bpm.free_frame_count(), 1);
    }
}
