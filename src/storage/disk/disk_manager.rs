use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::{KeystoneError, PageId, Result, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::page::{BitmapPage, DiskMetaPage, BITMAP_CAPACITY, MAX_EXTENTS};

/// Highest logical page id the file layout can address, plus one.
pub const MAX_LOGICAL_PAGES: u32 = MAX_EXTENTS * BITMAP_CAPACITY;

/// State guarded by the file lock: the file handle and the cached meta page.
struct DiskInner {
    file: File,
    meta: Box<[u8; PAGE_SIZE]>,
}

/// DiskManager reads and writes fixed-size pages of a single database file
/// and hands out logical page ids.
///
/// The file is laid out as a meta page followed by extents. Every extent is
/// one bitmap page tracking the `BITMAP_CAPACITY` data pages right after it:
///
/// ```text
/// | meta | bitmap 0 | data 0 .. data N-1 | bitmap 1 | data N .. | ...
/// ```
///
/// Callers only see logical page ids, which number the data pages densely.
pub struct DiskManager {
    inner: Mutex<DiskInner>,
    db_path: String,
    num_reads: AtomicU32,
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens the database file at `db_path`, creating and formatting it if it
    /// does not exist yet.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let mut meta = Box::new([0u8; PAGE_SIZE]);
        Self::read_physical(&mut file, 0, &mut meta[..])?;

        let mut meta_page = DiskMetaPage::new(&mut meta[..]);
        if meta_page.is_blank() {
            meta_page.init();
            Self::write_physical(&mut file, 0, &meta[..])?;
            debug!("formatted new database file {}", path_str);
        } else if !meta_page.is_valid() {
            return Err(KeystoneError::CorruptPage(format!(
                "{} does not start with a valid meta page",
                path_str
            )));
        } else {
            debug!(
                "opened database file {} with {} allocated pages",
                path_str,
                meta_page.allocated_pages()
            );
        }

        Ok(Self {
            inner: Mutex::new(DiskInner { file, meta }),
            db_path: path_str,
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Reads a logical page into `data`. Pages never written read as zeroes.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");
        let physical = Self::physical_page(page_id)?;

        let mut inner = self.inner.lock();
        Self::read_physical(&mut inner.file, physical, data)?;

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes `data` to a logical page.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");
        let physical = Self::physical_page(page_id)?;

        let mut inner = self.inner.lock();
        Self::write_physical(&mut inner.file, physical, data)?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates the lowest free logical page id. The page is zero-initialized.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let DiskInner { file, meta } = &mut *inner;
        let mut meta_page = DiskMetaPage::new(&mut meta[..]);

        let num_extents = meta_page.num_extents();
        let extent = (0..num_extents)
            .find(|&e| meta_page.extent_used(e) < BITMAP_CAPACITY)
            .or_else(|| (num_extents < MAX_EXTENTS).then_some(num_extents))
            .ok_or(KeystoneError::AllocationFailed)?;

        let mut bitmap = Box::new([0u8; PAGE_SIZE]);
        if extent == num_extents {
            BitmapPage::new(&mut bitmap[..]).init();
            meta_page.set_num_extents(num_extents + 1);
        } else {
            Self::read_physical(file, Self::bitmap_physical(extent), &mut bitmap[..])?;
        }

        let offset = BitmapPage::new(&mut bitmap[..])
            .allocate_page()
            .ok_or_else(|| {
                KeystoneError::CorruptPage(format!(
                    "bitmap of extent {} is full but the meta page disagrees",
                    extent
                ))
            })?;
        meta_page.record_allocation(extent);

        let page_id = PageId::new(extent * BITMAP_CAPACITY + offset);
        Self::write_physical(file, Self::bitmap_physical(extent), &bitmap[..])?;
        Self::write_physical(file, 0, &meta[..])?;
        Self::write_physical(file, Self::data_physical(page_id), &[0u8; PAGE_SIZE])?;

        trace!("allocated {}", page_id);
        Ok(page_id)
    }

    /// Releases a logical page id for reuse. Returns false if it was not
    /// allocated.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<bool> {
        Self::physical_page(page_id)?;
        let (extent, offset) = Self::locate(page_id);

        let mut inner = self.inner.lock();
        let DiskInner { file, meta } = &mut *inner;
        let mut meta_page = DiskMetaPage::new(&mut meta[..]);
        if extent >= meta_page.num_extents() {
            return Ok(false);
        }

        let mut bitmap = Box::new([0u8; PAGE_SIZE]);
        Self::read_physical(file, Self::bitmap_physical(extent), &mut bitmap[..])?;
        if !BitmapPage::new(&mut bitmap[..]).deallocate_page(offset) {
            return Ok(false);
        }
        meta_page.record_deallocation(extent);

        Self::write_physical(file, Self::bitmap_physical(extent), &bitmap[..])?;
        Self::write_physical(file, 0, &meta[..])?;

        trace!("deallocated {}", page_id);
        Ok(true)
    }

    /// Returns true if `page_id` is not currently allocated.
    pub fn is_page_free(&self, page_id: PageId) -> Result<bool> {
        Self::physical_page(page_id)?;
        let (extent, offset) = Self::locate(page_id);

        let mut inner = self.inner.lock();
        if extent >= DiskMetaPage::new(&inner.meta[..]).num_extents() {
            return Ok(true);
        }

        let mut bitmap = Box::new([0u8; PAGE_SIZE]);
        Self::read_physical(&mut inner.file, Self::bitmap_physical(extent), &mut bitmap[..])?;
        Ok(BitmapPage::new(&bitmap[..]).is_page_free(offset))
    }

    /// Number of logical pages currently allocated.
    pub fn num_allocated_pages(&self) -> u32 {
        DiskMetaPage::new(&self.inner.lock().meta[..]).allocated_pages()
    }

    /// Returns the number of page reads performed.
    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of page writes performed.
    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Flushes file buffers to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn locate(page_id: PageId) -> (u32, u32) {
        let logical = page_id.as_u32();
        (logical / BITMAP_CAPACITY, logical % BITMAP_CAPACITY)
    }

    fn bitmap_physical(extent: u32) -> u64 {
        1 + extent as u64 * (BITMAP_CAPACITY as u64 + 1)
    }

    fn data_physical(page_id: PageId) -> u64 {
        let (extent, offset) = Self::locate(page_id);
        Self::bitmap_physical(extent) + 1 + offset as u64
    }

    fn physical_page(page_id: PageId) -> Result<u64> {
        if page_id == INVALID_PAGE_ID || page_id.as_u32() >= MAX_LOGICAL_PAGES {
            return Err(KeystoneError::InvalidPageId(page_id));
        }
        Ok(Self::data_physical(page_id))
    }

    fn read_physical(file: &mut File, physical: u64, data: &mut [u8]) -> Result<()> {
        file.seek(SeekFrom::Start(physical * PAGE_SIZE as u64))?;

        // Short reads past the end of the file leave zeroes behind.
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data[filled..].fill(0);
        Ok(())
    }

    fn write_physical(file: &mut File, physical: u64, data: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(physical * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().file.sync_all();
    }
}
