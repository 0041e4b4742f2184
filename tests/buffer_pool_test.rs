//! Integration tests for the buffer pool manager

use std::sync::Arc;
use std::thread;

use keystone::buffer::BufferPoolManager;
use keystone::common::{KeystoneError, PageId};
use keystone::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
    init_logging();
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = BufferPoolManager::new(pool_size, dm);
    (bpm, temp_file)
}

#[test]
fn test_buffer_pool_basic_operations() {
    let (bpm, _temp) = create_bpm(10);

    let page_id = {
        let mut guard = bpm.new_page().unwrap();
        guard.data_mut()[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        guard.page_id()
    };
    assert_eq!(page_id, PageId::new(0));

    let guard = bpm.fetch_page_read(page_id).unwrap();
    assert_eq!(&guard.data()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(bpm.get_pin_count(page_id), Some(1));
    drop(guard);

    assert_eq!(bpm.get_pin_count(page_id), Some(0));
    assert!(bpm.check_all_unpinned());
}

#[test]
fn test_two_frame_pool_exhaustion() {
    init_logging();
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let p1 = dm.allocate_page().unwrap();
    let p2 = dm.allocate_page().unwrap();
    let p3 = dm.allocate_page().unwrap();
    let bpm = BufferPoolManager::new(2, dm);

    let frame1 = bpm.fetch_page(p1).unwrap().frame_id();
    bpm.fetch_page(p2).unwrap();
    assert!(matches!(bpm.fetch_page(p3), Err(KeystoneError::CacheExhausted)));

    assert!(bpm.unpin_page(p1, false).unwrap());
    let frame3 = bpm.fetch_page(p3).unwrap().frame_id();
    assert_eq!(frame3, frame1);
    assert_eq!(bpm.get_pin_count(p1), None);

    bpm.unpin_page(p2, false).unwrap();
    bpm.unpin_page(p3, false).unwrap();
    assert!(bpm.check_all_unpinned());
}

#[test]
fn test_pool_capacity_with_guards() {
    let (bpm, _temp) = create_bpm(5);

    let guards: Vec<_> = (0..5).map(|_| bpm.new_page().unwrap()).collect();
    assert_eq!(bpm.free_frame_count(), 0);
    assert!(matches!(bpm.new_page(), Err(KeystoneError::CacheExhausted)));

    let ids: Vec<PageId> = guards.iter().map(|g| g.page_id()).collect();
    drop(guards);

    // All five are now evictable, so new pages can push them out.
    for _ in 0..5 {
        bpm.new_page().unwrap();
    }
    for page_id in ids {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.page_id(), page_id);
    }
    assert!(bpm.check_all_unpinned());
}

#[test]
fn test_pin_counts_are_symmetric() {
    let (bpm, _temp) = create_bpm(4);
    let page_id = bpm.new_page().unwrap().page_id();

    for expected in 1..=3 {
        bpm.fetch_page(page_id).unwrap();
        assert_eq!(bpm.get_pin_count(page_id), Some(expected));
    }
    for expected in (0..3).rev() {
        assert!(bpm.unpin_page(page_id, false).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), Some(expected));
    }

    // A page that is not pinned cannot be unpinned again.
    assert!(!bpm.unpin_page(page_id, false).unwrap());
    assert!(matches!(
        bpm.unpin_page(PageId::new(999), false),
        Err(KeystoneError::PageNotFound(_))
    ));
}

#[test]
fn test_dirty_flag_is_sticky() {
    let (bpm, _temp) = create_bpm(4);
    let page_id = bpm.new_page().unwrap().page_id();
    bpm.flush_page(page_id).unwrap();
    assert_eq!(bpm.is_dirty(page_id), Some(false));

    bpm.fetch_page(page_id).unwrap();
    bpm.fetch_page(page_id).unwrap();
    bpm.unpin_page(page_id, true).unwrap();
    bpm.unpin_page(page_id, false).unwrap();
    assert_eq!(bpm.is_dirty(page_id), Some(true));

    assert!(bpm.flush_page(page_id).unwrap());
    assert_eq!(bpm.is_dirty(page_id), Some(false));
    assert!(!bpm.flush_page(PageId::new(777)).unwrap());
}

#[test]
fn test_buffer_pool_eviction_writes_back() {
    let (bpm, _temp) = create_bpm(3);

    let mut ids = Vec::new();
    for i in 0..10u8 {
        let mut guard = bpm.new_page().unwrap();
        guard.data_mut()[0] = i;
        guard.data_mut()[PAGE_TAIL] = i.wrapping_mul(7);
        ids.push(guard.page_id());
    }

    let reads_before = bpm.disk_manager().get_num_reads();
    for (i, page_id) in ids.iter().enumerate() {
        let guard = bpm.fetch_page_read(*page_id).unwrap();
        assert_eq!(guard.data()[0], i as u8);
        assert_eq!(guard.data()[PAGE_TAIL], (i as u8).wrapping_mul(7));
    }
    assert!(bpm.disk_manager().get_num_reads() > reads_before);
}

const PAGE_TAIL: usize = keystone::common::PAGE_SIZE - 1;

#[test]
fn test_delete_page() {
    let (bpm, _temp) = create_bpm(4);
    let page_id = bpm.new_page().unwrap().page_id();

    let guard = bpm.fetch_page_read(page_id).unwrap();
    assert!(!bpm.delete_page(page_id).unwrap());
    drop(guard);

    assert!(bpm.delete_page(page_id).unwrap());
    assert_eq!(bpm.get_pin_count(page_id), None);
    assert!(bpm.is_page_free(page_id).unwrap());
    assert_eq!(bpm.free_frame_count(), 4);

    // The freed id is handed out again.
    assert_eq!(bpm.new_page().unwrap().page_id(), page_id);
}

#[test]
fn test_buffer_pool_persistence() {
    init_logging();
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();
    let test_data = b"Persistence test data";

    let page_id = {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, dm);

        let mut guard = bpm.new_page().unwrap();
        guard.data_mut()[..test_data.len()].copy_from_slice(test_data);
        let page_id = guard.page_id();
        drop(guard);

        bpm.flush_all_pages().unwrap();
        page_id
    };

    let dm = Arc::new(DiskManager::new(&path).unwrap());
    let bpm = BufferPoolManager::new(10, dm);
    assert!(!bpm.is_page_free(page_id).unwrap());
    let guard = bpm.fetch_page_read(page_id).unwrap();
    assert_eq!(&guard.data()[..test_data.len()], test_data);
}

#[test]
fn test_buffer_pool_concurrent_access() {
    let (bpm, _temp) = create_bpm(16);
    let bpm = Arc::new(bpm);

    let ids: Vec<PageId> = (0..8).map(|_| bpm.new_page().unwrap().page_id()).collect();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let bpm = Arc::clone(&bpm);
            let ids = ids.clone();
            thread::spawn(move || {
                for round in 0..100 {
                    let page_id = ids[(t + round) % ids.len()];
                    let mut guard = bpm.fetch_page_write(page_id).unwrap();
                    let counter = u32::from_le_bytes(guard.data()[..4].try_into().unwrap());
                    guard.data_mut()[..4].copy_from_slice(&(counter + 1).to_le_bytes());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let total: u32 = ids
        .iter()
        .map(|&page_id| {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            u32::from_le_bytes(guard.data()[..4].try_into().unwrap())
        })
        .sum();
    assert_eq!(total, 800);
    assert!(bpm.check_all_unpinned());
}

#[test]
fn test_concurrent_eviction_pressure() {
    let (bpm, _temp) = create_bpm(8);
    let bpm = Arc::new(bpm);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                let mut mine = Vec::new();
                for i in 0..20u8 {
                    let mut guard = loop {
                        match bpm.new_page() {
                            Ok(guard) => break guard,
                            Err(KeystoneError::CacheExhausted) => thread::yield_now(),
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    };
                    guard.data_mut()[0] = t;
                    guard.data_mut()[1] = i;
                    mine.push(guard.page_id());
                }
                for (i, page_id) in mine.into_iter().enumerate() {
                    let guard = loop {
                        match bpm.fetch_page_read(page_id) {
                            Ok(guard) => break guard,
                            Err(KeystoneError::CacheExhausted) => thread::yield_now(),
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    };
                    assert_eq!(guard.data()[0], t);
                    assert_eq!(guard.data()[1], i as u8);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(bpm.check_all_unpinned());
}
