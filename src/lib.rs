//! Keystone - the storage core of a disk-oriented database
//!
//! This crate provides a page cache over a single database file and a
//! concurrent B+ tree index built on top of it.
//!
//! # Architecture
//!
//! The system is organized into three layers:
//!
//! - **Storage Layer** (`storage`): Handles disk I/O and page organization
//!   - `DiskManager`: Reads and writes pages, allocates them through on-disk bitmaps
//!   - `DiskScheduler`: Background worker that serializes disk requests
//!   - `BitmapPage`: Allocation bitmap for one extent of data pages
//!   - `IndexRootsPage`: Durable directory from index id to root page
//!
//! - **Buffer Pool** (`buffer`): Memory management for database pages
//!   - `BufferPoolManager`: Fetches pages from disk and caches them in memory
//!   - `LruReplacer`: Least-recently-unpinned eviction policy
//!   - `FrameHeader`: Per-frame metadata and data storage
//!   - `ReadPageGuard`/`WritePageGuard`: RAII guards for thread-safe page access
//!
//! - **Index** (`index`): Disk-resident B+ tree with latch crabbing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keystone::buffer::BufferPoolManager;
//! use keystone::common::{IndexId, PageId, RecordId, SlotId};
//! use keystone::index::{BTreeConfig, BTreeIndex, IntegerKeyManager};
//! use keystone::storage::disk::DiskManager;
//!
//! // Create a disk manager for a database file
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//!
//! // Create a buffer pool with 64 frames
//! let bpm = Arc::new(BufferPoolManager::new(64, disk_manager));
//!
//! // Open (or create) index 1 over i64 keys
//! let key_manager = Arc::new(IntegerKeyManager);
//! let config = BTreeConfig::for_key_size(8);
//! let index = BTreeIndex::open(IndexId(1), Arc::clone(&bpm), key_manager, config).unwrap();
//!
//! index.insert(&42, RecordId::new(PageId::new(7), SlotId(3))).unwrap();
//! assert!(index.get_value(&42).unwrap().is_some());
//!
//! // Flush changes to disk
//! bpm.flush_all_pages().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{IndexId, KeystoneError, PageId, RecordId, Result, SlotId};
