use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, trace};

use crate::common::{KeystoneError, PageId, Result, PAGE_SIZE};

use super::DiskManager;

/// Owned page buffer passed to and from the worker.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// A disk I/O request. Every request carries the channel its outcome is sent
/// back on.
pub enum DiskRequest {
    Read {
        page_id: PageId,
        reply: Sender<Result<PageBuf>>,
    },
    Write {
        page_id: PageId,
        data: PageBuf,
        reply: Sender<Result<()>>,
    },
}

/// Serializes all page I/O through a single background worker thread.
pub struct DiskScheduler {
    disk_manager: Arc<DiskManager>,
    /// Closed on drop to stop the worker
    request_sender: Option<Sender<DiskRequest>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Queue depth before `schedule` blocks.
    const QUEUE_CAPACITY: usize = 128;

    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = bounded::<DiskRequest>(Self::QUEUE_CAPACITY);

        let dm = Arc::clone(&disk_manager);
        let worker_handle = thread::spawn(move || Self::run_worker(dm, receiver));

        Self {
            disk_manager,
            request_sender: Some(sender),
            worker_handle: Some(worker_handle),
        }
    }

    /// Queues a request for the worker.
    pub fn schedule(&self, request: DiskRequest) -> Result<()> {
        let sender = self
            .request_sender
            .as_ref()
            .ok_or_else(|| KeystoneError::DiskScheduler("scheduler is shut down".into()))?;
        sender
            .send(request)
            .map_err(|e| KeystoneError::DiskScheduler(format!("failed to schedule request: {}", e)))
    }

    /// Reads `page_id` and blocks until the data is available.
    pub fn schedule_read_sync(&self, page_id: PageId) -> Result<PageBuf> {
        let (reply, rx) = bounded(1);
        self.schedule(DiskRequest::Read { page_id, reply })?;
        rx.recv().map_err(|e| {
            KeystoneError::DiskScheduler(format!("failed to receive completion: {}", e))
        })?
    }

    /// Writes `data` to `page_id` and blocks until the write has completed.
    pub fn schedule_write_sync(&self, page_id: PageId, data: PageBuf) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.schedule(DiskRequest::Write {
            page_id,
            data,
            reply,
        })?;
        rx.recv().map_err(|e| {
            KeystoneError::DiskScheduler(format!("failed to receive completion: {}", e))
        })?
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Processes requests until every sender is gone.
    fn run_worker(disk_manager: Arc<DiskManager>, receiver: Receiver<DiskRequest>) {
        for request in receiver.iter() {
            Self::process_request(&disk_manager, request);
        }
        debug!("disk scheduler worker exiting");
    }

    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read { page_id, reply } => {
                trace!("disk read {}", page_id);
                let mut data = Box::new([0u8; PAGE_SIZE]);
                let result = disk_manager
                    .read_page(page_id, &mut data[..])
                    .map(|_| data);
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
            DiskRequest::Write {
                page_id,
                data,
                reply,
            } => {
                trace!("disk write {}", page_id);
                let _ = reply.send(disk_manager.write_page(page_id, &data[..]));
            }
        }
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.request_sender.take();

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_scheduler() -> (DiskScheduler, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        (DiskScheduler::new(dm), temp_file)
    }

    #[test]
    fn test_disk_scheduler_read_write() {
        let (scheduler, _temp) = create_scheduler();
        let page_id = scheduler.disk_manager().allocate_page().unwrap();

        let mut data = Box::new([0u8; PAGE_SIZE]);
        data[0] = 42;
        data[100] = 255;
        scheduler.schedule_write_sync(page_id, data).unwrap();

        let read = scheduler.schedule_read_sync(page_id).unwrap();
        assert_eq!(read[0], 42);
        assert_eq!(read[100], 255);
    }

    #[test]
    fn test_disk_scheduler_from_many_threads() {
        let (scheduler, _temp) = create_scheduler();
        let scheduler = Arc::new(scheduler);
        let page_ids: Vec<_> = (0..8)
            .map(|_| scheduler.disk_manager().allocate_page().unwrap())
            .collect();

        let handles: Vec<_> = page_ids
            .iter()
            .enumerate()
            .map(|(i, &page_id)| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    scheduler
                        .schedule_write_sync(page_id, Box::new([i as u8; PAGE_SIZE]))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for (i, &page_id) in page_ids.iter().enumerate() {
            let read = scheduler.schedule_read_sync(page_id).unwrap();
            assert!(read.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn test_disk_scheduler_propagates_errors() {
        let (scheduler, _temp) = create_scheduler();
        let result = scheduler.schedule_read_sync(crate::common::INVALID_PAGE_ID);
        assert!(matches!(result, Err(KeystoneError::InvalidPageId(_))));
    }
}
