use crate::common::FrameId;

/// Eviction policy consulted by the buffer pool when no free frame is left.
///
/// A replacer only ever tracks frames whose pin count is zero. The pool calls
/// `unpin` when a frame becomes evictable and `pin` when it stops being so;
/// `victim` picks and forgets one tracked frame.
pub trait Replacer: Send {
    /// Removes and returns the frame to evict next, or `None` if nothing is
    /// evictable.
    fn victim(&mut self) -> Option<FrameId>;

    /// Stops tracking `frame_id`. No-op if it is not tracked.
    fn pin(&mut self, frame_id: FrameId);

    /// Starts tracking `frame_id` as evictable. No-op if it is already
    /// tracked.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}
