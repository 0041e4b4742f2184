use crate::common::FrameId;

use super::Replacer;

const NIL: usize = usize::MAX;

/// Least-recently-unpinned replacement policy.
///
/// Evictable frames form a doubly linked list threaded through per-frame
/// slots, most recently unpinned at the head. The victim is taken from the
/// tail, so every operation is O(1).
pub struct LruReplacer {
    /// Maximum number of frames the replacer can track
    capacity: usize,
    prev: Vec<usize>,
    next: Vec<usize>,
    tracked: Vec<bool>,
    head: usize,
    tail: usize,
    len: usize,
}

impl LruReplacer {
    /// Creates a replacer able to track frames `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            prev: vec![NIL; capacity],
            next: vec![NIL; capacity],
            tracked: vec![false; capacity],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    fn push_front(&mut self, slot: usize) {
        self.prev[slot] = NIL;
        self.next[slot] = self.head;
        if self.head != NIL {
            self.prev[self.head] = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
        self.tracked[slot] = true;
        self.len += 1;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.prev[slot], self.next[slot]);
        if prev != NIL {
            self.next[prev] = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.prev[next] = prev;
        } else {
            self.tail = prev;
        }
        self.prev[slot] = NIL;
        self.next[slot] = NIL;
        self.tracked[slot] = false;
        self.len -= 1;
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.unlink(slot);
        Some(FrameId::new(slot as u32))
    }

    fn pin(&mut self, frame_id: FrameId) {
        let slot = frame_id.as_usize();
        if slot < self.capacity && self.tracked[slot] {
            self.unlink(slot);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        let slot = frame_id.as_usize();
        if slot >= self.capacity || self.tracked[slot] || self.len >= self.capacity {
            return;
        }
        self.push_front(slot);
    }

    fn size(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32) -> FrameId {
        FrameId::new(id)
    }

    #[test]
    fn test_lru_replacer_victim_order() {
        let mut replacer = LruReplacer::new(7);

        for id in 1..=6 {
            replacer.unpin(frame(id));
        }
        // Unpinning a tracked frame does not refresh it.
        replacer.unpin(frame(1));
        assert_eq!(replacer.size(), 6);

        assert_eq!(replacer.victim(), Some(frame(1)));
        assert_eq!(replacer.victim(), Some(frame(2)));
        assert_eq!(replacer.victim(), Some(frame(3)));

        replacer.pin(frame(3));
        replacer.pin(frame(4));
        assert_eq!(replacer.size(), 2);

        replacer.unpin(frame(4));
        assert_eq!(replacer.victim(), Some(frame(5)));
        assert_eq!(replacer.victim(), Some(frame(6)));
        assert_eq!(replacer.victim(), Some(frame(4)));
        assert_eq!(replacer.victim(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_replacer_pin_untracked_is_noop() {
        let mut replacer = LruReplacer::new(3);
        replacer.pin(frame(0));
        replacer.pin(frame(10));
        assert_eq!(replacer.size(), 0);

        replacer.unpin(frame(2));
        replacer.pin(frame(2));
        replacer.pin(frame(2));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_lru_replacer_ignores_out_of_range_frames() {
        let mut replacer = LruReplacer::new(2);
        replacer.unpin(frame(2));
        replacer.unpin(frame(u32::MAX));
        assert_eq!(replacer.size(), 0);

        replacer.unpin(frame(0));
        replacer.unpin(frame(1));
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_lru_replacer_pin_middle() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpin(frame(0));
        replacer.unpin(frame(1));
        replacer.unpin(frame(2));

        replacer.pin(frame(1));
        assert_eq!(replacer.victim(), Some(frame(0)));
        assert_eq!(replacer.victim(), Some(frame(2)));
        assert_eq!(replacer.victim(), None);
    }
}
