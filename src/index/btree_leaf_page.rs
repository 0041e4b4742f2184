use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};

use crate::common::{PageId, RecordId, INVALID_PAGE_ID, PAGE_SIZE};

use super::btree_page::{BTreePage, BTreePageKind, COMMON_HEADER_SIZE};
use super::KeyManager;

const NEXT_PAGE_OFFSET: usize = COMMON_HEADER_SIZE;
pub(crate) const LEAF_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 4;

/// Leaf node: sorted `(key, RecordId)` pairs and a link to the next leaf.
///
/// Pairs are packed right after the header, `key_size + 6` bytes each.
pub struct BTreeLeafPage<B> {
    page: BTreePage<B>,
}

impl<B> Deref for BTreeLeafPage<B> {
    type Target = BTreePage<B>;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}

impl<B> DerefMut for BTreeLeafPage<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.page
    }
}

impl<B: AsRef<[u8]>> BTreeLeafPage<B> {
    pub fn new(data: B) -> Self {
        Self {
            page: BTreePage::new(data),
        }
    }

    /// Number of pairs a page can physically hold for `key_size`.
    pub fn capacity(key_size: usize) -> usize {
        (PAGE_SIZE - LEAF_HEADER_SIZE) / (key_size + RecordId::ENCODED_SIZE)
    }

    pub fn next_page_id(&self) -> PageId {
        PageId::new(self.read_u32(NEXT_PAGE_OFFSET))
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        let offset = self.pair_offset(index);
        &self.bytes()[offset..offset + self.key_size()]
    }

    pub fn value_at(&self, index: usize) -> RecordId {
        let offset = self.pair_offset(index) + self.key_size();
        RecordId::decode(&self.bytes()[offset..offset + RecordId::ENCODED_SIZE])
    }

    /// Index of the first key not less than `key`.
    pub fn lower_bound<K: KeyManager + ?Sized>(&self, key: &[u8], km: &K) -> usize {
        let (mut low, mut high) = (0, self.size());
        while low < high {
            let mid = low + (high - low) / 2;
            if km.compare(self.key_at(mid), key) == Ordering::Less {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Exact-match lookup.
    pub fn lookup<K: KeyManager + ?Sized>(&self, key: &[u8], km: &K) -> Option<RecordId> {
        let index = self.lower_bound(key, km);
        (index < self.size() && km.compare(self.key_at(index), key) == Ordering::Equal)
            .then(|| self.value_at(index))
    }

    fn pair_size(&self) -> usize {
        self.key_size() + RecordId::ENCODED_SIZE
    }

    fn pair_offset(&self, index: usize) -> usize {
        LEAF_HEADER_SIZE + index * self.pair_size()
    }

    /// Raw bytes of pairs `from..to`.
    fn pairs(&self, from: usize, to: usize) -> &[u8] {
        &self.bytes()[self.pair_offset(from)..self.pair_offset(to)]
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BTreeLeafPage<B> {
    pub fn init(&mut self, page_id: PageId, parent_page_id: PageId, max_size: usize, key_size: usize) {
        self.page
            .init_header(BTreePageKind::Leaf, page_id, parent_page_id, max_size, key_size);
        self.set_next_page_id(INVALID_PAGE_ID);
    }

    pub fn set_next_page_id(&mut self, next_page_id: PageId) {
        self.write_u32(NEXT_PAGE_OFFSET, next_page_id.as_u32());
    }

    /// Inserts keeping keys sorted. Returns the new size, or `None` if the
    /// key is already present.
    pub fn insert<K: KeyManager + ?Sized>(
        &mut self,
        key: &[u8],
        value: RecordId,
        km: &K,
    ) -> Option<usize> {
        let size = self.size();
        let index = self.lower_bound(key, km);
        if index < size && km.compare(self.key_at(index), key) == Ordering::Equal {
            return None;
        }

        let (start, end) = (self.pair_offset(index), self.pair_offset(size));
        let pair_size = self.pair_size();
        self.bytes_mut().copy_within(start..end, start + pair_size);
        self.write_pair(index, key, value);
        self.set_size(size + 1);
        Some(size + 1)
    }

    /// Removes `key`. Returns false if it is absent.
    pub fn remove<K: KeyManager + ?Sized>(&mut self, key: &[u8], km: &K) -> bool {
        let index = self.lower_bound(key, km);
        if index >= self.size() || km.compare(self.key_at(index), key) != Ordering::Equal {
            return false;
        }
        self.remove_at(index);
        true
    }

    fn remove_at(&mut self, index: usize) {
        let size = self.size();
        let (start, end) = (self.pair_offset(index + 1), self.pair_offset(size));
        let dest = self.pair_offset(index);
        self.bytes_mut().copy_within(start..end, dest);
        self.set_size(size - 1);
    }

    fn write_pair(&mut self, index: usize, key: &[u8], value: RecordId) {
        let offset = self.pair_offset(index);
        let key_size = self.key_size();
        let bytes = self.bytes_mut();
        bytes[offset..offset + key_size].copy_from_slice(&key[..key_size]);
        value.encode(&mut bytes[offset + key_size..offset + key_size + RecordId::ENCODED_SIZE]);
    }

    fn append_pairs(&mut self, raw: &[u8]) {
        let size = self.size();
        let offset = self.pair_offset(size);
        self.bytes_mut()[offset..offset + raw.len()].copy_from_slice(raw);
        let added = raw.len() / self.pair_size();
        self.set_size(size + added);
    }

    fn prepend_pair(&mut self, raw: &[u8]) {
        let size = self.size();
        let end = self.pair_offset(size);
        let pair_size = self.pair_size();
        let start = LEAF_HEADER_SIZE;
        let bytes = self.bytes_mut();
        bytes.copy_within(start..end, start + pair_size);
        bytes[start..start + pair_size].copy_from_slice(raw);
        self.set_size(size + 1);
    }

    /// Splits an overflowing leaf: this page keeps the first `min_size`
    /// pairs and the rest move to the empty `recipient`, which is linked in
    /// right after this page.
    pub fn move_half_to<R: AsRef<[u8]> + AsMut<[u8]>>(&mut self, recipient: &mut BTreeLeafPage<R>) {
        let size = self.size();
        let keep = self.min_size();
        recipient.append_pairs(self.pairs(keep, size));
        self.set_size(keep);

        recipient.set_next_page_id(self.next_page_id());
        self.set_next_page_id(recipient.page_id());
    }

    /// Appends every pair to `recipient`, the left neighbour, and hands over
    /// the sibling link.
    pub fn move_all_to<R: AsRef<[u8]> + AsMut<[u8]>>(&mut self, recipient: &mut BTreeLeafPage<R>) {
        let size = self.size();
        recipient.append_pairs(self.pairs(0, size));
        recipient.set_next_page_id(self.next_page_id());
        self.set_size(0);
    }

    /// Moves the first pair to the end of `recipient`, the left neighbour.
    pub fn move_first_to_end_of<R: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut BTreeLeafPage<R>,
    ) {
        recipient.append_pairs(self.pairs(0, 1));
        self.remove_at(0);
    }

    /// Moves the last pair to the front of `recipient`, the right neighbour.
    pub fn move_last_to_front_of<R: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut BTreeLeafPage<R>,
    ) {
        let last = self.size() - 1;
        recipient.prepend_pair(self.pairs(last, last + 1));
        self.set_size(last);
    }
}
