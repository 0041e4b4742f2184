use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};

use crate::common::{PageId, PAGE_SIZE};

use super::btree_page::{BTreePage, BTreePageKind, COMMON_HEADER_SIZE};
use super::KeyManager;

pub(crate) const INTERNAL_HEADER_SIZE: usize = COMMON_HEADER_SIZE;
const CHILD_SIZE: usize = 4;

/// Internal node: `size` child pointers separated by `size - 1` keys.
///
/// Entry `i` is `(key_i, child_i)`. `key_0` is unused; child `i` covers keys
/// in `[key_i, key_{i+1})`.
pub struct BTreeInternalPage<B> {
    page: BTreePage<B>,
}

impl<B> Deref for BTreeInternalPage<B> {
    type Target = BTreePage<B>;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}

impl<B> DerefMut for BTreeInternalPage<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.page
    }
}

impl<B: AsRef<[u8]>> BTreeInternalPage<B> {
    pub fn new(data: B) -> Self {
        Self {
            page: BTreePage::new(data),
        }
    }

    /// Number of children a page can physically hold for `key_size`.
    pub fn capacity(key_size: usize) -> usize {
        (PAGE_SIZE - INTERNAL_HEADER_SIZE) / (key_size + CHILD_SIZE)
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        let offset = self.entry_offset(index);
        &self.bytes()[offset..offset + self.key_size()]
    }

    pub fn value_at(&self, index: usize) -> PageId {
        PageId::new(self.read_u32(self.entry_offset(index) + self.key_size()))
    }

    /// Position of `child` among the children.
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.value_at(i) == child)
    }

    /// Child whose range contains `key`: the one after the greatest
    /// separator not exceeding `key`.
    pub fn lookup<K: KeyManager + ?Sized>(&self, key: &[u8], km: &K) -> PageId {
        // First separator greater than `key`, searched over 1..size.
        let (mut low, mut high) = (1, self.size());
        while low < high {
            let mid = low + (high - low) / 2;
            if km.compare(self.key_at(mid), key) == Ordering::Greater {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        self.value_at(low - 1)
    }

    fn entry_size(&self) -> usize {
        self.key_size() + CHILD_SIZE
    }

    fn entry_offset(&self, index: usize) -> usize {
        INTERNAL_HEADER_SIZE + index * self.entry_size()
    }

    fn entries(&self, from: usize, to: usize) -> &[u8] {
        &self.bytes()[self.entry_offset(from)..self.entry_offset(to)]
    }

    fn children(&self) -> Vec<PageId> {
        (0..self.size()).map(|i| self.value_at(i)).collect()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BTreeInternalPage<B> {
    pub fn init(&mut self, page_id: PageId, parent_page_id: PageId, max_size: usize, key_size: usize) {
        self.page.init_header(
            BTreePageKind::Internal,
            page_id,
            parent_page_id,
            max_size,
            key_size,
        );
    }

    pub fn set_key_at(&mut self, index: usize, key: &[u8]) {
        let offset = self.entry_offset(index);
        let key_size = self.key_size();
        self.bytes_mut()[offset..offset + key_size].copy_from_slice(&key[..key_size]);
    }

    pub fn set_value_at(&mut self, index: usize, child: PageId) {
        let offset = self.entry_offset(index) + self.key_size();
        self.write_u32(offset, child.as_u32());
    }

    /// Turns an empty page into a root with two children.
    pub fn populate_new_root(&mut self, old_child: PageId, key: &[u8], new_child: PageId) {
        self.set_value_at(0, old_child);
        self.set_key_at(1, key);
        self.set_value_at(1, new_child);
        self.set_size(2);
    }

    /// Inserts `(key, new_child)` right after `old_child`. Returns the new
    /// size, or `None` if `old_child` is not a child of this page.
    pub fn insert_node_after(&mut self, old_child: PageId, key: &[u8], new_child: PageId) -> Option<usize> {
        let index = self.value_index(old_child)? + 1;
        let size = self.size();

        let (start, end) = (self.entry_offset(index), self.entry_offset(size));
        let entry_size = self.entry_size();
        self.bytes_mut().copy_within(start..end, start + entry_size);
        self.set_key_at(index, key);
        self.set_value_at(index, new_child);
        self.set_size(size + 1);
        Some(size + 1)
    }

    pub fn remove_at(&mut self, index: usize) {
        let size = self.size();
        let (start, end) = (self.entry_offset(index + 1), self.entry_offset(size));
        let dest = self.entry_offset(index);
        self.bytes_mut().copy_within(start..end, dest);
        self.set_size(size - 1);
    }

    fn append_entries(&mut self, raw: &[u8]) {
        let size = self.size();
        let offset = self.entry_offset(size);
        self.bytes_mut()[offset..offset + raw.len()].copy_from_slice(raw);
        let added = raw.len() / self.entry_size();
        self.set_size(size + added);
    }

    fn prepend_entry(&mut self, raw: &[u8]) {
        let size = self.size();
        let (start, end) = (self.entry_offset(0), self.entry_offset(size));
        let entry_size = self.entry_size();
        let bytes = self.bytes_mut();
        bytes.copy_within(start..end, start + entry_size);
        bytes[start..start + entry_size].copy_from_slice(raw);
        self.set_size(size + 1);
    }

    /// Splits an overflowing page: this page keeps the first `min_size`
    /// children and the rest move to the empty `recipient`. The separator to
    /// push up is left in `recipient.key_at(0)`.
    ///
    /// Returns the moved children, whose parent pointers the caller updates.
    pub fn move_half_to<R: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut BTreeInternalPage<R>,
    ) -> Vec<PageId> {
        let size = self.size();
        let keep = self.min_size();
        recipient.append_entries(self.entries(keep, size));
        self.set_size(keep);
        recipient.children()
    }

    /// Merges every entry into `recipient`, the left neighbour, pulling the
    /// parent separator `middle_key` down in front of them.
    ///
    /// Returns the moved children.
    pub fn move_all_to<R: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut BTreeInternalPage<R>,
        middle_key: &[u8],
    ) -> Vec<PageId> {
        self.set_key_at(0, middle_key);
        let moved = self.children();
        let size = self.size();
        recipient.append_entries(self.entries(0, size));
        self.set_size(0);
        moved
    }

    /// Moves the first child to the end of `recipient`, the left neighbour.
    /// `middle_key` is the parent separator between the two pages.
    ///
    /// Returns the moved child and the separator that replaces `middle_key`.
    pub fn move_first_to_end_of<R: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut BTreeInternalPage<R>,
        middle_key: &[u8],
    ) -> (PageId, Vec<u8>) {
        let child = self.value_at(0);
        let new_separator = self.key_at(1).to_vec();

        self.set_key_at(0, middle_key);
        recipient.append_entries(self.entries(0, 1));
        self.remove_at(0);
        (child, new_separator)
    }

    /// Moves the last child to the front of `recipient`, the right
    /// neighbour. `middle_key` is the parent separator between the two pages.
    ///
    /// Returns the moved child and the separator that replaces `middle_key`.
    pub fn move_last_to_front_of<R: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut BTreeInternalPage<R>,
        middle_key: &[u8],
    ) -> (PageId, Vec<u8>) {
        let last = self.size() - 1;
        let child = self.value_at(last);
        let new_separator = self.key_at(last).to_vec();

        recipient.set_key_at(0, middle_key);
        recipient.prepend_entry(self.entries(last, last + 1));
        self.set_size(last);
        (child, new_separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::INVALID_PAGE_ID;
    use crate::index::IntegerKeyManager;

    fn key(k: i64) -> Vec<u8> {
        IntegerKeyManager.to_bytes(&k)
    }

    fn keys_of<B: AsRef<[u8]>>(page: &BTreeInternalPage<B>) -> Vec<i64> {
        (1..page.size())
            .map(|i| IntegerKeyManager.deserialize(page.key_at(i)))
            .collect()
    }

    fn children_of<B: AsRef<[u8]>>(page: &BTreeInternalPage<B>) -> Vec<u32> {
        (0..page.size()).map(|i| page.value_at(i).as_u32()).collect()
    }

    /// Children 100, 101, ... separated by keys 10, 20, ...
    fn internal_with(data: &mut [u8], page_id: u32, children: u32) -> BTreeInternalPage<&mut [u8]> {
        let mut page = BTreeInternalPage::new(data);
        page.init(PageId::new(page_id), INVALID_PAGE_ID, 4, 8);
        page.populate_new_root(PageId::new(100), &key(10), PageId::new(101));
        for c in 2..children {
            page.insert_node_after(
                PageId::new(100 + c - 1),
                &key(10 * c as i64),
                PageId::new(100 + c),
            );
        }
        page
    }

    #[test]
    fn test_internal_lookup() {
        let mut data = [0u8; PAGE_SIZE];
        let page = internal_with(&mut data, 1, 4);
        let km = IntegerKeyManager;

        assert_eq!(keys_of(&page), vec![10, 20, 30]);
        assert_eq!(page.lookup(&key(-1), &km), PageId::new(100));
        assert_eq!(page.lookup(&key(10), &km), PageId::new(101));
        assert_eq!(page.lookup(&key(15), &km), PageId::new(101));
        assert_eq!(page.lookup(&key(30), &km), PageId::new(103));
        assert_eq!(page.lookup(&key(1_000), &km), PageId::new(103));
        assert_eq!(page.value_index(PageId::new(102)), Some(2));
        assert_eq!(page.value_index(PageId::new(7)), None);
    }

    #[test]
    fn test_internal_insert_after_and_remove() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = internal_with(&mut data, 1, 3);

        assert_eq!(
            page.insert_node_after(PageId::new(100), &key(5), PageId::new(200)),
            Some(4)
        );
        assert_eq!(children_of(&page), vec![100, 200, 101, 102]);
        assert_eq!(keys_of(&page), vec![5, 10, 20]);
        assert_eq!(page.insert_node_after(PageId::new(7), &key(1), PageId::new(8)), None);

        page.remove_at(1);
        assert_eq!(children_of(&page), vec![100, 101, 102]);
        assert_eq!(keys_of(&page), vec![10, 20]);
    }

    #[test]
    fn test_internal_split() {
        let mut left_data = [0u8; PAGE_SIZE];
        let mut right_data = [0u8; PAGE_SIZE];
        let mut left = internal_with(&mut left_data, 1, 5);
        let mut right = BTreeInternalPage::new(&mut right_data[..]);
        right.init(PageId::new(2), INVALID_PAGE_ID, 4, 8);

        let moved = left.move_half_to(&mut right);

        assert_eq!(children_of(&left), vec![100, 101]);
        assert_eq!(keys_of(&left), vec![10]);
        assert_eq!(children_of(&right), vec![102, 103, 104]);
        assert_eq!(IntegerKeyManager.deserialize(right.key_at(0)), 20);
        assert_eq!(keys_of(&right), vec![30, 40]);
        assert_eq!(
            moved,
            vec![PageId::new(102), PageId::new(103), PageId::new(104)]
        );
    }

    #[test]
    fn test_internal_redistribute_and_merge() {
        let mut left_data = [0u8; PAGE_SIZE];
        let mut right_data = [0u8; PAGE_SIZE];
        let mut left = internal_with(&mut left_data, 1, 3);
        let mut right = BTreeInternalPage::new(&mut right_data[..]);
        right.init(PageId::new(2), INVALID_PAGE_ID, 4, 8);
        right.populate_new_root(PageId::new(110), &key(60), PageId::new(111));

        // Separator between the two pages in their parent is 50.
        let (child, separator) = left.move_last_to_front_of(&mut right, &key(50));
        assert_eq!(child, PageId::new(102));
        assert_eq!(IntegerKeyManager.deserialize(&separator), 20);
        assert_eq!(children_of(&right), vec![102, 110, 111]);
        assert_eq!(keys_of(&right), vec![50, 60]);

        let (child, separator) = right.move_first_to_end_of(&mut left, &separator);
        assert_eq!(child, PageId::new(102));
        assert_eq!(IntegerKeyManager.deserialize(&separator), 50);
        assert_eq!(children_of(&left), vec![100, 101, 102]);
        assert_eq!(keys_of(&left), vec![10, 20]);
        assert_eq!(children_of(&right), vec![110, 111]);
        assert_eq!(keys_of(&right), vec![60]);

        let moved = right.move_all_to(&mut left, &separator);
        assert_eq!(moved, vec![PageId::new(110), PageId::new(111)]);
        assert_eq!(children_of(&left), vec![100, 101, 102, 110, 111]);
        assert_eq!(keys_of(&left), vec![10, 20, 50, 60]);
        assert_eq!(right.size(), 0);
    }
}
