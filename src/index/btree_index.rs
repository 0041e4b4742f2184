use std::cmp::Ordering;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{
    IndexId, KeystoneError, PageId, RecordId, Result, INDEX_ROOTS_PAGE_ID, INVALID_PAGE_ID,
};
use crate::storage::page::IndexRootsPage;

use super::btree_internal_page::BTreeInternalPage;
use super::btree_leaf_page::BTreeLeafPage;
use super::btree_page::{BTreePage, BTreePageKind};
use super::{BTreeIterator, KeyManager};

/// Node fan-out limits of a tree.
///
/// A node splits once it holds more than its max size; every node other than
/// the root keeps at least `ceil(max / 2)` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeConfig {
    pub leaf_max_size: usize,
    pub internal_max_size: usize,
}

impl BTreeConfig {
    pub fn new(leaf_max_size: usize, internal_max_size: usize) -> Self {
        Self {
            leaf_max_size,
            internal_max_size,
        }
    }

    /// Largest sizes that fit a page for `key_size`, leaving room for the
    /// entry that overflows a node right before it splits.
    pub fn for_key_size(key_size: usize) -> Self {
        Self {
            leaf_max_size: BTreeLeafPage::<&[u8]>::capacity(key_size).saturating_sub(1),
            internal_max_size: BTreeInternalPage::<&[u8]>::capacity(key_size).saturating_sub(1),
        }
    }

    /// Checks the limits against `key_size` and the page capacity.
    pub fn validate(&self, key_size: usize) -> Result<()> {
        if key_size == 0 {
            return Err(KeystoneError::InvalidConfig("key size must be positive".into()));
        }
        if self.leaf_max_size < 2 {
            return Err(KeystoneError::InvalidConfig(format!(
                "leaf max size {} is below 2",
                self.leaf_max_size
            )));
        }
        if self.internal_max_size < 3 {
            return Err(KeystoneError::InvalidConfig(format!(
                "internal max size {} is below 3",
                self.internal_max_size
            )));
        }
        let limits = Self::for_key_size(key_size);
        if self.leaf_max_size > limits.leaf_max_size
            || self.internal_max_size > limits.internal_max_size
        {
            return Err(KeystoneError::InvalidConfig(format!(
                "{:?} does not fit a page with {}-byte keys (limits {:?})",
                self, key_size, limits
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteOp {
    Insert,
    Remove,
}

/// Latches held by a writer on its way down the tree.
///
/// `path` holds the pages that may still be restructured, top-down. The
/// root latch stays held while the root itself might change.
struct WriteContext<'a> {
    root_lock: Option<RwLockWriteGuard<'a, PageId>>,
    path: Vec<WritePageGuard<'a>>,
}

impl WriteContext<'_> {
    /// Releases everything above the most recently latched page.
    fn release_ancestors(&mut self) {
        let current = self.path.pop();
        self.path.clear();
        self.root_lock = None;
        self.path.extend(current);
    }
}

/// Pages an insert latches before touching the leaf: fresh pages for every
/// split it may cause, and the index roots page when the root splits.
struct Reserved<'a> {
    pages: Vec<WritePageGuard<'a>>,
    roots: Option<WritePageGuard<'a>>,
}

/// How one underfull node gets fixed, with the pages involved already
/// latched.
enum Repair<'a> {
    /// The left sibling lends its last entry. For internal nodes
    /// `moved_child` is the child that changes parent.
    BorrowLeft {
        left: WritePageGuard<'a>,
        moved_child: Option<WritePageGuard<'a>>,
    },
    /// The right sibling lends its first entry.
    BorrowRight {
        right: WritePageGuard<'a>,
        moved_child: Option<WritePageGuard<'a>>,
    },
    /// The node folds into its left sibling.
    MergeIntoLeft { left: WritePageGuard<'a> },
    /// The right sibling folds into the node.
    MergeRight { right: WritePageGuard<'a> },
}

/// Everything a removal restructures, latched bottom-up before the leaf
/// loses its key. `repairs[0]` fixes the leaf.
struct RemovalPlan<'a> {
    repairs: Vec<Repair<'a>>,
    roots: Option<WritePageGuard<'a>>,
}

/// Disk-resident B+ tree mapping unique fixed-size keys to `RecordId`s.
///
/// Every node is a buffer pool page. Readers descend with shared latches,
/// letting go of each parent once its child is latched. Writers take the
/// root latch and exclusive page latches, and drop all held ancestors as
/// soon as the current node cannot split (insert) or underflow (remove).
///
/// The current root of each index is recorded in the index roots page so the
/// tree can be reopened.
pub struct BTreeIndex<K: KeyManager> {
    index_id: IndexId,
    bpm: Arc<BufferPoolManager>,
    key_manager: Arc<K>,
    config: BTreeConfig,
    root_page_id: RwLock<PageId>,
}

impl<K: KeyManager> BTreeIndex<K> {
    /// Opens index `index_id`, creating the index roots page on a fresh
    /// database. An index without a recorded root starts empty.
    pub fn open(
        index_id: IndexId,
        bpm: Arc<BufferPoolManager>,
        key_manager: Arc<K>,
        config: BTreeConfig,
    ) -> Result<Self> {
        config.validate(key_manager.key_size())?;
        let root_page_id = Self::load_root(&bpm, index_id)?;
        debug!("opened {} with root {}", index_id, root_page_id);

        Ok(Self {
            index_id,
            bpm,
            key_manager,
            config,
            root_page_id: RwLock::new(root_page_id),
        })
    }

    fn load_root(bpm: &BufferPoolManager, index_id: IndexId) -> Result<PageId> {
        if bpm.is_page_free(INDEX_ROOTS_PAGE_ID)? {
            let mut guard = bpm.new_page()?;
            let page_id = guard.page_id();
            if page_id != INDEX_ROOTS_PAGE_ID {
                drop(guard);
                bpm.delete_page(page_id)?;
                return Err(KeystoneError::CorruptPage(format!(
                    "index roots page {} is not allocated",
                    INDEX_ROOTS_PAGE_ID
                )));
            }
            IndexRootsPage::new().encode(guard.data_mut())?;
            return Ok(INVALID_PAGE_ID);
        }

        let guard = bpm.fetch_page_read(INDEX_ROOTS_PAGE_ID)?;
        if !IndexRootsPage::is_initialized(guard.data()) {
            return Err(KeystoneError::CorruptPage(format!(
                "{} does not hold an index roots page",
                INDEX_ROOTS_PAGE_ID
            )));
        }
        let roots = IndexRootsPage::decode(guard.data())?;
        Ok(roots.get_root(index_id).unwrap_or(INVALID_PAGE_ID))
    }

    /// Returns the index ID.
    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn config(&self) -> BTreeConfig {
        self.config
    }

    pub fn key_manager(&self) -> &Arc<K> {
        &self.key_manager
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    /// Returns the current root page, `INVALID_PAGE_ID` when empty.
    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K::Key) -> Result<Option<RecordId>> {
        let key = self.key_manager.to_bytes(key);
        let Some(guard) = self.find_leaf_read(Some(&key))? else {
            return Ok(None);
        };
        let leaf = BTreeLeafPage::new(guard.data());
        Ok(leaf.lookup(&key, &*self.key_manager))
    }

    /// Inserts a unique key. Returns `Ok(false)` and leaves the tree
    /// unchanged if the key already exists.
    pub fn insert(&self, key: &K::Key, value: RecordId) -> Result<bool> {
        let key = self.key_manager.to_bytes(key);
        let km = &*self.key_manager;
        let mut ctx = self.find_leaf_write(&key, WriteOp::Insert)?;

        if ctx.path.is_empty() {
            self.start_new_tree(&mut ctx, &key, value)?;
            return Ok(true);
        }

        if let Some(leaf_guard) = ctx.path.last() {
            if BTreeLeafPage::new(leaf_guard.data())
                .lookup(&key, km)
                .is_some()
            {
                return Ok(false);
            }
        }

        // Every page a split may need is allocated before anything changes.
        let mut spare = self.reserve_split_pages(&ctx)?;

        let mut leaf_guard = ctx.path.pop().ok_or_else(|| missing("leaf"))?;
        let size = BTreeLeafPage::new(leaf_guard.data_mut())
            .insert(&key, value, km)
            .ok_or_else(|| {
                KeystoneError::IndexCorrupted("key appeared during insert".into())
            })?;

        if size > BTreePage::new(leaf_guard.data()).max_size() {
            let mut sibling_guard = spare.pages.pop().ok_or_else(|| missing("spare page"))?;
            let sibling_id = sibling_guard.page_id();
            let separator = {
                let mut leaf = BTreeLeafPage::new(leaf_guard.data_mut());
                let mut sibling = BTreeLeafPage::new(sibling_guard.data_mut());
                sibling.init(
                    sibling_id,
                    leaf.parent_page_id(),
                    leaf.max_size(),
                    leaf.key_size(),
                );
                leaf.move_half_to(&mut sibling);
                sibling.key_at(0).to_vec()
            };
            debug!("split leaf {} into {}", leaf_guard.page_id(), sibling_id);
            self.insert_into_parent(&mut ctx, leaf_guard, separator, sibling_guard, &mut spare)?;
        }

        for guard in spare.pages.drain(..) {
            let page_id = guard.page_id();
            drop(guard);
            self.discard_page(page_id)?;
        }
        Ok(true)
    }

    /// Removes a key. Returns `Ok(false)` if it is not present.
    pub fn remove(&self, key: &K::Key) -> Result<bool> {
        let key = self.key_manager.to_bytes(key);
        let km = &*self.key_manager;
        let mut ctx = self.find_leaf_write(&key, WriteOp::Remove)?;

        let Some(leaf_guard) = ctx.path.last() else {
            return Ok(false);
        };
        if BTreeLeafPage::new(leaf_guard.data())
            .lookup(&key, km)
            .is_none()
        {
            return Ok(false);
        }

        // Siblings are latched first so a full pool fails the call cleanly.
        let plan = self.plan_removal(&ctx)?;

        let mut leaf_guard = ctx.path.pop().ok_or_else(|| missing("leaf"))?;
        BTreeLeafPage::new(leaf_guard.data_mut()).remove(&key, km);
        self.rebalance(&mut ctx, leaf_guard, plan)?;
        Ok(true)
    }

    /// Iterator over every entry in key order.
    pub fn begin(&self) -> Result<BTreeIterator<K>> {
        let page_id = self
            .find_leaf_read(None)?
            .map_or(INVALID_PAGE_ID, |guard| guard.page_id());
        Ok(self.iterator(page_id, 0, None))
    }

    /// Iterator starting at the first key not less than `key`.
    pub fn begin_at(&self, key: &K::Key) -> Result<BTreeIterator<K>> {
        let key = self.key_manager.to_bytes(key);
        self.seek(&key, None)
    }

    /// Iterator over keys in `[start, end]`.
    pub fn range_scan(&self, start: &K::Key, end: &K::Key) -> Result<BTreeIterator<K>> {
        let start = self.key_manager.to_bytes(start);
        let end = self.key_manager.to_bytes(end);
        self.seek(&start, Some(end))
    }

    fn seek(&self, key: &[u8], end_key: Option<Vec<u8>>) -> Result<BTreeIterator<K>> {
        let Some(guard) = self.find_leaf_read(Some(key))? else {
            return Ok(self.iterator(INVALID_PAGE_ID, 0, None));
        };
        let index = BTreeLeafPage::new(guard.data()).lower_bound(key, &*self.key_manager);
        Ok(self.iterator(guard.page_id(), index, end_key))
    }

    fn iterator(&self, page_id: PageId, index: usize, end_key: Option<Vec<u8>>) -> BTreeIterator<K> {
        BTreeIterator::new(
            Arc::clone(&self.bpm),
            Arc::clone(&self.key_manager),
            page_id,
            index,
            end_key,
        )
    }

    /// Frees every page of the tree and clears its root record.
    ///
    /// Fails with `PageInUse` if some page is pinned elsewhere, in which case
    /// part of the tree may already be gone.
    pub fn destroy(&self) -> Result<()> {
        let mut root = self.root_page_id.write();
        if *root == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut roots = self.bpm.fetch_page_write(INDEX_ROOTS_PAGE_ID)?;
        self.destroy_subtree(*root)?;
        self.update_root_record(&mut roots, INVALID_PAGE_ID)?;
        *root = INVALID_PAGE_ID;
        debug!("destroyed {}", self.index_id);
        Ok(())
    }

    fn destroy_subtree(&self, page_id: PageId) -> Result<()> {
        let children = {
            let guard = self.bpm.fetch_page_read(page_id)?;
            match BTreePage::new(guard.data()).kind()? {
                BTreePageKind::Leaf => Vec::new(),
                BTreePageKind::Internal => {
                    let node = BTreeInternalPage::new(guard.data());
                    (0..node.size()).map(|i| node.value_at(i)).collect()
                }
            }
        };
        for child in children {
            self.destroy_subtree(child)?;
        }
        if !self.bpm.delete_page(page_id)? {
            return Err(KeystoneError::PageInUse(page_id));
        }
        Ok(())
    }

    /// Debug check that the tree left no page pinned.
    pub fn check(&self) -> bool {
        self.bpm.check_all_unpinned()
    }

    /// Walks the whole tree checking its structural invariants and returns
    /// the number of keys. Meant for a quiescent tree.
    pub fn verify_integrity(&self) -> Result<usize> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(0);
        }

        let mut leaves = Vec::new();
        let count = self.verify_node(*root, INVALID_PAGE_ID, None, None, &mut leaves)?;

        let mut page_id = leaves[0];
        for (position, &expected) in leaves.iter().enumerate() {
            if page_id != expected {
                return Err(KeystoneError::IndexCorrupted(format!(
                    "leaf chain reaches {} at position {}, expected {}",
                    page_id, position, expected
                )));
            }
            let guard = self.bpm.fetch_page_read(page_id)?;
            page_id = BTreeLeafPage::new(guard.data()).next_page_id();
        }
        if page_id != INVALID_PAGE_ID {
            return Err(KeystoneError::IndexCorrupted(format!(
                "last leaf links to {}",
                page_id
            )));
        }
        Ok(count)
    }

    fn verify_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        leaves: &mut Vec<PageId>,
    ) -> Result<usize> {
        let km = &*self.key_manager;
        let guard = self.bpm.fetch_page_read(page_id)?;
        let page = BTreePage::new(guard.data());
        let kind = page.kind()?;

        let corrupted = |what: String| KeystoneError::IndexCorrupted(format!("{}: {}", page_id, what));
        if page.page_id() != page_id {
            return Err(corrupted(format!("header names {}", page.page_id())));
        }
        if page.parent_page_id() != expected_parent {
            return Err(corrupted(format!(
                "parent is {}, expected {}",
                page.parent_page_id(),
                expected_parent
            )));
        }
        if page.key_size() != km.key_size() {
            return Err(corrupted(format!("key size {}", page.key_size())));
        }

        let size = page.size();
        let min = match (page.is_root(), kind) {
            (true, BTreePageKind::Leaf) => 1,
            (true, BTreePageKind::Internal) => 2,
            (false, _) => page.min_size(),
        };
        if size < min || size > page.max_size() {
            return Err(corrupted(format!(
                "size {} outside [{}, {}]",
                size,
                min,
                page.max_size()
            )));
        }

        let in_range = |key: &[u8]| {
            lower.map_or(true, |low| km.compare(key, low) != Ordering::Less)
                && upper.map_or(true, |high| km.compare(key, high) == Ordering::Less)
        };

        match kind {
            BTreePageKind::Leaf => {
                let leaf = BTreeLeafPage::new(guard.data());
                for i in 0..size {
                    if !in_range(leaf.key_at(i)) {
                        return Err(corrupted(format!("key {} outside its separators", i)));
                    }
                    if i > 0 && km.compare(leaf.key_at(i - 1), leaf.key_at(i)) != Ordering::Less {
                        return Err(corrupted(format!("keys {} and {} out of order", i - 1, i)));
                    }
                }
                leaves.push(page_id);
                Ok(size)
            }
            BTreePageKind::Internal => {
                let node = BTreeInternalPage::new(guard.data());
                for i in 1..size {
                    if !in_range(node.key_at(i)) {
                        return Err(corrupted(format!("separator {} outside its bounds", i)));
                    }
                    if i > 1 && km.compare(node.key_at(i - 1), node.key_at(i)) != Ordering::Less {
                        return Err(corrupted(format!(
                            "separators {} and {} out of order",
                            i - 1,
                            i
                        )));
                    }
                }
                let children: Vec<PageId> = (0..size).map(|i| node.value_at(i)).collect();
                let keys: Vec<Vec<u8>> = (0..size).map(|i| node.key_at(i).to_vec()).collect();
                drop(guard);

                let mut count = 0;
                for (i, &child) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(keys[i].as_slice()) };
                    let child_upper = if i + 1 < size {
                        Some(keys[i + 1].as_slice())
                    } else {
                        upper
                    };
                    count += self.verify_node(child, page_id, child_lower, child_upper, leaves)?;
                }
                Ok(count)
            }
        }
    }

    /// Indented rendering of the tree, one node per line, for debugging a
    /// quiescent tree.
    pub fn dump(&self) -> Result<String> {
        self.render(false)
    }

    /// Graphviz rendering of the tree: one record per node listing its keys,
    /// solid edges to children and dashed edges along the leaf chain.
    pub fn to_dot(&self) -> Result<String> {
        self.render(true)
    }

    fn render(&self, dot: bool) -> Result<String> {
        let root = self.root_page_id.read();
        let mut out = String::new();
        if dot {
            out.push_str("digraph btree {\n  node [shape=record];\n");
        }
        if *root != INVALID_PAGE_ID {
            self.render_node(*root, 0, dot, &mut out)?;
        } else if !dot {
            out.push_str("(empty)\n");
        }
        if dot {
            out.push_str("}\n");
        }
        Ok(out)
    }

    fn render_node(&self, page_id: PageId, depth: usize, dot: bool, out: &mut String) -> Result<()> {
        let km = &*self.key_manager;
        let format_key = |bytes: &[u8]| format!("{:?}", km.deserialize(bytes));
        let guard = self.bpm.fetch_page_read(page_id)?;
        let id = page_id.as_u32();

        let (kind, keys, children, next) = match BTreePage::new(guard.data()).kind()? {
            BTreePageKind::Leaf => {
                let leaf = BTreeLeafPage::new(guard.data());
                let keys: Vec<String> = (0..leaf.size()).map(|i| format_key(leaf.key_at(i))).collect();
                ("leaf", keys, Vec::new(), leaf.next_page_id())
            }
            BTreePageKind::Internal => {
                let node = BTreeInternalPage::new(guard.data());
                let keys: Vec<String> = (1..node.size()).map(|i| format_key(node.key_at(i))).collect();
                let children: Vec<PageId> = (0..node.size()).map(|i| node.value_at(i)).collect();
                ("internal", keys, children, INVALID_PAGE_ID)
            }
        };
        drop(guard);

        if dot {
            let label: Vec<String> = keys.iter().map(|k| dot_escape(k)).collect();
            out.push_str(&format!("  p{} [label=\"P{}|{}\"];\n", id, id, label.join("|")));
            for child in &children {
                out.push_str(&format!("  p{} -> p{};\n", id, child.as_u32()));
            }
            if next != INVALID_PAGE_ID {
                out.push_str(&format!("  p{} -> p{} [style=dashed];\n", id, next.as_u32()));
            }
        } else {
            out.push_str(&format!(
                "{}{} {} [{}]\n",
                "  ".repeat(depth),
                kind,
                page_id,
                keys.join(", ")
            ));
        }

        for child in children {
            self.render_node(child, depth + 1, dot, out)?;
        }
        Ok(())
    }

    /// Descends with shared latches to the leaf that may hold `key`, or to
    /// the leftmost leaf when `key` is `None`.
    fn find_leaf_read(&self, key: Option<&[u8]>) -> Result<Option<ReadPageGuard<'_>>> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.bpm.fetch_page_read(*root)?;
        drop(root);

        loop {
            let kind = BTreePage::new(guard.data()).kind()?;
            let child = match kind {
                BTreePageKind::Leaf => return Ok(Some(guard)),
                BTreePageKind::Internal => {
                    let node = BTreeInternalPage::new(guard.data());
                    match key {
                        Some(key) => node.lookup(key, &*self.key_manager),
                        None => node.value_at(0),
                    }
                }
            };
            guard = self.bpm.fetch_page_read(child)?;
        }
    }

    /// Descends with exclusive latches to the leaf for `key`, keeping only
    /// the pages `op` may restructure. An empty tree yields an empty path
    /// with the root latch held.
    fn find_leaf_write(&self, key: &[u8], op: WriteOp) -> Result<WriteContext<'_>> {
        let root = self.root_page_id.write();
        let mut page_id = *root;
        let mut ctx = WriteContext {
            root_lock: Some(root),
            path: Vec::new(),
        };
        if page_id == INVALID_PAGE_ID {
            return Ok(ctx);
        }

        loop {
            let guard = self.bpm.fetch_page_write(page_id)?;
            let (safe, next) = {
                let page = BTreePage::new(guard.data());
                let next = match page.kind()? {
                    BTreePageKind::Leaf => None,
                    BTreePageKind::Internal => Some(
                        BTreeInternalPage::new(guard.data()).lookup(key, &*self.key_manager),
                    ),
                };
                (Self::is_safe(&page, op), next)
            };

            ctx.path.push(guard);
            if safe {
                ctx.release_ancestors();
            }
            match next {
                Some(child) => page_id = child,
                None => return Ok(ctx),
            }
        }
    }

    fn is_safe<B: AsRef<[u8]>>(page: &BTreePage<B>, op: WriteOp) -> bool {
        let size = page.size();
        match op {
            WriteOp::Insert => size < page.max_size(),
            WriteOp::Remove if page.is_root() => {
                let floor = if page.is_leaf() { 1 } else { 2 };
                size > floor
            }
            WriteOp::Remove => size > page.min_size(),
        }
    }

    fn start_new_tree(&self, ctx: &mut WriteContext<'_>, key: &[u8], value: RecordId) -> Result<()> {
        let roots = self.bpm.fetch_page_write(INDEX_ROOTS_PAGE_ID)?;
        let mut guard = self.bpm.new_page()?;
        let page_id = guard.page_id();
        {
            let mut leaf = BTreeLeafPage::new(guard.data_mut());
            leaf.init(
                page_id,
                INVALID_PAGE_ID,
                self.config.leaf_max_size,
                self.key_manager.key_size(),
            );
            leaf.insert(key, value, &*self.key_manager);
        }
        drop(guard);

        if let Err(e) = self.set_root(ctx, page_id, Some(roots)) {
            self.discard_page(page_id)?;
            return Err(e);
        }
        debug!("{} started with root leaf {}", self.index_id, page_id);
        Ok(())
    }

    /// Allocates the pages an insert into the leaf at the end of `ctx.path`
    /// could need: one per full page on the path, plus a new root when the
    /// root itself is full. A root split also latches the index roots page.
    fn reserve_split_pages<'a>(&'a self, ctx: &WriteContext<'a>) -> Result<Reserved<'a>> {
        let mut needed = 0;
        let mut grows = false;
        for guard in ctx.path.iter().rev() {
            let page = BTreePage::new(guard.data());
            if page.size() < page.max_size() {
                break;
            }
            needed += 1;
            if page.is_root() {
                needed += 1;
                grows = true;
            }
        }

        let roots = if grows {
            Some(self.bpm.fetch_page_write(INDEX_ROOTS_PAGE_ID)?)
        } else {
            None
        };
        let mut pages = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.bpm.new_page() {
                Ok(guard) => pages.push(guard),
                Err(e) => {
                    let page_ids: Vec<PageId> = pages.iter().map(|g| g.page_id()).collect();
                    drop(pages);
                    drop(roots);
                    for page_id in page_ids {
                        self.discard_page(page_id)?;
                    }
                    trace!("{} could not reserve {} split pages: {}", self.index_id, needed, e);
                    return Err(e);
                }
            }
        }
        Ok(Reserved { pages, roots })
    }

    /// Links `new` in as the right neighbour of `old` under their parent,
    /// splitting ancestors as needed.
    fn insert_into_parent<'a>(
        &'a self,
        ctx: &mut WriteContext<'a>,
        mut old: WritePageGuard<'a>,
        key: Vec<u8>,
        mut new: WritePageGuard<'a>,
        spare: &mut Reserved<'a>,
    ) -> Result<()> {
        let (old_id, new_id) = (old.page_id(), new.page_id());

        if BTreePage::new(old.data()).is_root() {
            let mut root_guard = spare.pages.pop().ok_or_else(|| missing("spare page"))?;
            let root_id = root_guard.page_id();
            {
                let mut root = BTreeInternalPage::new(root_guard.data_mut());
                root.init(
                    root_id,
                    INVALID_PAGE_ID,
                    self.config.internal_max_size,
                    self.key_manager.key_size(),
                );
                root.populate_new_root(old_id, &key, new_id);
            }
            BTreePage::new(old.data_mut()).set_parent_page_id(root_id);
            BTreePage::new(new.data_mut()).set_parent_page_id(root_id);
            drop(old);
            drop(new);
            drop(root_guard);

            self.set_root(ctx, root_id, spare.roots.take())?;
            debug!("{} grew a new root {}", self.index_id, root_id);
            return Ok(());
        }

        let mut parent_guard = ctx.path.pop().ok_or_else(|| missing("parent"))?;
        let parent_id = parent_guard.page_id();
        // Unpinning both halves leaves frames for reparenting below.
        drop(old);
        drop(new);

        let size = BTreeInternalPage::new(parent_guard.data_mut())
            .insert_node_after(old_id, &key, new_id)
            .ok_or_else(|| not_a_child(old_id, parent_id))?;
        if size <= BTreePage::new(parent_guard.data()).max_size() {
            return Ok(());
        }

        let mut sibling_guard = spare.pages.pop().ok_or_else(|| missing("spare page"))?;
        let sibling_id = sibling_guard.page_id();
        let (separator, moved) = {
            let mut parent = BTreeInternalPage::new(parent_guard.data_mut());
            let mut sibling = BTreeInternalPage::new(sibling_guard.data_mut());
            sibling.init(
                sibling_id,
                parent.parent_page_id(),
                parent.max_size(),
                parent.key_size(),
            );
            let moved = parent.move_half_to(&mut sibling);
            (sibling.key_at(0).to_vec(), moved)
        };
        for child in moved {
            self.set_parent(child, sibling_id)?;
        }
        debug!("split internal {} into {}", parent_id, sibling_id);

        self.insert_into_parent(ctx, parent_guard, separator, sibling_guard, spare)
    }

    /// Decides, bottom-up, how removing one key from the leaf at the end of
    /// `ctx.path` gets repaired, and latches every sibling, moved child and
    /// the index roots page that repair touches. Nothing is modified.
    fn plan_removal<'a>(&'a self, ctx: &WriteContext<'a>) -> Result<RemovalPlan<'a>> {
        let mut plan = RemovalPlan {
            repairs: Vec::new(),
            roots: None,
        };

        for level in (0..ctx.path.len()).rev() {
            let node = &ctx.path[level];
            let page = BTreePage::new(node.data());
            // The leaf loses the key; each level above loses a merged child.
            let size = page.size().saturating_sub(1);
            if page.is_root() {
                let floor = if page.is_leaf() { 1 } else { 2 };
                if size < floor {
                    plan.roots = Some(self.bpm.fetch_page_write(INDEX_ROOTS_PAGE_ID)?);
                }
                break;
            }
            let min = page.min_size();
            if size >= min {
                break;
            }

            let parent = level
                .checked_sub(1)
                .map(|i| &ctx.path[i])
                .ok_or_else(|| missing("parent"))?;
            let parent_page = BTreeInternalPage::new(parent.data());
            let index = parent_page
                .value_index(node.page_id())
                .ok_or_else(|| not_a_child(node.page_id(), parent.page_id()))?;
            let internal = !page.is_leaf();

            let mut left = None;
            if index > 0 {
                let guard = self.bpm.fetch_page_write(parent_page.value_at(index - 1))?;
                let left_size = BTreePage::new(guard.data()).size();
                if left_size > min {
                    let moved_child = if internal {
                        let last = BTreeInternalPage::new(guard.data()).value_at(left_size - 1);
                        Some(self.bpm.fetch_page_write(last)?)
                    } else {
                        None
                    };
                    plan.repairs.push(Repair::BorrowLeft {
                        left: guard,
                        moved_child,
                    });
                    break;
                }
                left = Some(guard);
            }

            let mut right = None;
            if index + 1 < parent_page.size() {
                let guard = self.bpm.fetch_page_write(parent_page.value_at(index + 1))?;
                if BTreePage::new(guard.data()).size() > min {
                    let moved_child = if internal {
                        let first = BTreeInternalPage::new(guard.data()).value_at(0);
                        Some(self.bpm.fetch_page_write(first)?)
                    } else {
                        None
                    };
                    plan.repairs.push(Repair::BorrowRight {
                        right: guard,
                        moved_child,
                    });
                    break;
                }
                right = Some(guard);
            }

            let repair = match (left, right) {
                (Some(left), _) => Repair::MergeIntoLeft { left },
                (None, Some(right)) => Repair::MergeRight { right },
                (None, None) => {
                    return Err(KeystoneError::IndexCorrupted(format!(
                        "{} has no siblings under {}",
                        node.page_id(),
                        parent.page_id()
                    )))
                }
            };
            plan.repairs.push(repair);
        }
        Ok(plan)
    }

    /// Restores minimum occupancy from `node` upward after a removal,
    /// carrying out `plan`.
    fn rebalance<'a>(
        &'a self,
        ctx: &mut WriteContext<'a>,
        mut node: WritePageGuard<'a>,
        plan: RemovalPlan<'a>,
    ) -> Result<()> {
        let RemovalPlan { repairs, roots } = plan;
        let mut repairs = repairs.into_iter();
        let mut survivor = None;

        loop {
            if BTreePage::new(node.data()).is_root() {
                return self.adjust_root(ctx, node, survivor, roots);
            }
            let Some(repair) = repairs.next() else {
                return Ok(());
            };

            let mut parent = ctx.path.pop().ok_or_else(|| missing("parent"))?;
            let node_id = node.page_id();
            let index = BTreeInternalPage::new(parent.data())
                .value_index(node_id)
                .ok_or_else(|| not_a_child(node_id, parent.page_id()))?;

            let merged = match repair {
                Repair::BorrowLeft {
                    mut left,
                    moved_child,
                } => {
                    return self.borrow_from_left(
                        &mut left,
                        &mut node,
                        &mut parent,
                        index,
                        moved_child,
                    );
                }
                Repair::BorrowRight {
                    mut right,
                    moved_child,
                } => {
                    return self.borrow_from_right(
                        &mut node,
                        &mut right,
                        &mut parent,
                        index + 1,
                        moved_child,
                    );
                }
                Repair::MergeIntoLeft { mut left } => {
                    self.merge(&mut left, node, &mut parent, index)?;
                    left
                }
                Repair::MergeRight { right } => {
                    self.merge(&mut node, right, &mut parent, index + 1)?;
                    node
                }
            };
            node = parent;
            // A collapsing root hands its role to the merged node. Any other
            // level may reparent it, so its latch goes.
            survivor = BTreePage::new(node.data()).is_root().then_some(merged);
        }
    }

    /// Shrinks the tree at the root: an empty root leaf empties the tree and
    /// an internal root with one child hands the root role to that child.
    fn adjust_root<'a>(
        &'a self,
        ctx: &mut WriteContext<'a>,
        root: WritePageGuard<'a>,
        survivor: Option<WritePageGuard<'a>>,
        roots: Option<WritePageGuard<'a>>,
    ) -> Result<()> {
        let root_id = root.page_id();
        let page = BTreePage::new(root.data());

        if page.is_leaf() {
            if page.size() > 0 {
                return Ok(());
            }
            drop(root);
            self.set_root(ctx, INVALID_PAGE_ID, roots)?;
            self.discard_page(root_id)?;
            debug!("{} is now empty", self.index_id);
            return Ok(());
        }

        if page.size() > 1 {
            return Ok(());
        }
        let child_id = BTreeInternalPage::new(root.data()).value_at(0);
        drop(root);

        let mut child = match survivor {
            Some(guard) if guard.page_id() == child_id => guard,
            _ => self.bpm.fetch_page_write(child_id)?,
        };
        self.set_root(ctx, child_id, roots)?;
        BTreePage::new(child.data_mut()).set_parent_page_id(INVALID_PAGE_ID);
        drop(child);
        self.discard_page(root_id)?;
        debug!("{} promoted {} to root", self.index_id, child_id);
        Ok(())
    }

    /// Moves the last entry of `left` to the front of `node`, the child at
    /// `index` of `parent`.
    fn borrow_from_left(
        &self,
        left: &mut WritePageGuard<'_>,
        node: &mut WritePageGuard<'_>,
        parent: &mut WritePageGuard<'_>,
        index: usize,
        moved_child: Option<WritePageGuard<'_>>,
    ) -> Result<()> {
        let node_id = node.page_id();
        let mut parent_page = BTreeInternalPage::new(parent.data_mut());

        if BTreePage::new(node.data()).is_leaf() {
            let mut node_page = BTreeLeafPage::new(node.data_mut());
            BTreeLeafPage::new(left.data_mut()).move_last_to_front_of(&mut node_page);
            parent_page.set_key_at(index, node_page.key_at(0));
        } else {
            let middle = parent_page.key_at(index).to_vec();
            let (child, separator) = BTreeInternalPage::new(left.data_mut())
                .move_last_to_front_of(&mut BTreeInternalPage::new(node.data_mut()), &middle);
            parent_page.set_key_at(index, &separator);
            adopt(moved_child, child, node_id)?;
        }
        trace!("{} borrowed from left sibling {}", node_id, left.page_id());
        Ok(())
    }

    /// Moves the first entry of `right`, the child at `right_index` of
    /// `parent`, to the end of `node`.
    fn borrow_from_right(
        &self,
        node: &mut WritePageGuard<'_>,
        right: &mut WritePageGuard<'_>,
        parent: &mut WritePageGuard<'_>,
        right_index: usize,
        moved_child: Option<WritePageGuard<'_>>,
    ) -> Result<()> {
        let node_id = node.page_id();
        let mut parent_page = BTreeInternalPage::new(parent.data_mut());

        if BTreePage::new(node.data()).is_leaf() {
            let mut right_page = BTreeLeafPage::new(right.data_mut());
            right_page.move_first_to_end_of(&mut BTreeLeafPage::new(node.data_mut()));
            parent_page.set_key_at(right_index, right_page.key_at(0));
        } else {
            let middle = parent_page.key_at(right_index).to_vec();
            let (child, separator) = BTreeInternalPage::new(right.data_mut())
                .move_first_to_end_of(&mut BTreeInternalPage::new(node.data_mut()), &middle);
            parent_page.set_key_at(right_index, &separator);
            adopt(moved_child, child, node_id)?;
        }
        trace!("{} borrowed from right sibling {}", node_id, right.page_id());
        Ok(())
    }

    /// Folds `right`, the child at `right_index` of `parent`, into its left
    /// neighbour and frees it.
    fn merge(
        &self,
        left: &mut WritePageGuard<'_>,
        mut right: WritePageGuard<'_>,
        parent: &mut WritePageGuard<'_>,
        right_index: usize,
    ) -> Result<()> {
        let (left_id, right_id) = (left.page_id(), right.page_id());
        let mut parent_page = BTreeInternalPage::new(parent.data_mut());

        let moved = if BTreePage::new(right.data()).is_leaf() {
            BTreeLeafPage::new(right.data_mut())
                .move_all_to(&mut BTreeLeafPage::new(left.data_mut()));
            Vec::new()
        } else {
            let middle = parent_page.key_at(right_index).to_vec();
            BTreeInternalPage::new(right.data_mut())
                .move_all_to(&mut BTreeInternalPage::new(left.data_mut()), &middle)
        };
        parent_page.remove_at(right_index);
        drop(right);
        self.discard_page(right_id)?;

        // Reparenting runs in the frame `right` just gave back.
        for child in moved {
            self.set_parent(child, left_id)?;
        }
        debug!("merged {} into {}", right_id, left_id);
        Ok(())
    }

    fn set_parent(&self, page_id: PageId, parent_page_id: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(page_id)?;
        BTreePage::new(guard.data_mut()).set_parent_page_id(parent_page_id);
        Ok(())
    }

    /// Points the tree at a new root, durably first. `roots` is the index
    /// roots page if the caller already latched it.
    fn set_root(
        &self,
        ctx: &mut WriteContext<'_>,
        root_page_id: PageId,
        roots: Option<WritePageGuard<'_>>,
    ) -> Result<()> {
        let lock = ctx.root_lock.as_mut().ok_or_else(|| {
            KeystoneError::IndexCorrupted("root changed without holding the root latch".into())
        })?;
        let mut roots = match roots {
            Some(guard) => guard,
            None => self.bpm.fetch_page_write(INDEX_ROOTS_PAGE_ID)?,
        };
        self.update_root_record(&mut roots, root_page_id)?;
        **lock = root_page_id;
        Ok(())
    }

    fn update_root_record(&self, roots: &mut WritePageGuard<'_>, root_page_id: PageId) -> Result<()> {
        let mut directory = IndexRootsPage::decode(roots.data())?;
        if root_page_id == INVALID_PAGE_ID {
            directory.delete(self.index_id);
        } else {
            directory.upsert(self.index_id, root_page_id)?;
        }
        directory.encode(roots.data_mut())
    }

    /// Returns a page the tree no longer uses to the pool.
    fn discard_page(&self, page_id: PageId) -> Result<()> {
        if !self.bpm.delete_page(page_id)? {
            warn!("{} is still pinned and stays allocated", page_id);
        }
        Ok(())
    }
}

fn missing(what: &str) -> KeystoneError {
    KeystoneError::IndexCorrupted(format!("write path is missing the {}", what))
}

fn not_a_child(child: PageId, parent: PageId) -> KeystoneError {
    KeystoneError::IndexCorrupted(format!("{} is not a child of {}", child, parent))
}

/// Escapes the characters Graphviz treats as record structure.
fn dot_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '{' | '}' | '|' | '<' | '>' | '"' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Points the latched `guard`, expected to hold `child`, at its new parent.
fn adopt(guard: Option<WritePageGuard<'_>>, child: PageId, parent_page_id: PageId) -> Result<()> {
    match guard {
        Some(mut guard) if guard.page_id() == child => {
            BTreePage::new(guard.data_mut()).set_parent_page_id(parent_page_id);
            Ok(())
        }
        _ => Err(missing("moved child")),
    }
}
