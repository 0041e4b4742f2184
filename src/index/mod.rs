pub mod btree_index;
pub mod btree_internal_page;
pub mod btree_iterator;
pub mod btree_leaf_page;
pub mod btree_page;
pub mod key_manager;

pub use btree_index::{BTreeConfig, BTreeIndex};
pub use btree_internal_page::BTreeInternalPage;
pub use btree_iterator::BTreeIterator;
pub use btree_leaf_page::BTreeLeafPage;
pub use btree_page::{BTreePage, BTreePageKind};
pub use key_manager::{BytewiseKeyManager, IntegerKeyManager, KeyManager};
