mod bitmap_page;
mod disk_meta_page;
mod index_roots_page;

pub use bitmap_page::*;
pub use disk_meta_page::*;
pub use index_roots_page::*;
