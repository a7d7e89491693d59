pub mod write;

pub use write::{fsync_dir, remove_tree, temp_sibling, write_atomic};
