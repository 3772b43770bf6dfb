//! Migrators shipped with the crate.

mod table_copy;

pub use table_copy::{TableCopy, DEFAULT_BATCH_SIZE};
