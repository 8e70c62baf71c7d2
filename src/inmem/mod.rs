pub mod memtable;

pub use memtable::{InternalKey, MemTable};
