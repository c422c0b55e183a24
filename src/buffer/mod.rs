// Bounded page cache: reference-counted buffer frames with read/write
// pinning, LRU eviction and write-back through the file manager.

mod cache;
mod frame;

pub use cache::{CacheStatsSnapshot, PageCache};
pub use frame::{BufferFrame, CacheEntry, PinMode};
