// File-level IO: logical name registry, page-aligned reads and writes,
// per-page checksums.

mod file_manager;

pub use file_manager::FileManager;
