// Write-ahead log: typed records ordered by LSN, segmented append-only
// storage, checkpoint master marker.

mod log;
mod record;

pub use log::{WalIterator, WriteAheadLog};
pub use record::{read_varint, write_varint, PageOpKind, PageOpRecord, WalRecord};
