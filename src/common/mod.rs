// Shared identifier types and on-page constants.

use std::fmt;

/// Numeric identifier of a durable file managed by the file manager.
pub type FileId = u32;

/// Index of a page within its file.
pub type PageIndex = u64;

/// Identifier of an atomic operation unit.
pub type OperationId = u64;

/// Sentinel for "no page".
pub const INVALID_PAGE_INDEX: PageIndex = PageIndex::MAX;

/// Bytes reserved at the head of every durable page:
/// `u64` page LSN, `u32` content CRC32, `u32` reserved.
pub const PAGE_DATA_OFFSET: usize = 16;

/// Log sequence number. Packs (segment, offset-within-segment) so that
/// ordering follows append order across segment rolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(segment: u32, offset: u32) -> Self {
        Lsn(((segment as u64) << 32) | offset as u64)
    }

    pub fn segment(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment(), self.offset())
    }
}

/// Location of a sub-page bonsai bucket: page index plus byte offset of the
/// bucket region within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BonsaiPointer {
    pub page_index: PageIndex,
    pub page_offset: u32,
}

impl BonsaiPointer {
    pub const NULL: BonsaiPointer = BonsaiPointer {
        page_index: INVALID_PAGE_INDEX,
        page_offset: u32::MAX,
    };

    pub fn new(page_index: PageIndex, page_offset: u32) -> Self {
        Self {
            page_index,
            page_offset,
        }
    }

    pub fn is_null(&self) -> bool {
        self.page_index == INVALID_PAGE_INDEX
    }
}

impl fmt::Display for BonsaiPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "({}, {})", self.page_index, self.page_offset)
        }
    }
}

/// Physical record coordinates stored by the cluster position map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePosition {
    pub page_index: PageIndex,
    pub record_position: u32,
}

impl PagePosition {
    pub fn new(page_index: PageIndex, record_position: u32) -> Self {
        Self {
            page_index,
            record_position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering_across_segments() {
        let a = Lsn::new(0, 500);
        let b = Lsn::new(0, 900);
        let c = Lsn::new(1, 16);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.segment(), 1);
        assert_eq!(c.offset(), 16);
    }

    #[test]
    fn test_bonsai_pointer_null() {
        assert!(BonsaiPointer::NULL.is_null());
        assert!(!BonsaiPointer::new(0, 2048).is_null());
    }
}
