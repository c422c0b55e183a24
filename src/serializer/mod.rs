// # Binary serializer seam
//
// Index buckets persist the serializer IDs of their key and value types so
// typed access survives reopen. The `SerialType` trait carries a stable ID
// plus fixed-offset encode/decode; the registry validates IDs found on
// page against the set of serializers this build knows about.
//
// `preprocess` normalizes a key before comparison; after preprocessing all
// keys compare bytewise.

use std::collections::HashMap;

use crate::common::PagePosition;
use crate::error::{Result, StorageError};

pub type SerializerId = u8;

pub const LONG_SERIALIZER_ID: SerializerId = 10;
pub const ULONG_SERIALIZER_ID: SerializerId = 11;
pub const STRING_SERIALIZER_ID: SerializerId = 13;
pub const LINK_SERIALIZER_ID: SerializerId = 16;
pub const BYTES_SERIALIZER_ID: SerializerId = 17;

/// A type with a stable binary form addressed by (buffer, offset).
pub trait SerialType: Sized {
    const SERIALIZER_ID: SerializerId;

    fn serial_size(&self) -> usize;

    /// Size of the serialized object starting at `offset`, without
    /// materializing it.
    fn size_at(buf: &[u8], offset: usize) -> usize;

    fn write_to(&self, buf: &mut [u8], offset: usize);

    fn read_from(buf: &[u8], offset: usize) -> Self;

    /// Normalize a key before comparison. Identity unless the type needs
    /// canonicalization.
    fn preprocess(self) -> Self {
        self
    }
}

impl SerialType for i64 {
    const SERIALIZER_ID: SerializerId = LONG_SERIALIZER_ID;

    fn serial_size(&self) -> usize {
        8
    }

    fn size_at(_buf: &[u8], _offset: usize) -> usize {
        8
    }

    fn write_to(&self, buf: &mut [u8], offset: usize) {
        // Sign-flipped big-endian so the byte order matches numeric order.
        let biased = (*self as u64) ^ (1 << 63);
        buf[offset..offset + 8].copy_from_slice(&biased.to_be_bytes());
    }

    fn read_from(buf: &[u8], offset: usize) -> Self {
        let biased = u64::from_be_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"));
        (biased ^ (1 << 63)) as i64
    }
}

impl SerialType for u64 {
    const SERIALIZER_ID: SerializerId = ULONG_SERIALIZER_ID;

    fn serial_size(&self) -> usize {
        8
    }

    fn size_at(_buf: &[u8], _offset: usize) -> usize {
        8
    }

    fn write_to(&self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 8].copy_from_slice(&self.to_be_bytes());
    }

    fn read_from(buf: &[u8], offset: usize) -> Self {
        u64::from_be_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"))
    }
}

impl SerialType for String {
    const SERIALIZER_ID: SerializerId = STRING_SERIALIZER_ID;

    fn serial_size(&self) -> usize {
        2 + self.len()
    }

    fn size_at(buf: &[u8], offset: usize) -> usize {
        let len = u16::from_be_bytes(buf[offset..offset + 2].try_into().expect("2-byte slice"));
        2 + len as usize
    }

    fn write_to(&self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 2].copy_from_slice(&(self.len() as u16).to_be_bytes());
        buf[offset + 2..offset + 2 + self.len()].copy_from_slice(self.as_bytes());
    }

    fn read_from(buf: &[u8], offset: usize) -> Self {
        let len = u16::from_be_bytes(buf[offset..offset + 2].try_into().expect("2-byte slice"));
        String::from_utf8_lossy(&buf[offset + 2..offset + 2 + len as usize]).into_owned()
    }
}

impl SerialType for Vec<u8> {
    const SERIALIZER_ID: SerializerId = BYTES_SERIALIZER_ID;

    fn serial_size(&self) -> usize {
        4 + self.len()
    }

    fn size_at(buf: &[u8], offset: usize) -> usize {
        let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("4-byte slice"));
        4 + len as usize
    }

    fn write_to(&self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 4].copy_from_slice(&(self.len() as u32).to_be_bytes());
        buf[offset + 4..offset + 4 + self.len()].copy_from_slice(self);
    }

    fn read_from(buf: &[u8], offset: usize) -> Self {
        let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("4-byte slice"));
        buf[offset + 4..offset + 4 + len as usize].to_vec()
    }
}

impl SerialType for PagePosition {
    const SERIALIZER_ID: SerializerId = LINK_SERIALIZER_ID;

    fn serial_size(&self) -> usize {
        12
    }

    fn size_at(_buf: &[u8], _offset: usize) -> usize {
        12
    }

    fn write_to(&self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 8].copy_from_slice(&self.page_index.to_be_bytes());
        buf[offset + 8..offset + 12].copy_from_slice(&self.record_position.to_be_bytes());
    }

    fn read_from(buf: &[u8], offset: usize) -> Self {
        PagePosition {
            page_index: u64::from_be_bytes(buf[offset..offset + 8].try_into().expect("8 bytes")),
            record_position: u32::from_be_bytes(
                buf[offset + 8..offset + 12].try_into().expect("4 bytes"),
            ),
        }
    }
}

/// Registry of serializer IDs this build can resolve. Buckets written by a
/// build with more serializers fail loading with a `SerializerMismatch`
/// instead of misreading entry bytes.
pub struct SerializerRegistry {
    known: HashMap<SerializerId, &'static str>,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl SerializerRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            known: HashMap::new(),
        };
        registry.register(LONG_SERIALIZER_ID, "long");
        registry.register(ULONG_SERIALIZER_ID, "unsigned-long");
        registry.register(STRING_SERIALIZER_ID, "string");
        registry.register(LINK_SERIALIZER_ID, "link");
        registry.register(BYTES_SERIALIZER_ID, "bytes");
        registry
    }

    pub fn register(&mut self, id: SerializerId, name: &'static str) {
        self.known.insert(id, name);
    }

    pub fn validate(&self, id: SerializerId) -> Result<()> {
        if self.known.contains_key(&id) {
            Ok(())
        } else {
            Err(StorageError::SerializerMismatch(format!(
                "serializer id {id} is not registered"
            )))
        }
    }

    pub fn name(&self, id: SerializerId) -> Option<&'static str> {
        self.known.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: SerialType + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = vec![0u8; 64 + value.serial_size()];
        value.write_to(&mut buf, 64);
        assert_eq!(T::size_at(&buf, 64), value.serial_size());
        assert_eq!(T::read_from(&buf, 64), value);
    }

    #[test]
    fn test_builtin_roundtrips() {
        roundtrip(42i64);
        roundtrip(-42i64);
        roundtrip(7u64);
        roundtrip("hello".to_string());
        roundtrip(vec![1u8, 2, 3]);
        roundtrip(PagePosition::new(12, 7));
    }

    #[test]
    fn test_long_encoding_is_order_preserving() {
        let pairs = [(-5i64, 3i64), (i64::MIN, i64::MAX), (-1, 0), (0, 1)];
        for (a, b) in pairs {
            let mut ab = vec![0u8; 8];
            let mut bb = vec![0u8; 8];
            a.write_to(&mut ab, 0);
            b.write_to(&mut bb, 0);
            assert!(ab < bb, "{a} should order below {b}");
        }
    }

    #[test]
    fn test_registry_rejects_unknown_id() {
        let registry = SerializerRegistry::with_builtins();
        assert!(registry.validate(LONG_SERIALIZER_ID).is_ok());
        assert!(matches!(
            registry.validate(200),
            Err(StorageError::SerializerMismatch(_))
        ));
    }
}
