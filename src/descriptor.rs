//! Buffer descriptors exchanged through shared-memory ports
//!
//! A port never carries payload bytes. It carries fixed-size descriptors
//! pointing into *other* shared segments where the payloads live. Both types
//! here are `repr(C)` PODs so they can be stored directly in ring cells that
//! multiple processes map at different base addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 8-byte random identifier for a shared-memory segment or port instance
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId([u8; 8]);

impl SegmentId {
    /// Size of the identifier in bytes
    pub const SIZE: usize = 8;

    /// The all-zero identifier, used for vacant cells
    pub const fn nil() -> Self {
        Self([0u8; 8])
    }

    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Build an identifier from raw bytes
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the identifier
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Check whether this is the all-zero identifier
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self)
    }
}

/// Identifies a data buffer by the segment that holds it and the offset of
/// its buffer node inside that segment
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Identifier of the segment the payload buffer lives in
    pub source_segment_id: SegmentId,
    /// Offset of the buffer node inside the source segment
    pub buffer_node_offset: u64,
}

impl BufferDescriptor {
    /// Create a new descriptor
    pub fn new(source_segment_id: SegmentId, buffer_node_offset: u64) -> Self {
        Self {
            source_segment_id,
            buffer_node_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_id_random_is_unique() {
        let a = SegmentId::random();
        let b = SegmentId::random();
        assert_ne!(a, b);
        assert!(!a.is_nil());
    }

    #[test]
    fn test_segment_id_display() {
        let id = SegmentId::from_bytes([0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(id.to_string(), "0011223344556677");
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let id = SegmentId::random();
        let desc = BufferDescriptor::new(id, 4096);
        assert_eq!(desc.source_segment_id, id);
        assert_eq!(desc.buffer_node_offset, 4096);
    }

    #[test]
    fn test_descriptor_layout_is_stable() {
        // Descriptors are stored raw in shared memory; their size must not
        // change across builds that interoperate.
        assert_eq!(std::mem::size_of::<SegmentId>(), 8);
        assert_eq!(std::mem::size_of::<BufferDescriptor>(), 16);
    }
}
