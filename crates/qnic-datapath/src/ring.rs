//! Descriptor Rings
//!
//! Host-resident circular buffers shared by TX/RX queues, completion queues
//! and event queues, plus the fixed little-endian record layouts stored in
//! them.
//!
//! # Index arithmetic
//!
//! Producer (`head`) and consumer (`tail`) are free-running `u32` counters.
//! The slot is `index & (2^size_log2 - 1)`; occupancy is `head - tail`
//! with wrapping subtraction, which keeps "full" (`occupancy == capacity`)
//! distinct from "empty" (`head == tail`). Ring sizes are capped at 2^16 so
//! the counter width always exceeds the slot width.

use bitflags::bitflags;
use qnic_common::{DatapathError, DatapathResult, Timestamp};
use serde::{Deserialize, Serialize};

/// TX/RX descriptor size in bytes
pub const DESC_SIZE: usize = 16;

/// Completion record size in bytes
pub const CPL_SIZE: usize = 32;

/// Event record size in bytes
pub const EVENT_SIZE: usize = 16;

/// Smallest ring (2 slots)
pub const MIN_RING_LOG2: u8 = 1;

/// Largest ring (65536 slots)
pub const MAX_RING_LOG2: u8 = 16;

/// Phase flag position inside the last byte of CQ/EQ records
const PHASE_BIT: u8 = 0x80;

/// Ring placement in host memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingParams {
    /// Host address of slot 0
    pub base_address: u64,
    /// log2 of the slot count
    pub size_log2: u8,
}

impl RingParams {
    /// Create ring parameters
    pub const fn new(base_address: u64, size_log2: u8) -> Self {
        Self { base_address, size_log2 }
    }

    /// Reject sizes outside the supported range
    pub fn validate(&self) -> DatapathResult<()> {
        if !(MIN_RING_LOG2..=MAX_RING_LOG2).contains(&self.size_log2) {
            return Err(DatapathError::InvalidConfig(format!(
                "ring size 2^{} outside [2^{}, 2^{}]",
                self.size_log2, MIN_RING_LOG2, MAX_RING_LOG2
            )));
        }
        Ok(())
    }

    /// Slot count
    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        1u32 << self.size_log2
    }

    /// Slot mask
    #[inline(always)]
    pub fn mask(&self) -> u32 {
        self.capacity() - 1
    }

    /// Slot number for a free-running index
    #[inline(always)]
    pub fn slot(&self, index: u32) -> u32 {
        index & self.mask()
    }

    /// Byte offset of `index` from the ring base
    #[inline(always)]
    pub fn offset(&self, index: u32, slot_size: usize) -> u64 {
        self.slot(index) as u64 * slot_size as u64
    }

    /// Host address of the slot holding `index`
    #[inline(always)]
    pub fn slot_address(&self, index: u32, slot_size: usize) -> u64 {
        self.base_address + self.offset(index, slot_size)
    }

    /// Total ring footprint in bytes
    #[inline(always)]
    pub fn ring_bytes(&self, slot_size: usize) -> u64 {
        self.capacity() as u64 * slot_size as u64
    }
}

/// Entries between consumer and producer
#[inline(always)]
pub fn occupancy(head: u32, tail: u32) -> u32 {
    head.wrapping_sub(tail)
}

/// `head == tail`
#[inline(always)]
pub fn is_empty(head: u32, tail: u32) -> bool {
    head == tail
}

/// `head - tail == capacity`
#[inline(always)]
pub fn is_full(head: u32, tail: u32, capacity: u32) -> bool {
    occupancy(head, tail) == capacity
}

/// Phase written with the record at `index` (set on even laps)
#[inline(always)]
pub fn phase(index: u32, size_log2: u8) -> bool {
    (index >> size_log2) & 1 == 0
}

// ============================================================================
// Descriptor
// ============================================================================

/// Checksum enable bit in the descriptor flags
const CSUM_ENABLE: u16 = 0x8000;

/// TX checksum offload request carried in the descriptor flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumCommand {
    /// First byte of the summed range
    pub start: u8,
    /// Insert position relative to `start`
    pub offset: u8,
}

impl ChecksumCommand {
    /// Absolute byte position receiving the checksum
    pub fn insert_at(&self) -> usize {
        self.start as usize + self.offset as usize
    }
}

/// Host descriptor (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Host cookie echoed in the completion
    pub tag: u16,
    /// Checksum command word
    pub flags: u16,
    /// Buffer length
    pub length: u32,
    /// Buffer address
    pub buffer_address: u64,
}

impl Descriptor {
    /// Plain buffer descriptor
    pub const fn new(buffer_address: u64, length: u32, tag: u16) -> Self {
        Self { tag, flags: 0, length, buffer_address }
    }

    /// Request checksum insertion over `[start, end)` at `start + offset`
    pub fn with_checksum(mut self, start: u8, offset: u8) -> Self {
        self.flags = CSUM_ENABLE | ((offset as u16 & 0x7F) << 8) | start as u16;
        self
    }

    /// Decoded checksum command, if enabled
    pub fn checksum_command(&self) -> Option<ChecksumCommand> {
        if self.flags & CSUM_ENABLE == 0 {
            return None;
        }
        Some(ChecksumCommand {
            start: (self.flags & 0xFF) as u8,
            offset: ((self.flags >> 8) & 0x7F) as u8,
        })
    }

    /// Serialize to the ring layout
    pub fn encode(&self) -> [u8; DESC_SIZE] {
        let mut raw = [0u8; DESC_SIZE];
        raw[0..2].copy_from_slice(&self.tag.to_le_bytes());
        raw[2..4].copy_from_slice(&self.flags.to_le_bytes());
        raw[4..8].copy_from_slice(&self.length.to_le_bytes());
        raw[8..16].copy_from_slice(&self.buffer_address.to_le_bytes());
        raw
    }

    /// Parse from the ring layout
    pub fn decode(raw: &[u8; DESC_SIZE]) -> Self {
        Self {
            tag: u16::from_le_bytes([raw[0], raw[1]]),
            flags: u16::from_le_bytes([raw[2], raw[3]]),
            length: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            buffer_address: u64::from_le_bytes([
                raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
            ]),
        }
    }
}

// ============================================================================
// Completion record
// ============================================================================

bitflags! {
    /// Completion error bits
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CplErrorFlags: u8 {
        /// Descriptor failed validation; queue is faulted
        const INVALID_DESCRIPTOR = 0x01;
        /// Receive buffer shorter than the frame
        const TRUNCATED = 0x02;
        /// Host memory access failed
        const DMA_ERROR = 0x04;
    }
}

/// Completion record (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionRecord {
    /// Source TX/RX queue
    pub queue_id: u16,
    /// Descriptor tag
    pub descriptor_tag: u16,
    /// Bytes transferred
    pub length: u32,
    /// Receive hash
    pub rx_hash: u32,
    /// Receive checksum (folded one's-complement sum)
    pub rx_checksum: u16,
    /// Receive hash type bits
    pub hash_type: u8,
    /// Error bits
    pub error_flags: CplErrorFlags,
    /// Completion timestamp
    pub timestamp: Timestamp,
    /// Ring index of the completed descriptor
    pub descriptor_index: u32,
}

impl CompletionRecord {
    /// Serialize with the given phase
    pub fn encode(&self, phase: bool) -> [u8; CPL_SIZE] {
        let mut raw = [0u8; CPL_SIZE];
        raw[0..2].copy_from_slice(&self.queue_id.to_le_bytes());
        raw[2..4].copy_from_slice(&self.descriptor_tag.to_le_bytes());
        raw[4..8].copy_from_slice(&self.length.to_le_bytes());
        raw[8..12].copy_from_slice(&self.rx_hash.to_le_bytes());
        raw[12..14].copy_from_slice(&self.rx_checksum.to_le_bytes());
        raw[14] = self.hash_type;
        raw[15] = self.error_flags.bits();
        raw[16..24].copy_from_slice(&self.timestamp.as_nanos().to_le_bytes());
        raw[24..28].copy_from_slice(&self.descriptor_index.to_le_bytes());
        if phase {
            raw[31] |= PHASE_BIT;
        }
        raw
    }

    /// Parse, returning the record and its phase
    pub fn decode(raw: &[u8; CPL_SIZE]) -> (Self, bool) {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[16..24]);
        let record = Self {
            queue_id: u16::from_le_bytes([raw[0], raw[1]]),
            descriptor_tag: u16::from_le_bytes([raw[2], raw[3]]),
            length: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            rx_hash: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            rx_checksum: u16::from_le_bytes([raw[12], raw[13]]),
            hash_type: raw[14],
            error_flags: CplErrorFlags::from_bits_truncate(raw[15]),
            timestamp: Timestamp::from_nanos(u64::from_le_bytes(ts)),
            descriptor_index: u32::from_le_bytes([raw[24], raw[25], raw[26], raw[27]]),
        };
        (record, raw[31] & PHASE_BIT != 0)
    }
}

// ============================================================================
// Event record
// ============================================================================

/// Event kinds written to event queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EventType {
    /// A completion queue received new records
    Completion = 0,
    /// A queue entered the faulted state
    QueueFault = 1,
}

/// Event record (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    /// Kind of event
    pub event_type: EventType,
    /// Completion queue (or faulted queue) that raised it
    pub source: u16,
}

impl EventRecord {
    /// Serialize with the given phase
    pub fn encode(&self, phase: bool) -> [u8; EVENT_SIZE] {
        let mut raw = [0u8; EVENT_SIZE];
        raw[0..2].copy_from_slice(&(self.event_type as u16).to_le_bytes());
        raw[2..4].copy_from_slice(&self.source.to_le_bytes());
        if phase {
            raw[15] |= PHASE_BIT;
        }
        raw
    }

    /// Parse, returning the record and its phase
    pub fn decode(raw: &[u8; EVENT_SIZE]) -> (Self, bool) {
        let event_type = match u16::from_le_bytes([raw[0], raw[1]]) {
            1 => EventType::QueueFault,
            _ => EventType::Completion,
        };
        let record = Self {
            event_type,
            source: u16::from_le_bytes([raw[2], raw[3]]),
        };
        (record, raw[15] & PHASE_BIT != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ring_params() {
        let ring = RingParams::new(0x1000, 4);
        ring.validate().unwrap();
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.slot_address(17, DESC_SIZE), 0x1000 + 16);
        assert_eq!(ring.ring_bytes(CPL_SIZE), 512);
        assert!(RingParams::new(0, 0).validate().is_err());
        assert!(RingParams::new(0, 17).validate().is_err());
    }

    #[test]
    fn test_full_empty_boundary() {
        assert!(is_empty(5, 5));
        assert!(!is_full(5, 5, 8));
        assert!(is_full(13, 5, 8));
        assert!(!is_empty(13, 5));
        // Counter wraparound
        assert!(is_full(3, u32::MAX - 4, 8));
        assert_eq!(occupancy(2, u32::MAX), 3);
    }

    #[test]
    fn test_phase_alternates_per_lap() {
        assert!(phase(0, 3));
        assert!(phase(7, 3));
        assert!(!phase(8, 3));
        assert!(phase(16, 3));
    }

    #[test]
    fn test_descriptor_layout() {
        let desc = Descriptor::new(0xDEAD_BEEF_0000, 1514, 9).with_checksum(34, 6);
        let raw = desc.encode();
        assert_eq!(&raw[0..2], &[9, 0]);
        assert_eq!(u16::from_le_bytes([raw[2], raw[3]]), 0x8000 | (6 << 8) | 34);
        assert_eq!(Descriptor::decode(&raw), desc);

        let cmd = desc.checksum_command().unwrap();
        assert_eq!(cmd.insert_at(), 40);
        assert!(Descriptor::new(0, 1, 0).checksum_command().is_none());
    }

    #[test]
    fn test_completion_layout() {
        let record = CompletionRecord {
            queue_id: 3,
            descriptor_tag: 77,
            length: 9014,
            rx_hash: 0x1234_5678,
            rx_checksum: 0xBEEF,
            hash_type: 0x05,
            error_flags: CplErrorFlags::TRUNCATED,
            timestamp: Timestamp::from_nanos(42),
            descriptor_index: 65537,
        };
        let raw = record.encode(true);
        assert_eq!(raw[31] & 0x80, 0x80);
        let (decoded, phase) = CompletionRecord::decode(&raw);
        assert!(phase);
        assert_eq!(decoded, record);

        let (_, phase) = CompletionRecord::decode(&record.encode(false));
        assert!(!phase);
    }

    #[test]
    fn test_event_layout() {
        let ev = EventRecord { event_type: EventType::QueueFault, source: 12 };
        let (decoded, phase) = EventRecord::decode(&ev.encode(true));
        assert_eq!(decoded, ev);
        assert!(phase);
    }

    proptest! {
        #[test]
        fn prop_offset_periodic(index in any::<u32>(), log2 in MIN_RING_LOG2..=MAX_RING_LOG2) {
            let ring = RingParams::new(0x10_0000, log2);
            let next_lap = index.wrapping_add(ring.capacity());
            prop_assert_eq!(ring.offset(index, DESC_SIZE), ring.offset(next_lap, DESC_SIZE));
            prop_assert!(ring.offset(index, DESC_SIZE) < ring.ring_bytes(DESC_SIZE));
        }

        #[test]
        fn prop_full_and_empty_exclusive(tail in any::<u32>(), used in 0u32..=256, log2 in 1u8..=8) {
            let capacity = 1u32 << log2;
            let used = used % (capacity + 1);
            let head = tail.wrapping_add(used);
            prop_assert!(!(is_full(head, tail, capacity) && is_empty(head, tail)));
            prop_assert_eq!(is_empty(head, tail), used == 0);
            prop_assert_eq!(is_full(head, tail, capacity), used == capacity);
        }
    }
}
