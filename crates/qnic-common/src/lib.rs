//! qnic Common - Shared types for the multi-queue NIC datapath
//!
//! This crate provides:
//! - Queue, port and tag identifiers
//! - The datapath error taxonomy
//! - Interface configuration (JSON loadable)
//! - Timestamps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;

/// TX or RX descriptor queue index
pub type QueueId = u32;

/// Completion queue index
pub type CqId = u32;

/// Event queue index
pub type EqId = u32;

/// Physical port index
pub type PortId = u16;

/// Operation table tag
pub type Tag = u16;

/// Nanosecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Wrap a raw nanosecond value
    #[inline(always)]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Current wall-clock timestamp (nanoseconds since epoch)
    #[inline(always)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }

    /// Get nanoseconds value
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}
