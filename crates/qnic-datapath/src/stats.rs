//! Engine Statistics
//!
//! Lock-free counters per engine, with a plain snapshot for reporting.
//! Drops and faults are also exported through the `metrics` facade.

use qnic_common::DropReason;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-engine counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Frames moved
    pub packets: AtomicU64,
    /// Bytes moved
    pub bytes: AtomicU64,
    /// Operations released
    pub completions: AtomicU64,
    /// Frames dropped
    pub dropped: AtomicU64,
    /// Queues faulted
    pub faults: AtomicU64,
    /// TX checksums inserted
    pub checksum_offloads: AtomicU64,
    /// RX frames cut to the buffer size
    pub truncated: AtomicU64,
    /// Transport retries
    pub busy_retries: AtomicU64,
    /// Fetches refused for lack of a tag
    pub table_full: AtomicU64,
    /// Completion writes deferred on a full CQ
    pub cq_full: AtomicU64,
}

impl EngineStats {
    /// Count one frame of `bytes`
    #[inline(always)]
    pub fn record_packet(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count one released operation
    #[inline(always)]
    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dropped frame and export it labelled by reason
    pub fn record_drop(&self, engine: &'static str, reason: DropReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "qnic_drops_total",
            "engine" => engine,
            "reason" => format!("{:?}", reason)
        )
        .increment(1);
    }

    /// Count a queue fault and export it labelled by engine
    pub fn record_fault(&self, engine: &'static str) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("qnic_faults_total", "engine" => engine).increment(1);
    }

    /// Count one inserted checksum
    #[inline(always)]
    pub fn record_checksum(&self) {
        self.checksum_offloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one truncated receive
    #[inline(always)]
    pub fn record_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    /// Add transport retries
    #[inline(always)]
    pub fn record_retries(&self, retries: u32) {
        if retries > 0 {
            self.busy_retries.fetch_add(retries as u64, Ordering::Relaxed);
        }
    }

    /// Count one fetch refused for lack of a tag
    #[inline(always)]
    pub fn record_table_full(&self) {
        self.table_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one deferred completion write
    #[inline(always)]
    pub fn record_cq_full(&self) {
        self.cq_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Plain copy of every counter
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            checksum_offloads: self.checksum_offloads.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            table_full: self.table_full.load(Ordering::Relaxed),
            cq_full: self.cq_full.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Frames moved
    pub packets: u64,
    /// Bytes moved
    pub bytes: u64,
    /// Operations released
    pub completions: u64,
    /// Frames dropped
    pub dropped: u64,
    /// Queues faulted
    pub faults: u64,
    /// TX checksums inserted
    pub checksum_offloads: u64,
    /// RX frames cut to the buffer size
    pub truncated: u64,
    /// Transport retries
    pub busy_retries: u64,
    /// Fetches refused for lack of a tag
    pub table_full: u64,
    /// Completion writes deferred on a full CQ
    pub cq_full: u64,
}

impl EngineStatsSnapshot {
    /// Line rate over `elapsed_secs`, in Gbit/s
    pub fn throughput_gbps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / (elapsed_secs * 1_000_000_000.0)
    }

    /// Frame rate over `elapsed_secs`, in Mpps
    pub fn packet_rate_mpps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }
        self.packets as f64 / (elapsed_secs * 1_000_000.0)
    }
}

/// Interface-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceStats {
    /// Transmit engine
    pub tx: EngineStatsSnapshot,
    /// Receive engine
    pub rx: EngineStatsSnapshot,
    /// Interrupts raised across all event queues
    pub interrupts: u64,
}
