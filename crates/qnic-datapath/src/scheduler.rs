//! Round-robin transmit scheduler
//!
//! A rotating pointer scans the queue set and grants one fetch opportunity
//! to the first eligible queue at or after it, then moves past the grantee.
//! Paused queues are skipped without disturbing the rotation.

use qnic_common::{DatapathError, DatapathResult, PortId, QueueId};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct SchedEntry {
    enabled: AtomicBool,
    active: AtomicBool,
    paused: AtomicBool,
    port: AtomicU16,
}

/// Scheduler-side view of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStatus {
    /// Per-queue scheduling enable
    pub enabled: bool,
    /// Queue has been doorbelled and not found empty since
    pub active: bool,
    /// Per-queue pause
    pub paused: bool,
    /// Egress port
    pub port: PortId,
}

/// Round-robin scheduler over one engine's queues
#[derive(Debug)]
pub struct RoundRobinScheduler {
    entries: Vec<SchedEntry>,
    port_paused: Vec<AtomicBool>,
    pointer: AtomicUsize,
    enabled: AtomicBool,
}

impl RoundRobinScheduler {
    /// Scheduler for `num_queues` queues over `num_ports` ports, globally enabled
    pub fn new(num_queues: u32, num_ports: u16) -> Self {
        Self {
            entries: (0..num_queues).map(|_| SchedEntry::default()).collect(),
            port_paused: (0..num_ports).map(|_| AtomicBool::new(false)).collect(),
            pointer: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    fn entry(&self, queue: QueueId) -> DatapathResult<&SchedEntry> {
        self.entries.get(queue as usize).ok_or_else(|| {
            DatapathError::InvalidConfig(format!("scheduler has no queue {}", queue))
        })
    }

    /// Global enable
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Global enable state
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Per-queue scheduling enable
    pub fn enable_queue(&self, queue: QueueId, enabled: bool) -> DatapathResult<()> {
        self.entry(queue)?.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Doorbell hint: the queue has work
    pub fn notify(&self, queue: QueueId) -> DatapathResult<()> {
        self.entry(queue)?.active.store(true, Ordering::Release);
        Ok(())
    }

    /// A fetch found the queue empty or unusable
    pub fn deactivate(&self, queue: QueueId) {
        if let Some(entry) = self.entries.get(queue as usize) {
            entry.active.store(false, Ordering::Release);
        }
    }

    /// Hold a queue without losing its activation
    pub fn pause_queue(&self, queue: QueueId, paused: bool) -> DatapathResult<()> {
        self.entry(queue)?.paused.store(paused, Ordering::Release);
        Ok(())
    }

    /// Link-level pause on a port stops every queue bound to it
    pub fn set_port_paused(&self, port: PortId, paused: bool) -> DatapathResult<()> {
        let flag = self
            .port_paused
            .get(port as usize)
            .ok_or_else(|| DatapathError::InvalidConfig(format!("unknown port {}", port)))?;
        flag.store(paused, Ordering::Release);
        Ok(())
    }

    /// Link-level pause state of `port`
    pub fn is_port_paused(&self, port: PortId) -> bool {
        self.port_paused
            .get(port as usize)
            .map_or(false, |p| p.load(Ordering::Acquire))
    }

    /// Bind a queue to its egress port
    pub fn set_queue_port(&self, queue: QueueId, port: PortId) -> DatapathResult<()> {
        if port as usize >= self.port_paused.len() {
            return Err(DatapathError::InvalidConfig(format!("unknown port {}", port)));
        }
        self.entry(queue)?.port.store(port, Ordering::Release);
        Ok(())
    }

    /// Egress port of a queue
    pub fn queue_port(&self, queue: QueueId) -> PortId {
        self.entries
            .get(queue as usize)
            .map_or(0, |e| e.port.load(Ordering::Acquire))
    }

    /// Any queue waiting for service
    pub fn has_active(&self) -> bool {
        self.entries.iter().any(|e| e.active.load(Ordering::Acquire))
    }

    /// Scheduler view of one queue
    pub fn status(&self, queue: QueueId) -> DatapathResult<SchedStatus> {
        let e = self.entry(queue)?;
        Ok(SchedStatus {
            enabled: e.enabled.load(Ordering::Acquire),
            active: e.active.load(Ordering::Acquire),
            paused: e.paused.load(Ordering::Acquire),
            port: e.port.load(Ordering::Acquire),
        })
    }

    /// Grant one fetch opportunity
    ///
    /// `eligible` reports the queue manager's view (enabled, not faulted).
    /// Callers serialize grants; the pointer is not advanced on a miss.
    pub fn grant(&self, eligible: impl Fn(QueueId) -> bool) -> Option<QueueId> {
        if !self.is_enabled() || self.entries.is_empty() {
            return None;
        }
        let n = self.entries.len();
        let start = self.pointer.load(Ordering::Relaxed) % n;
        for step in 0..n {
            let idx = (start + step) % n;
            let e = &self.entries[idx];
            if !e.enabled.load(Ordering::Acquire)
                || !e.active.load(Ordering::Acquire)
                || e.paused.load(Ordering::Acquire)
                || self.is_port_paused(e.port.load(Ordering::Acquire))
            {
                continue;
            }
            let queue = idx as QueueId;
            if eligible(queue) {
                self.pointer.store((idx + 1) % n, Ordering::Relaxed);
                return Some(queue);
            }
        }
        None
    }
}
