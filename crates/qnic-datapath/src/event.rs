//! Event Queues and Interrupt Path
//!
//! Every event queue keeps a monotonically increasing event counter. When
//! the counter advances while the queue is armed, one interrupt is raised
//! and the queue disarms; further events are coalesced until the host
//! re-arms. Re-arming with unacknowledged events raises immediately so no
//! wakeup is lost.

use crate::hostmem::HostMemory;
use crate::ring::{self, EventRecord, RingParams, EVENT_SIZE};
use parking_lot::{Mutex, RwLock};
use qnic_common::{DatapathError, DatapathResult, EqId, QueueKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Interrupt controller (MSI-X style delivery lives outside the datapath)
pub trait InterruptSink: Send + Sync {
    /// Signal interrupt vector `irq`
    fn raise(&self, irq: u32);
}

/// Discards interrupts
#[derive(Debug, Default)]
pub struct NullInterrupts;

impl InterruptSink for NullInterrupts {
    fn raise(&self, _irq: u32) {}
}

/// Records every raised vector, in order
#[derive(Debug, Default)]
pub struct InterruptLog {
    raised: Mutex<Vec<u32>>,
}

impl InterruptLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// All vectors raised so far
    pub fn raised(&self) -> Vec<u32> {
        self.raised.lock().clone()
    }

    /// Number of raises on `irq`
    pub fn count(&self, irq: u32) -> usize {
        self.raised.lock().iter().filter(|&&v| v == irq).count()
    }

    /// Drain the log
    pub fn take(&self) -> Vec<u32> {
        std::mem::take(&mut *self.raised.lock())
    }
}

impl InterruptSink for InterruptLog {
    fn raise(&self, irq: u32) {
        self.raised.lock().push(irq);
    }
}

/// Per-EQ state
#[derive(Debug)]
struct EqState {
    ring: Option<RingParams>,
    irq: u32,
    counter: AtomicU64,
    acked: AtomicU64,
    armed: AtomicBool,
    coalesced: AtomicU64,
    interrupts: AtomicU64,
    overruns: AtomicU64,
    write_lock: Mutex<()>,
}

/// Outcome of one `notify`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Counter value after this event
    pub counter: u64,
    /// An interrupt was raised for this event
    pub raised: bool,
}

/// Status snapshot of one EQ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqStatus {
    /// Events produced
    pub counter: u64,
    /// Events acknowledged by the host
    pub acked: u64,
    /// Arm bit
    pub armed: bool,
    /// Events that did not raise an interrupt
    pub coalesced: u64,
    /// Interrupts raised, including on re-arm
    pub interrupts: u64,
    /// Events that found the EQ ring full
    pub overruns: u64,
    /// Interrupt vector
    pub irq: u32,
}

/// Event queue manager
pub struct EventQueueManager {
    slots: Vec<RwLock<Option<Arc<EqState>>>>,
    sink: Arc<dyn InterruptSink>,
}

impl EventQueueManager {
    /// Create a manager with `count` unallocated EQs
    pub fn new(count: u32, sink: Arc<dyn InterruptSink>) -> Self {
        Self {
            slots: (0..count).map(|_| RwLock::new(None)).collect(),
            sink,
        }
    }

    /// Number of EQ slots
    pub fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn unknown(eq: EqId) -> DatapathError {
        DatapathError::UnknownQueue { kind: QueueKind::Event, queue: eq }
    }

    fn get(&self, eq: EqId) -> DatapathResult<Arc<EqState>> {
        self.slots
            .get(eq as usize)
            .and_then(|slot| slot.read().clone())
            .ok_or_else(|| Self::unknown(eq))
    }

    /// Configure EQ `eq` on vector `irq`, optionally with an event ring
    pub fn allocate_at(&self, eq: EqId, ring: Option<RingParams>, irq: u32) -> DatapathResult<()> {
        if let Some(ref r) = ring {
            r.validate()?;
        }
        let slot = self.slots.get(eq as usize).ok_or_else(|| Self::unknown(eq))?;
        *slot.write() = Some(Arc::new(EqState {
            ring,
            irq,
            counter: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            coalesced: AtomicU64::new(0),
            interrupts: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }));
        Ok(())
    }

    /// Record one event
    pub fn notify(
        &self,
        eq: EqId,
        event: EventRecord,
        mem: &dyn HostMemory,
    ) -> DatapathResult<Notification> {
        let state = self.get(eq)?;
        let _guard = state.write_lock.lock();

        let index = state.counter.load(Ordering::Acquire);
        if let Some(ring) = state.ring {
            let pending = index - state.acked.load(Ordering::Acquire);
            if pending >= ring.capacity() as u64 {
                // Host is behind; the counter still advances so the
                // interrupt contract holds, only the record is lost.
                state.overruns.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(eq, pending, "event ring full, record dropped");
            } else {
                let idx = index as u32;
                let raw = event.encode(ring::phase(idx, ring.size_log2));
                mem.write(ring.slot_address(idx, EVENT_SIZE), &raw)?;
            }
        }
        let counter = index + 1;
        state.counter.store(counter, Ordering::Release);

        let raised = state.armed.swap(false, Ordering::AcqRel);
        if raised {
            state.interrupts.fetch_add(1, Ordering::Relaxed);
            self.sink.raise(state.irq);
            tracing::trace!(eq, irq = state.irq, counter, "interrupt raised");
        } else {
            state.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Notification { counter, raised })
    }

    /// Host re-arm
    ///
    /// Raises at once if events are still unacknowledged.
    pub fn arm(&self, eq: EqId) -> DatapathResult<bool> {
        let state = self.get(eq)?;
        let _guard = state.write_lock.lock();
        let pending = state.counter.load(Ordering::Acquire) > state.acked.load(Ordering::Acquire);
        if pending {
            state.armed.store(false, Ordering::Release);
            state.interrupts.fetch_add(1, Ordering::Relaxed);
            self.sink.raise(state.irq);
        } else {
            state.armed.store(true, Ordering::Release);
        }
        Ok(pending)
    }

    /// Host consumer doorbell: events up to `consumed` were processed
    pub fn acknowledge(&self, eq: EqId, consumed: u64) -> DatapathResult<()> {
        let state = self.get(eq)?;
        let counter = state.counter.load(Ordering::Acquire);
        if consumed > counter {
            return Err(DatapathError::RingOverflow {
                kind: QueueKind::Event,
                queue: eq,
                head: counter as u32,
                tail: consumed as u32,
            });
        }
        state.acked.store(consumed, Ordering::Release);
        Ok(())
    }

    /// Current event counter
    pub fn counter(&self, eq: EqId) -> DatapathResult<u64> {
        Ok(self.get(eq)?.counter.load(Ordering::Acquire))
    }

    /// Status snapshot
    pub fn status(&self, eq: EqId) -> DatapathResult<EqStatus> {
        let state = self.get(eq)?;
        Ok(EqStatus {
            counter: state.counter.load(Ordering::Acquire),
            acked: state.acked.load(Ordering::Acquire),
            armed: state.armed.load(Ordering::Acquire),
            coalesced: state.coalesced.load(Ordering::Relaxed),
            interrupts: state.interrupts.load(Ordering::Relaxed),
            overruns: state.overruns.load(Ordering::Relaxed),
            irq: state.irq,
        })
    }
}
