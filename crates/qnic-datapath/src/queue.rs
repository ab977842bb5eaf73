//! Queue Manager
//!
//! Live state for TX and RX descriptor queues. The host owns the producer
//! index (written through `doorbell`), the engine owns the consumer index.
//! Both are plain atomics: the two sides never write the same field, so the
//! single-producer/single-consumer ring discipline needs no broader lock.

use crate::ring::{self, RingParams, DESC_SIZE};
use parking_lot::RwLock;
use qnic_common::{CqId, DatapathError, DatapathResult, FaultCode, QueueId, QueueKind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Sentinel for "no completion queue attached"
const NO_CQ: u32 = u32::MAX;

/// Per-queue state
#[derive(Debug)]
pub struct QueueState {
    id: QueueId,
    kind: QueueKind,
    ring: RingParams,
    head: AtomicU32,
    tail: AtomicU32,
    enabled: AtomicBool,
    armed: AtomicBool,
    cq: AtomicU32,
    fault: AtomicU8,
    in_flight: AtomicU32,
}

impl QueueState {
    fn new(id: QueueId, kind: QueueKind, ring: RingParams) -> Self {
        Self {
            id,
            kind,
            ring,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            enabled: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            cq: AtomicU32::new(NO_CQ),
            fault: AtomicU8::new(0),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Queue index
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Ring placement
    pub fn ring(&self) -> RingParams {
        self.ring
    }

    /// Producer index
    #[inline]
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// Consumer index
    #[inline]
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Host enabled the queue
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Recorded fault, if any
    #[inline]
    pub fn fault(&self) -> Option<FaultCode> {
        FaultCode::from_raw(self.fault.load(Ordering::Acquire))
    }

    /// Attached completion queue
    pub fn cq(&self) -> Option<CqId> {
        match self.cq.load(Ordering::Acquire) {
            NO_CQ => None,
            cq => Some(cq),
        }
    }

    /// Enabled, unfaulted and holding at least one descriptor
    #[inline]
    pub fn is_serviceable(&self) -> bool {
        self.is_enabled() && self.fault().is_none() && !ring::is_empty(self.head(), self.tail())
    }

    /// Operations still referencing this queue
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Track a new operation on this queue
    pub(crate) fn begin_op(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// An operation on this queue was released
    pub(crate) fn end_op(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a fatal fault; the first fault wins
    pub(crate) fn set_fault(&self, code: FaultCode) -> bool {
        self.fault
            .compare_exchange(0, code as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            id: self.id,
            head: self.head(),
            tail: self.tail(),
            enabled: self.is_enabled(),
            armed: self.armed.load(Ordering::Acquire),
            cq: self.cq(),
            fault: self.fault(),
            in_flight: self.in_flight(),
        }
    }
}

/// Consumer position handed to an engine by `enqueue_descriptor`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOffset {
    /// Queue index
    pub queue: QueueId,
    /// Free-running consumer index
    pub index: u32,
    /// Host address of the descriptor slot
    pub address: u64,
}

/// Status register view of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Queue index
    pub id: QueueId,
    /// Producer index
    pub head: u32,
    /// Consumer index
    pub tail: u32,
    /// Enable bit
    pub enabled: bool,
    /// Arm bit
    pub armed: bool,
    /// Attached completion queue
    pub cq: Option<CqId>,
    /// Fault code
    pub fault: Option<FaultCode>,
    /// Operations in flight
    pub in_flight: u32,
}

/// Queue manager for one direction (TX or RX)
pub struct QueueManager {
    kind: QueueKind,
    slots: Vec<RwLock<Option<Arc<QueueState>>>>,
}

impl QueueManager {
    /// Create a manager with `count` unallocated queues
    pub fn new(kind: QueueKind, count: u32) -> Self {
        let slots = (0..count).map(|_| RwLock::new(None)).collect();
        Self { kind, slots }
    }

    /// Queue family
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Number of queue slots
    pub fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn unknown(&self, queue: QueueId) -> DatapathError {
        DatapathError::UnknownQueue { kind: self.kind, queue }
    }

    /// Look up live queue state
    #[inline]
    pub fn get(&self, queue: QueueId) -> DatapathResult<Arc<QueueState>> {
        self.slots
            .get(queue as usize)
            .and_then(|slot| slot.read().clone())
            .ok_or_else(|| self.unknown(queue))
    }

    /// Allocate the lowest free queue
    pub fn allocate(&self, params: RingParams) -> DatapathResult<QueueId> {
        params.validate()?;
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.write();
            if slot.is_none() {
                let id = idx as QueueId;
                *slot = Some(Arc::new(QueueState::new(id, self.kind, params)));
                tracing::debug!(kind = %self.kind, queue = id, base = params.base_address, "queue allocated");
                return Ok(id);
            }
        }
        Err(DatapathError::InvalidConfig(format!("no free {} queue", self.kind)))
    }

    /// Configure a specific queue index (host configuration write)
    ///
    /// Reconfiguring an existing queue requires it to be disabled and quiesced.
    pub fn allocate_at(&self, queue: QueueId, params: RingParams) -> DatapathResult<()> {
        params.validate()?;
        let slot = self.slots.get(queue as usize).ok_or_else(|| self.unknown(queue))?;
        let mut slot = slot.write();
        if let Some(existing) = slot.as_ref() {
            if existing.is_enabled() || existing.in_flight() != 0 {
                return Err(DatapathError::InvalidConfig(format!(
                    "{} queue {} busy; disable and quiesce before reconfiguring",
                    self.kind, queue
                )));
            }
        }
        *slot = Some(Arc::new(QueueState::new(queue, self.kind, params)));
        Ok(())
    }

    /// Release a disabled, quiesced queue
    pub fn free(&self, queue: QueueId) -> DatapathResult<()> {
        let slot = self.slots.get(queue as usize).ok_or_else(|| self.unknown(queue))?;
        let mut slot = slot.write();
        match slot.as_ref() {
            None => Err(self.unknown(queue)),
            Some(q) if q.is_enabled() || q.in_flight() != 0 => Err(DatapathError::InvalidConfig(
                format!("{} queue {} not quiesced", self.kind, queue),
            )),
            Some(_) => {
                *slot = None;
                Ok(())
            }
        }
    }

    /// Set the enable bit
    pub fn enable(&self, queue: QueueId) -> DatapathResult<()> {
        self.get(queue)?.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Clear the enable bit; operations already in flight drain normally
    pub fn disable(&self, queue: QueueId) -> DatapathResult<()> {
        self.get(queue)?.enabled.store(false, Ordering::Release);
        Ok(())
    }

    /// Set the arm bit
    pub fn set_armed(&self, queue: QueueId, armed: bool) -> DatapathResult<()> {
        self.get(queue)?.armed.store(armed, Ordering::Release);
        Ok(())
    }

    /// Pair the queue with a completion queue
    pub fn set_cq(&self, queue: QueueId, cq: CqId) -> DatapathResult<()> {
        self.get(queue)?.cq.store(cq, Ordering::Release);
        Ok(())
    }

    /// Host producer doorbell
    ///
    /// A head that would exceed ring capacity (or move backwards) faults the
    /// queue and is not applied.
    pub fn doorbell(&self, queue: QueueId, new_head: u32) -> DatapathResult<()> {
        let q = self.get(queue)?;
        let old_head = q.head();
        let tail = q.tail();
        let capacity = q.ring.capacity();

        let advance = new_head.wrapping_sub(old_head);
        if advance > capacity || ring::occupancy(new_head, tail) > capacity {
            tracing::warn!(kind = %self.kind, queue, new_head, old_head, tail, "doorbell overflow");
            let err = DatapathError::RingOverflow {
                kind: self.kind,
                queue,
                head: new_head,
                tail,
            };
            if let Some(code) = err.fault_code() {
                self.fault(queue, code)?;
            }
            return Err(err);
        }

        q.head.store(new_head, Ordering::Release);
        Ok(())
    }

    /// Next consumer position, without consuming it
    pub fn enqueue_descriptor(&self, queue: QueueId) -> DatapathResult<ConsumerOffset> {
        let q = self.get(queue)?;
        if !q.is_enabled() {
            return Err(DatapathError::QueueDisabled { kind: self.kind, queue });
        }
        if let Some(code) = q.fault() {
            return Err(DatapathError::QueueFaulted { kind: self.kind, queue, code });
        }
        let tail = q.tail();
        if ring::is_empty(q.head(), tail) {
            return Err(DatapathError::QueueEmpty { kind: self.kind, queue });
        }
        Ok(ConsumerOffset {
            queue,
            index: tail,
            address: q.ring.slot_address(tail, DESC_SIZE),
        })
    }

    /// Move the consumer index forward by `count`
    pub fn advance_consumer(&self, queue: QueueId, count: u32) -> DatapathResult<()> {
        let q = self.get(queue)?;
        let tail = q.tail();
        let head = q.head();
        if ring::occupancy(head, tail) < count {
            return Err(DatapathError::RingOverflow {
                kind: self.kind,
                queue,
                head,
                tail: tail.wrapping_add(count),
            });
        }
        q.tail.store(tail.wrapping_add(count), Ordering::Release);
        Ok(())
    }

    /// Halt a queue with a fatal fault
    pub fn fault(&self, queue: QueueId, code: FaultCode) -> DatapathResult<bool> {
        let q = self.get(queue)?;
        let first = q.set_fault(code);
        if first {
            tracing::warn!(kind = %self.kind, queue, ?code, "queue faulted");
            metrics::counter!("qnic_queue_faults_total", "kind" => self.kind.to_string())
                .increment(1);
        }
        Ok(first)
    }

    /// Host recovery: clear the fault and resynchronize head to tail
    pub fn clear_fault(&self, queue: QueueId) -> DatapathResult<()> {
        let q = self.get(queue)?;
        q.head.store(q.tail(), Ordering::Release);
        q.fault.store(0, Ordering::Release);
        tracing::info!(kind = %self.kind, queue, "queue fault cleared");
        Ok(())
    }

    /// Status register snapshot
    pub fn status(&self, queue: QueueId) -> DatapathResult<QueueStatus> {
        Ok(self.get(queue)?.status())
    }

    /// Disabled with no operations in flight
    pub fn is_quiesced(&self, queue: QueueId) -> DatapathResult<bool> {
        let q = self.get(queue)?;
        Ok(!q.is_enabled() && q.in_flight() == 0)
    }
}
