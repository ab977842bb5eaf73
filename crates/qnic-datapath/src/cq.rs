//! Completion Queue Manager
//!
//! Completion queues are rings the engine produces into and the host
//! consumes from. Each record carries a phase bit so the host can tell
//! fresh entries from stale ones without reading the producer index.
//! Every record advances the counter of the CQ's event queue; whether that
//! raises an interrupt is up to the event queue's own arm bit.

use crate::event::EventQueueManager;
use crate::hostmem::HostMemory;
use crate::ring::{self, CompletionRecord, EventRecord, EventType, RingParams, CPL_SIZE};
use parking_lot::{Mutex, RwLock};
use qnic_common::{CqId, DatapathError, DatapathResult, EqId, QueueId, QueueKind};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Per-CQ state
#[derive(Debug)]
pub struct CqState {
    id: CqId,
    ring: RingParams,
    eq: EqId,
    head: AtomicU32,
    tail: AtomicU32,
    enabled: AtomicBool,
    write_lock: Mutex<()>,
}

impl CqState {
    /// Ring placement
    pub fn ring(&self) -> RingParams {
        self.ring
    }

    /// Event queue this CQ reports to
    pub fn eq(&self) -> EqId {
        self.eq
    }

    /// Producer index (engine side)
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// Consumer index (host side)
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }
}

/// Result of appending one completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CplWrite {
    /// Producer index the record was written at
    pub index: u32,
    /// Event queue the record is reported to
    pub eq: EqId,
}

/// Status register view of one CQ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqStatus {
    /// Producer index
    pub head: u32,
    /// Consumer index
    pub tail: u32,
    /// Enable bit
    pub enabled: bool,
    /// Event queue
    pub eq: EqId,
}

/// Completion queue manager
pub struct CqManager {
    slots: Vec<RwLock<Option<Arc<CqState>>>>,
}

impl CqManager {
    /// Create a manager with `count` unallocated CQs
    pub fn new(count: u32) -> Self {
        Self {
            slots: (0..count).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Number of CQ slots
    pub fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn unknown(cq: CqId) -> DatapathError {
        DatapathError::UnknownQueue { kind: QueueKind::Completion, queue: cq }
    }

    /// Look up live CQ state
    pub fn get(&self, cq: CqId) -> DatapathResult<Arc<CqState>> {
        self.slots
            .get(cq as usize)
            .and_then(|slot| slot.read().clone())
            .ok_or_else(|| Self::unknown(cq))
    }

    /// Configure CQ `cq` reporting to event queue `eq`
    pub fn allocate_at(&self, cq: CqId, params: RingParams, eq: EqId) -> DatapathResult<()> {
        params.validate()?;
        let slot = self.slots.get(cq as usize).ok_or_else(|| Self::unknown(cq))?;
        let mut slot = slot.write();
        if slot.as_ref().map_or(false, |s| s.enabled.load(Ordering::Acquire)) {
            return Err(DatapathError::InvalidConfig(format!("cq {} enabled", cq)));
        }
        *slot = Some(Arc::new(CqState {
            id: cq,
            ring: params,
            eq,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            enabled: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }));
        Ok(())
    }

    /// Configure the lowest free CQ
    pub fn allocate(&self, params: RingParams, eq: EqId) -> DatapathResult<CqId> {
        let free = self
            .slots
            .iter()
            .position(|slot| slot.read().is_none())
            .ok_or_else(|| DatapathError::InvalidConfig("no free completion queue".into()))?;
        self.allocate_at(free as CqId, params, eq)?;
        Ok(free as CqId)
    }

    /// Set the enable bit
    pub fn enable(&self, cq: CqId) -> DatapathResult<()> {
        self.get(cq)?.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Clear the enable bit
    pub fn disable(&self, cq: CqId) -> DatapathResult<()> {
        self.get(cq)?.enabled.store(false, Ordering::Release);
        Ok(())
    }

    /// Host consumer doorbell
    ///
    /// The consumer index only moves forward and never past the producer.
    pub fn doorbell(&self, cq: CqId, new_tail: u32) -> DatapathResult<()> {
        let state = self.get(cq)?;
        let head = state.head();
        let tail = state.tail();
        if new_tail.wrapping_sub(tail) > ring::occupancy(head, tail) {
            return Err(DatapathError::RingOverflow {
                kind: QueueKind::Completion,
                queue: cq,
                head,
                tail: new_tail,
            });
        }
        state.tail.store(new_tail, Ordering::Release);
        Ok(())
    }

    /// Append one completion record
    ///
    /// `CompletionQueueFull` is backpressure: the caller retries once the
    /// host has advanced the consumer index.
    pub fn write(
        &self,
        cq: CqId,
        record: &CompletionRecord,
        mem: &dyn HostMemory,
    ) -> DatapathResult<CplWrite> {
        let state = self.get(cq)?;
        if !state.enabled.load(Ordering::Acquire) {
            return Err(DatapathError::QueueDisabled { kind: QueueKind::Completion, queue: cq });
        }

        let _guard = state.write_lock.lock();
        let head = state.head();
        if ring::is_full(head, state.tail(), state.ring.capacity()) {
            return Err(DatapathError::CompletionQueueFull { cq });
        }

        let raw = record.encode(ring::phase(head, state.ring.size_log2));
        mem.write(state.ring.slot_address(head, CPL_SIZE), &raw)?;
        state.head.store(head.wrapping_add(1), Ordering::Release);

        tracing::trace!(cq = state.id, index = head, queue = record.queue_id, "completion written");
        Ok(CplWrite { index: head, eq: state.eq })
    }

    /// Status register snapshot
    pub fn status(&self, cq: CqId) -> DatapathResult<CqStatus> {
        let state = self.get(cq)?;
        Ok(CqStatus {
            head: state.head(),
            tail: state.tail(),
            enabled: state.enabled.load(Ordering::Acquire),
            eq: state.eq,
        })
    }
}

/// Completion write path shared by the engines: CQ record, then one EQ
/// event per record
pub struct CompletionPath {
    cqs: Arc<CqManager>,
    eqs: Arc<EventQueueManager>,
    mem: Arc<dyn HostMemory>,
}

impl CompletionPath {
    /// Bind CQs and EQs to the host memory their records land in
    pub fn new(cqs: Arc<CqManager>, eqs: Arc<EventQueueManager>, mem: Arc<dyn HostMemory>) -> Self {
        Self { cqs, eqs, mem }
    }

    /// Completion queues
    pub fn cqs(&self) -> &CqManager {
        &self.cqs
    }

    /// Event queues
    pub fn eqs(&self) -> &EventQueueManager {
        &self.eqs
    }

    /// Host memory the records land in
    pub fn memory(&self) -> &dyn HostMemory {
        self.mem.as_ref()
    }

    /// Write one completion and advance its event queue
    pub fn post(&self, cq: CqId, record: &CompletionRecord) -> DatapathResult<CplWrite> {
        let written = self.cqs.write(cq, record, self.mem.as_ref())?;
        let event = EventRecord { event_type: EventType::Completion, source: cq as u16 };
        self.eqs.notify(written.eq, event, self.mem.as_ref())?;
        Ok(written)
    }

    /// Report a queue fault on the event queue behind `cq`
    pub fn fault_event(&self, cq: Option<CqId>, queue: QueueId) -> DatapathResult<()> {
        let cq = match cq {
            Some(cq) => cq,
            None => return Ok(()),
        };
        let eq = self.cqs.get(cq)?.eq();
        let event = EventRecord { event_type: EventType::QueueFault, source: queue as u16 };
        self.eqs.notify(eq, event, self.mem.as_ref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostmem::DmaRegion;

    fn setup() -> (CqManager, DmaRegion) {
        let cqm = CqManager::new(2);
        cqm.allocate_at(1, RingParams::new(0x100, 2), 0).unwrap();
        cqm.enable(1).unwrap();
        (cqm, DmaRegion::new(4096))
    }

    fn record(tag: u16) -> CompletionRecord {
        CompletionRecord {
            queue_id: 4,
            descriptor_tag: tag,
            length: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_write_with_phase() {
        let (cqm, mem) = setup();
        for tag in 0..4 {
            let w = cqm.write(1, &record(tag), &mem).unwrap();
            assert_eq!(w.index, tag as u32);
        }

        let mut raw = [0u8; CPL_SIZE];
        mem.read(0x100 + 2 * CPL_SIZE as u64, &mut raw).unwrap();
        let (decoded, phase) = CompletionRecord::decode(&raw);
        assert_eq!(decoded.descriptor_tag, 2);
        assert!(phase);

        // Full until the host consumes
        assert!(matches!(
            cqm.write(1, &record(9), &mem),
            Err(DatapathError::CompletionQueueFull { cq: 1 })
        ));
        cqm.doorbell(1, 2).unwrap();
        let w = cqm.write(1, &record(9), &mem).unwrap();
        assert_eq!(w.index, 4);

        // Second lap flips the phase
        mem.read(0x100, &mut raw).unwrap();
        let (decoded, phase) = CompletionRecord::decode(&raw);
        assert_eq!(decoded.descriptor_tag, 9);
        assert!(!phase);
    }

    #[test]
    fn test_every_write_reports_its_eq() {
        let cqm = CqManager::new(1);
        cqm.allocate_at(0, RingParams::new(0x100, 2), 3).unwrap();
        cqm.enable(0).unwrap();
        let mem = DmaRegion::new(4096);
        for tag in 0..3 {
            assert_eq!(cqm.write(0, &record(tag), &mem).unwrap().eq, 3);
        }
    }

    #[test]
    fn test_disabled_and_unknown() {
        let (cqm, mem) = setup();
        cqm.disable(1).unwrap();
        assert!(matches!(
            cqm.write(1, &record(0), &mem),
            Err(DatapathError::QueueDisabled { .. })
        ));
        assert!(matches!(cqm.doorbell(0, 0), Err(DatapathError::UnknownQueue { .. })));
    }

    #[test]
    fn test_completion_path_notifies_eq() {
        use crate::event::InterruptLog;
        use crate::hostmem::DmaRegion;

        let cqs = Arc::new(CqManager::new(1));
        cqs.allocate_at(0, RingParams::new(0x100, 2), 0).unwrap();
        cqs.enable(0).unwrap();
        let log = Arc::new(InterruptLog::new());
        let eqs = Arc::new(EventQueueManager::new(1, log.clone()));
        eqs.allocate_at(0, None, 3).unwrap();
        let path = CompletionPath::new(cqs.clone(), eqs.clone(), Arc::new(DmaRegion::new(4096)));

        // Unarmed EQ: the counter advances, nothing is raised
        path.post(0, &record(0)).unwrap();
        assert_eq!(eqs.counter(0).unwrap(), 1);
        assert_eq!(log.count(3), 0);

        // Re-arm with an unacknowledged event raises at once
        assert!(eqs.arm(0).unwrap());
        eqs.acknowledge(0, 1).unwrap();
        assert!(!eqs.arm(0).unwrap());

        // One interrupt for the next burst, one count per completion
        path.post(0, &record(1)).unwrap();
        path.post(0, &record(2)).unwrap();
        assert_eq!(eqs.counter(0).unwrap(), 3);
        assert_eq!(log.count(3), 2);

        path.fault_event(Some(0), 5).unwrap();
        path.fault_event(None, 5).unwrap();
        assert_eq!(eqs.counter(0).unwrap(), 4);
    }

    #[test]
    fn test_doorbell_past_head_rejected() {
        let (cqm, mem) = setup();
        cqm.write(1, &record(0), &mem).unwrap();
        assert!(cqm.doorbell(1, 1).is_ok());
        assert!(cqm.doorbell(1, 3).is_err());
    }

    #[test]
    fn test_doorbell_backwards_rejected() {
        let (cqm, mem) = setup();
        cqm.write(1, &record(0), &mem).unwrap();
        cqm.doorbell(1, 1).unwrap();

        // head = tail = 1: moving the consumer back to 0 is not allowed
        assert!(matches!(
            cqm.doorbell(1, 0),
            Err(DatapathError::RingOverflow { tail: 0, .. })
        ));
        assert_eq!(cqm.status(1).unwrap().tail, 1);

        // Staying put is fine
        cqm.doorbell(1, 1).unwrap();
        cqm.write(1, &record(1), &mem).unwrap();
        cqm.write(1, &record(2), &mem).unwrap();
        cqm.doorbell(1, 2).unwrap();
        assert!(cqm.doorbell(1, 1).is_err());
        cqm.doorbell(1, 3).unwrap();
    }
}
