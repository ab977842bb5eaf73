//! TX Engine
//!
//! Moves descriptors from host transmit rings to the wire.
//!
//! # Pipeline
//!
//! ```text
//!  fetch (serialized)        data (parallel)         completion (serialized)
//! ┌────────────────────┐   ┌──────────────────┐    ┌──────────────────────────┐
//! │ grant ─► allocate  │   │ validate         │    │ send ─► CQ write ─► EQ   │
//! │ ─► read descriptor │──►│ ─► payload read  │──► │ ─► release tag           │
//! │ ─► advance tail    │   │ ─► checksum      │    │ (op-table order)         │
//! └────────────────────┘   └──────────────────┘    └──────────────────────────┘
//! ```
//!
//! The fetch stage consumes descriptors strictly in ring order. The
//! completion stage only sees entries the operation table has released in
//! allocation order, so frames leave each queue in submission order even
//! when several workers run the data stage concurrently.

use crate::backoff::retry;
use crate::checksum::insert_checksum;
use crate::clock::Clock;
use crate::cq::CompletionPath;
use crate::hostmem::HostMemory;
use crate::optable::{OpEntry, OperationTable};
use crate::queue::{QueueManager, QueueState};
use crate::ring::{CompletionRecord, CplErrorFlags, Descriptor, DESC_SIZE};
use crate::scheduler::RoundRobinScheduler;
use crate::stats::EngineStats;
use crate::transport::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use qnic_common::{
    CqId, DatapathError, DatapathResult, DescriptorFault, FaultCode, NicConfig, PortId, QueueId,
    QueueKind, RetryPolicy, Tag, Timestamp,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-descriptor progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    /// Descriptor read, tag allocated
    Fetching,
    /// Payload read and checksum pending
    ChecksumApply,
    /// Frame ready for the wire
    Transmitting,
    /// Sent (or rejected); completion record pending
    CompletionWrite,
    /// Tag returned to the table
    Released,
}

/// Outcome of one fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetched {
    /// A descriptor was consumed under this tag
    Op(Tag),
    /// The granted queue faulted before a tag was taken
    Faulted,
    /// No eligible queue holds a descriptor, or the table is full
    Idle,
}

/// Operation-table metadata for one transmit
#[derive(Debug)]
pub struct TxOp {
    queue: Arc<QueueState>,
    index: u32,
    descriptor: Descriptor,
    port: PortId,
    cq: Option<CqId>,
    frame: Option<Bytes>,
    error: CplErrorFlags,
    stage: TxStage,
}

impl TxOp {
    /// Current stage
    pub fn stage(&self) -> TxStage {
        self.stage
    }
}

/// Transmit engine
pub struct TxEngine {
    queues: Arc<QueueManager>,
    completions: Arc<CompletionPath>,
    mem: Arc<dyn HostMemory>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    scheduler: RoundRobinScheduler,
    table: OperationTable<TxOp>,
    fetch_lock: Mutex<()>,
    /// Entries released in order, waiting for the wire or a CQ slot
    ready: Mutex<VecDeque<OpEntry<TxOp>>>,
    drain_lock: Mutex<()>,
    checksum_enable: AtomicBool,
    max_tx_size: u32,
    retry: RetryPolicy,
    stats: EngineStats,
}

impl TxEngine {
    /// Engine over `queues`, sending on `transport`
    pub fn new(
        config: &NicConfig,
        queues: Arc<QueueManager>,
        completions: Arc<CompletionPath>,
        mem: Arc<dyn HostMemory>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduler: RoundRobinScheduler::new(queues.count(), config.num_ports),
            queues,
            completions,
            mem,
            transport,
            clock,
            table: OperationTable::new(config.tx_op_table_size),
            fetch_lock: Mutex::new(()),
            ready: Mutex::new(VecDeque::new()),
            drain_lock: Mutex::new(()),
            checksum_enable: AtomicBool::new(config.checksum_enable),
            max_tx_size: config.max_tx_size,
            retry: config.retry.clone(),
            stats: EngineStats::default(),
        }
    }

    /// Queue scheduler
    pub fn scheduler(&self) -> &RoundRobinScheduler {
        &self.scheduler
    }

    /// Engine counters
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Operations currently holding a tag
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Global checksum offload switch
    pub fn set_checksum_enable(&self, enable: bool) {
        self.checksum_enable.store(enable, Ordering::Release);
    }

    /// Doorbell hint from the host
    pub fn notify(&self, queue: QueueId) -> DatapathResult<()> {
        self.scheduler.notify(queue)
    }

    /// Mark the queue active only if it holds unfetched descriptors
    pub fn notify_pending(&self, queue: QueueId) -> DatapathResult<bool> {
        if !self.queues.get(queue)?.is_serviceable() {
            return Ok(false);
        }
        self.scheduler.notify(queue)?;
        Ok(true)
    }

    /// Nothing fetched, nothing waiting
    pub fn is_idle(&self) -> bool {
        self.table.is_empty() && !self.scheduler.has_active()
    }

    /// Process one descriptor (if any queue is eligible) and drain the
    /// completion stage; returns the number of operations that progressed
    pub fn poll(&self) -> DatapathResult<usize> {
        let mut progressed = 0;
        match self.fetch()? {
            Fetched::Op(tag) => {
                self.process(tag)?;
                progressed += 1;
            }
            Fetched::Faulted => progressed += 1,
            Fetched::Idle => {}
        }
        progressed += self.drain()?;
        Ok(progressed)
    }

    /// Poll until no queue has work left; returns descriptors completed
    pub fn run_until_idle(&self) -> DatapathResult<usize> {
        let start = self.stats.completions.load(Ordering::Relaxed);
        while self.poll()? > 0 {}
        Ok((self.stats.completions.load(Ordering::Relaxed) - start) as usize)
    }

    /// Fetch stage: grant, allocate a tag, read the descriptor, consume it
    ///
    /// Granted queues that turn out to be empty are deactivated and the
    /// grant moves on, so one stale activation never hides the others.
    fn fetch(&self) -> DatapathResult<Fetched> {
        let _fetch = self.fetch_lock.lock();
        if !self.table.has_capacity() {
            self.stats.record_table_full();
            return Ok(Fetched::Idle);
        }

        let queues = &self.queues;
        let eligible = |q: QueueId| {
            queues
                .get(q)
                .map_or(false, |s| s.is_enabled() && s.fault().is_none())
        };
        let mut misses = 0;
        let (queue, offset) = loop {
            let queue = match self.scheduler.grant(&eligible) {
                Some(q) => q,
                None => return Ok(Fetched::Idle),
            };
            match self.queues.enqueue_descriptor(queue) {
                Ok(offset) => break (queue, offset),
                Err(
                    DatapathError::QueueEmpty { .. }
                    | DatapathError::QueueDisabled { .. }
                    | DatapathError::QueueFaulted { .. }
                    | DatapathError::UnknownQueue { .. },
                ) => {
                    self.scheduler.deactivate(queue);
                    // A doorbell may have landed between the check and deactivate
                    if self.queues.get(queue).map_or(false, |s| s.is_serviceable()) {
                        self.scheduler.notify(queue)?;
                    }
                    misses += 1;
                    if misses > self.queues.count() {
                        return Ok(Fetched::Idle);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let state = self.queues.get(queue)?;
        let mut raw = [0u8; DESC_SIZE];
        if let Err(e) = self.mem.read(offset.address, &mut raw) {
            tracing::warn!(queue, index = offset.index, error = %e, "descriptor read failed");
            self.fault_queue(&state, &e);
            return Ok(Fetched::Faulted);
        }
        let descriptor = Descriptor::decode(&raw);

        let op = TxOp {
            queue: state.clone(),
            index: offset.index,
            descriptor,
            port: self.scheduler.queue_port(queue),
            cq: state.cq(),
            frame: None,
            error: CplErrorFlags::empty(),
            stage: TxStage::Fetching,
        };
        let tag = self.table.allocate(queue, offset.index, op)?;
        self.queues.advance_consumer(queue, 1)?;
        state.begin_op();

        tracing::trace!(queue, index = offset.index, tag, len = descriptor.length, "tx fetch");
        Ok(Fetched::Op(tag))
    }

    fn validate(&self, descriptor: &Descriptor) -> Result<(), DescriptorFault> {
        if descriptor.length == 0 {
            return Err(DescriptorFault::ZeroLength);
        }
        if descriptor.length > self.max_tx_size {
            return Err(DescriptorFault::TooLong { len: descriptor.length, max: self.max_tx_size });
        }
        if !self.mem.contains(descriptor.buffer_address, descriptor.length as u64) {
            return Err(DescriptorFault::AddressOutOfRange {
                addr: descriptor.buffer_address,
                len: descriptor.length,
            });
        }
        Ok(())
    }

    /// Data stage: payload read and checksum, outside both locks
    fn process(&self, tag: Tag) -> DatapathResult<()> {
        let (state, index, descriptor) = self.table.metadata_mut(tag, |op| {
            op.stage = TxStage::ChecksumApply;
            (op.queue.clone(), op.index, op.descriptor)
        })?;
        let queue = state.id();

        let result = self.validate(&descriptor).and_then(|()| {
            let mut payload = vec![0u8; descriptor.length as usize];
            self.mem
                .read(descriptor.buffer_address, &mut payload)
                .map_err(|_| DescriptorFault::AddressOutOfRange {
                    addr: descriptor.buffer_address,
                    len: descriptor.length,
                })?;
            if let Some(cmd) = descriptor.checksum_command() {
                if self.checksum_enable.load(Ordering::Acquire) {
                    insert_checksum(&mut payload, cmd)?;
                    self.stats.record_checksum();
                }
            }
            Ok(Bytes::from(payload))
        });

        match result {
            Ok(frame) => {
                self.table.metadata_mut(tag, |op| {
                    op.frame = Some(frame);
                    op.stage = TxStage::Transmitting;
                })?;
            }
            Err(fault) => {
                let err = DatapathError::InvalidDescriptor {
                    kind: QueueKind::Tx,
                    queue,
                    index,
                    fault,
                };
                tracing::warn!(queue, tag = descriptor.tag, error = %err, "tx descriptor rejected");
                self.fault_queue(&state, &err);
                self.table.metadata_mut(tag, |op| {
                    op.error = CplErrorFlags::INVALID_DESCRIPTOR;
                    op.stage = TxStage::CompletionWrite;
                })?;
            }
        }
        self.table.mark_in_flight(tag)?;

        let mut ready = self.ready.lock();
        ready.extend(self.table.complete(tag)?);
        Ok(())
    }

    /// Halt the queue with the fault code `error` maps to
    fn fault_queue(&self, state: &QueueState, error: &DatapathError) {
        let code = error.fault_code().unwrap_or(FaultCode::DmaError);
        if state.set_fault(code) {
            self.stats.record_fault("tx");
            tracing::warn!(queue = state.id(), ?code, "tx queue faulted");
            if let Err(e) = self.completions.fault_event(state.cq(), state.id()) {
                tracing::warn!(queue = state.id(), error = %e, "fault event not delivered");
            }
        }
        self.scheduler.deactivate(state.id());
    }

    /// Completion stage: transmit and complete released entries in order
    ///
    /// Stops at the first entry that still cannot make progress (wire or
    /// CQ backpressure past the retry budget); it is resumed next poll.
    /// One worker drains at a time; `ready` is only locked to take or
    /// return the head entry, so the data stage never waits on a backoff.
    fn drain(&self) -> DatapathResult<usize> {
        let _drain = match self.drain_lock.try_lock() {
            Some(guard) => guard,
            None => return Ok(0),
        };
        let mut done = 0;

        loop {
            let next = self.ready.lock().pop_front();
            let mut entry = match next {
                Some(entry) => entry,
                None => break,
            };
            match self.complete_entry(&mut entry) {
                Ok(true) => {}
                Ok(false) => {
                    self.ready.lock().push_front(entry);
                    break;
                }
                Err(e) => {
                    self.ready.lock().push_front(entry);
                    return Err(e);
                }
            }

            let state = entry.metadata.queue.clone();
            self.table.release(entry.tag)?;
            state.end_op();
            self.stats.record_completion();
            done += 1;
        }
        Ok(done)
    }

    /// Send the frame (once) and post its completion; false on backpressure
    fn complete_entry(&self, entry: &mut OpEntry<TxOp>) -> DatapathResult<bool> {
        let op = &mut entry.metadata;

        if op.stage == TxStage::Transmitting {
            if let Some(frame) = op.frame.clone() {
                let len = frame.len() as u64;
                let port = op.port;
                let sent = retry(&self.retry, || self.transport.send(port, frame.clone()));
                self.stats.record_retries(sent.attempts.saturating_sub(1));
                match sent.result {
                    Ok(()) => self.stats.record_packet(len),
                    Err(DatapathError::TransportBusy) => {
                        tracing::debug!(queue = entry.queue, port, "transport busy, deferring");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
            op.stage = TxStage::CompletionWrite;
        }

        if let Some(cq) = op.cq {
            let record = CompletionRecord {
                queue_id: entry.queue as u16,
                descriptor_tag: op.descriptor.tag,
                length: if op.error.is_empty() { op.descriptor.length } else { 0 },
                error_flags: op.error,
                timestamp: self.timestamp(),
                descriptor_index: entry.descriptor_index,
                ..Default::default()
            };
            let posted = retry(&self.retry, || self.completions.post(cq, &record));
            match posted.result {
                Ok(_) => {}
                Err(DatapathError::CompletionQueueFull { .. }) => {
                    self.stats.record_cq_full();
                    tracing::warn!(cq, queue = entry.queue, "completion queue full, deferring");
                    return Ok(false);
                }
                Err(e) => {
                    tracing::warn!(cq, queue = entry.queue, error = %e, "completion dropped");
                }
            }
        }

        op.stage = TxStage::Released;
        Ok(true)
    }

    fn timestamp(&self) -> Timestamp {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cq::CqManager;
    use crate::event::{EventQueueManager, NullInterrupts};
    use crate::hostmem::DmaRegion;
    use crate::ring::{RingParams, CPL_SIZE};
    use crate::transport::CaptureTransport;

    const TX_RING: u64 = 0x1000;
    const CQ_RING: u64 = 0x2000;
    const BUFFERS: u64 = 0x10000;

    struct Rig {
        engine: TxEngine,
        queues: Arc<QueueManager>,
        cqs: Arc<CqManager>,
        mem: Arc<DmaRegion>,
        wire: Arc<CaptureTransport>,
    }

    fn rig() -> Rig {
        rig_with(NicConfig { tx_queues: 4, ..NicConfig::default() })
    }

    fn rig_with(config: NicConfig) -> Rig {
        let mem = Arc::new(DmaRegion::new(1 << 20));
        let queues = Arc::new(QueueManager::new(QueueKind::Tx, 4));
        let cqs = Arc::new(CqManager::new(1));
        let eqs = Arc::new(EventQueueManager::new(1, Arc::new(NullInterrupts)));
        eqs.allocate_at(0, None, 0).unwrap();
        cqs.allocate_at(0, RingParams::new(CQ_RING, 6), 0).unwrap();
        cqs.enable(0).unwrap();
        let path = Arc::new(CompletionPath::new(cqs.clone(), eqs, mem.clone()));
        let wire = Arc::new(CaptureTransport::new());
        let engine = TxEngine::new(
            &config,
            queues.clone(),
            path,
            mem.clone(),
            wire.clone(),
            Arc::new(ManualClock::new(1000)),
        );
        for q in 0..2 {
            queues.allocate_at(q, RingParams::new(TX_RING + q as u64 * 0x400, 4)).unwrap();
            queues.set_cq(q, 0).unwrap();
            queues.enable(q).unwrap();
            engine.scheduler().enable_queue(q, true).unwrap();
        }
        Rig { engine, queues, cqs, mem, wire }
    }

    fn post(rig: &Rig, queue: QueueId, index: u32, payload: &[u8], desc: Descriptor) {
        rig.mem.write(desc.buffer_address, payload).unwrap();
        post_desc(rig, queue, index, desc);
    }

    fn post_desc(rig: &Rig, queue: QueueId, index: u32, desc: Descriptor) {
        let ring = rig.queues.get(queue).unwrap().ring();
        rig.mem.write(ring.slot_address(index, DESC_SIZE), &desc.encode()).unwrap();
        rig.queues.doorbell(queue, index + 1).unwrap();
        rig.engine.notify(queue).unwrap();
    }

    fn completion(rig: &Rig, index: u32) -> CompletionRecord {
        let mut raw = [0u8; CPL_SIZE];
        rig.mem.read(CQ_RING + index as u64 * CPL_SIZE as u64, &mut raw).unwrap();
        CompletionRecord::decode(&raw).0
    }

    #[test]
    fn test_single_frame() {
        let rig = rig();
        let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        post(&rig, 0, 0, &payload, Descriptor::new(BUFFERS, 1024, 42));

        assert_eq!(rig.engine.run_until_idle().unwrap(), 1);
        let frames = rig.wire.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].1[..], &payload[..]);

        let cpl = completion(&rig, 0);
        assert_eq!(cpl.descriptor_tag, 42);
        assert_eq!(cpl.length, 1024);
        assert_eq!(cpl.timestamp.as_nanos(), 1000);
        assert!(cpl.error_flags.is_empty());
        assert_eq!(rig.cqs.status(0).unwrap().head, 1);
        assert!(rig.engine.is_idle());
        assert_eq!(rig.queues.get(0).unwrap().in_flight(), 0);
    }

    #[test]
    fn test_checksum_offload_toggle() {
        let rig = rig();
        let mut payload = vec![0x11u8; 128];
        payload[40] = 0;
        payload[41] = 0;
        let desc = Descriptor::new(BUFFERS, 128, 1).with_checksum(34, 6);
        post(&rig, 0, 0, &payload, desc);
        rig.engine.run_until_idle().unwrap();
        let sent = rig.wire.take();
        assert_eq!(rig.engine.stats().snapshot().checksum_offloads, 1);
        assert_eq!(crate::checksum::fold(crate::checksum::ones_complement_sum(&sent[0].1[34..])), 0xFFFF);

        rig.engine.set_checksum_enable(false);
        post(&rig, 0, 1, &payload, desc);
        rig.engine.run_until_idle().unwrap();
        assert_eq!(&rig.wire.take()[0].1[..], &payload[..]);
    }

    #[test]
    fn test_invalid_descriptor_faults_queue() {
        let rig = rig();
        post(&rig, 0, 0, &[1, 2, 3], Descriptor::new(BUFFERS, 0, 7));
        post(&rig, 1, 0, &[4, 5, 6], Descriptor::new(BUFFERS + 0x1000, 3, 8));

        rig.engine.run_until_idle().unwrap();
        assert_eq!(rig.queues.get(0).unwrap().fault(), Some(FaultCode::InvalidDescriptor));
        assert_eq!(rig.queues.get(1).unwrap().fault(), None);
        assert_eq!(rig.wire.count(), 1);

        let errored = (0..2).map(|i| completion(&rig, i)).find(|c| c.queue_id == 0).unwrap();
        assert_eq!(errored.error_flags, CplErrorFlags::INVALID_DESCRIPTOR);
        assert_eq!(errored.descriptor_tag, 7);
        assert_eq!(rig.engine.stats().snapshot().faults, 1);
    }

    #[test]
    fn test_oversize_and_out_of_range() {
        let rig = rig();
        post(&rig, 0, 0, &[0], Descriptor::new(BUFFERS, 9215, 1));
        rig.engine.run_until_idle().unwrap();
        assert!(rig.queues.get(0).unwrap().fault().is_some());

        post_desc(&rig, 1, 0, Descriptor::new(1 << 20, 64, 2));
        rig.engine.run_until_idle().unwrap();
        assert!(rig.queues.get(1).unwrap().fault().is_some());
        assert_eq!(rig.wire.count(), 0);
    }

    #[test]
    fn test_transport_busy_retried() {
        let rig = rig();
        rig.wire.inject_busy(3);
        post(&rig, 0, 0, &[9u8; 60], Descriptor::new(BUFFERS, 60, 0));
        rig.engine.run_until_idle().unwrap();
        assert_eq!(rig.wire.count(), 1);
        assert_eq!(rig.engine.stats().snapshot().busy_retries, 3);
    }

    #[test]
    fn test_transport_stall_resumes() {
        let rig = rig();
        rig.wire.inject_busy(1000);
        post(&rig, 0, 0, &[9u8; 60], Descriptor::new(BUFFERS, 60, 0));
        rig.engine.run_until_idle().unwrap();
        assert_eq!(rig.wire.count(), 0);
        assert_eq!(rig.engine.in_flight(), 1);

        rig.wire.inject_busy(0);
        rig.engine.run_until_idle().unwrap();
        assert_eq!(rig.wire.count(), 1);
        assert_eq!(rig.engine.in_flight(), 0);
    }

    #[test]
    fn test_backoff_does_not_block_data_stage() {
        use qnic_common::BackoffKind;
        use std::time::{Duration, Instant};

        let retry = RetryPolicy {
            max_attempts: 60,
            backoff: BackoffKind::Fixed,
            base_delay_us: 10_000,
            max_delay_us: 10_000,
        };
        let rig = rig_with(NicConfig { tx_queues: 4, retry, ..NicConfig::default() });
        rig.wire.inject_busy(u32::MAX);
        post(&rig, 0, 0, &[1u8; 64], Descriptor::new(BUFFERS, 64, 0));

        std::thread::scope(|scope| {
            let stalled = scope.spawn(|| rig.engine.poll().unwrap());
            std::thread::sleep(Duration::from_millis(30));

            // Fetch and data stage complete while the first frame backs off
            post(&rig, 1, 0, &[2u8; 64], Descriptor::new(BUFFERS + 0x1000, 64, 1));
            let start = Instant::now();
            assert_eq!(rig.engine.poll().unwrap(), 1);
            assert!(start.elapsed() < Duration::from_millis(150));
            assert_eq!(rig.engine.in_flight(), 2);
            stalled.join().unwrap();
        });

        rig.wire.inject_busy(0);
        rig.engine.run_until_idle().unwrap();
        let frames = rig.wire.take();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].1[..], &[1u8; 64][..]);
        assert_eq!(rig.engine.in_flight(), 0);
    }

    #[test]
    fn test_empty_grant_does_not_end_pass() {
        let rig = rig();
        // Queue 0 is marked active with nothing posted
        rig.engine.notify(0).unwrap();
        for k in 0..3u32 {
            let addr = BUFFERS + k as u64 * 0x100;
            post(&rig, 1, k, &[k as u8; 60], Descriptor::new(addr, 60, k as u16));
        }

        assert_eq!(rig.engine.run_until_idle().unwrap(), 3);
        assert_eq!(rig.wire.count(), 3);
        assert!(rig.engine.is_idle());
    }

    #[test]
    fn test_notify_pending_skips_empty_queue() {
        let rig = rig();
        assert!(!rig.engine.notify_pending(0).unwrap());
        assert!(!rig.engine.scheduler().has_active());

        let ring = rig.queues.get(0).unwrap().ring();
        let desc = Descriptor::new(BUFFERS, 60, 0);
        rig.mem.write(ring.slot_address(0, DESC_SIZE), &desc.encode()).unwrap();
        rig.queues.doorbell(0, 1).unwrap();
        assert!(rig.engine.notify_pending(0).unwrap());
        assert!(rig.engine.scheduler().has_active());
    }

    #[test]
    fn test_disabled_queue_not_fetched() {
        let rig = rig();
        rig.queues.disable(0).unwrap();
        post(&rig, 0, 0, &[1u8; 64], Descriptor::new(BUFFERS, 64, 0));
        assert_eq!(rig.engine.run_until_idle().unwrap(), 0);
        assert_eq!(rig.queues.status(0).unwrap().tail, 0);
        assert!(rig.queues.is_quiesced(0).unwrap());
    }
}
