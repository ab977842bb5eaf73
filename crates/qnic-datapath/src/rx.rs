//! RX Engine
//!
//! Receives frames from the link, steers each one to a receive queue and
//! writes it into the next posted host buffer of that queue.
//!
//! Frames wait in a bounded FIFO per port. A full FIFO pushes back on the
//! link (`TransportBusy`); a paused port keeps its frames queued until it
//! is released. Frames that find no usable descriptor are dropped, never
//! retried.

use crate::backoff::retry;
use crate::checksum::rx_checksum;
use crate::clock::Clock;
use crate::cq::CompletionPath;
use crate::hostmem::HostMemory;
use crate::optable::{OpEntry, OperationTable};
use crate::queue::{QueueManager, QueueState};
use crate::queue_map::RxQueueMapper;
use crate::ring::{CompletionRecord, CplErrorFlags, Descriptor, DESC_SIZE};
use crate::rss::FlowHasher;
use crate::stats::EngineStats;
use crate::ETH_HEADER_LEN;
use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use qnic_common::{
    CqId, DatapathError, DatapathResult, DescriptorFault, DropReason, FaultCode, NicConfig,
    PortId, QueueId, QueueKind, RetryPolicy, Tag,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A frame waiting in the RX FIFO
#[derive(Debug, Clone)]
pub struct RxFrame {
    /// Ingress port
    pub port: PortId,
    /// Frame bytes
    pub data: Bytes,
    /// Bypass the queue mapper
    pub dest_override: Option<QueueId>,
}

/// Operation-table metadata for one receive
#[derive(Debug)]
pub struct RxOp {
    queue: Arc<QueueState>,
    cq: Option<CqId>,
    record: CompletionRecord,
}

struct PortFifo {
    tx: Sender<RxFrame>,
    rx: Receiver<RxFrame>,
    paused: AtomicBool,
}

/// Receive engine
pub struct RxEngine {
    queues: Arc<QueueManager>,
    completions: Arc<CompletionPath>,
    mem: Arc<dyn HostMemory>,
    clock: Arc<dyn Clock>,
    mapper: RxQueueMapper,
    hasher: FlowHasher,
    table: OperationTable<RxOp>,
    ports: Vec<PortFifo>,
    next_port: AtomicUsize,
    fetch_lock: Mutex<()>,
    ready: Mutex<VecDeque<OpEntry<RxOp>>>,
    max_rx_size: u32,
    checksum_skip: usize,
    retry: RetryPolicy,
    stats: EngineStats,
}

impl RxEngine {
    /// Engine over `queues`, writing completions through `completions`
    pub fn new(
        config: &NicConfig,
        queues: Arc<QueueManager>,
        completions: Arc<CompletionPath>,
        mem: Arc<dyn HostMemory>,
        clock: Arc<dyn Clock>,
    ) -> DatapathResult<Self> {
        let ports = (0..config.num_ports)
            .map(|_| {
                let (tx, rx) = bounded(config.rx_fifo_depth);
                PortFifo { tx, rx, paused: AtomicBool::new(false) }
            })
            .collect();
        Ok(Self {
            queues,
            completions,
            mem,
            clock,
            mapper: RxQueueMapper::from_config(config),
            hasher: FlowHasher::from_config(&config.rss_hash)?,
            table: OperationTable::new(config.rx_op_table_size),
            ports,
            next_port: AtomicUsize::new(0),
            fetch_lock: Mutex::new(()),
            ready: Mutex::new(VecDeque::new()),
            max_rx_size: config.max_rx_size,
            checksum_skip: config.rx_checksum_skip,
            retry: config.retry.clone(),
            stats: EngineStats::default(),
        })
    }

    /// Queue mapping registers
    pub fn mapper(&self) -> &RxQueueMapper {
        &self.mapper
    }

    /// Engine counters
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Receives holding a tag
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    fn port(&self, port: PortId) -> DatapathResult<&PortFifo> {
        self.ports
            .get(port as usize)
            .ok_or_else(|| DatapathError::InvalidConfig(format!("unknown port {}", port)))
    }

    /// Frame arriving from the link
    pub fn deliver(&self, port: PortId, data: Bytes) -> DatapathResult<()> {
        self.enqueue(RxFrame { port, data, dest_override: None })
    }

    /// Frame arriving with a fixed destination queue
    pub fn deliver_to(&self, port: PortId, data: Bytes, queue: QueueId) -> DatapathResult<()> {
        self.enqueue(RxFrame { port, data, dest_override: Some(queue) })
    }

    fn enqueue(&self, frame: RxFrame) -> DatapathResult<()> {
        match self.port(frame.port)?.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(DatapathError::TransportBusy)
            }
        }
    }

    /// Link-level pause on a port
    pub fn set_port_paused(&self, port: PortId, paused: bool) -> DatapathResult<()> {
        self.port(port)?.paused.store(paused, Ordering::Release);
        Ok(())
    }

    /// Frames waiting across all port FIFOs
    pub fn backlog(&self) -> usize {
        self.ports.iter().map(|p| p.rx.len()).sum()
    }

    /// Take the next frame from an unpaused port, rotating between ports
    fn next_frame(&self) -> Option<RxFrame> {
        let n = self.ports.len();
        let start = self.next_port.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &self.ports[(start + i) % n])
            .filter(|p| !p.paused.load(Ordering::Acquire))
            .find_map(|p| p.rx.try_recv().ok())
    }

    /// Process one frame and drain completions; returns operations that
    /// progressed (drops count)
    pub fn poll(&self) -> DatapathResult<usize> {
        let mut progressed = 0;
        if self.receive()? {
            progressed += 1;
        }
        progressed += self.drain()?;
        Ok(progressed)
    }

    /// Poll until every unpaused FIFO is empty
    pub fn run_until_idle(&self) -> DatapathResult<usize> {
        let mut total = 0;
        loop {
            let n = self.poll()?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    fn drop_frame(&self, port: PortId, reason: DropReason) {
        self.stats.record_drop("rx", reason);
        tracing::debug!(port, ?reason, "rx drop");
    }

    /// Take one frame through the pipeline; false when no frame was waiting
    fn receive(&self) -> DatapathResult<bool> {
        // Fetch stage: frames claim descriptors in arrival order
        let (frame, hash, queue, tag, state, index, descriptor) = {
            let _fetch = self.fetch_lock.lock();
            let frame = match self.next_frame() {
                Some(frame) => frame,
                None => return Ok(false),
            };
            let port = frame.port;
            let len = frame.data.len();
            if len < ETH_HEADER_LEN || len > self.max_rx_size as usize {
                self.drop_frame(port, DropReason::BadLength);
                return Ok(true);
            }

            let hash = self.hasher.hash_frame(&frame.data);
            let queue = match self.mapper.select_queue(port, hash.hash, frame.dest_override) {
                Ok(queue) => queue,
                Err(e) => {
                    // The frame already left the FIFO; account for it here
                    self.stats.record_drop("rx", DropReason::UnknownQueue);
                    tracing::warn!(port, hash = hash.hash, error = %e, "no queue for frame, dropped");
                    return Ok(true);
                }
            };
            let offset = match self.queues.enqueue_descriptor(queue) {
                Ok(offset) => offset,
                Err(e) => {
                    let reason = match e {
                        DatapathError::QueueDisabled { .. } => DropReason::QueueDisabled,
                        DatapathError::QueueEmpty { .. } => DropReason::NoDescriptor,
                        DatapathError::QueueFaulted { .. } => DropReason::QueueFaulted,
                        DatapathError::UnknownQueue { .. } => DropReason::UnknownQueue,
                        other => return Err(other),
                    };
                    self.drop_frame(port, reason);
                    return Ok(true);
                }
            };
            let state = self.queues.get(queue)?;

            let mut raw = [0u8; DESC_SIZE];
            if let Err(e) = self.mem.read(offset.address, &mut raw) {
                tracing::warn!(queue, index = offset.index, error = %e, "descriptor read failed");
                self.fault_queue(&state, &e);
                self.drop_frame(port, DropReason::QueueFaulted);
                return Ok(true);
            }
            let descriptor = Descriptor::decode(&raw);

            // Only this stage allocates, so capacity seen here is capacity kept
            let slot = retry(&self.retry, || {
                if self.table.has_capacity() {
                    Ok(())
                } else {
                    self.stats.record_table_full();
                    Err(DatapathError::TableFull)
                }
            });
            if slot.result.is_err() {
                self.drop_frame(port, DropReason::TableFull);
                return Ok(true);
            }
            let op = RxOp { queue: state.clone(), cq: state.cq(), record: CompletionRecord::default() };
            let tag = self.table.allocate(queue, offset.index, op)?;
            self.queues.advance_consumer(queue, 1)?;
            state.begin_op();
            (frame, hash, queue, tag, state, offset.index, descriptor)
        };

        // Data stage
        let port = frame.port;
        let len = frame.data.len();
        let csum = rx_checksum(&frame.data, self.checksum_skip);
        let mut record = CompletionRecord {
            queue_id: queue as u16,
            descriptor_tag: descriptor.tag,
            rx_hash: hash.hash,
            rx_checksum: csum,
            hash_type: hash.hash_type.bits(),
            descriptor_index: index,
            ..Default::default()
        };

        match self.validate(&descriptor) {
            Ok(()) => {
                let copy = len.min(descriptor.length as usize);
                if copy < len {
                    record.error_flags |= CplErrorFlags::TRUNCATED;
                    self.stats.record_truncated();
                }
                match self.mem.write(descriptor.buffer_address, &frame.data[..copy]) {
                    Ok(()) => {
                        record.length = copy as u32;
                        self.stats.record_packet(copy as u64);
                    }
                    Err(e) => {
                        tracing::warn!(queue, error = %e, "rx buffer write failed");
                        record.error_flags |= CplErrorFlags::DMA_ERROR;
                        self.fault_queue(&state, &e);
                    }
                }
            }
            Err(fault) => {
                let err = DatapathError::InvalidDescriptor {
                    kind: QueueKind::Rx,
                    queue,
                    index,
                    fault,
                };
                tracing::warn!(queue, error = %err, "rx descriptor rejected");
                record.error_flags |= CplErrorFlags::INVALID_DESCRIPTOR;
                self.fault_queue(&state, &err);
                self.drop_frame(port, DropReason::QueueFaulted);
            }
        }
        record.timestamp = self.clock.now();

        tracing::trace!(port, queue, tag, len, hash = hash.hash, "rx frame");
        self.finish(tag, record)?;
        Ok(true)
    }

    fn validate(&self, descriptor: &Descriptor) -> Result<(), DescriptorFault> {
        if descriptor.length == 0 {
            return Err(DescriptorFault::ZeroLength);
        }
        if !self.mem.contains(descriptor.buffer_address, descriptor.length as u64) {
            return Err(DescriptorFault::AddressOutOfRange {
                addr: descriptor.buffer_address,
                len: descriptor.length,
            });
        }
        Ok(())
    }

    fn finish(&self, tag: Tag, record: CompletionRecord) -> DatapathResult<()> {
        self.table.metadata_mut(tag, |op| op.record = record)?;
        self.table.mark_in_flight(tag)?;
        let mut ready = self.ready.lock();
        ready.extend(self.table.complete(tag)?);
        Ok(())
    }

    /// Halt the queue with the fault code `error` maps to
    fn fault_queue(&self, state: &QueueState, error: &DatapathError) {
        let code = error.fault_code().unwrap_or(FaultCode::DmaError);
        if state.set_fault(code) {
            self.stats.record_fault("rx");
            tracing::warn!(queue = state.id(), ?code, "rx queue faulted");
            if let Err(e) = self.completions.fault_event(state.cq(), state.id()) {
                tracing::warn!(queue = state.id(), error = %e, "fault event not delivered");
            }
        }
    }

    /// Completion stage: write records in per-queue order
    fn drain(&self) -> DatapathResult<usize> {
        let mut ready = self.ready.lock();
        let mut done = 0;
        while let Some(entry) = ready.front() {
            let op = &entry.metadata;
            if let Some(cq) = op.cq {
                let posted = retry(&self.retry, || self.completions.post(cq, &op.record));
                match posted.result {
                    Ok(_) => {}
                    Err(DatapathError::CompletionQueueFull { .. }) => {
                        self.stats.record_cq_full();
                        tracing::warn!(cq, queue = entry.queue, "completion queue full, deferring");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(cq, queue = entry.queue, error = %e, "completion dropped");
                    }
                }
            }
            let state = op.queue.clone();
            let tag = entry.tag;
            ready.pop_front();
            self.table.release(tag)?;
            state.end_op();
            self.stats.record_completion();
            done += 1;
        }
        Ok(done)
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
    use crate::rss::tests::udp_frame;

    const RX_RING: u64 = 0x1000;
    const CQ_RING: u64 = 0x4000;
    const BUFFERS: u64 = 0x10000;

    struct Rig {
        engine: RxEngine,
        queues: Arc<QueueManager>,
        mem: Arc<DmaRegion>,
    }

    fn rig(config: NicConfig) -> Rig {
        let mem = Arc::new(DmaRegion::new(1 << 20));
        let queues = Arc::new(QueueManager::new(QueueKind::Rx, config.rx_queues));
        let cqs = Arc::new(CqManager::new(1));
        let eqs = Arc::new(EventQueueManager::new(1, Arc::new(NullInterrupts)));
        eqs.allocate_at(0, None, 0).unwrap();
        cqs.allocate_at(0, RingParams::new(CQ_RING, 8), 0).unwrap();
        cqs.enable(0).unwrap();
        let path = Arc::new(CompletionPath::new(cqs, eqs, mem.clone()));
        let engine =
            RxEngine::new(&config, queues.clone(), path, mem.clone(), Arc::new(ManualClock::new(5)))
                .unwrap();
        Rig { engine, queues, mem }
    }

    /// Enable `queue` with `count` posted buffers of `buf_len` bytes
    fn post_buffers(rig: &Rig, queue: QueueId, count: u32, buf_len: u32) {
        let ring = RingParams::new(RX_RING + queue as u64 * 0x400, 6);
        rig.queues.allocate_at(queue, ring).unwrap();
        rig.queues.set_cq(queue, 0).unwrap();
        rig.queues.enable(queue).unwrap();
        for i in 0..count {
            let addr = BUFFERS + (queue as u64 * 64 + i as u64) * 0x2800;
            let desc = Descriptor::new(addr, buf_len, i as u16);
            rig.mem.write(ring.slot_address(i, DESC_SIZE), &desc.encode()).unwrap();
        }
        rig.queues.doorbell(queue, count).unwrap();
    }

    fn completion(rig: &Rig, index: u32) -> CompletionRecord {
        let mut raw = [0u8; CPL_SIZE];
        rig.mem.read(CQ_RING + index as u64 * CPL_SIZE as u64, &mut raw).unwrap();
        CompletionRecord::decode(&raw).0
    }

    #[test]
    fn test_receive_into_buffer() {
        let rig = rig(NicConfig { rx_queues: 2, ..NicConfig::default() });
        post_buffers(&rig, 0, 4, 2048);
        let frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1000, 2000, 1514);
        rig.engine.deliver(0, Bytes::from(frame.clone())).unwrap();
        rig.engine.run_until_idle().unwrap();

        let cpl = completion(&rig, 0);
        assert_eq!(cpl.length, 1514);
        assert_eq!(cpl.descriptor_tag, 0);
        assert!(cpl.error_flags.is_empty());
        assert_ne!(cpl.rx_hash, 0);
        assert_eq!(cpl.rx_checksum, rx_checksum(&frame, 14));
        assert_eq!(cpl.timestamp.as_nanos(), 5);

        let mut landed = vec![0u8; 1514];
        rig.mem.read(BUFFERS, &mut landed).unwrap();
        assert_eq!(landed, frame);
        assert_eq!(rig.queues.status(0).unwrap().tail, 1);
    }

    #[test]
    fn test_truncated_copy() {
        let rig = rig(NicConfig { rx_queues: 1, ..NicConfig::default() });
        post_buffers(&rig, 0, 1, 100);
        rig.engine.deliver(0, Bytes::from(vec![0xAB; 300])).unwrap();
        rig.engine.run_until_idle().unwrap();

        let cpl = completion(&rig, 0);
        assert_eq!(cpl.length, 100);
        assert!(cpl.error_flags.contains(CplErrorFlags::TRUNCATED));
        assert_eq!(rig.engine.stats().snapshot().truncated, 1);
    }

    #[test]
    fn test_drops_counted() {
        let rig = rig(NicConfig { rx_queues: 2, ..NicConfig::default() });
        // No descriptors posted on queue 0
        rig.queues.allocate_at(0, RingParams::new(RX_RING, 4)).unwrap();
        rig.queues.enable(0).unwrap();
        rig.engine.deliver(0, Bytes::from(vec![0u8; 64])).unwrap();
        // Disabled destination
        post_buffers(&rig, 1, 2, 2048);
        rig.queues.disable(1).unwrap();
        rig.engine.deliver_to(0, Bytes::from(vec![0u8; 64]), 1).unwrap();
        // Runt
        rig.engine.deliver(0, Bytes::from(vec![0u8; 10])).unwrap();

        rig.engine.run_until_idle().unwrap();
        let stats = rig.engine.stats().snapshot();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.packets, 0);
        assert_eq!(rig.queues.status(1).unwrap().tail, 0);
    }

    #[test]
    fn test_unmapped_port_counted_as_drop() {
        let config = NicConfig { num_ports: 2, rx_queues: 1, ..NicConfig::default() };
        let mut rig = rig(config);
        post_buffers(&rig, 0, 4, 2048);
        // Port 1 has a FIFO but no mapping registers
        rig.engine.mapper = RxQueueMapper::new(1, 8, true);

        rig.engine.deliver(1, Bytes::from(vec![0u8; 64])).unwrap();
        rig.engine.deliver(0, Bytes::from(vec![0u8; 64])).unwrap();
        rig.engine.run_until_idle().unwrap();

        let stats = rig.engine.stats().snapshot();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.packets, 1);
        assert_eq!(rig.engine.backlog(), 0);
        assert_eq!(rig.queues.status(0).unwrap().tail, 1);
    }

    #[test]
    fn test_fifo_backpressure_and_pause() {
        let rig = rig(NicConfig { rx_queues: 1, rx_fifo_depth: 2, ..NicConfig::default() });
        post_buffers(&rig, 0, 8, 2048);
        rig.engine.set_port_paused(0, true).unwrap();
        rig.engine.deliver(0, Bytes::from(vec![1u8; 64])).unwrap();
        rig.engine.deliver(0, Bytes::from(vec![2u8; 64])).unwrap();
        assert!(matches!(
            rig.engine.deliver(0, Bytes::from(vec![3u8; 64])),
            Err(DatapathError::TransportBusy)
        ));

        assert_eq!(rig.engine.run_until_idle().unwrap(), 0);
        assert_eq!(rig.engine.backlog(), 2);

        rig.engine.set_port_paused(0, false).unwrap();
        rig.engine.run_until_idle().unwrap();
        assert_eq!(rig.engine.backlog(), 0);
        assert_eq!(rig.engine.stats().snapshot().packets, 2);
        assert_eq!(rig.engine.in_flight(), 0);
    }

    #[test]
    fn test_invalid_descriptor_faults_queue() {
        let rig = rig(NicConfig { rx_queues: 1, ..NicConfig::default() });
        post_buffers(&rig, 0, 2, 0);
        rig.engine.deliver(0, Bytes::from(vec![0u8; 64])).unwrap();
        rig.engine.deliver(0, Bytes::from(vec![0u8; 64])).unwrap();
        rig.engine.run_until_idle().unwrap();

        assert_eq!(rig.queues.get(0).unwrap().fault(), Some(FaultCode::InvalidDescriptor));
        let cpl = completion(&rig, 0);
        assert!(cpl.error_flags.contains(CplErrorFlags::INVALID_DESCRIPTOR));
        // Second frame finds the queue faulted
        assert_eq!(rig.engine.stats().snapshot().dropped, 2);
        assert_eq!(rig.queues.status(0).unwrap().tail, 1);
    }
}
