//! Host-side Ring Driver
//!
//! Software stand-in for the kernel driver: carves rings and packet
//! buffers out of a DMA region, posts descriptors, rings doorbells and
//! consumes completion and event records by phase.
//!
//! Every TX and RX ring slot owns a fixed buffer. TX descriptors use the
//! slot number as their tag; a slot is reusable once its completion has
//! been consumed.

use crate::hostmem::{DmaRegion, HostMemory};
use crate::interface::Interface;
use crate::ring::{
    self, CompletionRecord, CplErrorFlags, Descriptor, EventRecord, RingParams, CPL_SIZE,
    DESC_SIZE, EVENT_SIZE,
};
use bytes::Bytes;
use qnic_common::{CqId, DatapathError, DatapathResult, EqId, QueueId, QueueKind};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Driver layout parameters
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// TX queues to create
    pub tx_queues: u32,
    /// RX queues to create
    pub rx_queues: u32,
    /// log2 slots per TX/RX descriptor ring
    pub queue_log2: u8,
    /// log2 slots per completion ring
    pub cq_log2: u8,
    /// log2 slots of the event ring
    pub eq_log2: u8,
    /// Bytes per TX buffer
    pub tx_buffer_size: u32,
    /// Bytes per posted RX buffer
    pub rx_buffer_size: u32,
    /// Interrupt vector of event queue 0
    pub irq: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tx_queues: 4,
            rx_queues: 4,
            queue_log2: 6,
            cq_log2: 8,
            eq_log2: 8,
            tx_buffer_size: 9216,
            rx_buffer_size: 9216,
            irq: 0,
        }
    }
}

/// One consumed completion
#[derive(Debug, Clone)]
pub struct HostCompletion {
    /// Queue family the record came from
    pub kind: QueueKind,
    /// Decoded completion
    pub record: CompletionRecord,
    /// Received payload (RX only, absent on error completions)
    pub data: Option<Bytes>,
}

impl HostCompletion {
    /// Queue that completed the descriptor
    pub fn queue(&self) -> QueueId {
        self.record.queue_id as QueueId
    }

    /// Any error flag set
    pub fn is_error(&self) -> bool {
        self.record
            .error_flags
            .intersects(CplErrorFlags::INVALID_DESCRIPTOR | CplErrorFlags::DMA_ERROR)
    }
}

struct DescRing {
    params: RingParams,
    head: u32,
    /// Completions consumed; slots below this index are free
    clean_tail: u32,
    buffers: Vec<u64>,
    buffer_size: u32,
}

impl DescRing {
    fn free_slots(&self) -> u32 {
        self.params.capacity() - ring::occupancy(self.head, self.clean_tail)
    }

    fn buffer(&self, index: u32) -> u64 {
        self.buffers[self.params.slot(index) as usize]
    }
}

struct CplRing {
    params: RingParams,
    kind: QueueKind,
    tail: u32,
}

/// Host driver bound to one interface
pub struct HostDriver {
    iface: Arc<Interface>,
    mem: Arc<DmaRegion>,
    next_addr: u64,
    tx: HashMap<QueueId, DescRing>,
    rx: HashMap<QueueId, DescRing>,
    cqs: HashMap<CqId, CplRing>,
    eq: RingParams,
    eq_consumed: u64,
    rx_ready: VecDeque<HostCompletion>,
    tx_done: VecDeque<HostCompletion>,
}

impl HostDriver {
    /// Bring the interface up: event queue 0, one CQ per queue, TX and RX
    /// rings, RX buffers posted and the scheduler enabled
    pub fn open(iface: Arc<Interface>, mem: Arc<DmaRegion>, config: &DriverConfig) -> DatapathResult<Self> {
        let mut driver = Self {
            iface,
            mem,
            // Keep address 0 unused so a zeroed descriptor never aliases a ring
            next_addr: 0x1000,
            tx: HashMap::new(),
            rx: HashMap::new(),
            cqs: HashMap::new(),
            eq: RingParams::new(0, config.eq_log2),
            eq_consumed: 0,
            rx_ready: VecDeque::new(),
            tx_done: VecDeque::new(),
        };

        let eq_base = driver.alloc_ring(config.eq_log2, EVENT_SIZE)?;
        driver.eq = RingParams::new(eq_base, config.eq_log2);
        driver.iface.configure_eq(0, Some(driver.eq), config.irq)?;
        driver.iface.arm_eq(0)?;

        for _ in 0..config.tx_queues {
            driver.create_tx_queue(config.queue_log2, config.cq_log2, config.tx_buffer_size)?;
        }
        for _ in 0..config.rx_queues {
            driver.create_rx_queue(config.queue_log2, config.cq_log2, config.rx_buffer_size)?;
        }
        driver.iface.set_scheduler_enable(true);

        tracing::info!(
            tx_queues = config.tx_queues,
            rx_queues = config.rx_queues,
            used = driver.next_addr,
            "host driver opened"
        );
        Ok(driver)
    }

    /// Interface this driver owns
    pub fn interface(&self) -> &Interface {
        &self.iface
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Bump-allocate `len` bytes aligned to `align`
    pub fn alloc(&mut self, len: u64, align: u64) -> DatapathResult<u64> {
        let align = align.max(1);
        let addr = (self.next_addr + align - 1) / align * align;
        if !self.mem.contains(addr, len) {
            return Err(DatapathError::HostMemory { addr, len: len as usize });
        }
        self.next_addr = addr + len;
        Ok(addr)
    }

    fn alloc_ring(&mut self, size_log2: u8, slot_size: usize) -> DatapathResult<u64> {
        let params = RingParams::new(0, size_log2);
        params.validate()?;
        let bytes = params.ring_bytes(slot_size);
        let base = self.alloc(bytes, 4096)?;
        self.mem.fill(base, bytes as usize, 0)?;
        Ok(base)
    }

    fn alloc_buffers(&mut self, count: u32, size: u32) -> DatapathResult<Vec<u64>> {
        (0..count).map(|_| self.alloc(size as u64, 64)).collect()
    }

    fn create_cq(&mut self, kind: QueueKind, size_log2: u8) -> DatapathResult<CqId> {
        let base = self.alloc_ring(size_log2, CPL_SIZE)?;
        let params = RingParams::new(base, size_log2);
        let cq = self.iface.allocate_cq(params, 0)?;
        self.iface.enable_cq(cq)?;
        self.cqs.insert(cq, CplRing { params, kind, tail: 0 });
        Ok(cq)
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Create and enable a TX queue with its own completion queue
    pub fn create_tx_queue(&mut self, size_log2: u8, cq_log2: u8, buffer_size: u32) -> DatapathResult<QueueId> {
        let cq = self.create_cq(QueueKind::Tx, cq_log2)?;
        let base = self.alloc_ring(size_log2, DESC_SIZE)?;
        let params = RingParams::new(base, size_log2);
        let buffers = self.alloc_buffers(params.capacity(), buffer_size)?;

        let queue = self.iface.allocate_tx_queue(params)?;
        self.iface.set_tx_queue_cq(queue, cq)?;
        self.iface.enable_tx_queue(queue)?;
        self.tx.insert(queue, DescRing { params, head: 0, clean_tail: 0, buffers, buffer_size });
        tracing::debug!(queue, cq, base, "tx queue created");
        Ok(queue)
    }

    /// Create and enable an RX queue with every slot posted
    pub fn create_rx_queue(&mut self, size_log2: u8, cq_log2: u8, buffer_size: u32) -> DatapathResult<QueueId> {
        let cq = self.create_cq(QueueKind::Rx, cq_log2)?;
        let base = self.alloc_ring(size_log2, DESC_SIZE)?;
        let params = RingParams::new(base, size_log2);
        let buffers = self.alloc_buffers(params.capacity(), buffer_size)?;

        let queue = self.iface.allocate_rx_queue(params)?;
        self.iface.set_rx_queue_cq(queue, cq)?;
        self.iface.enable_rx_queue(queue)?;
        self.rx.insert(queue, DescRing { params, head: 0, clean_tail: 0, buffers, buffer_size });
        self.refill_rx(queue)?;
        tracing::debug!(queue, cq, base, "rx queue created");
        Ok(queue)
    }

    /// Copy `frame` into the next free slot of TX queue `queue`
    ///
    /// `csum` requests checksum insertion as `(start, offset)`. Returns
    /// false when the ring has no free slot.
    pub fn start_xmit(&mut self, queue: QueueId, frame: &[u8], csum: Option<(u8, u8)>) -> DatapathResult<bool> {
        let ring = self
            .tx
            .get_mut(&queue)
            .ok_or(DatapathError::UnknownQueue { kind: QueueKind::Tx, queue })?;
        if ring.free_slots() == 0 {
            return Ok(false);
        }
        if frame.len() > ring.buffer_size as usize {
            return Err(DatapathError::InvalidConfig(format!(
                "frame of {} bytes exceeds the {} byte tx buffer",
                frame.len(),
                ring.buffer_size
            )));
        }

        let index = ring.head;
        let buffer = ring.buffer(index);
        self.mem.write(buffer, frame)?;

        let mut desc = Descriptor::new(buffer, frame.len() as u32, ring.params.slot(index) as u16);
        if let Some((start, offset)) = csum {
            desc = desc.with_checksum(start, offset);
        }
        self.mem.write(ring.params.slot_address(index, DESC_SIZE), &desc.encode())?;

        ring.head = index.wrapping_add(1);
        self.iface.tx_doorbell(queue, ring.head)?;
        Ok(true)
    }

    /// Post empty buffers into every free slot of RX queue `queue`
    pub fn refill_rx(&mut self, queue: QueueId) -> DatapathResult<u32> {
        let ring = self
            .rx
            .get_mut(&queue)
            .ok_or(DatapathError::UnknownQueue { kind: QueueKind::Rx, queue })?;
        let mut posted = 0;
        while ring.free_slots() > 0 {
            let index = ring.head;
            let desc = Descriptor::new(ring.buffer(index), ring.buffer_size, ring.params.slot(index) as u16);
            self.mem.write(ring.params.slot_address(index, DESC_SIZE), &desc.encode())?;
            ring.head = index.wrapping_add(1);
            posted += 1;
        }
        if posted > 0 {
            self.iface.rx_doorbell(queue, ring.head)?;
        }
        Ok(posted)
    }

    // ------------------------------------------------------------------
    // Completions and events
    // ------------------------------------------------------------------

    /// Consume every fresh record on `cq`
    pub fn poll_cq(&mut self, cq: CqId) -> DatapathResult<usize> {
        let ring = self
            .cqs
            .get_mut(&cq)
            .ok_or(DatapathError::UnknownQueue { kind: QueueKind::Completion, queue: cq })?;
        let mut raw = [0u8; CPL_SIZE];
        let mut consumed = 0;
        let mut refill = Vec::new();

        loop {
            self.mem.read(ring.params.slot_address(ring.tail, CPL_SIZE), &mut raw)?;
            let (record, phase) = CompletionRecord::decode(&raw);
            if phase != ring::phase(ring.tail, ring.params.size_log2) {
                break;
            }
            ring.tail = ring.tail.wrapping_add(1);
            consumed += 1;

            let queue = record.queue_id as QueueId;
            let rings = match ring.kind {
                QueueKind::Rx => &mut self.rx,
                _ => &mut self.tx,
            };
            let desc_ring = rings
                .get_mut(&queue)
                .ok_or(DatapathError::UnknownQueue { kind: ring.kind, queue })?;
            desc_ring.clean_tail = record.descriptor_index.wrapping_add(1);

            let mut completion = HostCompletion { kind: ring.kind, record, data: None };
            if ring.kind == QueueKind::Rx {
                if !completion.is_error() {
                    let mut data = vec![0u8; record.length as usize];
                    self.mem.read(desc_ring.buffer(record.descriptor_index), &mut data)?;
                    completion.data = Some(Bytes::from(data));
                }
                if !refill.contains(&queue) {
                    refill.push(queue);
                }
                self.rx_ready.push_back(completion);
            } else {
                self.tx_done.push_back(completion);
            }
        }

        if consumed > 0 {
            let tail = ring.tail;
            self.iface.cq_doorbell(cq, tail)?;
        }
        for queue in refill {
            self.refill_rx(queue)?;
        }
        Ok(consumed)
    }

    /// Poll every completion queue
    pub fn poll(&mut self) -> DatapathResult<usize> {
        let mut cqs: Vec<CqId> = self.cqs.keys().copied().collect();
        cqs.sort_unstable();
        let mut total = 0;
        for cq in cqs {
            total += self.poll_cq(cq)?;
        }
        Ok(total)
    }

    /// Next received packet, polling completion queues if none is pending
    pub fn recv(&mut self) -> DatapathResult<Option<HostCompletion>> {
        if self.rx_ready.is_empty() {
            self.poll()?;
        }
        Ok(self.rx_ready.pop_front())
    }

    /// Drain consumed TX completions
    pub fn tx_completions(&mut self) -> Vec<HostCompletion> {
        self.tx_done.drain(..).collect()
    }

    /// Read the event records produced since the last call, acknowledge
    /// them and re-arm event queue 0
    ///
    /// Records lost to an event ring overrun are skipped.
    pub fn service_eq(&mut self) -> DatapathResult<Vec<EventRecord>> {
        const EQ: EqId = 0;
        let counter = self.iface.eq_status(EQ)?.counter;
        let mut raw = [0u8; EVENT_SIZE];
        let mut events = Vec::new();

        while self.eq_consumed < counter {
            let index = self.eq_consumed as u32;
            self.mem.read(self.eq.slot_address(index, EVENT_SIZE), &mut raw)?;
            let (event, phase) = EventRecord::decode(&raw);
            if phase == ring::phase(index, self.eq.size_log2) {
                events.push(event);
            }
            self.eq_consumed += 1;
        }

        self.iface.eq_acknowledge(EQ, self.eq_consumed)?;
        self.iface.arm_eq(EQ)?;
        Ok(events)
    }

    /// Clear a TX queue fault and resynchronize the host ring with the
    /// engine's consumer index
    ///
    /// Descriptors posted but never fetched are abandoned; poll completions
    /// first so fetched ones are accounted for.
    pub fn recover_tx_queue(&mut self, queue: QueueId) -> DatapathResult<()> {
        self.iface.clear_tx_fault(queue)?;
        let tail = self.iface.tx_queue_status(queue)?.tail;
        let ring = self
            .tx
            .get_mut(&queue)
            .ok_or(DatapathError::UnknownQueue { kind: QueueKind::Tx, queue })?;
        ring.head = tail;
        ring.clean_tail = tail;
        Ok(())
    }

    /// Host-side view of TX queue occupancy (posted minus completed)
    pub fn tx_outstanding(&self, queue: QueueId) -> Option<u32> {
        self.tx.get(&queue).map(|r| ring::occupancy(r.head, r.clean_tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CaptureTransport;
    use qnic_common::NicConfig;

    fn open(config: DriverConfig) -> (HostDriver, Arc<CaptureTransport>) {
        let mem = Arc::new(DmaRegion::new(8 << 20));
        let wire = Arc::new(CaptureTransport::new());
        let iface = Interface::builder(NicConfig::default(), mem.clone(), wire.clone())
            .build()
            .unwrap();
        let driver = HostDriver::open(Arc::new(iface), mem, &config).unwrap();
        (driver, wire)
    }

    #[test]
    fn test_open_posts_rx_buffers() {
        let (driver, _) = open(DriverConfig::default());
        let status = driver.interface().rx_queue_status(0).unwrap();
        assert_eq!(status.head, 64);
        assert!(status.enabled);
        assert_eq!(status.cq, Some(4));
    }

    #[test]
    fn test_xmit_completes_and_frees_slot() {
        let config = DriverConfig { tx_queues: 1, rx_queues: 1, queue_log2: 2, ..DriverConfig::default() };
        let (mut driver, wire) = open(config);

        for k in 0..4u8 {
            assert!(driver.start_xmit(0, &[k; 64], None).unwrap());
        }
        assert!(!driver.start_xmit(0, &[9; 64], None).unwrap());

        driver.interface().run_until_idle().unwrap();
        assert_eq!(wire.count(), 4);

        driver.poll().unwrap();
        let done = driver.tx_completions();
        assert_eq!(done.len(), 4);
        assert!(done.iter().all(|c| c.kind == QueueKind::Tx && !c.is_error()));
        let tags: Vec<u16> = done.iter().map(|c| c.record.descriptor_tag).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);

        assert_eq!(driver.tx_outstanding(0), Some(0));
        assert!(driver.start_xmit(0, &[9; 64], None).unwrap());
    }

    #[test]
    fn test_recv_and_refill() {
        let config = DriverConfig { tx_queues: 1, rx_queues: 1, queue_log2: 2, ..DriverConfig::default() };
        let (mut driver, _) = open(config);

        for k in 0..6u8 {
            driver.interface().receive(0, Bytes::from(vec![k; 60])).unwrap();
            driver.interface().run_until_idle().unwrap();
            let pkt = driver.recv().unwrap().unwrap();
            assert_eq!(pkt.queue(), 0);
            assert_eq!(pkt.data.unwrap().as_ref(), &[k; 60][..]);
        }
        assert_eq!(driver.interface().rx_queue_status(0).unwrap().head, 10);
        assert!(driver.recv().unwrap().is_none());
    }

    #[test]
    fn test_service_eq_reports_completion_events() {
        let config = DriverConfig { tx_queues: 1, rx_queues: 1, ..DriverConfig::default() };
        let (mut driver, _) = open(config);

        driver.start_xmit(0, &[1; 64], None).unwrap();
        driver.interface().run_until_idle().unwrap();

        let events = driver.service_eq().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, ring::EventType::Completion);
        assert_eq!(events[0].source, 0);
        assert!(driver.service_eq().unwrap().is_empty());
    }

    #[test]
    fn test_alloc_exhaustion() {
        let (mut driver, _) = open(DriverConfig { tx_queues: 1, rx_queues: 1, ..DriverConfig::default() });
        assert!(matches!(driver.alloc(16 << 20, 64), Err(DatapathError::HostMemory { .. })));
    }
}
