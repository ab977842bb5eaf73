//! NIC Interface
//!
//! One interface owns its queue managers, completion and event queues,
//! the TX and RX engines and their worker threads. Every control-plane
//! register the host can write is exposed as a typed method here.
//!
//! Engines can be driven synchronously (`poll`, `run_until_idle`) or by a
//! worker pool started with `start`.

use crate::clock::{Clock, SystemClock};
use crate::cq::{CompletionPath, CqManager, CqStatus};
use crate::event::{EqStatus, EventQueueManager, InterruptSink, NullInterrupts};
use crate::hostmem::HostMemory;
use crate::queue::{QueueManager, QueueStatus};
use crate::queue_map::{MapMode, PortMapStatus};
use crate::ring::RingParams;
use crate::rx::RxEngine;
use crate::stats::InterfaceStats;
use crate::transport::Transport;
use crate::tx::TxEngine;
use bytes::Bytes;
use parking_lot::Mutex;
use qnic_common::{
    CqId, DatapathError, DatapathResult, EqId, NicConfig, PortId, QueueId, QueueKind, WorkerConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Worker lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start` called twice
    #[error("interface already running")]
    AlreadyRunning,

    /// Worker thread could not be created
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
}

/// Assembles an interface from its collaborators
pub struct InterfaceBuilder {
    config: NicConfig,
    mem: Arc<dyn HostMemory>,
    transport: Arc<dyn Transport>,
    interrupts: Arc<dyn InterruptSink>,
    clock: Arc<dyn Clock>,
}

impl InterfaceBuilder {
    /// Interrupt controller (default: discard)
    pub fn interrupts(mut self, sink: Arc<dyn InterruptSink>) -> Self {
        self.interrupts = sink;
        self
    }

    /// Timestamp source (default: wall clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and wire up the engines
    pub fn build(self) -> DatapathResult<Interface> {
        let config = self.config;
        config.validate()?;

        let tx_queues = Arc::new(QueueManager::new(QueueKind::Tx, config.tx_queues));
        let rx_queues = Arc::new(QueueManager::new(QueueKind::Rx, config.rx_queues));
        let cqs = Arc::new(CqManager::new(config.completion_queues));
        let eqs = Arc::new(EventQueueManager::new(config.event_queues, self.interrupts));
        let completions = Arc::new(CompletionPath::new(cqs, eqs, self.mem.clone()));

        let tx = Arc::new(TxEngine::new(
            &config,
            tx_queues.clone(),
            completions.clone(),
            self.mem.clone(),
            self.transport,
            self.clock.clone(),
        ));
        let rx = Arc::new(RxEngine::new(
            &config,
            rx_queues.clone(),
            completions.clone(),
            self.mem,
            self.clock,
        )?);

        tracing::info!(
            ports = config.num_ports,
            tx_queues = config.tx_queues,
            rx_queues = config.rx_queues,
            hash = ?config.rss_hash.algorithm,
            "interface created"
        );

        Ok(Interface {
            config,
            tx_queues,
            rx_queues,
            completions,
            tx,
            rx,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }
}

/// One NIC interface
pub struct Interface {
    config: NicConfig,
    tx_queues: Arc<QueueManager>,
    rx_queues: Arc<QueueManager>,
    completions: Arc<CompletionPath>,
    tx: Arc<TxEngine>,
    rx: Arc<RxEngine>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Interface {
    /// Start building an interface over `mem` and `transport`
    pub fn builder(
        config: NicConfig,
        mem: Arc<dyn HostMemory>,
        transport: Arc<dyn Transport>,
    ) -> InterfaceBuilder {
        InterfaceBuilder {
            config,
            mem,
            transport,
            interrupts: Arc::new(NullInterrupts),
            clock: Arc::new(SystemClock),
        }
    }

    /// Configuration the interface was built with
    pub fn config(&self) -> &NicConfig {
        &self.config
    }

    /// Transmit engine
    pub fn tx_engine(&self) -> &TxEngine {
        &self.tx
    }

    /// Receive engine
    pub fn rx_engine(&self) -> &RxEngine {
        &self.rx
    }

    /// Host memory shared with the engines
    pub fn memory(&self) -> &dyn HostMemory {
        self.completions.memory()
    }

    // ------------------------------------------------------------------
    // Transmit queues
    // ------------------------------------------------------------------

    /// Allocate the lowest free TX queue
    pub fn allocate_tx_queue(&self, ring: RingParams) -> DatapathResult<QueueId> {
        self.tx_queues.allocate(ring)
    }

    /// Place TX queue `queue` at `ring` (queue must be disabled and quiesced)
    pub fn configure_tx_queue(&self, queue: QueueId, ring: RingParams) -> DatapathResult<()> {
        self.tx_queues.allocate_at(queue, ring)
    }

    /// Pair a TX queue with an existing CQ
    pub fn set_tx_queue_cq(&self, queue: QueueId, cq: CqId) -> DatapathResult<()> {
        self.completions.cqs().get(cq)?;
        self.tx_queues.set_cq(queue, cq)
    }

    /// Egress port of a TX queue
    pub fn set_tx_queue_port(&self, queue: QueueId, port: PortId) -> DatapathResult<()> {
        self.tx.scheduler().set_queue_port(queue, port)
    }

    /// Enable the queue and its scheduler slot
    ///
    /// The queue only becomes active if descriptors are already posted.
    pub fn enable_tx_queue(&self, queue: QueueId) -> DatapathResult<()> {
        self.tx_queues.enable(queue)?;
        self.tx.scheduler().enable_queue(queue, true)?;
        self.tx.notify_pending(queue)?;
        Ok(())
    }

    /// Stop fetching from the queue; in-flight operations drain
    pub fn disable_tx_queue(&self, queue: QueueId) -> DatapathResult<()> {
        self.tx.scheduler().enable_queue(queue, false)?;
        self.tx_queues.disable(queue)
    }

    /// Per-queue transmit pause
    pub fn pause_tx_queue(&self, queue: QueueId, paused: bool) -> DatapathResult<()> {
        self.tx.scheduler().pause_queue(queue, paused)
    }

    /// Host producer doorbell
    pub fn tx_doorbell(&self, queue: QueueId, head: u32) -> DatapathResult<()> {
        self.doorbell(&self.tx_queues, queue, head)?;
        self.tx.notify(queue)
    }

    /// Apply a producer doorbell; an overflow faults the queue and is
    /// reported on its event queue
    fn doorbell(&self, queues: &QueueManager, queue: QueueId, head: u32) -> DatapathResult<()> {
        match queues.doorbell(queue, head) {
            Err(e @ DatapathError::RingOverflow { .. }) => {
                let cq = queues.get(queue)?.cq();
                if let Err(report) = self.completions.fault_event(cq, queue) {
                    tracing::warn!(queue, error = %report, "fault event not delivered");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Release a faulted queue; head is resynchronized to tail
    pub fn clear_tx_fault(&self, queue: QueueId) -> DatapathResult<()> {
        self.tx_queues.clear_fault(queue)?;
        self.tx.notify_pending(queue)?;
        Ok(())
    }

    /// TX queue status register
    pub fn tx_queue_status(&self, queue: QueueId) -> DatapathResult<QueueStatus> {
        self.tx_queues.status(queue)
    }

    // ------------------------------------------------------------------
    // Receive queues
    // ------------------------------------------------------------------

    /// Configure the lowest free RX queue
    pub fn allocate_rx_queue(&self, ring: RingParams) -> DatapathResult<QueueId> {
        self.rx_queues.allocate(ring)
    }

    /// Reconfigure a disabled RX queue
    pub fn configure_rx_queue(&self, queue: QueueId, ring: RingParams) -> DatapathResult<()> {
        self.rx_queues.allocate_at(queue, ring)
    }

    /// Pair an RX queue with an existing CQ
    pub fn set_rx_queue_cq(&self, queue: QueueId, cq: CqId) -> DatapathResult<()> {
        self.completions.cqs().get(cq)?;
        self.rx_queues.set_cq(queue, cq)
    }

    /// Start accepting frames on the queue
    pub fn enable_rx_queue(&self, queue: QueueId) -> DatapathResult<()> {
        self.rx_queues.enable(queue)
    }

    /// Stop accepting frames; in-flight writes drain
    pub fn disable_rx_queue(&self, queue: QueueId) -> DatapathResult<()> {
        self.rx_queues.disable(queue)
    }

    /// Host producer doorbell (buffers posted)
    pub fn rx_doorbell(&self, queue: QueueId, head: u32) -> DatapathResult<()> {
        self.doorbell(&self.rx_queues, queue, head)
    }

    /// Release a faulted queue; head is resynchronized to tail
    pub fn clear_rx_fault(&self, queue: QueueId) -> DatapathResult<()> {
        self.rx_queues.clear_fault(queue)
    }

    /// RX queue status register
    pub fn rx_queue_status(&self, queue: QueueId) -> DatapathResult<QueueStatus> {
        self.rx_queues.status(queue)
    }

    // ------------------------------------------------------------------
    // Completion and event queues
    // ------------------------------------------------------------------

    /// Allocate the lowest free CQ reporting to `eq`
    pub fn allocate_cq(&self, ring: RingParams, eq: EqId) -> DatapathResult<CqId> {
        self.check_eq(eq)?;
        self.completions.cqs().allocate(ring, eq)
    }

    /// Configure CQ `cq` reporting to `eq`
    pub fn configure_cq(&self, cq: CqId, ring: RingParams, eq: EqId) -> DatapathResult<()> {
        self.check_eq(eq)?;
        self.completions.cqs().allocate_at(cq, ring, eq)
    }

    fn check_eq(&self, eq: EqId) -> DatapathResult<()> {
        self.completions.eqs().counter(eq).map(|_| ())
    }

    /// Allow completions on the CQ
    pub fn enable_cq(&self, cq: CqId) -> DatapathResult<()> {
        self.completions.cqs().enable(cq)
    }

    /// Refuse further completions on the CQ
    pub fn disable_cq(&self, cq: CqId) -> DatapathResult<()> {
        self.completions.cqs().disable(cq)
    }

    /// Host consumer doorbell
    pub fn cq_doorbell(&self, cq: CqId, tail: u32) -> DatapathResult<()> {
        self.completions.cqs().doorbell(cq, tail)
    }

    /// CQ status register
    pub fn cq_status(&self, cq: CqId) -> DatapathResult<CqStatus> {
        self.completions.cqs().status(cq)
    }

    /// Configure EQ `eq` on interrupt vector `irq`, optionally ring-backed
    pub fn configure_eq(&self, eq: EqId, ring: Option<RingParams>, irq: u32) -> DatapathResult<()> {
        self.completions.eqs().allocate_at(eq, ring, irq)
    }

    /// Re-arm; returns true if an interrupt was raised immediately
    pub fn arm_eq(&self, eq: EqId) -> DatapathResult<bool> {
        self.completions.eqs().arm(eq)
    }

    /// Host EQ consumer doorbell
    pub fn eq_acknowledge(&self, eq: EqId, consumed: u64) -> DatapathResult<()> {
        self.completions.eqs().acknowledge(eq, consumed)
    }

    /// EQ status register
    pub fn eq_status(&self, eq: EqId) -> DatapathResult<EqStatus> {
        self.completions.eqs().status(eq)
    }

    // ------------------------------------------------------------------
    // Receive steering and global switches
    // ------------------------------------------------------------------

    /// Write one indirection entry of `port`
    pub fn set_indir_entry(&self, port: PortId, index: usize, queue: QueueId) -> DatapathResult<()> {
        self.rx.mapper().set_indir_entry(port, index, queue)
    }

    /// Spread `queues` across the whole indirection table of `port`
    pub fn fill_indir(&self, port: PortId, queues: &[QueueId]) -> DatapathResult<()> {
        self.rx.mapper().fill_indir(port, queues)
    }

    /// Hash mask applied before the table lookup
    pub fn set_rss_mask(&self, port: PortId, mask: u32) -> DatapathResult<()> {
        self.rx.mapper().set_rss_mask(port, mask)
    }

    /// Queue used when RSS is off
    pub fn set_static_offset(&self, port: PortId, queue: QueueId) -> DatapathResult<()> {
        self.rx.mapper().set_static_offset(port, queue)
    }

    /// Per-port RSS or static mapping
    pub fn set_map_mode(&self, port: PortId, mode: MapMode) -> DatapathResult<()> {
        self.rx.mapper().set_mode(port, mode)
    }

    /// Mapping registers of one port
    pub fn port_map_status(&self, port: PortId) -> DatapathResult<PortMapStatus> {
        self.rx.mapper().status(port)
    }

    /// Global RSS switch
    pub fn set_rss_enable(&self, enable: bool) {
        self.rx.mapper().set_rss_enable(enable);
    }

    /// Global TX checksum offload switch
    pub fn set_checksum_enable(&self, enable: bool) {
        self.tx.set_checksum_enable(enable);
    }

    /// Global transmit scheduler enable
    pub fn set_scheduler_enable(&self, enable: bool) {
        self.tx.scheduler().set_enabled(enable);
    }

    /// Link-level flow control: pause transmit and receive processing on `port`
    pub fn set_port_paused(&self, port: PortId, paused: bool) -> DatapathResult<()> {
        self.tx.scheduler().set_port_paused(port, paused)?;
        self.rx.set_port_paused(port, paused)?;
        tracing::info!(port, paused, "port flow control");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Datapath
    // ------------------------------------------------------------------

    /// Frame from the link on `port`; `TransportBusy` when the FIFO is full
    pub fn receive(&self, port: PortId, frame: Bytes) -> DatapathResult<()> {
        self.rx.deliver(port, frame)
    }

    /// One pass over both engines
    pub fn poll(&self) -> DatapathResult<usize> {
        Ok(self.tx.poll()? + self.rx.poll()?)
    }

    /// Poll both engines until neither makes progress
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

    /// Disabled with nothing in flight
    pub fn is_quiesced(&self, kind: QueueKind, queue: QueueId) -> DatapathResult<bool> {
        match kind {
            QueueKind::Tx => self.tx_queues.is_quiesced(queue),
            QueueKind::Rx => self.rx_queues.is_quiesced(queue),
            QueueKind::Completion | QueueKind::Event => Err(DatapathError::InvalidConfig(
                format!("{} queues have no quiescence state", kind),
            )),
        }
    }

    /// Counters of both engines
    pub fn stats(&self) -> InterfaceStats {
        let interrupts = (0..self.completions.eqs().count())
            .filter_map(|eq| self.completions.eqs().status(eq).ok())
            .map(|s| s.interrupts)
            .sum();
        InterfaceStats {
            tx: self.tx.stats().snapshot(),
            rx: self.rx.stats().snapshot(),
            interrupts,
        }
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Spawn the TX and RX worker pools
    pub fn start(&self, workers: &WorkerConfig) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRunning);
        }
        let idle = Duration::from_micros(workers.idle_sleep_us);
        let mut handles = self.workers.lock();

        for id in 0..workers.tx_workers {
            let engine = self.tx.clone();
            let running = self.running.clone();
            let handle = thread::Builder::new()
                .name(format!("qnic-tx-{}", id))
                .spawn(move || worker_loop("tx", id, running, idle, || engine.poll()))
                .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
            handles.push(handle);
        }
        for id in 0..workers.rx_workers {
            let engine = self.rx.clone();
            let running = self.running.clone();
            let handle = thread::Builder::new()
                .name(format!("qnic-rx-{}", id))
                .spawn(move || worker_loop("rx", id, running, idle, || engine.poll()))
                .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
            handles.push(handle);
        }

        tracing::info!(
            tx_workers = workers.tx_workers,
            rx_workers = workers.rx_workers,
            "interface started"
        );
        Ok(())
    }

    /// Stop and join all workers
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            join_worker(handle);
        }
        tracing::info!("interface stopped");
    }

    /// Worker pool is up
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join one worker thread; false if it panicked
fn join_worker(handle: thread::JoinHandle<()>) -> bool {
    let name = handle.thread().name().unwrap_or("worker").to_string();
    match handle.join() {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            tracing::error!(worker = %name, panic = %message, "worker panicked");
            false
        }
    }
}

fn worker_loop(
    engine: &'static str,
    id: usize,
    running: Arc<AtomicBool>,
    idle: Duration,
    poll: impl Fn() -> DatapathResult<usize>,
) {
    tracing::debug!(engine, id, "worker starting");
    while running.load(Ordering::Relaxed) {
        match poll() {
            Ok(0) => thread::sleep(idle),
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!(engine, id, error = %e, "poll failed, queue needs host recovery");
                thread::sleep(idle);
            }
            Err(e) => {
                tracing::warn!(engine, id, error = %e, "poll failed");
                thread::sleep(idle);
            }
        }
    }
    tracing::debug!(engine, id, "worker stopped");
}
