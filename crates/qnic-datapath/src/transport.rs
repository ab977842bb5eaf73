//! Physical packet transport
//!
//! The link side of the datapath. Sends may report `TransportBusy`
//! (backpressure); receive traffic is pushed into `RxEngine::deliver` by
//! whoever owns the link.

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use qnic_common::{DatapathError, DatapathResult, PortId};
use std::sync::atomic::{AtomicU32, Ordering};

/// Egress link
pub trait Transport: Send + Sync {
    /// Hand one frame to port `port`
    fn send(&self, port: PortId, frame: Bytes) -> DatapathResult<()>;
}

/// Per-port bounded wire, read back by the other end (loopback cable)
pub struct LoopbackTransport {
    ports: Vec<(Sender<Bytes>, Receiver<Bytes>)>,
}

impl LoopbackTransport {
    /// `depth` frames in flight per port
    pub fn new(num_ports: u16, depth: usize) -> Self {
        Self {
            ports: (0..num_ports).map(|_| bounded(depth)).collect(),
        }
    }

    fn wire(&self, port: PortId) -> DatapathResult<&(Sender<Bytes>, Receiver<Bytes>)> {
        self.ports
            .get(port as usize)
            .ok_or_else(|| DatapathError::InvalidConfig(format!("unknown port {}", port)))
    }

    /// Next frame on the wire of `port`
    pub fn recv(&self, port: PortId) -> Option<Bytes> {
        self.wire(port).ok().and_then(|(_, rx)| rx.try_recv().ok())
    }

    /// Everything currently on the wire of `port`
    pub fn drain(&self, port: PortId) -> Vec<Bytes> {
        match self.wire(port) {
            Ok((_, rx)) => rx.try_iter().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Frames waiting on `port`
    pub fn pending(&self, port: PortId) -> usize {
        self.wire(port).map_or(0, |(_, rx)| rx.len())
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, port: PortId, frame: Bytes) -> DatapathResult<()> {
        let (tx, _) = self.wire(port)?;
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DatapathError::TransportBusy),
            Err(TrySendError::Disconnected(_)) => Err(DatapathError::TransportBusy),
        }
    }
}

/// Records every transmitted frame; can be told to refuse sends
#[derive(Default)]
pub struct CaptureTransport {
    frames: Mutex<Vec<(PortId, Bytes)>>,
    busy: AtomicU32,
}

impl CaptureTransport {
    /// Empty capture that accepts every send
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` sends with `TransportBusy`
    pub fn inject_busy(&self, count: u32) {
        self.busy.store(count, Ordering::Release);
    }

    /// Transmitted frames, in order
    pub fn frames(&self) -> Vec<(PortId, Bytes)> {
        self.frames.lock().clone()
    }

    /// Drain the captured frames
    pub fn take(&self) -> Vec<(PortId, Bytes)> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Frames captured and not yet taken
    pub fn count(&self) -> usize {
        self.frames.lock().len()
    }
}

impl Transport for CaptureTransport {
    fn send(&self, port: PortId, frame: Bytes) -> DatapathResult<()> {
        let refused = self
            .busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(DatapathError::TransportBusy);
        }
        self.frames.lock().push((port, frame));
        Ok(())
    }
}
