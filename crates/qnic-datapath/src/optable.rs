//! Operation Table
//!
//! Fixed-capacity scoreboard of in-flight descriptor operations, one per
//! engine. The capacity is the engine's concurrency bound: `TableFull` is
//! backpressure, not an error.
//!
//! # Ordering
//!
//! Operations on different queues may finish in any order, but each queue's
//! operations are handed back in allocation order. A completion that
//! arrives ahead of its queue's head-of-line entry is parked in the table
//! until everything before it has completed.

use parking_lot::Mutex;
use qnic_common::{DatapathError, DatapathResult, QueueId, Tag};
use std::collections::{HashMap, VecDeque};

/// Lifecycle of a table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Descriptor and payload being fetched
    Fetching,
    /// Data moving (DMA / transmit pending)
    InFlight,
    /// Finished; waiting for in-order release
    Completing,
}

/// One in-flight operation
#[derive(Debug, Clone)]
pub struct OpEntry<M> {
    /// Table tag
    pub tag: Tag,
    /// Owning queue
    pub queue: QueueId,
    /// Ring index of the descriptor
    pub descriptor_index: u32,
    /// Current state
    pub state: OpState,
    /// Engine-specific data
    pub metadata: M,
}

#[derive(Debug)]
enum Slot<M> {
    Free,
    Busy(OpEntry<M>),
    /// Returned by `complete`, waiting for `release`
    Handed(QueueId),
}

#[derive(Debug)]
struct Inner<M> {
    slots: Vec<Slot<M>>,
    free: VecDeque<Tag>,
    order: HashMap<QueueId, VecDeque<Tag>>,
}

/// Per-engine operation table
pub struct OperationTable<M> {
    capacity: usize,
    inner: Mutex<Inner<M>>,
}

fn bad_tag(tag: Tag, what: &str) -> DatapathError {
    DatapathError::InvalidConfig(format!("operation tag {} {}", tag, what))
}

impl<M> OperationTable<M> {
    /// Create a table with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(Tag::MAX as usize + 1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots: (0..capacity).map(|_| Slot::Free).collect(),
                free: (0..capacity).map(|t| t as Tag).collect(),
                order: HashMap::new(),
            }),
        }
    }

    /// Slot count
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupied slots (including handed-out entries awaiting release)
    pub fn len(&self) -> usize {
        self.capacity - self.inner.lock().free.len()
    }

    /// No operation in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// At least one free slot
    pub fn has_capacity(&self) -> bool {
        !self.inner.lock().free.is_empty()
    }

    /// Claim a slot for the next descriptor of `queue`
    pub fn allocate(&self, queue: QueueId, descriptor_index: u32, metadata: M) -> DatapathResult<Tag> {
        let mut inner = self.inner.lock();
        let tag = inner.free.pop_front().ok_or(DatapathError::TableFull)?;
        inner.slots[tag as usize] = Slot::Busy(OpEntry {
            tag,
            queue,
            descriptor_index,
            state: OpState::Fetching,
            metadata,
        });
        inner.order.entry(queue).or_default().push_back(tag);
        Ok(tag)
    }

    /// Fetch finished; data is moving
    pub fn mark_in_flight(&self, tag: Tag) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(tag as usize) {
            Some(Slot::Busy(entry)) if entry.state == OpState::Fetching => {
                entry.state = OpState::InFlight;
                Ok(())
            }
            _ => Err(bad_tag(tag, "not fetching")),
        }
    }

    /// Update an entry's metadata in place
    pub fn metadata_mut<R>(&self, tag: Tag, f: impl FnOnce(&mut M) -> R) -> DatapathResult<R> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(tag as usize) {
            Some(Slot::Busy(entry)) => Ok(f(&mut entry.metadata)),
            _ => Err(bad_tag(tag, "not active")),
        }
    }

    /// Mark `tag` finished and collect every entry of its queue that is now
    /// releasable, in allocation order
    ///
    /// Returns an empty batch when an earlier operation on the same queue is
    /// still outstanding. Returned entries keep their slot until `release`.
    pub fn complete(&self, tag: Tag) -> DatapathResult<Vec<OpEntry<M>>> {
        let mut inner = self.inner.lock();
        let queue = match inner.slots.get_mut(tag as usize) {
            Some(Slot::Busy(entry)) if entry.state != OpState::Completing => {
                entry.state = OpState::Completing;
                entry.queue
            }
            _ => return Err(bad_tag(tag, "not completable")),
        };

        let mut ready = Vec::new();
        loop {
            let head = match inner.order.get(&queue).and_then(|fifo| fifo.front()) {
                Some(&head) => head,
                None => break,
            };
            let done = matches!(
                &inner.slots[head as usize],
                Slot::Busy(entry) if entry.state == OpState::Completing
            );
            if !done {
                break;
            }
            if let Some(fifo) = inner.order.get_mut(&queue) {
                fifo.pop_front();
            }
            let slot = std::mem::replace(&mut inner.slots[head as usize], Slot::Handed(queue));
            if let Slot::Busy(entry) = slot {
                ready.push(entry);
            }
        }
        if inner.order.get(&queue).map_or(false, |fifo| fifo.is_empty()) {
            inner.order.remove(&queue);
        }
        Ok(ready)
    }

    /// Return a handed-out slot to the free pool
    pub fn release(&self, tag: Tag) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        match inner.slots.get(tag as usize) {
            Some(Slot::Handed(_)) => {
                inner.slots[tag as usize] = Slot::Free;
                inner.free.push_back(tag);
                Ok(())
            }
            _ => Err(bad_tag(tag, "not awaiting release")),
        }
    }

    /// Operations (any state) still referencing `queue`
    pub fn in_flight(&self, queue: QueueId) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| match slot {
                Slot::Busy(entry) => entry.queue == queue,
                Slot::Handed(q) => *q == queue,
                Slot::Free => false,
            })
            .count()
    }
}
