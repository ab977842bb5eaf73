//! qnic Datapath
//!
//! Software model of the queue-based packet datapath of a multi-queue NIC:
//! host-visible descriptor rings, an operation table per engine, a round
//! robin transmit scheduler, receive side scaling and the completion and
//! event queues that report work back to the host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           INTERFACE                              │
//! │                                                                  │
//! │  host rings ──doorbell──▶ Scheduler ──grant──▶ TX Engine ──▶ port│
//! │      ▲                                        │  op table        │
//! │      │                                        ▼                  │
//! │      │◀──────── CQ record ◀── Completion ◀────┘                  │
//! │      │               │                                           │
//! │      │               ▼                                           │
//! │      │          Event Queue ──▶ interrupt                        │
//! │      │                                                           │
//! │  host buffers ◀── RX Engine ◀── Queue Mapper ◀── hash ◀── port   │
//! │                   op table      (RSS / static)                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ordering
//!
//! Each engine serializes its fetch stage, overlaps payload movement and
//! checksums, and completes operations in per-queue submission order
//! through the operation table.

#![warn(missing_docs)]

pub mod backoff;
pub mod checksum;
pub mod clock;
pub mod cq;
pub mod event;
pub mod host;
pub mod hostmem;
pub mod interface;
pub mod optable;
pub mod queue;
pub mod queue_map;
pub mod ring;
pub mod rss;
pub mod rx;
pub mod scheduler;
pub mod stats;
pub mod transport;
pub mod tx;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cq::{CompletionPath, CqManager};
pub use event::{EventQueueManager, InterruptLog, InterruptSink, NullInterrupts};
pub use host::{DriverConfig, HostCompletion, HostDriver};
pub use hostmem::{DmaRegion, HostMemory};
pub use interface::{EngineError, Interface, InterfaceBuilder};
pub use optable::OperationTable;
pub use queue::QueueManager;
pub use queue_map::{MapMode, RxQueueMapper};
pub use ring::{CompletionRecord, CplErrorFlags, Descriptor, EventRecord, EventType, RingParams};
pub use rss::{FlowHasher, HashTypes, RssHasher, ToeplitzHasher, XorFoldHasher};
pub use rx::RxEngine;
pub use scheduler::RoundRobinScheduler;
pub use stats::{EngineStats, InterfaceStats};
pub use transport::{CaptureTransport, LoopbackTransport, Transport};
pub use tx::TxEngine;

/// Ethernet header length; frames shorter than this are dropped
pub const ETH_HEADER_LEN: usize = 14;
