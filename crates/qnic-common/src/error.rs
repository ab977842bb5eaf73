//! Error types for the qnic datapath

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which queue family an identifier refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Transmit descriptor queue
    Tx,
    /// Receive descriptor queue
    Rx,
    /// Completion queue
    Completion,
    /// Event queue
    Event,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueueKind::Tx => "tx",
            QueueKind::Rx => "rx",
            QueueKind::Completion => "cq",
            QueueKind::Event => "eq",
        };
        f.write_str(name)
    }
}

/// Why a queue stopped being serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultCode {
    /// Producer index moved past consumer capacity (or backwards)
    RingOverflow = 1,
    /// A fetched descriptor failed validation
    InvalidDescriptor = 2,
    /// Host memory access outside the mapped region
    DmaError = 3,
}

impl FaultCode {
    /// Decode from the status register encoding
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::RingOverflow),
            2 => Some(Self::InvalidDescriptor),
            3 => Some(Self::DmaError),
            _ => None,
        }
    }
}

/// Reason a descriptor was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorFault {
    /// Length field is zero
    ZeroLength,
    /// Length exceeds the engine's maximum frame size
    TooLong {
        /// Length requested by the descriptor
        len: u32,
        /// Engine limit
        max: u32,
    },
    /// Buffer does not fit in host memory
    AddressOutOfRange {
        /// Buffer address
        addr: u64,
        /// Buffer length
        len: u32,
    },
    /// Checksum command points outside the frame
    ChecksumOutOfRange {
        /// Start of the summed range
        start: u16,
        /// Insert position (absolute)
        insert: u16,
    },
}

impl std::fmt::Display for DescriptorFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorFault::ZeroLength => write!(f, "zero length"),
            DescriptorFault::TooLong { len, max } => write!(f, "length {} exceeds {}", len, max),
            DescriptorFault::AddressOutOfRange { addr, len } => {
                write!(f, "buffer {:#x}+{} outside host memory", addr, len)
            }
            DescriptorFault::ChecksumOutOfRange { start, insert } => {
                write!(f, "checksum start {} insert {} outside frame", start, insert)
            }
        }
    }
}

/// Why a received frame was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Destination queue not enabled
    QueueDisabled,
    /// Destination queue has no posted descriptor
    NoDescriptor,
    /// Destination queue is faulted
    QueueFaulted,
    /// Frame is shorter than an Ethernet header or above the MTU limit
    BadLength,
    /// Operation table stayed full past the retry budget
    TableFull,
    /// Mapper returned a queue that does not exist
    UnknownQueue,
}

/// Datapath error type
#[derive(Error, Debug)]
pub enum DatapathError {
    /// Queue is not enabled
    #[error("{kind} queue {queue} disabled")]
    QueueDisabled {
        /// Queue family
        kind: QueueKind,
        /// Queue index
        queue: u32,
    },

    /// Queue has no posted descriptors
    #[error("{kind} queue {queue} empty")]
    QueueEmpty {
        /// Queue family
        kind: QueueKind,
        /// Queue index
        queue: u32,
    },

    /// Queue halted until the host clears the fault
    #[error("{kind} queue {queue} faulted: {code:?}")]
    QueueFaulted {
        /// Queue family
        kind: QueueKind,
        /// Queue index
        queue: u32,
        /// Recorded fault
        code: FaultCode,
    },

    /// Producer outran consumer capacity
    #[error("{kind} queue {queue} ring overflow (head {head}, tail {tail})")]
    RingOverflow {
        /// Queue family
        kind: QueueKind,
        /// Queue index
        queue: u32,
        /// Rejected producer index
        head: u32,
        /// Consumer index at the time
        tail: u32,
    },

    /// Operation table has no free slot
    #[error("operation table full")]
    TableFull,

    /// Descriptor failed validation
    #[error("invalid descriptor on {kind} queue {queue} index {index}: {fault}")]
    InvalidDescriptor {
        /// Queue family
        kind: QueueKind,
        /// Queue index
        queue: u32,
        /// Ring index of the descriptor
        index: u32,
        /// What was wrong
        fault: DescriptorFault,
    },

    /// Transport cannot accept a frame right now
    #[error("transport busy")]
    TransportBusy,

    /// Received frame dropped
    #[error("rx drop on port {port}: {reason:?}")]
    RxDrop {
        /// Ingress port
        port: u16,
        /// Why
        reason: DropReason,
    },

    /// Completion queue has no free slot
    #[error("completion queue {cq} full")]
    CompletionQueueFull {
        /// Completion queue index
        cq: u32,
    },

    /// Identifier does not name an allocated queue
    #[error("unknown {kind} queue {queue}")]
    UnknownQueue {
        /// Queue family
        kind: QueueKind,
        /// Queue index
        queue: u32,
    },

    /// Access outside the host memory region
    #[error("host memory access {addr:#x}+{len} out of range")]
    HostMemory {
        /// Start address
        addr: u64,
        /// Access length
        len: usize,
    },

    /// Configuration error
    #[error("config error: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatapathError {
    /// Backpressure conditions that engines retry internally
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DatapathError::TableFull
                | DatapathError::TransportBusy
                | DatapathError::CompletionQueueFull { .. }
        )
    }

    /// Conditions that halt a queue until host intervention
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DatapathError::RingOverflow { .. } | DatapathError::InvalidDescriptor { .. }
        )
    }

    /// Fault code recorded in the queue status for fatal errors
    pub fn fault_code(&self) -> Option<FaultCode> {
        match self {
            DatapathError::RingOverflow { .. } => Some(FaultCode::RingOverflow),
            DatapathError::InvalidDescriptor { .. } => Some(FaultCode::InvalidDescriptor),
            DatapathError::HostMemory { .. } => Some(FaultCode::DmaError),
            _ => None,
        }
    }
}

/// Result type for the datapath
pub type DatapathResult<T> = Result<T, DatapathError>;
