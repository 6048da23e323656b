//! Device capabilities consumed by the transport core, plus the
//! in-memory fabric used by the binary and the tests.

pub mod capability;
pub mod completion;
pub mod event;
pub mod memory;

pub use capability::{Device, DeviceProvider, RejectedReceive};
pub use completion::{
    Completion, CompletionKind, CompletionStatus, OPCODE_RDMA_WRITE, OPCODE_RECV, OPCODE_SEND,
    RawCompletion, STATUS_FLUSHED, STATUS_LOCAL_LENGTH, classify,
};
pub use event::{ConnectionEvent, ConnectionEventKind};
pub use memory::{MemoryDevice, MemoryFabric, MemoryProvider};
