use crate::errors::TransportError;
use crate::pool::Fragment;
use crate::shared_types::PeerId;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

// Work-completion opcodes, numbered as in the verbs API.
pub const OPCODE_SEND: u32 = 0;
pub const OPCODE_RDMA_WRITE: u32 = 1;
pub const OPCODE_RECV: u32 = 128;

pub const STATUS_LOCAL_LENGTH: u32 = 1;
pub const STATUS_FLUSHED: u32 = 5;

// -----------------------------------------------------------------------------
// ----- RawCompletion ---------------------------------------------------------

/// A completion record exactly as the device reports it.
#[derive(Debug)]
pub struct RawCompletion {
    pub wr_id: u64,
    pub peer: PeerId,
    pub opcode: u32,
    pub status: CompletionStatus,
    pub byte_len: usize,
    /// The posted receive buffer, for completions on the receive queue.
    pub buffer: Option<Fragment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed { code: u32, vendor: u32 },
}

impl RawCompletion {
    pub fn success(peer: PeerId, opcode: u32, wr_id: u64) -> Self {
        Self {
            wr_id,
            peer,
            opcode,
            status: CompletionStatus::Success,
            byte_len: 0,
            buffer: None,
        }
    }

    pub fn received(peer: PeerId, fragment: Fragment) -> Self {
        Self {
            wr_id: fragment.id().to_wr_id(),
            peer,
            opcode: OPCODE_RECV,
            status: CompletionStatus::Success,
            byte_len: fragment.len(),
            buffer: Some(fragment),
        }
    }

    pub fn failed(peer: PeerId, opcode: u32, wr_id: u64, code: u32) -> Self {
        Self {
            wr_id,
            peer,
            opcode,
            status: CompletionStatus::Failed { code, vendor: 0 },
            byte_len: 0,
            buffer: None,
        }
    }

    pub fn with_buffer(mut self, fragment: Fragment) -> Self {
        self.byte_len = fragment.len();
        self.buffer = Some(fragment);
        self
    }
}

// -----------------------------------------------------------------------------
// ----- Completion ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Send,
    Receive,
    RdmaWrite,
    Error,
    Empty,
}

/// A classified completion, ready for dispatch.
#[derive(Debug)]
pub enum Completion {
    Empty,
    Send {
        peer: PeerId,
        wr_id: u64,
    },
    Receive {
        peer: PeerId,
        fragment: Fragment,
    },
    RdmaWrite {
        peer: PeerId,
        wr_id: u64,
    },
    Error {
        peer: PeerId,
        wr_id: u64,
        error: TransportError,
        buffer: Option<Fragment>,
    },
}

impl Completion {
    pub fn kind(&self) -> CompletionKind {
        match self {
            Completion::Empty => CompletionKind::Empty,
            Completion::Send { .. } => CompletionKind::Send,
            Completion::Receive { .. } => CompletionKind::Receive,
            Completion::RdmaWrite { .. } => CompletionKind::RdmaWrite,
            Completion::Error { .. } => CompletionKind::Error,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- classify --------------------------------------------------------------

/// Map one poll result onto a completion variant.
pub fn classify(raw: Option<RawCompletion>) -> Completion {
    let Some(raw) = raw else {
        return Completion::Empty;
    };

    let RawCompletion {
        wr_id,
        peer,
        opcode,
        status,
        buffer,
        ..
    } = raw;

    if let CompletionStatus::Failed { code, vendor } = status {
        return Completion::Error {
            peer,
            wr_id,
            error: TransportError::connection_failed(
                peer,
                format!("work completion status {code}, vendor code {vendor}"),
            ),
            buffer,
        };
    }

    match opcode {
        OPCODE_SEND | OPCODE_RDMA_WRITE if buffer.is_some() => protocol_error(
            peer,
            wr_id,
            "send queue completion carried a receive buffer",
            buffer,
        ),
        OPCODE_SEND => Completion::Send { peer, wr_id },
        OPCODE_RDMA_WRITE => Completion::RdmaWrite { peer, wr_id },
        OPCODE_RECV => match buffer {
            Some(fragment) => Completion::Receive { peer, fragment },
            None => protocol_error(peer, wr_id, "receive completion without a buffer", None),
        },
        other => protocol_error(
            peer,
            wr_id,
            &format!("unknown completion opcode {other}"),
            buffer,
        ),
    }
}

fn protocol_error(
    peer: PeerId,
    wr_id: u64,
    reason: &str,
    buffer: Option<Fragment>,
) -> Completion {
    Completion::Error {
        peer,
        wr_id,
        error: TransportError::ProtocolViolation(reason.to_string()),
        buffer,
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
