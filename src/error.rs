//! Error types for the control-transfer channel.

use std::fmt;
use std::io;

/// Where in the protocol an unexpected connection state was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Yielding control, before waking the peer.
    BeforeWake,
    /// Waiting for control, before blocking.
    BeforeWait,
    /// Touching the payload area.
    DataAccess,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeWake => write!(f, "before wake"),
            Self::BeforeWait => write!(f, "before wait"),
            Self::DataAccess => write!(f, "during data access"),
        }
    }
}

/// Errors surfaced by an [`Endpoint`](crate::Endpoint).
///
/// `UnexpectedState`, `WakeFailed` and `WaitFailed` are fatal to the
/// connection. `Shutdown` is the normal result of a local teardown.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection-state word held neither of the values this endpoint
    /// expected.
    #[error("unexpected connection state {phase}: {observed}")]
    UnexpectedState { phase: Phase, observed: u32 },

    #[error("failed to wake peer endpoint: {0}")]
    WakeFailed(#[source] io::Error),

    #[error("failed to wait for peer endpoint: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("endpoint is shut down")]
    Shutdown,

    #[error("failed to map packet buffer: {0}")]
    Map(#[source] io::Error),

    #[error("packet of {len} bytes is smaller than the {min}-byte header")]
    PacketTooSmall { len: usize, min: usize },

    #[error("packet offset {offset} is not 8-byte aligned")]
    Misaligned { offset: usize },

    #[error("packet at offset {offset} with length {len} exceeds mapping of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("packet payload of {len} bytes exceeds the {max}-byte limit of the length field")]
    PacketTooLarge { len: usize, max: usize },

    #[error("active and inactive states must differ (both are {value})")]
    InvalidStates { value: u32 },

    #[error("data length {len} exceeds packet capacity {cap}")]
    DataTooLong { len: usize, cap: usize },
}

impl Error {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// True if the shared state can no longer be trusted.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::UnexpectedState { .. })
    }
}
