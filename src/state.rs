//! Connection state machine.
//!
//! A single shared word says whose turn it is. The two roles read it through
//! complementary [`StatePair`]s: the initiator's active value is the
//! responder's inactive value and vice versa, so at most one side can ever
//! see "my turn".

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Error;

/// Connection state meaning "the initiator may run".
pub const INITIATOR_ACTIVE: u32 = 1;
/// Connection state meaning "the responder may run".
pub const RESPONDER_ACTIVE: u32 = 2;

/// Which side of the connection an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Holds control when the packet is initialised ("client").
    Initiator,
    /// Starts out waiting for the initiator ("server").
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    /// The conventional state pair for this role.
    pub fn default_states(self) -> StatePair {
        match self {
            Role::Initiator => StatePair {
                active: INITIATOR_ACTIVE,
                inactive: RESPONDER_ACTIVE,
            },
            Role::Responder => StatePair {
                active: RESPONDER_ACTIVE,
                inactive: INITIATOR_ACTIVE,
            },
        }
    }
}

/// The two connection-state values as seen from one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatePair {
    active: u32,
    inactive: u32,
}

impl StatePair {
    pub fn new(active: u32, inactive: u32) -> Result<Self, Error> {
        if active == inactive {
            return Err(Error::InvalidStates { value: active });
        }
        Ok(Self { active, inactive })
    }

    /// Value meaning "this endpoint may run".
    pub fn active(&self) -> u32 {
        self.active
    }

    /// Value meaning "the peer may run".
    pub fn inactive(&self) -> u32 {
        self.inactive
    }

    /// The pair as the peer sees it.
    pub fn swapped(self) -> StatePair {
        StatePair {
            active: self.inactive,
            inactive: self.active,
        }
    }
}

/// Result of reading the connection-state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Mine,
    Peer,
}

/// Read the word. `Err` carries a value matching neither state.
#[inline]
pub fn observe(word: &AtomicU32, states: StatePair) -> Result<Turn, u32> {
    match word.load(Ordering::Acquire) {
        s if s == states.active => Ok(Turn::Mine),
        s if s == states.inactive => Ok(Turn::Peer),
        other => Err(other),
    }
}

/// Hand the word to the peer. Only valid while it holds `states.active`;
/// otherwise returns the value actually observed and leaves the word alone.
#[inline]
pub fn yield_control(word: &AtomicU32, states: StatePair) -> Result<(), u32> {
    word.compare_exchange(
        states.active,
        states.inactive,
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .map(|_| ())
}
