//! Endpoint configuration.

use std::sync::Arc;

use crate::futex::{default_waiter, yield_thread, WaitWake};
use crate::state::{Role, StatePair};

const DEFAULT_SPIN_ROUNDS: u32 = 0;
const FAST_SPIN_ROUNDS: u32 = 64;

fn default_spin_rounds() -> u32 {
    std::env::var("HANDOFF_SPIN_ROUNDS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_SPIN_ROUNDS)
}

/// What to do between two re-checks of the connection state while spinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinStrategy {
    /// Give the time slice away (`sched_yield`).
    Yield,
    /// CPU spin-loop hint only.
    Hint,
}

/// Bounded spin-then-park policy used while waiting for the peer.
///
/// Each time the peer still holds control, the waiting endpoint re-checks up
/// to `rounds` times before blocking in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    pub rounds: u32,
    pub strategy: SpinStrategy,
}

impl SpinPolicy {
    pub const fn new(rounds: u32, strategy: SpinStrategy) -> Self {
        Self { rounds, strategy }
    }

    /// Always park immediately.
    pub const fn disabled() -> Self {
        Self::new(0, SpinPolicy::DEFAULT_STRATEGY)
    }

    /// Policy for latency-sensitive round trips.
    pub const fn fast() -> Self {
        Self::new(FAST_SPIN_ROUNDS, SpinStrategy::Yield)
    }

    const DEFAULT_STRATEGY: SpinStrategy = SpinStrategy::Yield;

    pub fn is_disabled(&self) -> bool {
        self.rounds == 0
    }

    /// One spin round.
    #[inline]
    pub fn relax(&self) {
        match self.strategy {
            SpinStrategy::Yield => yield_thread(),
            SpinStrategy::Hint => std::hint::spin_loop(),
        }
    }
}

impl Default for SpinPolicy {
    /// `HANDOFF_SPIN_ROUNDS` from the environment, or no spinning.
    fn default() -> Self {
        Self::new(default_spin_rounds(), Self::DEFAULT_STRATEGY)
    }
}

/// Everything an [`Endpoint`](crate::Endpoint) needs besides its packet.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub role: Role,
    pub states: StatePair,
    pub spin: SpinPolicy,
    pub waiter: Arc<dyn WaitWake>,
}

impl EndpointConfig {
    /// Conventional states for `role`, the platform waiter and the default
    /// spin policy.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            states: role.default_states(),
            spin: SpinPolicy::default(),
            waiter: default_waiter(),
        }
    }

    pub fn with_states(mut self, states: StatePair) -> Self {
        self.states = states;
        self
    }

    pub fn with_spin(mut self, spin: SpinPolicy) -> Self {
        self.spin = spin;
        self
    }

    pub fn with_waiter(mut self, waiter: Arc<dyn WaitWake>) -> Self {
        self.waiter = waiter;
        self
    }
}
