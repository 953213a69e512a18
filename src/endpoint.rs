//! One side of a shared-memory control-transfer channel.
//!
//! Two endpoints, one per process, share a packet. At any moment exactly one
//! of them holds control and may touch the payload area; it hands control to
//! the peer with [`Endpoint::switch_to_peer`], and the peer picks it up with
//! [`Endpoint::switch_from_peer`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::{EndpointConfig, SpinPolicy};
use crate::error::{Error, Phase};
use crate::futex::{yield_thread, WaitWake};
use crate::layout::{PacketHeader, PacketWindow};
use crate::state::{self, Role, StatePair, Turn};

/// A process's handle to one side of the channel.
///
/// Control operations take `&self`, but the protocol is strictly ping-pong:
/// callers must not run two of them concurrently on the same endpoint.
#[derive(Debug)]
pub struct Endpoint {
    window: PacketWindow,
    role: Role,
    states: StatePair,
    spin: SpinPolicy,
    waiter: Arc<dyn WaitWake>,
    shutdown: AtomicBool,
    /// Threads of this process currently inside `switch_from_peer`.
    waiting: AtomicU32,
}

/// Keeps `Endpoint::waiting` raised for the lifetime of one wait loop.
struct WaitingGuard<'a>(&'a AtomicU32);

impl<'a> WaitingGuard<'a> {
    fn enter(count: &'a AtomicU32) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Endpoint {
    /// Attach to a packet. The packet header must already be initialised.
    pub fn new(window: PacketWindow, config: EndpointConfig) -> Self {
        tracing::debug!(
            role = ?config.role,
            active = config.states.active(),
            inactive = config.states.inactive(),
            data_cap = window.data_cap(),
            "endpoint attached"
        );
        Self {
            window,
            role: config.role,
            states: config.states,
            spin: config.spin,
            waiter: config.waiter,
            shutdown: AtomicBool::new(false),
            waiting: AtomicU32::new(0),
        }
    }

    /// Create a connected (initiator, responder) pair over a fresh packet.
    pub fn pair(data_cap: usize, spin: SpinPolicy) -> Result<(Self, Self), Error> {
        let window = PacketWindow::create("handoff-pair", data_cap)?;
        let initiator = Endpoint::new(
            window.clone(),
            EndpointConfig::new(Role::Initiator).with_spin(spin),
        );
        let responder = Endpoint::new(window, EndpointConfig::new(Role::Responder).with_spin(spin));
        Ok((initiator, responder))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn states(&self) -> StatePair {
        self.states
    }

    pub fn header(&self) -> &PacketHeader {
        self.window.header()
    }

    pub fn window(&self) -> &PacketWindow {
        &self.window
    }

    /// Current raw value of the connection-state word.
    pub fn conn_state(&self) -> u32 {
        self.word().load(Ordering::Acquire)
    }

    /// True if the connection state says this endpoint may run.
    pub fn is_active(&self) -> bool {
        matches!(state::observe(self.word(), self.states), Ok(Turn::Mine))
    }

    pub fn data_cap(&self) -> usize {
        self.window.data_cap()
    }

    fn word(&self) -> &AtomicU32 {
        &self.window.header().conn_state
    }

    /// Hand control to the peer and wake it.
    ///
    /// Fails with [`Error::UnexpectedState`] if this endpoint did not hold
    /// control; the word is left untouched in that case.
    pub fn switch_to_peer(&self) -> Result<(), Error> {
        let word = self.word();
        state::yield_control(word, self.states).map_err(|observed| Error::UnexpectedState {
            phase: Phase::BeforeWake,
            observed,
        })?;

        self.waiter.wake(word, 1).map_err(Error::WakeFailed)?;
        Ok(())
    }

    /// Wait until the peer hands control back.
    ///
    /// Returns immediately if control already arrived. Returns
    /// [`Error::Shutdown`] instead of blocking once
    /// [`request_shutdown`](Self::request_shutdown) has been called.
    pub fn switch_from_peer(&self) -> Result<(), Error> {
        self.switch_from_peer_with(self.spin)
    }

    fn switch_from_peer_with(&self, spin: SpinPolicy) -> Result<(), Error> {
        let word = self.word();
        let mut spins_left = spin.rounds;
        // Raised before the first shutdown check so `request_shutdown` keeps
        // waking until this loop has exited.
        let _waiting = WaitingGuard::enter(&self.waiting);

        loop {
            match state::observe(word, self.states) {
                Ok(Turn::Mine) => return Ok(()),
                Ok(Turn::Peer) => {}
                Err(observed) => {
                    return Err(Error::UnexpectedState {
                        phase: Phase::BeforeWait,
                        observed,
                    })
                }
            }

            if self.is_shutdown() {
                return Err(Error::Shutdown);
            }

            if spins_left > 0 {
                spins_left -= 1;
                spin.relax();
                continue;
            }

            tracing::trace!(role = ?self.role, state = self.states.inactive(), "parking");
            self.waiter
                .wait(word, self.states.inactive())
                .map_err(Error::WaitFailed)?;
        }
    }

    /// Ask this endpoint to stop waiting for the peer.
    ///
    /// The flag is local to this process. Every thread of this process inside
    /// `switch_from_peer` on this endpoint returns [`Error::Shutdown`] before
    /// this call returns: the word is woken repeatedly until none is left. A
    /// peer blocked on the same word may be woken too; it finds nothing
    /// changed and parks again.
    pub fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(role = ?self.role, "shutdown requested");

        // A waiter may have checked the flag just before it was set and not be
        // parked yet, so a single wake can miss it.
        while self.waiting.load(Ordering::SeqCst) > 0 {
            if let Err(err) = self.waiter.wake(self.word(), u32::MAX) {
                tracing::debug!(role = ?self.role, error = %err, "wake on shutdown failed");
                return;
            }
            yield_thread();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The payload area.
    ///
    /// # Safety
    /// The peer may write the payload whenever it holds control. Only read
    /// while this endpoint is active, and drop the slice before switching.
    pub unsafe fn data(&self) -> &[u8] {
        std::slice::from_raw_parts(self.window.data_ptr(), self.data_cap())
    }

    /// The payload area, mutably.
    ///
    /// # Safety
    /// Same as [`data`](Self::data): only while this endpoint is active.
    pub unsafe fn data_mut(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.window.data_ptr(), self.data_cap())
    }

    /// Copy `src` to the start of the payload area. Requires control.
    pub fn write_data(&self, src: &[u8]) -> Result<u32, Error> {
        self.check_len(src.len())?;
        self.require_active()?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.window.data_ptr(), src.len());
        }
        // `PacketWindow::new` keeps data_cap within u32.
        Ok(src.len() as u32)
    }

    /// Fill `dst` from the start of the payload area. Requires control.
    pub fn read_data(&self, dst: &mut [u8]) -> Result<usize, Error> {
        self.check_len(dst.len())?;
        self.require_active()?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.window.data_ptr(), dst.as_mut_ptr(), dst.len());
        }
        Ok(dst.len())
    }

    /// Publish `len` bytes of payload, hand control to the peer, and wait for
    /// its reply. Returns the length of the peer's payload.
    pub fn send_recv(&self, len: u32) -> Result<u32, Error> {
        self.store_len(len)?;
        self.switch_to_peer()?;
        self.switch_from_peer()?;
        self.load_len()
    }

    /// Like [`send_recv`](Self::send_recv), but spins before parking even if
    /// this endpoint's policy does not.
    pub fn send_recv_fast(&self, len: u32) -> Result<u32, Error> {
        let spin = if self.spin.is_disabled() {
            SpinPolicy::fast()
        } else {
            self.spin
        };

        self.store_len(len)?;
        self.switch_to_peer()?;
        self.switch_from_peer_with(spin)?;
        self.load_len()
    }

    /// Wait for the first message from the peer. Returns its payload length.
    pub fn recv_first(&self) -> Result<u32, Error> {
        self.switch_from_peer()?;
        self.load_len()
    }

    /// Publish `len` bytes of payload and hand control to the peer without
    /// waiting for a reply.
    pub fn send_last(&self, len: u32) -> Result<(), Error> {
        self.store_len(len)?;
        self.switch_to_peer()
    }

    fn check_len(&self, len: usize) -> Result<(), Error> {
        let cap = self.data_cap();
        if len > cap {
            return Err(Error::DataTooLong { len, cap });
        }
        Ok(())
    }

    fn require_active(&self) -> Result<(), Error> {
        match state::observe(self.word(), self.states) {
            Ok(Turn::Mine) => Ok(()),
            Ok(Turn::Peer) => Err(Error::UnexpectedState {
                phase: Phase::DataAccess,
                observed: self.states.inactive(),
            }),
            Err(observed) => Err(Error::UnexpectedState {
                phase: Phase::DataAccess,
                observed,
            }),
        }
    }

    // The yield CAS publishes this store to the peer.
    fn store_len(&self, len: u32) -> Result<(), Error> {
        self.check_len(len as usize)?;
        self.require_active()?;
        self.header().data_len.store(len, Ordering::Relaxed);
        Ok(())
    }

    fn load_len(&self) -> Result<u32, Error> {
        let len = self.header().data_len.load(Ordering::Relaxed);
        self.check_len(len as usize)?;
        Ok(len)
    }
}
