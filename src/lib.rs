#![doc = include_str!("../README.md")]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod futex;
pub mod layout;
pub mod shm;
pub mod state;

pub use config::{EndpointConfig, SpinPolicy, SpinStrategy};
pub use endpoint::Endpoint;
pub use error::{Error, Phase};
#[cfg(target_os = "linux")]
pub use futex::Futex;
pub use futex::{default_waiter, yield_thread, ParkingLot, WaitOutcome, WaitWake};
pub use layout::{packet_size_for, PacketHeader, PacketWindow, MAX_DATA_CAP, PACKET_HEADER_BYTES};
pub use shm::SharedMemory;
pub use state::{Role, StatePair, Turn, INITIATOR_ACTIVE, RESPONDER_ACTIVE};

#[cfg(test)]
mod proptests;
