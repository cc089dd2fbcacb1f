//! AR/RPC connection management
//!
//! Connect negotiation over UDP 34964, the per-device state machine,
//! and the AR records that own the cyclic IOCR buffers.

pub mod ar;
pub mod connect;
pub mod manager;
pub mod strategy;

pub use ar::{Ar, CyclicStats};
pub use connect::{ConnectAck, ConnectParams};
pub use manager::{ConnectionConfig, ConnectionManager};
pub use strategy::{ConnectStrategy, SlotScope, TimingTuple, UuidEncoding};
