//! Data model: timestamps, packets, type tags, calculator contracts.

pub mod contract;
pub mod error;
pub mod packet;
pub mod timestamp;
pub mod types;

pub use contract::{CalculatorContract, HandlerChoice, OnFull, PortSpec, SidePacketSpec};
pub use error::PacketError;
pub use packet::Packet;
pub use timestamp::Timestamp;
pub use types::{DeclaredType, TypeTag, register_type};
