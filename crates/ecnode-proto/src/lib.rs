//! # ecnode-proto
//!
//! Protocol types, constants, and data structures for the erasure-coded
//! storage node.
//!
//! This crate defines the binary packet format, opcodes, result codes,
//! admin task payloads and the unified error type shared by the node
//! daemon and its networking layer.

pub mod admin;
pub mod constants;
pub mod defaults;
pub mod error;
pub mod packet;

// Re-export commonly used types at the crate root
pub use admin::{AdminTask, CreateEcPartitionRequest, DeleteEcPartitionRequest, ExtentInfo};
pub use error::{EcError, EcResult};
pub use packet::{Opcode, Packet, ResultCode};
