//! # ecnode-core
//!
//! Core networking library for the erasure-coded storage node.
//! Provides async listen/connect helpers, the packet stream codec,
//! pooled peer connections and the peer transport used for replication.

pub mod codec;
pub mod net;
pub mod sockfd_cache;
pub mod tcp_transport;
pub mod transport;
