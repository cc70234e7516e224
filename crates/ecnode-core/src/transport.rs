//! Peer transport abstraction: decouples replication from the socket layer.
//!
//! The replication coordinator sends follower packets through
//! `PeerTransport`, so tests and alternative transports can be plugged in
//! at startup. [`TcpTransport`](crate::tcp_transport::TcpTransport) is the
//! kernel TCP implementation.

use async_trait::async_trait;
use ecnode_proto::{EcResult, Packet};

/// Abstraction over the node-to-node packet transport.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Send a packet to `addr` (`host:port`) and await the peer's reply.
    ///
    /// Transport failures are `NetworkError` (or `MalformedPacket` for a
    /// garbled reply). A reply carrying a failure result code is still
    /// `Ok`; interpreting it is the caller's business. The call itself has
    /// no deadline: callers wrap it in their own timeout.
    async fn send_packet(&self, addr: &str, packet: &Packet) -> EcResult<Packet>;

    /// Shut down the transport, releasing all pooled resources.
    async fn shutdown(&self) -> EcResult<()>;
}
