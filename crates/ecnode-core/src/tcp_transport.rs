//! TCP-based peer transport, the default (kernel networking) implementation.
//!
//! Each call writes one packet and reads one reply on a pooled connection.
//! Uses [`SockfdCache`] to avoid a TCP handshake per follower round-trip.
//! A reply whose request ID does not match is treated as a broken stream.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use ecnode_proto::{EcError, EcResult, Packet};

use crate::codec::{read_packet, write_packet};
use crate::sockfd_cache::SockfdCache;
use crate::transport::PeerTransport;

/// TCP-based peer transport with connection pooling.
pub struct TcpTransport {
    cache: SockfdCache,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// `max_conns_per_node` controls the pool size per peer.
    pub fn new(max_conns_per_node: usize) -> Self {
        Self {
            cache: SockfdCache::new(max_conns_per_node),
        }
    }

    /// The underlying connection pool.
    pub fn cache(&self) -> &SockfdCache {
        &self.cache
    }

    /// Write one packet and read its reply. The connection is pooled again
    /// on success; on failure it is dropped along with the node's pool.
    async fn round_trip(
        &self,
        addr: &str,
        mut stream: TcpStream,
        packet: &Packet,
    ) -> EcResult<Packet> {
        let result = async {
            write_packet(&mut stream, packet).await?;
            // No deadline here: the caller bounds the whole round-trip.
            let reply = read_packet(&mut stream, None).await?;
            if reply.req_id != packet.req_id {
                warn!(
                    "reply from {} has req_id {} (expected {})",
                    addr, reply.req_id, packet.req_id
                );
                return Err(EcError::MalformedPacket);
            }
            Ok(reply)
        }
        .await;

        match result {
            Ok(reply) => {
                self.cache.put(addr, stream);
                Ok(reply)
            }
            Err(e) => {
                debug!("send to {} failed: {}", addr, e);
                self.cache.clear_node(addr);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn send_packet(&self, addr: &str, packet: &Packet) -> EcResult<Packet> {
        // A pooled connection may have been closed by the peer while idle.
        // Only that case is retried, once, on a fresh connection.
        if let Some(stream) = self.cache.get(addr) {
            match self.round_trip(addr, stream, packet).await {
                Err(EcError::NetworkError) => {
                    debug!("pooled connection to {} is stale, reconnecting", addr);
                }
                other => return other,
            }
        }

        let stream = crate::net::connect_to(addr).await?;
        self.round_trip(addr, stream, packet).await
    }

    async fn shutdown(&self) -> EcResult<()> {
        self.cache.clear_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecnode_proto::Opcode;
    use tokio::net::TcpListener;

    /// Minimal peer: answers every packet with Ok, echoing it back.
    async fn spawn_ok_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(mut p) = read_packet(&mut stream, None).await {
                        p.pack_ok();
                        if write_packet(&mut stream, &p).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_send_and_reuse_connection() {
        let addr = spawn_ok_peer().await;
        let transport = TcpTransport::new(4);
        assert_eq!(transport.name(), "tcp");

        let p = Packet::new_request(Opcode::CreateExtent, 1, 1025).forward_copy();
        let reply = transport.send_packet(&addr, &p).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.req_id, p.req_id);
        assert_eq!(transport.cache().idle_count(&addr), 1);

        // Second call reuses the pooled connection.
        let p2 = Packet::new_request(Opcode::CreateExtent, 1, 1026).forward_copy();
        let reply = transport.send_packet(&addr, &p2).await.unwrap();
        assert_eq!(reply.extent_id, 1026);
        assert_eq!(transport.cache().idle_count(&addr), 1);

        transport.shutdown().await.unwrap();
        assert_eq!(transport.cache().idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_stale_pooled_connection_reconnects() {
        // Peer answers one packet per connection, then hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                if let Ok(mut p) = read_packet(&mut stream, None).await {
                    p.pack_ok();
                    let _ = write_packet(&mut stream, &p).await;
                }
            }
        });

        let transport = TcpTransport::new(4);
        for eid in [1025, 1026, 1027] {
            let p = Packet::new_request(Opcode::CreateExtent, 1, eid).forward_copy();
            let reply = transport.send_packet(&addr, &p).await.unwrap();
            assert_eq!(reply.extent_id, eid);
        }
    }

    #[tokio::test]
    async fn test_send_to_dead_peer() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let transport = TcpTransport::new(4);
        let p = Packet::new_request(Opcode::CreateExtent, 1, 1025);
        assert_eq!(
            transport.send_packet(&addr, &p).await.unwrap_err(),
            EcError::NetworkError
        );
    }
}
