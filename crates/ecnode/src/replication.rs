//! Primary to follower replication.
//!
//! After the primary has applied a create-extent or write locally, the
//! [`Replicator`] sends an equivalent forwarded packet to every other host
//! of the partition, one after another in host-list order, and waits for
//! each reply under a timeout. The operation succeeds only if every
//! follower acknowledges. There is no retry and no quorum; a failed
//! follower leaves the primary's local copy in place.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ecnode_core::transport::PeerTransport;
use ecnode_proto::{EcError, Opcode, Packet};
use tracing::{debug, warn};

use crate::partition::EcPartition;

/// Why one follower did not acknowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerFailure {
    pub host: String,
    /// `ReplicationNetwork`, `ReplicationTimeout` or `ReplicationRejected`.
    pub kind: EcError,
    pub detail: String,
}

impl fmt::Display for FollowerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.host, self.kind, self.detail)
    }
}

/// Aggregate outcome of a failed replication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("replication failed on {} of {} followers: {}", .failures.len(), .followers, describe(.failures))]
pub struct ReplicationError {
    /// Kind of the first failure in host-list order; this is the result
    /// code returned to the client.
    pub kind: EcError,
    pub followers: usize,
    pub failures: Vec<FollowerFailure>,
}

fn describe(failures: &[FollowerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Sends forwarded packets to followers.
pub struct Replicator {
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl Replicator {
    pub fn new(transport: Arc<dyn PeerTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Mirror `packet` to every follower of `partition`.
    ///
    /// `packet` must already carry the values the primary applied (for a
    /// create-extent, the assigned extent ID).
    pub async fn replicate(
        &self,
        partition: &EcPartition,
        packet: &Packet,
    ) -> Result<(), ReplicationError> {
        let followers = partition.follower_hosts();
        let mut failures = Vec::new();

        for host in &followers {
            let forwarded = packet.forward_copy();
            match self.send_one(host, &forwarded).await {
                Ok(()) => debug!("{} replicated to {}", packet, host),
                Err(failure) => {
                    warn!("{} replication: {}", packet, failure);
                    failures.push(failure);
                }
            }
        }

        match failures.first() {
            None => Ok(()),
            Some(first) => Err(ReplicationError {
                kind: first.kind,
                followers: followers.len(),
                failures,
            }),
        }
    }

    async fn send_one(&self, host: &str, forwarded: &Packet) -> Result<(), FollowerFailure> {
        let failure = |kind: EcError, detail: String| FollowerFailure {
            host: host.to_string(),
            kind,
            detail,
        };

        let reply =
            match tokio::time::timeout(self.timeout, self.transport.send_packet(host, forwarded))
                .await
            {
                Err(_) => {
                    return Err(failure(
                        EcError::ReplicationTimeout,
                        format!("no reply within {:?}", self.timeout),
                    ))
                }
                Ok(Err(EcError::Timeout)) => {
                    return Err(failure(
                        EcError::ReplicationTimeout,
                        "transport timed out".to_string(),
                    ))
                }
                Ok(Err(e)) => {
                    return Err(failure(
                        EcError::ReplicationNetwork,
                        format!("send/receive: {}", e),
                    ))
                }
                Ok(Ok(reply)) => reply,
            };

        if let Err(e) = reply.result() {
            return Err(failure(
                EcError::ReplicationRejected,
                format!("apply: {}: {}", e, reply.get_result_msg()),
            ));
        }

        // A follower that created a different extent than the primary
        // would silently diverge.
        if forwarded.op() == Ok(Opcode::CreateExtent) && reply.extent_id != forwarded.extent_id {
            return Err(failure(
                EcError::ReplicationRejected,
                format!(
                    "apply: created extent {} instead of {}",
                    reply.extent_id, forwarded.extent_id
                ),
            ));
        }

        Ok(())
    }
}
