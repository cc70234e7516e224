//! Node-wide state.
//!
//! One [`EcNode`] owns everything a request handler needs and is passed
//! around as [`SharedNode`]. There are no globals.

use std::sync::Arc;

use ecnode_core::transport::PeerTransport;
use ecnode_proto::{EcError, EcResult};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::replication::Replicator;
use crate::space::SpaceManager;

pub type SharedNode = Arc<EcNode>;

pub struct EcNode {
    pub config: NodeConfig,
    pub space: SpaceManager,
    pub replicator: Replicator,
    /// Wakes the accept loop for shutdown.
    pub shutdown_notify: Arc<Notify>,
}

impl EcNode {
    /// Load local state from the configured disks and build the node.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> EcResult<SharedNode> {
        let space = SpaceManager::startup(&config.local_addr, &config.disks).await?;
        for stat in space.disk_stats().await {
            info!(
                "disk {} {:?}: {} partitions, {} of {} bytes free",
                stat.path.display(),
                stat.status,
                stat.partition_count,
                stat.free,
                stat.capacity
            );
        }
        info!(
            "node {} ready: {} partitions, transport {}",
            config.local_addr,
            space.partition_ids().await.len(),
            transport.name()
        );

        let replicator = Replicator::new(transport, config.replica_timeout);
        Ok(Arc::new(Self {
            config,
            space,
            replicator,
            shutdown_notify: Arc::new(Notify::new()),
        }))
    }

    pub fn local_addr(&self) -> &str {
        &self.config.local_addr
    }

    /// Check every extent of every partition against its block checksums.
    /// Returns the number of corrupt extents found.
    pub async fn scrub(&self) -> usize {
        let mut corrupt = 0;
        for partition_id in self.space.partition_ids().await {
            let Ok(partition) = self.space.partition(partition_id).await else {
                continue;
            };
            for extent_id in partition.store().extent_ids() {
                // Yield to a pending delete between extents.
                let Ok(_guard) = partition.begin_op().await else {
                    break;
                };
                match partition.store().verify(extent_id).await {
                    Ok(()) => {}
                    Err(EcError::ChecksumMismatch) => {
                        error!(
                            "scrub: extent {} of partition {} is corrupt",
                            extent_id, partition_id
                        );
                        corrupt += 1;
                    }
                    Err(e) => warn!(
                        "scrub: extent {} of partition {}: {}",
                        extent_id, partition_id, e
                    ),
                }
            }
        }
        corrupt
    }

    /// Stop accepting connections and drop pooled follower connections.
    pub async fn shutdown(&self) -> EcResult<()> {
        info!("node {} shutting down", self.config.local_addr);
        self.shutdown_notify.notify_one();
        self.replicator.transport().shutdown().await
    }
}
