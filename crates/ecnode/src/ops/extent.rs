//! Extent operations within one partition.
//!
//! Create-extent and write are applied locally first and then mirrored to
//! the followers, unless the packet was itself forwarded by a primary.
//! A local failure is returned without contacting any follower.

use std::sync::Arc;

use ecnode_proto::EcError;
use tracing::debug;

use super::{OpError, OpResult};
use crate::node::EcNode;
use crate::partition::EcPartition;
use crate::request::Request;

fn partition(req: &Request) -> Result<Arc<EcPartition>, OpError> {
    req.partition
        .clone()
        .ok_or_else(|| OpError::new(EcError::Internal, "partition not resolved"))
}

fn local_err(node: &EcNode, req: &Request, what: &str) -> impl FnOnce(EcError) -> OpError {
    let msg = format!(
        "{} extent {} of partition {} on {}",
        what,
        req.packet.extent_id,
        req.packet.partition_id,
        node.local_addr()
    );
    move |e| OpError::new(e, msg)
}

pub(super) async fn create_extent(node: &EcNode, req: &mut Request) -> OpResult {
    let partition = partition(req)?;

    if req.packet.is_forwarded() {
        let extent_id = partition
            .create_local_extent(req.packet.extent_id)
            .await
            .map_err(local_err(node, req, "create"))?;
        req.packet.extent_id = extent_id;
    } else {
        // Held until the followers answer, so a write to this extent cannot
        // reach them ahead of the create.
        let (extent_id, _order) = partition
            .create_local_extent_ordered(req.packet.extent_id)
            .await
            .map_err(local_err(node, req, "create"))?;
        // Followers must create the same ID the primary assigned.
        req.packet.extent_id = extent_id;
        node.replicator.replicate(&partition, &req.packet).await?;
    }

    debug!(
        "extent {} ready in partition {}",
        req.packet.extent_id,
        partition.partition_id()
    );
    req.packet.pack_ok();
    Ok(())
}

pub(super) async fn write(node: &EcNode, req: &mut Request) -> OpResult {
    let partition = partition(req)?;
    let extent_id = req.packet.extent_id;
    let offset = req.packet.extent_offset;
    let crc = req.packet.crc;

    if req.packet.is_forwarded() {
        // The primary already ordered this write against its others.
        let data = std::mem::take(&mut req.packet.data);
        partition
            .write(extent_id, offset, data, crc)
            .await
            .map_err(local_err(node, req, "write"))?;
    } else {
        // Writes to one extent are applied and mirrored one at a time, so
        // every follower sees them in the primary's order.
        let _order = partition
            .order_extent(extent_id)
            .await
            .map_err(local_err(node, req, "write"))?;
        partition
            .write(extent_id, offset, req.packet.data.clone(), crc)
            .await
            .map_err(local_err(node, req, "write"))?;
        node.replicator.replicate(&partition, &req.packet).await?;
    }

    req.packet.pack_ok();
    Ok(())
}

pub(super) async fn read(node: &EcNode, req: &mut Request) -> OpResult {
    let partition = partition(req)?;

    let (data, crc) = partition
        .read(
            req.packet.extent_id,
            req.packet.extent_offset,
            req.packet.size as u64,
        )
        .await
        .map_err(local_err(node, req, "read"))?;

    req.packet.pack_ok_with_data(data);
    req.packet.crc = crc;
    Ok(())
}

pub(super) async fn extent_info(node: &EcNode, req: &mut Request) -> OpResult {
    let partition = partition(req)?;

    let info = partition
        .extent_info(req.packet.extent_id)
        .await
        .map_err(local_err(node, req, "stat"))?;
    let body = serde_json::to_vec(&info).map_err(|_| OpError::from(EcError::Internal))?;

    req.packet.pack_ok_with_data(body);
    Ok(())
}
