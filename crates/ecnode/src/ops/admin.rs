//! Partition lifecycle operations sent by the cluster controller.
//!
//! The packet body is a JSON [`AdminTask`]. The controller addresses each
//! host of a partition separately, so these are never replicated.

use ecnode_proto::{
    AdminTask, CreateEcPartitionRequest, DeleteEcPartitionRequest, EcError, Opcode,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{OpError, OpResult};
use crate::node::EcNode;
use crate::request::Request;

/// Decode the admin task in the packet body and check it targets the
/// same operation and partition as the header.
fn decode_task<R>(
    req: &Request,
    op: Opcode,
    partition_id: impl Fn(&R) -> u64,
) -> Result<AdminTask<R>, OpError>
where
    R: Serialize + for<'de> Deserialize<'de>,
{
    let task = AdminTask::<R>::from_json(&req.packet.data)
        .map_err(|e| OpError::new(e, format!("unparsable {} task", op)))?;

    if task.op_code != op.to_u8() {
        return Err(OpError::new(
            EcError::InvalidArgument,
            format!("task opcode {:#04x} sent as {}", task.op_code, op),
        ));
    }
    let task_pid = partition_id(&task.request);
    if req.packet.partition_id != 0 && req.packet.partition_id != task_pid {
        return Err(OpError::new(
            EcError::InvalidArgument,
            format!(
                "header partition {} does not match task partition {}",
                req.packet.partition_id, task_pid
            ),
        ));
    }
    Ok(task)
}

pub(super) async fn create_partition(node: &EcNode, req: &mut Request) -> OpResult {
    let task = decode_task(req, Opcode::CreateEcPartition, |r: &CreateEcPartitionRequest| {
        r.partition_id
    })?;
    let partition_id = task.request.partition_id;

    node.space.create_partition(task.request).await.map_err(|e| {
        OpError::new(
            e,
            format!("create partition {} on {}", partition_id, node.local_addr()),
        )
    })?;

    info!("partition {} created by {}", partition_id, task.operator);
    req.packet.partition_id = partition_id;
    req.packet.pack_ok();
    Ok(())
}

pub(super) async fn delete_partition(node: &EcNode, req: &mut Request) -> OpResult {
    let task = decode_task(req, Opcode::DeleteEcPartition, |r: &DeleteEcPartitionRequest| {
        r.partition_id
    })?;
    let partition_id = task.request.partition_id;

    node.space.delete_partition(partition_id).await.map_err(|e| {
        OpError::new(
            e,
            format!("delete partition {} on {}", partition_id, node.local_addr()),
        )
    })?;

    info!("partition {} deleted by {}", partition_id, task.operator);
    req.packet.partition_id = partition_id;
    req.packet.pack_ok();
    Ok(())
}
