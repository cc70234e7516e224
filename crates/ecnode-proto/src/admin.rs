/// Admin task payloads sent by the cluster controller.
///
/// Partition-level requests travel as the JSON body of a packet, wrapped
/// in an [`AdminTask`] envelope.

use serde::{Deserialize, Serialize};

use crate::error::{EcError, EcResult};
use crate::packet::{generate_request_id, now_nanos, Opcode};

/// Envelope around a controller request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminTask<R> {
    /// Task identifier (for tracing on the controller side).
    pub id: String,
    /// Opcode this task is meant for.
    pub op_code: u8,
    /// Address of the host the task was issued to.
    pub operator: String,
    /// Creation time (unix nanos).
    pub create_time: i64,
    /// The request proper.
    pub request: R,
}

impl<R> AdminTask<R>
where
    R: Serialize + for<'de> Deserialize<'de>,
{
    pub fn new(op: Opcode, operator: &str, request: R) -> Self {
        Self {
            id: format!("{}_{}", operator, generate_request_id()),
            op_code: op.to_u8(),
            operator: operator.to_string(),
            create_time: now_nanos(),
            request,
        }
    }

    pub fn to_json(&self) -> EcResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| EcError::Internal)
    }

    pub fn from_json(body: &[u8]) -> EcResult<Self> {
        serde_json::from_slice(body).map_err(|_| EcError::InvalidArgument)
    }
}

/// Create an erasure-coded partition on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEcPartitionRequest {
    pub partition_id: u64,
    /// Space budget reserved on the chosen disk (bytes).
    pub partition_size: u64,
    pub volume_id: String,
    /// Bytes per stripe write unit.
    pub stripe_unit_size: u64,
    /// Maximum length of one extent file (bytes).
    pub extent_file_size: u64,
    pub data_node_num: u32,
    pub parity_node_num: u32,
    /// Data hosts followed by parity hosts.
    pub hosts: Vec<String>,
}

/// Delete a partition from this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEcPartitionRequest {
    pub partition_id: u64,
}

/// Extent attributes returned by the extent-info opcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentInfo {
    pub extent_id: u64,
    /// Current length in bytes.
    pub size: u64,
    /// CRC-32 of the most recent write.
    pub crc: u32,
    /// Last modification (unix seconds).
    pub modify_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_task_json() {
        let req = CreateEcPartitionRequest {
            partition_id: 1,
            partition_size: 5 << 30,
            volume_id: "ltptest".to_string(),
            stripe_unit_size: 4096,
            extent_file_size: 64 << 20,
            data_node_num: 4,
            parity_node_num: 2,
            hosts: vec!["127.0.0.1:17310".to_string()],
        };
        let task = AdminTask::new(Opcode::CreateEcPartition, "127.0.0.1:17310", req.clone());
        let body = task.to_json().unwrap();

        let parsed: AdminTask<CreateEcPartitionRequest> = AdminTask::from_json(&body).unwrap();
        assert_eq!(parsed.op_code, Opcode::CreateEcPartition.to_u8());
        assert_eq!(parsed.request, req);
    }

    #[test]
    fn test_admin_task_garbage() {
        let err = AdminTask::<DeleteEcPartitionRequest>::from_json(b"{not json").unwrap_err();
        assert_eq!(err, EcError::InvalidArgument);
    }
}
