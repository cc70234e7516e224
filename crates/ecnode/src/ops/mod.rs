//! Operation handlers.
//!
//! Operations are organized by scope:
//! - `admin`: partition lifecycle driven by the cluster controller
//! - `extent`: extent create/write/read/info within one partition
//!
//! [`operate`] is the single entry point: an exhaustive match over the
//! closed opcode set.

mod admin;
mod extent;

use std::fmt;

use ecnode_proto::{EcError, Opcode};

use crate::node::EcNode;
use crate::replication::ReplicationError;
use crate::request::Request;

/// A failed operation: the wire result code and the message returned with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub code: EcError,
    pub msg: String,
}

impl OpError {
    pub fn new(code: EcError, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

impl From<EcError> for OpError {
    fn from(code: EcError) -> Self {
        Self {
            code,
            msg: String::new(),
        }
    }
}

impl From<ReplicationError> for OpError {
    fn from(err: ReplicationError) -> Self {
        Self {
            code: err.kind,
            msg: err.to_string(),
        }
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.msg)
        }
    }
}

pub type OpResult = Result<(), OpError>;

/// Execute the request's operation. On success the handler has packed
/// the response; on failure the caller packs the error.
pub async fn operate(node: &EcNode, req: &mut Request, op: Opcode) -> OpResult {
    match op {
        Opcode::CreateEcPartition => admin::create_partition(node, req).await,
        Opcode::DeleteEcPartition => admin::delete_partition(node, req).await,
        Opcode::CreateExtent => extent::create_extent(node, req).await,
        Opcode::Write => extent::write(node, req).await,
        Opcode::Read => extent::read(node, req).await,
        Opcode::ExtentInfo => extent::extent_info(node, req).await,
    }
}
