//! Erasure-coded partitions.
//!
//! An [`EcPartition`] is one partition resident on this node: its
//! immutable geometry and host list (persisted as `META`), its directory
//! on one disk, and the [`ExtentStore`] holding its extents.
//!
//! Host order is significant: the first `data_node_num` hosts hold data
//! stripes, the remaining `parity_node_num` hosts hold parity stripes.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ecnode_proto::constants::PARTITION_META_FILE;
use ecnode_proto::{CreateEcPartitionRequest, EcError, EcResult, ExtentInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

use crate::store::{common, ExtentState, ExtentStore};

/// Persistent description of a partition. Never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcPartitionMeta {
    pub partition_id: u64,
    pub partition_size: u64,
    pub volume_id: String,
    pub stripe_unit_size: u64,
    pub extent_file_size: u64,
    pub data_node_num: u32,
    pub parity_node_num: u32,
    pub hosts: Vec<String>,
    /// Unix nanos at creation.
    pub create_time: i64,
}

impl From<CreateEcPartitionRequest> for EcPartitionMeta {
    fn from(req: CreateEcPartitionRequest) -> Self {
        Self {
            partition_id: req.partition_id,
            partition_size: req.partition_size,
            volume_id: req.volume_id,
            stripe_unit_size: req.stripe_unit_size,
            extent_file_size: req.extent_file_size,
            data_node_num: req.data_node_num,
            parity_node_num: req.parity_node_num,
            hosts: req.hosts,
            create_time: ecnode_proto::packet::now_nanos(),
        }
    }
}

impl EcPartitionMeta {
    /// Check the geometry and that `local_addr` is one of the hosts.
    pub fn validate(&self, local_addr: &str) -> EcResult<()> {
        let reject = |why: &str| {
            warn!("partition {}: {}", self.partition_id, why);
            Err(EcError::InvalidArgument)
        };

        if self.partition_id == 0 {
            return reject("partition id 0 is reserved");
        }
        if self.partition_size == 0 {
            return reject("partition size is zero");
        }
        if self.data_node_num == 0 {
            return reject("no data nodes");
        }
        let expected = self.data_node_num as usize + self.parity_node_num as usize;
        if self.hosts.len() != expected {
            return reject(&format!(
                "{} hosts for {}+{} geometry",
                self.hosts.len(),
                self.data_node_num,
                self.parity_node_num
            ));
        }
        let unique: HashSet<&str> = self.hosts.iter().map(String::as_str).collect();
        if unique.len() != self.hosts.len() {
            return reject("duplicate host in host list");
        }
        if self.stripe_unit_size == 0 || self.extent_file_size == 0 {
            return reject("zero stripe unit or extent size");
        }
        if self.extent_file_size % self.stripe_unit_size != 0 {
            return reject("extent size is not a multiple of the stripe unit");
        }
        if !unique.contains(local_addr) {
            return reject(&format!("local address {} not in host list", local_addr));
        }
        Ok(())
    }

    pub fn dir_name(&self) -> String {
        common::partition_dir_name(self.partition_id, self.partition_size)
    }
}

/// Stripe role of a position in the host list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    /// Holds data stripe `i`.
    Data(usize),
    /// Holds parity stripe `i`.
    Parity(usize),
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(i) => write!(f, "data[{}]", i),
            Self::Parity(i) => write!(f, "parity[{}]", i),
        }
    }
}

/// One erasure-coded partition resident on this node.
pub struct EcPartition {
    meta: EcPartitionMeta,
    path: PathBuf,
    disk_path: PathBuf,
    local_addr: String,
    store: ExtentStore,
    /// Held shared by every in-flight operation, exclusively by delete.
    barrier: Arc<RwLock<()>>,
    deleted: AtomicBool,
}

impl EcPartition {
    /// Create the partition directory on `disk_path` and persist its META.
    pub async fn create(
        disk_path: &Path,
        meta: EcPartitionMeta,
        local_addr: &str,
    ) -> EcResult<Self> {
        meta.validate(local_addr)?;

        let path = disk_path.join(meta.dir_name());
        let encoded = bincode::serialize(&meta).map_err(|_| EcError::Internal)?;

        let dir = path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir(&dir).map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    EcError::AlreadyExists
                } else {
                    warn!("failed to create partition dir {}: {}", dir.display(), e);
                    EcError::Io
                }
            })?;
            let written = common::atomic_write(&dir.join(PARTITION_META_FILE), &encoded);
            if written.is_err() {
                let _ = std::fs::remove_dir_all(&dir);
            }
            written
        })
        .await
        .map_err(|_| EcError::Internal)??;

        let store = ExtentStore::new(&path, meta.stripe_unit_size, meta.extent_file_size);
        let partition = Self::assemble(meta, path, disk_path, local_addr, store);
        info!("created {} at {}", partition, partition.path.display());
        Ok(partition)
    }

    /// Load a partition from its directory.
    pub async fn load(dir: &Path, disk_path: &Path, local_addr: &str) -> EcResult<Self> {
        let meta_path = dir.join(PARTITION_META_FILE);
        let raw = tokio::task::spawn_blocking(move || std::fs::read(meta_path))
            .await
            .map_err(|_| EcError::Internal)?
            .map_err(|e| {
                warn!("failed to read META in {}: {}", dir.display(), e);
                EcError::Io
            })?;

        let meta: EcPartitionMeta = bincode::deserialize(&raw).map_err(|e| {
            warn!("corrupt META in {}: {}", dir.display(), e);
            EcError::Io
        })?;
        meta.validate(local_addr)?;

        let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if dir_name != meta.dir_name() {
            warn!(
                "partition dir {} does not match META ({})",
                dir.display(),
                meta.dir_name()
            );
            return Err(EcError::InvalidArgument);
        }

        let store = ExtentStore::load(dir, meta.stripe_unit_size, meta.extent_file_size).await?;
        let partition = Self::assemble(meta, dir.to_path_buf(), disk_path, local_addr, store);
        debug!(
            "loaded {} with {} extents",
            partition,
            partition.store.extent_count()
        );
        Ok(partition)
    }

    fn assemble(
        meta: EcPartitionMeta,
        path: PathBuf,
        disk_path: &Path,
        local_addr: &str,
        store: ExtentStore,
    ) -> Self {
        Self {
            meta,
            path,
            disk_path: disk_path.to_path_buf(),
            local_addr: local_addr.to_string(),
            store,
            barrier: Arc::new(RwLock::new(())),
            deleted: AtomicBool::new(false),
        }
    }

    // --- Geometry ---

    pub fn partition_id(&self) -> u64 {
        self.meta.partition_id
    }

    pub fn partition_size(&self) -> u64 {
        self.meta.partition_size
    }

    pub fn volume_id(&self) -> &str {
        &self.meta.volume_id
    }

    pub fn stripe_unit_size(&self) -> u64 {
        self.meta.stripe_unit_size
    }

    pub fn extent_file_size(&self) -> u64 {
        self.meta.extent_file_size
    }

    pub fn data_node_count(&self) -> usize {
        self.meta.data_node_num as usize
    }

    pub fn parity_node_count(&self) -> usize {
        self.meta.parity_node_num as usize
    }

    pub fn hosts(&self) -> &[String] {
        &self.meta.hosts
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }

    pub fn store(&self) -> &ExtentStore {
        &self.store
    }

    // --- Hosts ---

    pub fn is_local_host(&self, addr: &str) -> bool {
        self.local_addr == addr
    }

    /// The host list minus this node, in host-list order.
    pub fn follower_hosts(&self) -> Vec<String> {
        self.hosts()
            .iter()
            .filter(|h| !self.is_local_host(h))
            .cloned()
            .collect()
    }

    /// Stripe role of host-list position `index`.
    pub fn host_role(&self, index: usize) -> Option<HostRole> {
        let data = self.data_node_count();
        if index < data {
            Some(HostRole::Data(index))
        } else if index < data + self.parity_node_count() {
            Some(HostRole::Parity(index - data))
        } else {
            None
        }
    }

    /// Stripe role of this node.
    pub fn local_role(&self) -> Option<HostRole> {
        let index = self.hosts().iter().position(|h| self.is_local_host(h))?;
        self.host_role(index)
    }

    // --- Extents ---

    /// Create an extent on this node only.
    pub async fn create_local_extent(&self, extent_id: u64) -> EcResult<u64> {
        self.store.create_extent(extent_id).await
    }

    /// Create an extent on this node, keeping its ordering guard for the
    /// replication that follows.
    pub async fn create_local_extent_ordered(
        &self,
        extent_id: u64,
    ) -> EcResult<(u64, OwnedMutexGuard<()>)> {
        self.store.create_extent_ordered(extent_id).await
    }

    /// Serialize a primary's apply-and-replicate of one extent.
    pub async fn order_extent(&self, extent_id: u64) -> EcResult<OwnedMutexGuard<()>> {
        self.store.order_extent(extent_id).await
    }

    pub async fn write(
        &self,
        extent_id: u64,
        offset: u64,
        data: Vec<u8>,
        crc: u32,
    ) -> EcResult<ExtentState> {
        self.store.write(extent_id, offset, data, crc).await
    }

    pub async fn read(&self, extent_id: u64, offset: u64, size: u64) -> EcResult<(Vec<u8>, u32)> {
        self.store.read(extent_id, offset, size).await
    }

    pub async fn extent_info(&self, extent_id: u64) -> EcResult<ExtentInfo> {
        self.store.info(extent_id).await
    }

    // --- Operation barrier ---

    /// Enter the partition for one operation. Fails with `NotFound` once
    /// the partition is being deleted.
    pub async fn begin_op(&self) -> EcResult<OwnedRwLockReadGuard<()>> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(EcError::NotFound);
        }
        let guard = self.barrier.clone().read_owned().await;
        if self.deleted.load(Ordering::Acquire) {
            return Err(EcError::NotFound);
        }
        Ok(guard)
    }

    /// Refuse new operations and wait for in-flight ones to finish.
    pub async fn drain(&self) -> OwnedRwLockWriteGuard<()> {
        self.deleted.store(true, Ordering::Release);
        self.barrier.clone().write_owned().await
    }
}

impl fmt::Display for EcPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {} (vol {}, {}+{}, unit {}, extent {})",
            self.partition_id(),
            self.volume_id(),
            self.data_node_count(),
            self.parity_node_count(),
            self.stripe_unit_size(),
            self.extent_file_size()
        )?;
        match self.local_role() {
            Some(role) => write!(f, " as {}", role),
            None => Ok(()),
        }
    }
}
