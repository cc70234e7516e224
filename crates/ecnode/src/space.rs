//! Space manager: disks and the partitions resident on them.
//!
//! On startup every configured disk is scanned for partition directories;
//! the directories on disk are the source of truth. New partitions are
//! placed on an available disk with enough unreserved capacity, chosen by
//! weighted random selection over free space. Each partition reserves its
//! full size budget on its disk.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ecnode_proto::{CreateEcPartitionRequest, EcError, EcResult};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::DiskConfig;
use crate::partition::{EcPartition, EcPartitionMeta};
use crate::store::common;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Available,
    /// The disk could not be scanned; no partitions are placed on it.
    Unavailable,
}

/// One data disk.
#[derive(Debug, Clone)]
pub struct Disk {
    pub path: PathBuf,
    /// Space budget in bytes.
    pub capacity: u64,
    /// Bytes reserved by resident partitions.
    pub used: u64,
    pub partitions: BTreeSet<u64>,
    pub status: DiskStatus,
}

impl Disk {
    fn new(path: PathBuf, capacity: u64, status: DiskStatus) -> Self {
        Self {
            path,
            capacity,
            used: 0,
            partitions: BTreeSet::new(),
            status,
        }
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Snapshot of one disk for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStat {
    pub path: PathBuf,
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub partition_count: usize,
    pub status: DiskStatus,
}

/// Owner of disks and resident partitions.
pub struct SpaceManager {
    local_addr: String,
    disks: RwLock<BTreeMap<PathBuf, Disk>>,
    partitions: RwLock<HashMap<u64, Arc<EcPartition>>>,
    /// Partition IDs with a create in progress.
    creating: Mutex<HashSet<u64>>,
}

impl SpaceManager {
    /// Scan the configured disks and load every partition found.
    ///
    /// A disk that cannot be scanned is marked unavailable; a partition
    /// that cannot be loaded is skipped. Neither stops startup.
    pub async fn startup(local_addr: &str, disk_configs: &[DiskConfig]) -> EcResult<Self> {
        let mut disks = BTreeMap::new();
        let mut partitions = HashMap::new();

        for cfg in disk_configs {
            let path = cfg.path.clone();
            let configured = cfg.capacity;
            let scanned = tokio::task::spawn_blocking(move || scan_disk(&path, configured))
                .await
                .map_err(|_| EcError::Internal)?;

            let (capacity, dirs) = match scanned {
                Ok(found) => found,
                Err(e) => {
                    error!("disk {} unavailable: {}", cfg.path.display(), e);
                    disks.insert(
                        cfg.path.clone(),
                        Disk::new(cfg.path.clone(), configured, DiskStatus::Unavailable),
                    );
                    continue;
                }
            };

            let mut disk = Disk::new(cfg.path.clone(), capacity, DiskStatus::Available);
            for dir in dirs {
                let partition = match EcPartition::load(&dir, &cfg.path, local_addr).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("skipping partition dir {}: {}", dir.display(), e);
                        continue;
                    }
                };
                let id = partition.partition_id();
                if partitions.contains_key(&id) {
                    warn!(
                        "partition {} found again at {}, keeping the first copy",
                        id,
                        dir.display()
                    );
                    continue;
                }
                disk.used += partition.partition_size();
                disk.partitions.insert(id);
                partitions.insert(id, Arc::new(partition));
            }

            info!(
                "disk {}: capacity {} used {} partitions {}",
                disk.path.display(),
                disk.capacity,
                disk.used,
                disk.partitions.len()
            );
            disks.insert(cfg.path.clone(), disk);
        }

        Ok(Self {
            local_addr: local_addr.to_string(),
            disks: RwLock::new(disks),
            partitions: RwLock::new(partitions),
            creating: Mutex::new(HashSet::new()),
        })
    }

    /// Look up a resident partition.
    pub async fn partition(&self, partition_id: u64) -> EcResult<Arc<EcPartition>> {
        self.partitions
            .read()
            .await
            .get(&partition_id)
            .cloned()
            .ok_or(EcError::NotFound)
    }

    /// IDs of all resident partitions, ascending.
    pub async fn partition_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.partitions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Create a partition on this node.
    pub async fn create_partition(
        &self,
        req: CreateEcPartitionRequest,
    ) -> EcResult<Arc<EcPartition>> {
        let meta = EcPartitionMeta::from(req);
        meta.validate(&self.local_addr)?;
        let id = meta.partition_id;

        {
            let mut creating = self.creating.lock().await;
            if creating.contains(&id) || self.partitions.read().await.contains_key(&id) {
                warn!("partition {} already exists", id);
                return Err(EcError::AlreadyExists);
            }
            creating.insert(id);
        }

        let result = self.create_reserved(meta).await;
        self.creating.lock().await.remove(&id);
        result
    }

    async fn create_reserved(&self, meta: EcPartitionMeta) -> EcResult<Arc<EcPartition>> {
        let id = meta.partition_id;
        let size = meta.partition_size;
        let disk_path = self.reserve(id, size).await?;

        match EcPartition::create(&disk_path, meta, &self.local_addr).await {
            Ok(partition) => {
                let partition = Arc::new(partition);
                self.partitions.write().await.insert(id, partition.clone());
                Ok(partition)
            }
            Err(e) => {
                self.release(&disk_path, id, size).await;
                Err(e)
            }
        }
    }

    /// Pick a disk for `size` bytes and reserve the space on it.
    async fn reserve(&self, partition_id: u64, size: u64) -> EcResult<PathBuf> {
        let mut disks = self.disks.write().await;
        let Some(path) = choose_disk(&disks, size) else {
            warn!(
                "no disk with {} free bytes for partition {}",
                size, partition_id
            );
            return Err(EcError::NoSpace);
        };
        let disk = disks.get_mut(&path).ok_or(EcError::Internal)?;
        disk.used += size;
        disk.partitions.insert(partition_id);
        debug!(
            "reserved {} bytes on {} for partition {}",
            size,
            path.display(),
            partition_id
        );
        Ok(path)
    }

    async fn release(&self, disk_path: &Path, partition_id: u64, size: u64) {
        if let Some(disk) = self.disks.write().await.get_mut(disk_path) {
            disk.used = disk.used.saturating_sub(size);
            disk.partitions.remove(&partition_id);
        }
    }

    /// Delete a partition: unindex it, wait for in-flight operations,
    /// remove its directory and release its space.
    pub async fn delete_partition(&self, partition_id: u64) -> EcResult<()> {
        let partition = self
            .partitions
            .write()
            .await
            .remove(&partition_id)
            .ok_or(EcError::NotFound)?;

        let _drained = partition.drain().await;

        let dir = partition.path().to_path_buf();
        let removed = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&dir))
            .await
            .map_err(|_| EcError::Internal)?;

        self.release(
            partition.disk_path(),
            partition_id,
            partition.partition_size(),
        )
        .await;

        removed.map_err(|e| {
            error!(
                "failed to remove partition dir {}: {}",
                partition.path().display(),
                e
            );
            EcError::Io
        })?;

        info!("deleted partition {}", partition_id);
        Ok(())
    }

    /// Per-disk usage.
    pub async fn disk_stats(&self) -> Vec<DiskStat> {
        self.disks
            .read()
            .await
            .values()
            .map(|d| DiskStat {
                path: d.path.clone(),
                capacity: d.capacity,
                used: d.used,
                free: d.free(),
                partition_count: d.partitions.len(),
                status: d.status,
            })
            .collect()
    }
}

/// Weighted random choice over available disks that can hold `size`
/// bytes; disks with more free space are more likely to be chosen.
fn choose_disk(disks: &BTreeMap<PathBuf, Disk>, size: u64) -> Option<PathBuf> {
    use rand::Rng;

    let candidates: Vec<&Disk> = disks
        .values()
        .filter(|d| d.status == DiskStatus::Available && d.free() >= size)
        .collect();
    let total_free: u64 = candidates.iter().map(|d| d.free()).sum();
    if candidates.is_empty() || total_free == 0 {
        return None;
    }

    let threshold = rand::thread_rng().gen_range(0..total_free);
    let mut cumulative = 0u64;
    for disk in &candidates {
        cumulative += disk.free();
        if cumulative > threshold {
            return Some(disk.path.clone());
        }
    }
    candidates.first().map(|d| d.path.clone())
}

/// List the partition directories on a disk.
/// Returns the effective capacity and the directories found.
///
/// The disk root must already exist: creating it would put data on
/// whatever filesystem is underneath an unmounted disk.
fn scan_disk(path: &Path, configured: u64) -> EcResult<(u64, Vec<PathBuf>)> {
    if !path.is_dir() {
        warn!("disk root {} is missing or not a directory", path.display());
        return Err(EcError::DiskUnavailable);
    }

    let space = common::get_disk_space(path).map_err(|_| EcError::DiskUnavailable)?;
    let capacity = if configured > 0 { configured } else { space.total };
    if configured > space.available {
        warn!(
            "disk {}: capacity {} exceeds the {} bytes available on the filesystem",
            path.display(),
            capacity,
            space.available
        );
    }

    let entries = std::fs::read_dir(path).map_err(|e| {
        warn!("failed to scan disk {}: {}", path.display(), e);
        EcError::DiskUnavailable
    })?;

    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name();
        let is_partition = name
            .to_str()
            .and_then(common::parse_partition_dir_name)
            .is_some();
        if is_dir && is_partition {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok((capacity, dirs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecnode_proto::constants::GB;
    use tempfile::TempDir;

    const LOCAL: &str = "127.0.0.1:17310";

    fn request(id: u64, size: u64) -> CreateEcPartitionRequest {
        CreateEcPartitionRequest {
            partition_id: id,
            partition_size: size,
            volume_id: "vol".to_string(),
            stripe_unit_size: 4096,
            extent_file_size: 64 << 20,
            data_node_num: 4,
            parity_node_num: 2,
            hosts: (0..6).map(|i| format!("127.0.0.1:{}", 17310 + i)).collect(),
        }
    }

    async fn manager(disk: &TempDir, capacity: u64) -> SpaceManager {
        SpaceManager::startup(LOCAL, &[DiskConfig::new(disk.path(), capacity)])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_lookup_duplicate() {
        let disk = tempfile::tempdir().unwrap();
        let space = manager(&disk, 100 * GB).await;

        let p = space.create_partition(request(1, 5 * GB)).await.unwrap();
        assert_eq!(p.partition_id(), 1);
        assert!(disk.path().join("ecpartition_1_5368709120").join("META").exists());
        assert_eq!(space.partition(1).await.unwrap().volume_id(), "vol");
        assert_eq!(space.partition(2).await.err(), Some(EcError::NotFound));

        assert_eq!(
            space.create_partition(request(1, 5 * GB)).await.err(),
            Some(EcError::AlreadyExists)
        );

        let stats = space.disk_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].used, 5 * GB);
        assert_eq!(stats[0].free, 95 * GB);
        assert_eq!(stats[0].partition_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_create() {
        let disk = tempfile::tempdir().unwrap();
        let space = Arc::new(manager(&disk, 100 * GB).await);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let space = space.clone();
                tokio::spawn(async move { space.create_partition(request(7, GB)).await })
            })
            .collect();

        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e, EcError::AlreadyExists),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(space.disk_stats().await[0].used, GB);
    }

    #[tokio::test]
    async fn test_no_space() {
        let disk = tempfile::tempdir().unwrap();
        let space = manager(&disk, GB).await;

        assert_eq!(
            space.create_partition(request(1, 5 * GB)).await.err(),
            Some(EcError::NoSpace)
        );
        space.create_partition(request(2, GB)).await.unwrap();
        assert_eq!(
            space.create_partition(request(3, 1)).await.err(),
            Some(EcError::NoSpace)
        );
    }

    #[tokio::test]
    async fn test_invalid_geometry_rejected() {
        let disk = tempfile::tempdir().unwrap();
        let space = manager(&disk, 100 * GB).await;

        let mut req = request(1, GB);
        req.hosts.pop();
        assert_eq!(
            space.create_partition(req).await.err(),
            Some(EcError::InvalidArgument)
        );
        assert!(space.partition_ids().await.is_empty());
        assert_eq!(space.disk_stats().await[0].used, 0);
    }

    #[tokio::test]
    async fn test_reload_after_restart() {
        let disk = tempfile::tempdir().unwrap();
        {
            let space = manager(&disk, 100 * GB).await;
            let p = space.create_partition(request(1, 5 * GB)).await.unwrap();
            p.create_local_extent(1025).await.unwrap();
            space.create_partition(request(2, 5 * GB)).await.unwrap();
        }
        // Stray entries are ignored.
        std::fs::create_dir(disk.path().join("lost+found")).unwrap();
        std::fs::create_dir(disk.path().join("ecpartition_9_100")).unwrap();

        let space = manager(&disk, 100 * GB).await;
        assert_eq!(space.partition_ids().await, vec![1, 2]);

        let p = space.partition(1).await.unwrap();
        assert_eq!(p.hosts().len(), p.data_node_count() + p.parity_node_count());
        assert_eq!(p.stripe_unit_size(), 4096);
        assert_eq!(p.store().extent_ids(), vec![1025]);
        assert_eq!(space.disk_stats().await[0].used, 10 * GB);
    }

    #[tokio::test]
    async fn test_unavailable_disk() {
        let root = tempfile::tempdir().unwrap();
        let bad = root.path().join("not-a-dir");
        std::fs::write(&bad, b"file").unwrap();
        let good = root.path().join("good");
        std::fs::create_dir(&good).unwrap();
        let missing = root.path().join("unmounted");

        let space = SpaceManager::startup(
            LOCAL,
            &[
                DiskConfig::new(&bad, 100 * GB),
                DiskConfig::new(&good, 100 * GB),
                DiskConfig::new(&missing, 100 * GB),
            ],
        )
        .await
        .unwrap();

        let stats = space.disk_stats().await;
        let bad_stat = stats.iter().find(|s| s.path == bad).unwrap();
        assert_eq!(bad_stat.status, DiskStatus::Unavailable);
        let missing_stat = stats.iter().find(|s| s.path == missing).unwrap();
        assert_eq!(missing_stat.status, DiskStatus::Unavailable);
        assert!(!missing.exists());

        // Placement only considers the available disk.
        let p = space.create_partition(request(1, GB)).await.unwrap();
        assert_eq!(p.disk_path(), good.as_path());
    }

    #[tokio::test]
    async fn test_delete_partition() {
        let disk = tempfile::tempdir().unwrap();
        let space = manager(&disk, 100 * GB).await;
        let p = space.create_partition(request(1, 5 * GB)).await.unwrap();
        let dir = p.path().to_path_buf();
        drop(p);

        space.delete_partition(1).await.unwrap();
        assert!(!dir.exists());
        assert_eq!(space.partition(1).await.err(), Some(EcError::NotFound));
        assert_eq!(space.disk_stats().await[0].used, 0);
        assert_eq!(space.delete_partition(1).await.err(), Some(EcError::NotFound));

        // The ID can be reused.
        space.create_partition(request(1, 5 * GB)).await.unwrap();
    }
}
