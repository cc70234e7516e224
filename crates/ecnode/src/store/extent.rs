//! Per-partition extent store.
//!
//! Each extent is a flat file named by its ID inside the partition
//! directory, with a sidecar `{id}.crc` holding one big-endian CRC-32 per
//! stripe unit:
//!   `{partition_dir}/{extent_id}`
//!   `{partition_dir}/{extent_id}.crc`
//!
//! Writes must be stripe-unit aligned. Every persisted unit gets its CRC
//! recorded in the same critical section as the data write, and reads
//! verify each unit they touch against the table. A zero table entry marks
//! a unit that has never been written (a hole).
//!
//! All filesystem I/O is performed inside `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ecnode_proto::constants::{BLOCK_CRC_SIZE, MB, MIN_EXTENT_ID};
use ecnode_proto::packet::crc32;
use ecnode_proto::{EcError, EcResult, ExtentInfo};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::common;

/// Upper bound on the bytes `verify` reads at once.
const VERIFY_BATCH_BYTES: u64 = 4 * MB;

/// Mutable attributes of one extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentState {
    /// Current length in bytes.
    pub size: u64,
    /// CRC-32 of the payload of the most recent write.
    pub crc: u32,
    /// Unix seconds of the most recent write.
    pub modify_time: u64,
}

/// One extent and its locks.
///
/// The `state` write lock is held for the whole checksum table update, data
/// write and flush; readers share the read lock. `order` is held by a
/// primary from its local apply until every follower has answered, so
/// followers see writes to one extent in the primary's order.
pub struct Extent {
    data_path: PathBuf,
    crc_path: PathBuf,
    state: RwLock<ExtentState>,
    order: Arc<Mutex<()>>,
}

impl Extent {
    fn new(dir: &Path, id: u64, state: ExtentState) -> Self {
        Self {
            data_path: common::extent_data_path(dir, id),
            crc_path: common::extent_crc_path(dir, id),
            state: RwLock::new(state),
            order: Arc::new(Mutex::new(())),
        }
    }

    pub async fn state(&self) -> ExtentState {
        *self.state.read().await
    }
}

/// Extent table and on-disk files of one partition.
pub struct ExtentStore {
    dir: PathBuf,
    /// Stripe unit size: write alignment and checksum granularity.
    block_size: u64,
    /// Maximum length of any extent.
    extent_size_limit: u64,
    extents: DashMap<u64, Arc<Extent>>,
    next_extent_id: AtomicU64,
}

impl ExtentStore {
    /// Create an empty store rooted at `dir`. The directory must exist.
    pub fn new(dir: impl Into<PathBuf>, block_size: u64, extent_size_limit: u64) -> Self {
        Self {
            dir: dir.into(),
            block_size,
            extent_size_limit,
            extents: DashMap::new(),
            next_extent_id: AtomicU64::new(MIN_EXTENT_ID + 1),
        }
    }

    /// Open a store and rebuild its extent table from the files present.
    pub async fn load(
        dir: impl Into<PathBuf>,
        block_size: u64,
        extent_size_limit: u64,
    ) -> EcResult<Self> {
        let store = Self::new(dir, block_size, extent_size_limit);

        let dir = store.dir.clone();
        let found = tokio::task::spawn_blocking(move || scan_extents(&dir, block_size))
            .await
            .map_err(|_| EcError::Internal)??;

        for (id, state) in found {
            if state.size > extent_size_limit {
                warn!(
                    "extent {} in {} is {} bytes, over the {} limit",
                    id,
                    store.dir.display(),
                    state.size,
                    extent_size_limit
                );
            }
            store.bump_next_id(id);
            store
                .extents
                .insert(id, Arc::new(Extent::new(&store.dir, id, state)));
        }

        debug!(
            "loaded {} extents from {}",
            store.extent_count(),
            store.dir.display()
        );
        Ok(store)
    }

    /// Number of extents in the table.
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    /// IDs of all extents, ascending.
    pub fn extent_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.extents.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn get(&self, extent_id: u64) -> EcResult<Arc<Extent>> {
        self.extents
            .get(&extent_id)
            .map(|e| e.value().clone())
            .ok_or(EcError::NotFound)
    }

    fn bump_next_id(&self, used: u64) {
        self.next_extent_id.fetch_max(used + 1, Ordering::SeqCst);
    }

    /// Create an empty extent and return its ID.
    ///
    /// `extent_id == 0` allocates the next free ID. Creating an extent that
    /// already exists succeeds without touching it.
    pub async fn create_extent(&self, extent_id: u64) -> EcResult<u64> {
        let (id, _order) = self.create_inner(extent_id).await?;
        Ok(id)
    }

    /// Like [`create_extent`](Self::create_extent), also returning the
    /// extent's ordering guard. A new extent is published with the guard
    /// already held, so no write can be ordered ahead of its create.
    pub async fn create_extent_ordered(
        &self,
        extent_id: u64,
    ) -> EcResult<(u64, OwnedMutexGuard<()>)> {
        match self.create_inner(extent_id).await? {
            (id, Some(order)) => Ok((id, order)),
            (id, None) => Ok((id, self.order_extent(id).await?)),
        }
    }

    /// Returns the guard only when this call inserted the extent.
    async fn create_inner(
        &self,
        extent_id: u64,
    ) -> EcResult<(u64, Option<OwnedMutexGuard<()>>)> {
        if extent_id != 0 && extent_id <= MIN_EXTENT_ID {
            warn!("extent id {} is reserved", extent_id);
            return Err(EcError::InvalidArgument);
        }

        let (id, order) = loop {
            let id = if extent_id == 0 {
                self.next_extent_id.fetch_add(1, Ordering::SeqCst)
            } else {
                extent_id
            };
            match self.extents.entry(id) {
                Entry::Occupied(_) if extent_id != 0 => {
                    debug!("extent {} already exists in {}", id, self.dir.display());
                    return Ok((id, None));
                }
                // Taken by an explicit create since the counter moved past it.
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let extent = Extent::new(&self.dir, id, ExtentState::default());
                    let order = extent
                        .order
                        .clone()
                        .try_lock_owned()
                        .map_err(|_| EcError::Internal)?;
                    slot.insert(Arc::new(extent));
                    break (id, order);
                }
            }
        };
        self.bump_next_id(id);

        let data_path = common::extent_data_path(&self.dir, id);
        let crc_path = common::extent_crc_path(&self.dir, id);
        let created = tokio::task::spawn_blocking(move || {
            // Files may survive from a create whose table entry was rolled back.
            for path in [&data_path, &crc_path] {
                match common::create_new_file(path) {
                    Ok(()) | Err(EcError::AlreadyExists) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| EcError::Internal)
        .and_then(|r| r);

        if let Err(e) = created {
            self.extents.remove(&id);
            return Err(e);
        }

        info!("created extent {} in {}", id, self.dir.display());
        Ok((id, Some(order)))
    }

    /// Wait for and take the ordering guard of an existing extent.
    pub async fn order_extent(&self, extent_id: u64) -> EcResult<OwnedMutexGuard<()>> {
        let extent = self.get(extent_id)?;
        Ok(extent.order.clone().lock_owned().await)
    }

    /// Persist `data` at `offset` of an extent.
    ///
    /// Validation happens before any disk write: the payload CRC, then
    /// alignment, then the size limit, then existence.
    pub async fn write(
        &self,
        extent_id: u64,
        offset: u64,
        data: Vec<u8>,
        crc: u32,
    ) -> EcResult<ExtentState> {
        let actual = crc32(&data);
        if actual != crc {
            warn!(
                "extent {} write at {}: crc {:#010x} does not match payload {:#010x}",
                extent_id, offset, crc, actual
            );
            return Err(EcError::ChecksumMismatch);
        }
        if data.is_empty() {
            return Err(EcError::InvalidArgument);
        }

        let len = data.len() as u64;
        if offset % self.block_size != 0 || len % self.block_size != 0 {
            warn!(
                "extent {} write at {} len {} is not aligned to {}",
                extent_id, offset, len, self.block_size
            );
            return Err(EcError::InvalidArgument);
        }
        let end = offset.checked_add(len).ok_or(EcError::SizeExceeded)?;
        if end > self.extent_size_limit {
            warn!(
                "extent {} write [{}, {}) exceeds limit {}",
                extent_id, offset, end, self.extent_size_limit
            );
            return Err(EcError::SizeExceeded);
        }

        let extent = self.get(extent_id)?;
        let mut state = extent.state.write().await;

        let data_path = extent.data_path.clone();
        let crc_path = extent.crc_path.clone();
        let block_size = self.block_size as usize;
        tokio::task::spawn_blocking(move || {
            let block_crcs: Vec<u32> = data.chunks(block_size).map(crc32).collect();
            common::write_at(&data_path, offset, &data)?;
            common::write_block_crcs(&crc_path, offset / block_size as u64, &block_crcs)
        })
        .await
        .map_err(|_| EcError::Internal)??;

        state.size = state.size.max(end);
        state.crc = crc;
        state.modify_time = unix_secs();

        debug!(
            "extent {} wrote [{}, {}) size now {}",
            extent_id, offset, end, state.size
        );
        Ok(*state)
    }

    /// Read `size` bytes at `offset`. Returns the data and its CRC-32.
    ///
    /// Every stripe unit touched is checked against the checksum table.
    pub async fn read(&self, extent_id: u64, offset: u64, size: u64) -> EcResult<(Vec<u8>, u32)> {
        if size == 0 {
            return Err(EcError::InvalidArgument);
        }
        let extent = self.get(extent_id)?;
        let state = extent.state.read().await;

        let end = offset.checked_add(size).ok_or(EcError::InvalidArgument)?;
        if end > state.size {
            warn!(
                "extent {} read [{}, {}) beyond length {}",
                extent_id, offset, end, state.size
            );
            return Err(EcError::InvalidArgument);
        }

        let data_path = extent.data_path.clone();
        let crc_path = extent.crc_path.clone();
        let block_size = self.block_size;
        let extent_len = state.size;
        let data = tokio::task::spawn_blocking(move || {
            let first_block = offset / block_size;
            let aligned_start = first_block * block_size;
            let aligned_end = end.div_ceil(block_size).saturating_mul(block_size).min(extent_len);

            let buf = common::read_at(&data_path, aligned_start, (aligned_end - aligned_start) as usize)?;
            verify_blocks(extent_id, &crc_path, first_block, block_size, &buf)?;

            let lo = (offset - aligned_start) as usize;
            Ok::<_, EcError>(buf[lo..lo + size as usize].to_vec())
        })
        .await
        .map_err(|_| EcError::Internal)??;

        let crc = crc32(&data);
        Ok((data, crc))
    }

    /// Check every stripe unit of an extent against its recorded CRC,
    /// reading at most `VERIFY_BATCH_BYTES` at a time.
    pub async fn verify(&self, extent_id: u64) -> EcResult<()> {
        let extent = self.get(extent_id)?;
        let state = extent.state.read().await;
        if state.size == 0 {
            return Ok(());
        }

        let data_path = extent.data_path.clone();
        let crc_path = extent.crc_path.clone();
        let block_size = self.block_size;
        let batch = (VERIFY_BATCH_BYTES / block_size).max(1) * block_size;
        let len = state.size;
        tokio::task::spawn_blocking(move || {
            let mut offset = 0;
            while offset < len {
                let n = batch.min(len - offset);
                let buf = common::read_at(&data_path, offset, n as usize)?;
                verify_blocks(extent_id, &crc_path, offset / block_size, block_size, &buf)?;
                offset += n;
            }
            Ok(())
        })
        .await
        .map_err(|_| EcError::Internal)?
    }

    /// Attributes of an extent.
    pub async fn info(&self, extent_id: u64) -> EcResult<ExtentInfo> {
        let extent = self.get(extent_id)?;
        let state = extent.state().await;
        Ok(ExtentInfo {
            extent_id,
            size: state.size,
            crc: state.crc,
            modify_time: state.modify_time,
        })
    }
}

/// Compare each block of `buf` (starting at `first_block`) with the table.
fn verify_blocks(
    extent_id: u64,
    crc_path: &Path,
    first_block: u64,
    block_size: u64,
    buf: &[u8],
) -> EcResult<()> {
    let blocks: Vec<&[u8]> = buf.chunks(block_size as usize).collect();
    let expected = common::read_block_crcs(crc_path, first_block, blocks.len())?;
    for (i, (block, want)) in blocks.iter().zip(expected).enumerate() {
        if want == 0 {
            continue;
        }
        let got = crc32(block);
        if got != want {
            warn!(
                "extent {} block {} corrupt: stored crc {:#010x}, computed {:#010x}",
                extent_id,
                first_block + i as u64,
                want,
                got
            );
            return Err(EcError::ChecksumMismatch);
        }
    }
    Ok(())
}

/// Find extent files in `dir` and read their lengths. A missing or short
/// checksum table is padded with zeros, leaving those units unverified.
fn scan_extents(dir: &Path, block_size: u64) -> EcResult<Vec<(u64, ExtentState)>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        warn!("failed to read extent dir {}: {}", dir.display(), e);
        EcError::Io
    })?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(common::parse_extent_file_name) else {
            continue;
        };
        let meta = entry.metadata().map_err(|_| EcError::Io)?;
        if !meta.is_file() {
            continue;
        }
        let modify_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let table_len = meta.len().div_ceil(block_size) * BLOCK_CRC_SIZE as u64;
        let crc_path = common::extent_crc_path(dir, id);
        let table = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&crc_path)
            .map_err(|_| EcError::Io)?;
        if table.metadata().map_err(|_| EcError::Io)?.len() < table_len {
            warn!("padding checksum table {}", crc_path.display());
            table.set_len(table_len).map_err(|_| EcError::Io)?;
        }

        found.push((
            id,
            ExtentState {
                size: meta.len(),
                crc: 0,
                modify_time,
            },
        ));
    }
    Ok(found)
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
