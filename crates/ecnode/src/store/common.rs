//! Shared helper functions for store operations.
//!
//! Provides utilities for:
//! - Naming partition directories and extent files
//! - Positional file reads and writes
//! - Block checksum table access
//! - Atomic file writes (write-to-tmp then rename)
//! - Checking available disk space
//!
//! Everything here is blocking; callers run it inside `spawn_blocking`.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ecnode_proto::constants::{BLOCK_CRC_SIZE, EXTENT_CRC_SUFFIX, PARTITION_DIR_PREFIX};
use ecnode_proto::{EcError, EcResult};
use tracing::warn;

/// Directory name of a partition: `ecpartition_{id}_{size}`.
pub fn partition_dir_name(partition_id: u64, partition_size: u64) -> String {
    format!("{}{}_{}", PARTITION_DIR_PREFIX, partition_id, partition_size)
}

/// Parse `(partition_id, partition_size)` from a partition directory name.
pub fn parse_partition_dir_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix(PARTITION_DIR_PREFIX)?;
    let (id, size) = rest.split_once('_')?;
    Some((id.parse().ok()?, size.parse().ok()?))
}

/// Path of an extent's data file.
pub fn extent_data_path(dir: &Path, extent_id: u64) -> PathBuf {
    dir.join(extent_id.to_string())
}

/// Path of an extent's block checksum table.
pub fn extent_crc_path(dir: &Path, extent_id: u64) -> PathBuf {
    dir.join(format!("{}{}", extent_id, EXTENT_CRC_SUFFIX))
}

/// Parse an extent ID from a data file name. Checksum tables, temporary
/// files and metadata are not extents.
pub fn parse_extent_file_name(name: &str) -> Option<u64> {
    if name.starts_with('.') || name.ends_with(EXTENT_CRC_SUFFIX) {
        return None;
    }
    name.parse().ok()
}

/// Create an empty file, failing with `AlreadyExists` if it is present.
pub fn create_new_file(path: &Path) -> EcResult<()> {
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                EcError::AlreadyExists
            } else {
                warn!("failed to create {}: {}", path.display(), e);
                EcError::Io
            }
        })?;
    file.sync_all().map_err(|_| EcError::Io)?;
    Ok(())
}

/// Write data at a specific offset within an existing file and flush it.
pub fn write_at(path: &Path, offset: u64, data: &[u8]) -> EcResult<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| {
            warn!("failed to open {} for write: {}", path.display(), e);
            if e.kind() == io::ErrorKind::NotFound {
                EcError::NotFound
            } else {
                EcError::Io
            }
        })?;

    file.seek(SeekFrom::Start(offset)).map_err(|e| {
        warn!("failed to seek in {}: {}", path.display(), e);
        EcError::Io
    })?;

    file.write_all(data).map_err(|e| {
        warn!("failed to write to {}: {}", path.display(), e);
        EcError::Io
    })?;

    file.sync_data().map_err(|_| EcError::Io)?;

    Ok(())
}

/// Read exactly `length` bytes at `offset` from an existing file.
pub fn read_at(path: &Path, offset: u64, length: usize) -> EcResult<Vec<u8>> {
    let mut file = fs::File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EcError::NotFound
        } else {
            warn!("failed to open {} for read: {}", path.display(), e);
            EcError::Io
        }
    })?;

    file.seek(SeekFrom::Start(offset)).map_err(|e| {
        warn!("failed to seek in {}: {}", path.display(), e);
        EcError::Io
    })?;

    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf).map_err(|e| {
        warn!("failed to read {} bytes from {}: {}", length, path.display(), e);
        EcError::Io
    })?;

    Ok(buf)
}

/// Store checksums for consecutive blocks starting at `first_block`.
pub fn write_block_crcs(path: &Path, first_block: u64, crcs: &[u32]) -> EcResult<()> {
    let mut buf = Vec::with_capacity(crcs.len() * BLOCK_CRC_SIZE);
    for crc in crcs {
        buf.extend_from_slice(&crc.to_be_bytes());
    }
    write_at(path, first_block * BLOCK_CRC_SIZE as u64, &buf)
}

/// Load checksums for `count` consecutive blocks starting at `first_block`.
pub fn read_block_crcs(path: &Path, first_block: u64, count: usize) -> EcResult<Vec<u32>> {
    let buf = read_at(path, first_block * BLOCK_CRC_SIZE as u64, count * BLOCK_CRC_SIZE)?;
    Ok(buf
        .chunks_exact(BLOCK_CRC_SIZE)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Atomic write: write data to a temporary file, then rename into place.
///
/// A crash during the write never leaves a partially written target.
/// The temp file lives next to `target` so the rename stays on one
/// filesystem.
pub fn atomic_write(target: &Path, data: &[u8]) -> EcResult<()> {
    let dir = target.parent().ok_or(EcError::InvalidArgument)?;
    fs::create_dir_all(dir).map_err(|_| EcError::Io)?;

    let tmp_path = dir.join(format!(".tmp_{}", std::process::id()));

    let mut file = fs::File::create(&tmp_path).map_err(|e| {
        warn!("failed to create tmp file {}: {}", tmp_path.display(), e);
        EcError::Io
    })?;
    let written = file.write_all(data).and_then(|_| file.sync_all());
    if let Err(e) = written {
        warn!("failed to write tmp file {}: {}", tmp_path.display(), e);
        let _ = fs::remove_file(&tmp_path);
        return Err(EcError::Io);
    }
    drop(file);

    fs::rename(&tmp_path, target).map_err(|e| {
        warn!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            target.display(),
            e
        );
        let _ = fs::remove_file(&tmp_path);
        EcError::Io
    })?;

    Ok(())
}

/// Information about disk space usage.
#[derive(Debug, Clone)]
pub struct DiskSpace {
    /// Total disk space in bytes.
    pub total: u64,
    /// Available disk space for non-root users in bytes.
    pub available: u64,
}

/// Get disk space information for the filesystem containing `path`.
pub fn get_disk_space(path: &Path) -> EcResult<DiskSpace> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(|e| {
        warn!("statvfs failed for {}: {}", path.display(), e);
        EcError::Io
    })?;

    let block_size = stat.fragment_size() as u64;
    Ok(DiskSpace {
        total: stat.blocks() as u64 * block_size,
        available: stat.blocks_available() as u64 * block_size,
    })
}
