/// Protocol and on-disk layout constants.

/// Packet magic number. Packets carrying anything else are rejected.
pub const PROTO_MAGIC: u8 = 0xFF;

/// Fixed size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 58;

/// Header flag: the packet was forwarded by a primary and must only be
/// applied locally.
pub const FLAG_FORWARDED: u8 = 0x01;

/// Extent IDs up to and including this value are reserved.
/// Ordinary extents are allocated strictly above it.
pub const MIN_EXTENT_ID: u64 = 1024;

/// Prefix of a partition directory: `ecpartition_{id}_{size}`.
pub const PARTITION_DIR_PREFIX: &str = "ecpartition_";

/// Partition metadata file inside a partition directory.
pub const PARTITION_META_FILE: &str = "META";

/// Suffix of the per-extent block checksum table.
pub const EXTENT_CRC_SUFFIX: &str = ".crc";

/// Size in bytes of one entry in the block checksum table.
pub const BLOCK_CRC_SIZE: usize = 4;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;
