//! Tunable operational defaults for the storage node.
//!
//! Protocol-level constants (wire format, magic numbers, layout names)
//! remain in [`crate::constants`]. This module centralizes the
//! configurable defaults that can be overridden via CLI flags.

// ─── Network / Port Defaults ────────────────────────────────────────────────

/// Default listen port for packet traffic.
pub const DEFAULT_LISTEN_PORT: u16 = 17310;

// ─── Transport ──────────────────────────────────────────────────────────────

/// Maximum payload carried by one packet (bytes). 64 MB.
/// Protects against corrupt size fields on the wire.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum result message length (bytes).
pub const DEFAULT_MAX_RESULT_MSG_LEN: u32 = 64 * 1024;

/// Default maximum pooled connections per follower node.
pub const DEFAULT_TCP_MAX_CONNS_PER_NODE: usize = 8;

/// Read deadline applied to client-facing connections (milliseconds).
pub const DEFAULT_CLIENT_READ_TIMEOUT_MS: u64 = 60_000;

// ─── Replication ────────────────────────────────────────────────────────────

/// Upper bound on one follower round-trip (milliseconds).
pub const DEFAULT_REPLICA_TIMEOUT_MS: u64 = 5_000;

// ─── Request accounting ─────────────────────────────────────────────────────

/// Requests slower than this are logged at warn level (milliseconds).
pub const DEFAULT_SLOW_REQUEST_MS: u64 = 1_000;

// ─── Scrub ──────────────────────────────────────────────────────────────────

/// Interval between background checksum scrubs of all extents (seconds).
/// Zero disables scrubbing.
pub const DEFAULT_SCRUB_INTERVAL_SECS: u64 = 24 * 60 * 60;
