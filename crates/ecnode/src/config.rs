//! Node configuration.
//!
//! Built from the command line in `main`. Tunable defaults come from
//! [`ecnode_proto::defaults`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ecnode_proto::constants::{GB, KB, MB};
use ecnode_proto::defaults::{
    DEFAULT_CLIENT_READ_TIMEOUT_MS, DEFAULT_REPLICA_TIMEOUT_MS, DEFAULT_SLOW_REQUEST_MS,
    DEFAULT_TCP_MAX_CONNS_PER_NODE,
};

/// One data disk: a directory and the space budget the node may use on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    pub path: PathBuf,
    /// Capacity in bytes; 0 means the size of the filesystem.
    pub capacity: u64,
}

impl DiskConfig {
    pub fn new(path: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            path: path.into(),
            capacity,
        }
    }
}

/// Parse a capacity such as `4096`, `512M` or `2G`.
fn parse_capacity(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, unit) = match s.char_indices().last()? {
        (i, 'K' | 'k') => (&s[..i], KB),
        (i, 'M' | 'm') => (&s[..i], MB),
        (i, 'G' | 'g') => (&s[..i], GB),
        (i, 'T' | 't') => (&s[..i], GB * 1024),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(unit)
}

impl FromStr for DiskConfig {
    type Err = String;

    /// `PATH[:CAPACITY]`. The capacity suffix is only split off when it
    /// parses, so paths containing ':' still work.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, capacity) = match s.rsplit_once(':') {
            Some((path, cap)) => match parse_capacity(cap) {
                Some(capacity) => (path, capacity),
                None => (s, 0),
            },
            None => (s, 0),
        };
        if path.is_empty() {
            return Err(format!("invalid disk '{}': empty path", s));
        }
        Ok(Self::new(path, capacity))
    }
}

impl fmt::Display for DiskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.capacity == 0 {
            write!(f, "{}", self.path.display())
        } else {
            write!(f, "{}:{}", self.path.display(), self.capacity)
        }
    }
}

/// Runtime configuration of one storage node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the packet listener binds to.
    pub listen_addr: String,
    /// This node's `host:port` as it appears in partition host lists.
    pub local_addr: String,
    pub disks: Vec<DiskConfig>,
    /// Upper bound on one follower round-trip.
    pub replica_timeout: Duration,
    /// Read deadline on client connections; `None` waits forever.
    pub client_read_timeout: Option<Duration>,
    pub max_conns_per_node: usize,
    /// Requests slower than this are logged at warn level.
    pub slow_request: Duration,
}

impl NodeConfig {
    pub fn new(listen_addr: &str, local_addr: &str, disks: Vec<DiskConfig>) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            local_addr: local_addr.to_string(),
            disks,
            replica_timeout: Duration::from_millis(DEFAULT_REPLICA_TIMEOUT_MS),
            client_read_timeout: Some(Duration::from_millis(DEFAULT_CLIENT_READ_TIMEOUT_MS)),
            max_conns_per_node: DEFAULT_TCP_MAX_CONNS_PER_NODE,
            slow_request: Duration::from_millis(DEFAULT_SLOW_REQUEST_MS),
        }
    }

    /// Set the client read deadline in milliseconds; 0 disables it.
    pub fn with_read_timeout_ms(mut self, ms: u64) -> Self {
        self.client_read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        self
    }

    pub fn with_replica_timeout_ms(mut self, ms: u64) -> Self {
        self.replica_timeout = Duration::from_millis(ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_disk_arg() {
        assert_eq!(
            "/data/disk1".parse::<DiskConfig>().unwrap(),
            DiskConfig::new("/data/disk1", 0)
        );
        assert_eq!(
            "/data/disk1:1073741824".parse::<DiskConfig>().unwrap(),
            DiskConfig::new("/data/disk1", GB)
        );
        assert_eq!(
            "/data/disk2:20G".parse::<DiskConfig>().unwrap(),
            DiskConfig::new("/data/disk2", 20 * GB)
        );
        assert_eq!(
            "/mnt/a:b".parse::<DiskConfig>().unwrap(),
            DiskConfig::new("/mnt/a:b", 0)
        );
        assert!(":10G".parse::<DiskConfig>().is_err());
        assert!("".parse::<DiskConfig>().is_err());
    }

    #[test]
    fn test_read_timeout_zero_disables() {
        let cfg = NodeConfig::new("0.0.0.0:17310", "127.0.0.1:17310", vec![]);
        assert!(cfg.client_read_timeout.is_some());
        let cfg = cfg.with_read_timeout_ms(0);
        assert!(cfg.client_read_timeout.is_none());
        let cfg = cfg.with_read_timeout_ms(250);
        assert_eq!(cfg.client_read_timeout, Some(Duration::from_millis(250)));
    }
}
