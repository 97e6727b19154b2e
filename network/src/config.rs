use std::time::Duration;

use spindle_core::types::Hash;

/// Sync configuration for a node.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Number of connected peers required before syncing starts.
    pub min_peers: usize,

    /// Upper bound on worker slots kept in the pool.
    pub max_peers: usize,

    /// Interval between block-announce handshakes while waiting for
    /// enough peers and a sync target.
    pub wait_peers_duration: Duration,

    /// How long an announced block may sit in the pending set before the
    /// housekeeper drops it.
    pub pending_ttl: Duration,

    /// How long an ignored peer stays out of worker selection.
    pub ignore_cooldown: Duration,

    /// Block hashes that must never be imported; peers serving them are
    /// penalised.
    pub bad_blocks: Vec<Hash>,
}

impl SyncConfig {
    pub fn new() -> Self {
        SyncConfig::default()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            min_peers: 1,
            max_peers: 50,
            wait_peers_duration: Duration::from_secs(5),
            pending_ttl: Duration::from_secs(600),
            ignore_cooldown: Duration::from_secs(30),
            bad_blocks: vec![],
        }
    }
}
