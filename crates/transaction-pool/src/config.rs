use std::time::Duration;

/// The default maximum number of transactions resident in the pool.
pub const DEFAULT_POOL_LIMIT: usize = 15_000;

/// The default number of blocks a transaction's `block_limit` may look
/// ahead; also the width of the committed-nonce window.
pub const DEFAULT_BLOCK_LIMIT: u64 = 1_000;

/// Maximum number of new transactions drained per sync round.
pub const MAX_NEW_TXS_PER_ROUND: usize = 1_000;

/// Configuration options for the transaction pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of transactions resident in the pool.
    pub pool_limit: usize,
    /// Number of workers delivering submit receipts and sealer
    /// notifications.
    pub notify_worker_num: usize,
    /// Number of workers running admission and block verification.
    ///
    /// The default of 1 serializes block verification, which keeps lock
    /// contention with sealing low.
    pub verify_worker_num: usize,
    /// Width of the block-limit window, in blocks.
    pub block_limit: u64,
    /// Chain id transactions must be bound to.
    pub chain_id: u64,
    /// Group id transactions must be bound to.
    pub group_id: u64,
    /// Sync engine settings.
    pub sync: SyncConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_limit: DEFAULT_POOL_LIMIT,
            notify_worker_num: 1,
            verify_worker_num: 1,
            block_limit: DEFAULT_BLOCK_LIMIT,
            chain_id: 0,
            group_id: 0,
            sync: SyncConfig::default(),
        }
    }
}

/// Configuration options for the transaction sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of new transactions picked up per propagation round.
    pub max_new_txs_per_round: usize,
    /// Percentage of eligible peers a transaction forwarded from another
    /// peer is re-announced to.
    pub forward_percent: usize,
    /// Deadline applied to request/response round trips with peers.
    pub network_timeout: Duration,
    /// Fallback wake-up interval of the sync reactor.
    pub tick: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_new_txs_per_round: MAX_NEW_TXS_PER_ROUND,
            forward_percent: 25,
            network_timeout: Duration::from_millis(200),
            tick: Duration::from_millis(100),
        }
    }
}
