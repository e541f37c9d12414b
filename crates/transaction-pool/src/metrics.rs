//! Transaction pool metrics.

use metrics::{Counter, Gauge};
use metrics_derive::Metrics;

/// Metrics for the in-memory transaction pool.
#[derive(Metrics)]
#[metrics(scope = "txpool")]
pub(crate) struct TxPoolMetrics {
    /// Number of transactions inserted into the pool
    pub(crate) inserted_transactions: Counter,
    /// Number of transactions rejected at admission
    pub(crate) invalid_transactions: Counter,
    /// Number of transactions removed from the pool
    pub(crate) removed_transactions: Counter,
    /// Number of transactions currently resident in the pool
    pub(crate) resident_transactions: Gauge,
    /// Number of resident transactions currently marked sealed
    pub(crate) sealed_transactions: Gauge,
}

/// Metrics for the transaction sync engine.
#[derive(Metrics)]
#[metrics(scope = "txpool_sync")]
pub(crate) struct TransactionSyncMetrics {
    /// Total number of transactions announced or forwarded to peers
    pub(crate) propagated_transactions: Counter,
    /// Total number of transactions imported from peers
    pub(crate) imported_transactions: Counter,
    /// Total number of inbound messages that failed to decode
    pub(crate) invalid_messages: Counter,
    /// Total number of missed transactions recovered during block
    /// verification
    pub(crate) recovered_transactions: Counter,
}
