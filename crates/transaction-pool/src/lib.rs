#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! Grove's transaction pool implementation.
//!
//! The pool admits client-submitted transactions, keeps them durable and
//! queryable, coordinates with consensus and block sealing, and synchronizes
//! pending transactions with peer nodes. It is built from four subsystems:
//!
//! - the **validator** ([`TxValidator`]): the single admission gate, running
//!   chain/group/signature checks and the dual-layer nonce protection,
//! - the **nonce checkers** ([`PoolNonceChecker`], [`LedgerNonceChecker`]):
//!   a concurrent set of in-flight nonces plus a sliding window over the
//!   nonces of recently committed blocks,
//! - the **storage**: an import-time ordered queue with a hash index,
//!   carrying the `sealed`/`synced` attributes and the invalid tombstones
//!   drained asynchronously,
//! - the **sync engine**: a reactor announcing fresh transactions to peers
//!   and recovering missed proposal transactions during block verification.
//!
//! Everything else (signature math, wire codecs, persistent storage, block
//! assembly, the p2p transport) is consumed through the injected
//! capabilities of [`traits`].
//!
//! ## Lifecycle
//!
//! A transaction enters through [`Pool::submit`] (or is pushed by a peer),
//! passes the validator, lands in the queue and is persisted to the ledger
//! ahead of commit. The sealer pulls batches with
//! [`Pool::seal_transactions`], which marks them sealed; a commit
//! notification ([`Pool::notify_block_result`]) removes them and advances
//! the nonce window. Entries whose `block_limit` expires while waiting are
//! tombstoned during selection and removed asynchronously.

mod config;
pub mod error;
mod metrics;
mod pool;
pub mod sync;
pub mod traits;
mod validate;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::{
    config::{PoolConfig, SyncConfig, DEFAULT_BLOCK_LIMIT, DEFAULT_POOL_LIMIT},
    error::{PoolError, PoolResult},
    pool::ValidPoolTransaction,
    traits::{SealedTxs, TransactionOrigin, TxSubmitResult},
    validate::{LedgerNonceChecker, PoolNonceChecker, TxValidator},
};

use crate::{
    pool::PoolInner,
    sync::{SyncPeers, TransactionSync},
    traits::{FrontService, Ledger, Sealer},
};
use grove_primitives::{
    BlockHash, BlockNumber, Bytes, CryptoSuite, NodeId, TransactionSigned, TxHash,
};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// A shareable handle to the transaction pool.
///
/// All operations are non-blocking for the caller: admission and block
/// verification run under a bounded permit pool, receipts and sealer
/// notifications are delivered by notifier tasks, and peer traffic is
/// handled by the sync reactor.
#[derive(Clone, Debug)]
pub struct Pool {
    inner: Arc<PoolInner>,
    sync: Arc<TransactionSync>,
}

impl Pool {
    /// Wires up a pool from its configuration and injected capabilities.
    ///
    /// The pool is inert until [`Pool::init`] seeds it from the ledger and
    /// [`Pool::start`] spawns the sync reactor.
    pub fn new(
        config: PoolConfig,
        node_id: NodeId,
        crypto: Arc<dyn CryptoSuite>,
        ledger: Arc<dyn Ledger>,
        sealer: Arc<dyn Sealer>,
        front: Arc<dyn FrontService>,
    ) -> Self {
        let peers = Arc::new(SyncPeers::new(node_id));
        let inner = Arc::new(PoolInner::new(config, crypto, ledger, sealer, peers));
        let sync = Arc::new(TransactionSync::new(inner.clone(), front));
        Self { inner, sync }
    }

    /// Seeds the pool from the ledger: latest block number and hash, node
    /// membership lists, and the most recent `block_limit` blocks of
    /// nonces. Also discovers the currently connected peers.
    pub async fn init(&self) -> PoolResult<()> {
        self.inner.init().await?;
        match self.sync.front().connected_node_ids().await {
            Ok(nodes) => self.inner.peers().set_connected(nodes.into_iter().collect()),
            Err(err) => {
                warn!(target: "txpool", %err, "failed to fetch connected nodes")
            }
        }
        Ok(())
    }

    /// Spawns the sync reactor. Must be called within a tokio runtime.
    pub fn start(&self) {
        info!(target: "txpool", "starting the transaction pool");
        self.sync.start();
    }

    /// Stops the pool: new work observes [`PoolError::ShuttingDown`],
    /// in-flight operations complete, the sync reactor exits.
    pub fn stop(&self) {
        if !self.inner.is_running() {
            warn!(target: "txpool", "the transaction pool has already been stopped");
            return
        }
        self.inner.shutdown();
        self.sync.stop();
        info!(target: "txpool", "stopped the transaction pool");
    }

    /// Submits an encoded transaction and returns the admission outcome.
    pub async fn submit(&self, origin: TransactionOrigin, data: Bytes) -> PoolResult<TxHash> {
        let _permit = self.inner.acquire_verify().await?;
        self.inner.submit_bytes(origin, &data, None)
    }

    /// Submits an encoded transaction from a local client and additionally
    /// returns a receiver resolving at most once with the commit-time
    /// receipt (or the block-limit invalidation).
    pub async fn submit_and_watch(
        &self,
        data: Bytes,
    ) -> PoolResult<(TxHash, oneshot::Receiver<TxSubmitResult>)> {
        let _permit = self.inner.acquire_verify().await?;
        let (tx, rx) = oneshot::channel();
        let hash = self.inner.submit_bytes(TransactionOrigin::Local, &data, Some(tx))?;
        Ok((hash, rx))
    }

    /// Submits an already decoded transaction.
    pub async fn submit_transaction(
        &self,
        origin: TransactionOrigin,
        tx: TransactionSigned,
    ) -> PoolResult<TxHash> {
        let _permit = self.inner.acquire_verify().await?;
        self.inner.submit_transaction(origin, tx, None)
    }

    /// Selects up to `limit` sealable transaction hashes in import order,
    /// skipping `avoid`, marking the returned entries sealed.
    pub async fn seal_transactions(
        &self,
        limit: usize,
        avoid: Option<HashSet<TxHash>>,
    ) -> PoolResult<SealedTxs> {
        if !self.inner.is_running() {
            return Err(PoolError::ShuttingDown)
        }
        Ok(self.inner.seal_transactions(limit, avoid.as_ref()))
    }

    /// Returns the transactions behind the given proposal hashes, in the
    /// requested order. Missing transactions are recovered from the local
    /// ledger if possible.
    pub async fn fill_block(&self, hashes: &[TxHash]) -> PoolResult<Vec<TransactionSigned>> {
        let (txs, missed) = self.inner.fetch(hashes);
        if missed.is_empty() {
            return Ok(txs.into_iter().map(|tx| tx.transaction.clone()).collect())
        }
        warn!(target: "txpool", missed = missed.len(), "fill block: missing transactions, trying the ledger");
        self.sync.request_missed_txs(None, missed).await?;
        let (txs, missed) = self.inner.fetch(hashes);
        if !missed.is_empty() {
            return Err(PoolError::TransactionsMissing(missed.len()))
        }
        Ok(txs.into_iter().map(|tx| tx.transaction.clone()).collect())
    }

    /// Removes the transactions of the committed block `block_number`,
    /// advances the committed-nonce window and delivers submit receipts.
    pub async fn notify_block_result(
        &self,
        block_number: BlockNumber,
        results: Vec<TxSubmitResult>,
    ) -> PoolResult<()> {
        self.inner.batch_remove(block_number, results);
        Ok(())
    }

    /// Verifies that every transaction referenced by the encoded proposal
    /// is (or becomes) resident, fetching missed ones from `origin` with a
    /// ledger fallback.
    pub async fn verify_block(&self, origin: NodeId, block: Bytes) -> PoolResult<()> {
        let _permit = self.inner.acquire_verify().await?;
        self.sync.verify_block(origin, &block).await
    }

    /// Dispatches an inbound message of the transaction sync module.
    ///
    /// `uuid` is the transport's response correlation handle for request
    /// messages.
    pub fn notify_txs_sync_message(&self, from: NodeId, uuid: Option<String>, data: Bytes) {
        if !self.inner.is_running() {
            return
        }
        self.sync.on_message(from, uuid, data);
    }

    /// Replaces the set of connected peers.
    pub fn notify_connected_nodes(&self, nodes: HashSet<NodeId>) {
        self.inner.peers().set_connected(nodes);
    }

    /// Replaces the consensus member list.
    pub fn notify_consensus_node_list(&self, nodes: Vec<NodeId>) {
        self.inner.peers().set_consensus_node_list(nodes);
    }

    /// Replaces the observer member list.
    pub fn notify_observer_node_list(&self, nodes: Vec<NodeId>) {
        self.inner.peers().set_observer_node_list(nodes);
    }

    /// Updates the sealed flag of the given transactions, correlating
    /// sealed entries with the proposal batch `batch_id`/`batch_hash`.
    pub async fn mark_transactions(
        &self,
        hashes: &[TxHash],
        sealed: bool,
        batch_id: BlockNumber,
        batch_hash: BlockHash,
    ) -> PoolResult<()> {
        self.inner.batch_mark(hashes, sealed, batch_id, batch_hash);
        Ok(())
    }

    /// Resets the sealed flag across the pool, e.g. after a consensus view
    /// change abandoned the in-flight proposals.
    pub async fn reset_pool(&self) -> PoolResult<()> {
        info!(target: "txpool", size = self.len(), "resetting pool sealing state");
        self.inner.mark_all(false);
        Ok(())
    }

    /// Number of resident transactions.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the pool holds no transactions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of transactions available to the sealer.
    pub fn pending_size(&self) -> usize {
        self.inner.unsealed_len()
    }

    /// Whether a transaction with this hash is resident.
    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.contains(hash)
    }

    /// Looks up a resident pool entry by hash.
    pub fn get(&self, hash: &TxHash) -> Option<Arc<ValidPoolTransaction>> {
        self.inner.get(hash)
    }

    /// Drops every resident transaction.
    pub fn clear(&self) {
        self.inner.clear();
    }
}
