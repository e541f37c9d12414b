//! Transaction pool internals.
//!
//! [`PoolInner`] owns the store behind the pool-wide reader/writer lock and
//! drives the admission pipeline: capacity and duplicate checks, the
//! validator gate, pre-commit persistence to the ledger, sealer
//! notifications and submit receipts. User-visible callbacks never run
//! under the storage lock; they are posted onto a small notifier pool.

use crate::{
    config::PoolConfig,
    error::{PoolError, PoolResult},
    metrics::TxPoolMetrics,
    sync::SyncPeers,
    traits::{Ledger, NodeType, Sealer, SealedTxs, TransactionOrigin, TxSubmitResult},
    validate::TxValidator,
};
use grove_primitives::{
    BlockHash, BlockNumber, CryptoSuite, NodeId, TransactionSigned, TxHash,
};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

mod txpool;

pub use txpool::ValidPoolTransaction;
pub(crate) use txpool::TxPool;

/// How often a failed pre-commit store is retried.
const PRE_COMMIT_RETRIES: usize = 3;
/// Pause between pre-commit retries.
const PRE_COMMIT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How often a failed sealer notification is retried.
const NOTIFY_RETRIES: usize = 3;

/// Admission timestamp in milliseconds.
fn utc_now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// The pool core shared between the façade, the sync engine and spawned
/// worker tasks.
pub(crate) struct PoolInner {
    config: PoolConfig,
    validator: TxValidator,
    /// The store, behind the pool-wide lock.
    pool: RwLock<TxPool>,
    /// Hashes announced by peers that are not locally held.
    missed_txs: RwLock<HashSet<TxHash>>,
    crypto: Arc<dyn CryptoSuite>,
    ledger: Arc<dyn Ledger>,
    sealer: Arc<dyn Sealer>,
    peers: Arc<SyncPeers>,
    /// Wakes the sync reactor when a new transaction arrives.
    on_ready: Notify,
    /// Permits bounding admission and block verification work.
    verify_slots: Arc<Semaphore>,
    /// Permits bounding receipt delivery and invalid-removal passes.
    notify_slots: Arc<Semaphore>,
    running: AtomicBool,
    metrics: TxPoolMetrics,
}

impl PoolInner {
    pub(crate) fn new(
        config: PoolConfig,
        crypto: Arc<dyn CryptoSuite>,
        ledger: Arc<dyn Ledger>,
        sealer: Arc<dyn Sealer>,
        peers: Arc<SyncPeers>,
    ) -> Self {
        let validator = TxValidator::new(
            config.chain_id,
            config.group_id,
            crypto.clone(),
            config.block_limit,
        );
        let verify_slots = Arc::new(Semaphore::new(config.verify_worker_num.max(1)));
        let notify_slots = Arc::new(Semaphore::new(config.notify_worker_num.max(1)));
        Self {
            config,
            validator,
            pool: RwLock::new(TxPool::default()),
            missed_txs: RwLock::new(HashSet::new()),
            crypto,
            ledger,
            sealer,
            peers,
            on_ready: Notify::new(),
            verify_slots,
            notify_slots,
            running: AtomicBool::new(true),
            metrics: TxPoolMetrics::default(),
        }
    }

    /// Seeds the pool from the ledger: latest block, node lists and the
    /// committed-nonce window.
    pub(crate) async fn init(&self) -> PoolResult<()> {
        let number = self.ledger.block_number().await?;
        let block_hash = self.ledger.block_hash_by_number(number).await?;
        info!(target: "txpool", number, hash = %block_hash, "fetched ledger state");

        let consensus = self.ledger.node_list_by_type(NodeType::ConsensusSealer).await?;
        let observers = self.ledger.node_list_by_type(NodeType::ConsensusObserver).await?;
        self.peers.set_consensus_node_list(consensus);
        self.peers.set_observer_node_list(observers);

        let window = self.config.block_limit;
        let start = if number >= window { number - window + 1 } else { 0 };
        let nonces = self.ledger.nonce_list(start, number - start + 1).await?;
        self.validator.ledger_nonces().init(number, nonces);
        info!(target: "txpool", number, start, "seeded nonce window from ledger");
        Ok(())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flips the running flag and unblocks everything waiting on pool
    /// resources. In-flight operations complete; new ones observe
    /// [`PoolError::ShuttingDown`].
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.verify_slots.close();
        self.notify_slots.close();
        self.on_ready.notify_waiters();
    }

    /// Acquires a verification permit, failing once the pool is stopping.
    pub(crate) async fn acquire_verify(&self) -> PoolResult<OwnedSemaphorePermit> {
        self.verify_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::ShuttingDown)
    }

    // === admission ===

    /// Decodes and submits a transaction from its wire form.
    pub(crate) fn submit_bytes(
        self: &Arc<Self>,
        origin: TransactionOrigin,
        data: &[u8],
        receipt: Option<oneshot::Sender<TxSubmitResult>>,
    ) -> PoolResult<TxHash> {
        let tx = match TransactionSigned::decode_and_hash(data, &*self.crypto) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(target: "txpool", %err, "invalid transaction: decode failure");
                self.metrics.invalid_transactions.increment(1);
                return Err(PoolError::Malform)
            }
        };
        self.submit_transaction(origin, tx, receipt)
    }

    /// Submits a decoded transaction through the full admission pipeline.
    pub(crate) fn submit_transaction(
        self: &Arc<Self>,
        origin: TransactionOrigin,
        tx: TransactionSigned,
        receipt: Option<oneshot::Sender<TxSubmitResult>>,
    ) -> PoolResult<TxHash> {
        let outcome = self.verify_and_insert(origin, tx, receipt);
        if let Err(err) = &outcome {
            trace!(target: "txpool", %err, "rejected transaction");
            self.metrics.invalid_transactions.increment(1);
        }
        outcome
    }

    fn verify_and_insert(
        self: &Arc<Self>,
        origin: TransactionOrigin,
        tx: TransactionSigned,
        receipt: Option<oneshot::Sender<TxSubmitResult>>,
    ) -> PoolResult<TxHash> {
        if !self.is_running() {
            return Err(PoolError::ShuttingDown)
        }
        if origin.is_local() && !self.peers.exists_in_group() {
            warn!(target: "txpool", "rejecting local submission, node is not in the group");
            return Err(PoolError::RequestNotBelongToTheGroup)
        }
        let hash = tx.hash();
        {
            let pool = self.pool.read();
            if pool.len() >= self.config.pool_limit {
                return Err(PoolError::TxPoolIsFull)
            }
            if pool.contains(&hash) {
                return Err(PoolError::AlreadyInTxPool(hash))
            }
        }
        // reserves the nonce on success
        self.validator.verify(&tx)?;
        let nonce = tx.nonce();
        let entry =
            Arc::new(ValidPoolTransaction::new(tx, origin, utc_now_millis(), receipt));
        let inserted = {
            let mut pool = self.pool.write();
            if pool.len() >= self.config.pool_limit {
                Err(PoolError::TxPoolIsFull)
            } else {
                pool.insert(entry.clone())
            }
        };
        if let Err(err) = inserted {
            self.validator.pool_nonces().remove(&nonce);
            return Err(err)
        }
        self.on_inserted(&entry);
        Ok(hash)
    }

    /// Imports a proposal transaction recovered during block verification:
    /// no validation, immediately sealed. An unsealed resident entry is
    /// sealed in place; a sealed one means another proposal holds it.
    pub(crate) fn enforce_import(self: &Arc<Self>, tx: TransactionSigned) -> PoolResult<TxHash> {
        let hash = tx.hash();
        let entry = {
            let mut pool = self.pool.write();
            if let Some(newly_sealed) = pool.seal_entry(&hash) {
                return if newly_sealed {
                    Ok(hash)
                } else {
                    Err(PoolError::AlreadyInTxPool(hash))
                }
            }
            let entry = Arc::new(ValidPoolTransaction::new(
                tx,
                TransactionOrigin::External,
                utc_now_millis(),
                None,
            ));
            entry.set_sealed(true);
            pool.insert(entry.clone())?;
            entry
        };
        self.on_inserted(&entry);
        Ok(hash)
    }

    fn on_inserted(self: &Arc<Self>, entry: &Arc<ValidPoolTransaction>) {
        self.missed_txs.write().remove(&entry.hash());
        self.metrics.inserted_transactions.increment(1);
        self.metrics.resident_transactions.set(self.len() as f64);
        trace!(target: "txpool", tx = %entry.hash(), "inserted new transaction");
        self.on_ready.notify_one();
        self.pre_commit(entry.clone());
        self.notify_unsealed_size();
    }

    // === sealing ===

    /// Selects up to `limit` sealable transactions and schedules the
    /// asynchronous removal of entries whose block limit expired.
    pub(crate) fn seal_transactions(
        self: &Arc<Self>,
        limit: usize,
        avoid: Option<&HashSet<TxHash>>,
    ) -> SealedTxs {
        let sealed = {
            let pool = self.pool.upgradable_read();
            pool.batch_fetch(limit, avoid, true, &self.validator)
        };
        self.metrics.sealed_transactions.set(self.pool.read().sealed_len() as f64);
        debug!(target: "txpool", count = sealed.len(), "sealed transactions");
        self.notify_unsealed_size();
        self.remove_invalid_txs();
        sealed
    }

    /// Drains the invalid tombstones on a notifier worker: removes the
    /// entries, releases their nonces and reports the rejection to local
    /// submitters.
    pub(crate) fn remove_invalid_txs(self: &Arc<Self>) {
        if !self.pool.read().has_invalid() {
            return
        }
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(pool) = this.upgrade() else { return };
            let Ok(_permit) = pool.notify_slots.clone().acquire_owned().await else { return };
            let removed = {
                let mut store = pool.pool.write();
                let (hashes, nonces) = store.take_invalid();
                let mut removed = Vec::with_capacity(hashes.len());
                for hash in &hashes {
                    if let Some(tx) = store.remove(hash) {
                        removed.push(tx);
                    }
                }
                pool.validator.pool_nonces().batch_remove(nonces.iter());
                removed
            };
            if removed.is_empty() {
                return
            }
            debug!(target: "txpool", count = removed.len(), "removed block-limit expired transactions");
            pool.metrics.removed_transactions.increment(removed.len() as u64);
            pool.metrics.resident_transactions.set(pool.len() as f64);
            for tx in removed {
                let result = TxSubmitResult::rejected(tx.hash(), PoolError::BlockLimitCheckFail)
                    .with_nonce(tx.nonce());
                pool.notify_tx_result(&tx, result);
            }
            pool.notify_unsealed_size();
        });
    }

    // === commit ===

    /// Removes the transactions of a committed block, advances the nonce
    /// window and delivers commit receipts.
    pub(crate) fn batch_remove(
        self: &Arc<Self>,
        block_number: BlockNumber,
        results: Vec<TxSubmitResult>,
    ) {
        let expected = results.len();
        let mut nonces = Vec::with_capacity(expected);
        let mut notifications = Vec::new();
        {
            let mut store = self.pool.write();
            for result in results {
                match store.remove(&result.hash) {
                    Some(tx) => {
                        nonces.push(tx.nonce());
                        notifications.push((tx, result));
                    }
                    // the block carried a transaction this pool never held;
                    // its nonce still enters the window
                    None => {
                        if let Some(nonce) = result.nonce {
                            nonces.push(nonce);
                        }
                    }
                }
            }
        }
        info!(
            target: "txpool",
            block_number,
            expected,
            removed = notifications.len(),
            "removed committed transactions"
        );
        self.metrics.removed_transactions.increment(notifications.len() as u64);
        self.metrics.resident_transactions.set(self.len() as f64);
        for (tx, result) in notifications {
            let nonce = tx.nonce();
            let receipt = result.with_block_number(block_number).with_nonce(nonce);
            self.notify_tx_result(&tx, receipt);
        }
        self.validator.ledger_nonces().batch_insert(block_number, nonces.clone());
        self.validator.pool_nonces().batch_remove(nonces.iter());
        self.notify_unsealed_size();
    }

    // === queries & marking ===

    pub(crate) fn len(&self) -> usize {
        self.pool.read().len()
    }

    pub(crate) fn unsealed_len(&self) -> usize {
        self.pool.read().unsealed_len()
    }

    pub(crate) fn contains(&self, hash: &TxHash) -> bool {
        self.pool.read().contains(hash)
    }

    pub(crate) fn get(&self, hash: &TxHash) -> Option<Arc<ValidPoolTransaction>> {
        self.pool.read().get(hash).cloned()
    }

    pub(crate) fn fetch(
        &self,
        hashes: &[TxHash],
    ) -> (Vec<Arc<ValidPoolTransaction>>, Vec<TxHash>) {
        self.pool.read().fetch(hashes)
    }

    pub(crate) fn fetch_new(&self, limit: usize) -> Vec<Arc<ValidPoolTransaction>> {
        self.pool.read().fetch_new(limit)
    }

    pub(crate) fn batch_mark(
        self: &Arc<Self>,
        hashes: &[TxHash],
        sealed: bool,
        batch_id: BlockNumber,
        batch_hash: BlockHash,
    ) {
        self.pool.read().batch_mark(hashes, sealed, batch_id, batch_hash);
        self.metrics.sealed_transactions.set(self.pool.read().sealed_len() as f64);
        self.notify_unsealed_size();
    }

    pub(crate) fn mark_all(self: &Arc<Self>, sealed: bool) {
        self.pool.read().mark_all(sealed);
        self.metrics.sealed_transactions.set(self.pool.read().sealed_len() as f64);
        self.notify_unsealed_size();
    }

    pub(crate) fn clear(&self) {
        self.pool.write().clear();
        self.metrics.resident_transactions.set(0.0);
        self.metrics.sealed_transactions.set(0.0);
    }

    /// Records `peer` as knowing the resident subset of `hashes` and
    /// returns the hashes this pool has never seen, tracking them as
    /// missed. The missed set is reset wholesale once it reaches the pool
    /// limit.
    pub(crate) fn filter_unknown(&self, hashes: &[TxHash], peer: NodeId) -> Vec<TxHash> {
        {
            let pool = self.pool.read();
            for hash in hashes {
                if let Some(tx) = pool.get(hash) {
                    tx.append_known_node(peer);
                }
            }
        }
        let mut unknown = Vec::new();
        let missed = self.missed_txs.upgradable_read();
        {
            let pool = self.pool.read();
            for hash in hashes {
                if pool.contains(hash) || missed.contains(hash) {
                    continue
                }
                unknown.push(*hash);
            }
        }
        if !unknown.is_empty() {
            let mut missed = RwLockUpgradableReadGuard::upgrade(missed);
            missed.extend(unknown.iter().copied());
            if missed.len() >= self.config.pool_limit {
                // membership information is lost; peers will re-announce
                missed.clear();
            }
        }
        unknown
    }

    // === notifications ===

    /// Delivers the submit receipt for `tx` on a notifier worker, at most
    /// once per transaction.
    pub(crate) fn notify_tx_result(self: &Arc<Self>, tx: &ValidPoolTransaction, result: TxSubmitResult) {
        let Some(sender) = tx.take_receipt() else { return };
        let hash = tx.hash();
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(pool) = this.upgrade() else { return };
            let Ok(_permit) = pool.notify_slots.clone().acquire_owned().await else {
                // stopping; the watcher observes the closed channel
                return
            };
            let _ = sender.send(result);
            trace!(target: "txpool", tx = %hash, "notified submit result");
        });
    }

    /// Reports the current unsealed size to the sealer, retrying a bounded
    /// number of times. Delivery is at-least-once.
    pub(crate) fn notify_unsealed_size(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            for attempt in 0..=NOTIFY_RETRIES {
                let Some(pool) = this.upgrade() else { return };
                let size = pool.unsealed_len();
                match pool.sealer.note_unsealed_size(size).await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(target: "txpool", %err, attempt, size, "sealer notification failed, retrying")
                    }
                }
            }
        });
    }

    /// Stores the freshly admitted transaction in the ledger ahead of
    /// commit, retrying a bounded number of times.
    fn pre_commit(self: &Arc<Self>, tx: Arc<ValidPoolTransaction>) {
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let encoded = tx.transaction.encoded();
            let hash = tx.hash();
            for attempt in 0..=PRE_COMMIT_RETRIES {
                let Some(pool) = this.upgrade() else { return };
                if !pool.is_running() {
                    return
                }
                match pool.ledger.store_transactions(vec![encoded.clone()], vec![hash]).await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(target: "txpool", %err, attempt, tx = %hash, "pre-commit store failed")
                    }
                }
                drop(pool);
                tokio::time::sleep(PRE_COMMIT_RETRY_DELAY).await;
            }
        });
    }

    // === shared context ===

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn validator(&self) -> &TxValidator {
        &self.validator
    }

    pub(crate) fn crypto(&self) -> &Arc<dyn CryptoSuite> {
        &self.crypto
    }

    pub(crate) fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub(crate) fn peers(&self) -> &Arc<SyncPeers> {
        &self.peers
    }

    pub(crate) fn on_ready(&self) -> &Notify {
        &self.on_ready
    }
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("config", &self.config)
            .field("size", &self.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
