//! The in-memory transaction store: an ordered queue over an arena of
//! shared entries, a hash index, and the sealed/invalid bookkeeping.

use crate::{
    error::{PoolError, PoolResult},
    traits::{SealedTxs, TransactionOrigin, TxSubmitResult},
    validate::TxValidator,
};
use dashmap::DashSet;
use grove_primitives::{BlockHash, BlockNumber, NodeId, Nonce, TransactionSigned, TxHash};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::oneshot;
use tracing::warn;

/// Sentinel batch id for entries not part of any sealed batch.
const NO_BATCH: u64 = u64::MAX;

/// Position of an entry in the sealing order: import time ascending, ties
/// broken by insertion sequence.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TxId {
    /// Import timestamp in milliseconds.
    pub(crate) time: u64,
    /// Insertion sequence number.
    pub(crate) seq: u64,
}

/// A transaction resident in the pool, together with the pool-owned mutable
/// state.
///
/// Entries are shared (`Arc`) between the queue, the sync engine and
/// in-flight notification tasks; the mutable flags use interior mutability
/// so they can be flipped under the pool's shared lock.
#[derive(Debug)]
pub struct ValidPoolTransaction {
    /// The admitted transaction.
    pub transaction: TransactionSigned,
    /// Where the transaction entered this node.
    pub origin: TransactionOrigin,
    /// Admission timestamp in milliseconds.
    pub import_time: u64,
    /// Set once the transaction is part of an in-flight proposal.
    sealed: AtomicBool,
    /// Set once the transaction has been announced to peers.
    synced: AtomicBool,
    /// Number of the proposal batch that sealed this entry.
    batch_id: AtomicU64,
    /// Hash of the proposal batch that sealed this entry.
    batch_hash: Mutex<BlockHash>,
    /// Peers already aware of this transaction.
    known_nodes: RwLock<HashSet<NodeId>>,
    /// Commit receipt channel of the local submitter, consumed at most once.
    receipt: Mutex<Option<oneshot::Sender<TxSubmitResult>>>,
}

impl ValidPoolTransaction {
    /// Creates a pool entry.
    pub(crate) fn new(
        transaction: TransactionSigned,
        origin: TransactionOrigin,
        import_time: u64,
        receipt: Option<oneshot::Sender<TxSubmitResult>>,
    ) -> Self {
        Self {
            transaction,
            origin,
            import_time,
            sealed: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            batch_id: AtomicU64::new(NO_BATCH),
            batch_hash: Mutex::new(BlockHash::ZERO),
            known_nodes: RwLock::new(HashSet::new()),
            receipt: Mutex::new(receipt),
        }
    }

    /// The transaction hash.
    pub fn hash(&self) -> TxHash {
        self.transaction.hash()
    }

    /// The transaction nonce.
    pub fn nonce(&self) -> Nonce {
        self.transaction.nonce()
    }

    /// Whether this is a system transaction.
    pub fn is_system(&self) -> bool {
        self.transaction.is_system()
    }

    /// Whether the transaction was submitted by a local client.
    pub fn is_local(&self) -> bool {
        self.origin.is_local()
    }

    /// Whether the entry is part of an in-flight proposal.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Sets the sealed flag, returning the previous value.
    pub(crate) fn set_sealed(&self, sealed: bool) -> bool {
        self.sealed.swap(sealed, Ordering::AcqRel)
    }

    /// Whether the entry has been announced to peers.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Sets the synced flag, returning the previous value.
    pub(crate) fn set_synced(&self, synced: bool) -> bool {
        self.synced.swap(synced, Ordering::AcqRel)
    }

    /// Records the proposal batch that sealed this entry.
    pub(crate) fn mark_batch(&self, batch_id: BlockNumber, batch_hash: BlockHash) {
        self.batch_id.store(batch_id, Ordering::Release);
        *self.batch_hash.lock() = batch_hash;
    }

    /// Clears the batch correlation.
    pub(crate) fn clear_batch(&self) {
        self.batch_id.store(NO_BATCH, Ordering::Release);
        *self.batch_hash.lock() = BlockHash::ZERO;
    }

    /// The batch that sealed this entry, if any.
    pub fn batch(&self) -> Option<(BlockNumber, BlockHash)> {
        let id = self.batch_id.load(Ordering::Acquire);
        (id != NO_BATCH).then(|| (id, *self.batch_hash.lock()))
    }

    /// Whether `peer` already knows this transaction.
    pub fn is_known_by(&self, peer: &NodeId) -> bool {
        self.known_nodes.read().contains(peer)
    }

    /// Records that `peer` knows this transaction.
    pub fn append_known_node(&self, peer: NodeId) {
        self.known_nodes.write().insert(peer);
    }

    /// Records that all `peers` know this transaction.
    pub fn append_known_nodes(&self, peers: impl IntoIterator<Item = NodeId>) {
        self.known_nodes.write().extend(peers);
    }

    /// Takes the commit receipt channel, if still unconsumed.
    pub(crate) fn take_receipt(&self) -> Option<oneshot::Sender<TxSubmitResult>> {
        self.receipt.lock().take()
    }
}

/// The transaction store proper. Guarded by the pool-wide reader/writer
/// lock in [`PoolInner`](crate::pool::PoolInner); the sealed counter and the
/// invalid tombstones use concurrent types so sealing can run under a
/// shared guard.
#[derive(Debug, Default)]
pub(crate) struct TxPool {
    /// Entries in sealing order.
    queue: BTreeMap<TxId, Arc<ValidPoolTransaction>>,
    /// Primary index: hash -> queue position.
    by_hash: HashMap<TxHash, TxId>,
    /// Number of resident entries currently marked sealed.
    sealed_count: AtomicUsize,
    /// Hashes discovered to violate their block limit during selection.
    invalid_txs: DashSet<TxHash>,
    /// Nonces of those entries, released together with them.
    invalid_nonces: DashSet<Nonce>,
    /// Next insertion sequence number.
    next_seq: u64,
}

impl TxPool {
    /// Number of resident transactions.
    pub(crate) fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether the pool holds no transactions.
    pub(crate) fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Whether a transaction with this hash is resident.
    pub(crate) fn contains(&self, hash: &TxHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Looks up an entry by hash.
    pub(crate) fn get(&self, hash: &TxHash) -> Option<&Arc<ValidPoolTransaction>> {
        self.by_hash.get(hash).and_then(|id| self.queue.get(id))
    }

    /// Number of resident entries marked sealed.
    pub(crate) fn sealed_len(&self) -> usize {
        self.sealed_count.load(Ordering::Acquire)
    }

    /// Number of sealable transactions. The sealed counter is clamped if it
    /// ever overtakes the pool size.
    pub(crate) fn unsealed_len(&self) -> usize {
        let len = self.by_hash.len();
        let sealed = self.sealed_count.load(Ordering::Acquire);
        if len < sealed {
            self.sealed_count.store(len, Ordering::Release);
            return 0
        }
        len - sealed
    }

    /// Appends an entry to the queue and indexes it by hash.
    pub(crate) fn insert(&mut self, tx: Arc<ValidPoolTransaction>) -> PoolResult<()> {
        let hash = tx.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(PoolError::AlreadyInTxPool(hash))
        }
        let id = TxId { time: tx.import_time, seq: self.next_seq };
        self.next_seq += 1;
        if tx.is_sealed() {
            self.sealed_count.fetch_add(1, Ordering::AcqRel);
        }
        self.by_hash.insert(hash, id);
        self.queue.insert(id, tx);
        Ok(())
    }

    /// Seals a resident entry in place, returning whether it was newly
    /// sealed, or `None` if no entry with this hash is resident.
    pub(crate) fn seal_entry(&self, hash: &TxHash) -> Option<bool> {
        let tx = self.get(hash)?;
        let newly_sealed = !tx.set_sealed(true);
        if newly_sealed {
            self.sealed_count.fetch_add(1, Ordering::AcqRel);
        }
        Some(newly_sealed)
    }

    /// Removes an entry by hash.
    pub(crate) fn remove(&mut self, hash: &TxHash) -> Option<Arc<ValidPoolTransaction>> {
        let id = self.by_hash.remove(hash)?;
        let tx = self.queue.remove(&id)?;
        if tx.is_sealed() {
            self.sealed_count.fetch_sub(1, Ordering::AcqRel);
        }
        Some(tx)
    }

    /// Selects up to `limit` sealable hashes in import order, re-checking
    /// every candidate against the committed window.
    pub(crate) fn batch_fetch(
        &self,
        limit: usize,
        avoid: Option<&HashSet<TxHash>>,
        avoid_duplicate: bool,
        validator: &TxValidator,
    ) -> SealedTxs {
        let mut sealed = SealedTxs::default();
        for tx in self.queue.values() {
            if sealed.len() >= limit {
                break
            }
            let hash = tx.hash();
            if self.invalid_txs.contains(&hash) {
                continue
            }
            // re-check before the sealed skip so entries that expired while
            // sealed still get tombstoned
            match validator.duplicate_tx(&tx.transaction) {
                // a later block committed this nonce; the commit
                // notification will remove the entry
                Err(PoolError::NonceCheckFail) => continue,
                Err(PoolError::BlockLimitCheckFail) => {
                    self.invalid_txs.insert(hash);
                    self.invalid_nonces.insert(tx.nonce());
                    continue
                }
                _ => {}
            }
            if avoid.is_some_and(|set| set.contains(&hash)) {
                continue
            }
            if avoid_duplicate && tx.is_sealed() {
                continue
            }
            if tx.is_system() {
                sealed.system_txs.push(hash);
            } else {
                sealed.txs.push(hash);
            }
            if !tx.set_sealed(true) {
                self.sealed_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        sealed
    }

    /// Looks up the requested hashes, preserving their order; absent hashes
    /// are collected separately.
    pub(crate) fn fetch(
        &self,
        hashes: &[TxHash],
    ) -> (Vec<Arc<ValidPoolTransaction>>, Vec<TxHash>) {
        let mut txs = Vec::with_capacity(hashes.len());
        let mut missed = Vec::new();
        for hash in hashes {
            match self.by_hash.get(hash).and_then(|id| self.queue.get(id)) {
                Some(tx) => txs.push(tx.clone()),
                None => missed.push(*hash),
            }
        }
        (txs, missed)
    }

    /// Returns up to `limit` not-yet-announced transactions in import order,
    /// marking each as announced.
    pub(crate) fn fetch_new(&self, limit: usize) -> Vec<Arc<ValidPoolTransaction>> {
        let mut out = Vec::new();
        for tx in self.queue.values() {
            if out.len() >= limit {
                break
            }
            if tx.set_synced(true) {
                continue
            }
            out.push(tx.clone());
        }
        out
    }

    /// Updates the sealed flag of the given entries, maintaining the sealed
    /// counter for actual transitions.
    pub(crate) fn batch_mark(
        &self,
        hashes: &[TxHash],
        sealed: bool,
        batch_id: BlockNumber,
        batch_hash: BlockHash,
    ) {
        for hash in hashes {
            let Some(tx) = self.get(hash) else {
                warn!(target: "txpool", tx = %hash, sealed, "batch_mark: missing transaction");
                continue
            };
            let prev = tx.set_sealed(sealed);
            match (prev, sealed) {
                (false, true) => {
                    self.sealed_count.fetch_add(1, Ordering::AcqRel);
                }
                (true, false) => {
                    self.sealed_count.fetch_sub(1, Ordering::AcqRel);
                }
                _ => {}
            }
            if sealed {
                tx.mark_batch(batch_id, batch_hash);
            } else {
                tx.clear_batch();
            }
        }
    }

    /// Resets the sealed flag across the whole pool.
    pub(crate) fn mark_all(&self, sealed: bool) {
        for tx in self.queue.values() {
            tx.set_sealed(sealed);
            if !sealed {
                tx.clear_batch();
            }
        }
        let count = if sealed { self.by_hash.len() } else { 0 };
        self.sealed_count.store(count, Ordering::Release);
    }

    /// Drains the invalid tombstones accumulated by selection.
    pub(crate) fn take_invalid(&mut self) -> (Vec<TxHash>, Vec<Nonce>) {
        let hashes: Vec<TxHash> = self.invalid_txs.iter().map(|h| *h).collect();
        let nonces: Vec<Nonce> = self.invalid_nonces.iter().map(|n| *n).collect();
        self.invalid_txs.clear();
        self.invalid_nonces.clear();
        (hashes, nonces)
    }

    /// Whether any invalid tombstones are pending removal.
    pub(crate) fn has_invalid(&self) -> bool {
        !self.invalid_txs.is_empty()
    }

    /// Drops every entry.
    pub(crate) fn clear(&mut self) {
        self.by_hash.clear();
        self.queue.clear();
        self.invalid_txs.clear();
        self.invalid_nonces.clear();
        self.sealed_count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fake_transaction, random_nonce, MockCryptoSuite, MockKeyPair};
    use std::collections::BTreeMap as StdBTreeMap;

    const CHAIN: u64 = 1;
    const GROUP: u64 = 1;
    const WINDOW: u64 = 10;
    const LATEST: u64 = 100;

    fn validator() -> TxValidator {
        let v = TxValidator::new(CHAIN, GROUP, Arc::new(MockCryptoSuite::default()), WINDOW);
        v.ledger_nonces().init(LATEST, StdBTreeMap::new());
        v
    }

    fn entry(import_time: u64, block_limit: u64) -> Arc<ValidPoolTransaction> {
        let crypto = MockCryptoSuite::default();
        let key = MockKeyPair::random();
        let tx = fake_transaction(&crypto, &key, random_nonce(), block_limit, CHAIN, GROUP);
        Arc::new(ValidPoolTransaction::new(tx, TransactionOrigin::Local, import_time, None))
    }

    #[test]
    fn queue_and_index_stay_in_lockstep() {
        let mut pool = TxPool::default();
        let a = entry(2, LATEST + 5);
        let b = entry(1, LATEST + 5);
        pool.insert(a.clone()).unwrap();
        pool.insert(b.clone()).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&a.hash()));
        assert!(pool.contains(&b.hash()));

        assert!(pool.remove(&a.hash()).is_some());
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&a.hash()));
        assert!(pool.remove(&a.hash()).is_none());
    }

    #[test]
    fn duplicate_hash_is_rejected() {
        let mut pool = TxPool::default();
        let tx = entry(1, LATEST + 5);
        pool.insert(tx.clone()).unwrap();
        let dup = Arc::new(ValidPoolTransaction::new(
            tx.transaction.clone(),
            TransactionOrigin::External,
            2,
            None,
        ));
        assert_eq!(pool.insert(dup), Err(PoolError::AlreadyInTxPool(tx.hash())));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn selection_follows_import_order() {
        let validator = validator();
        let mut pool = TxPool::default();
        let mut expected = Vec::new();
        for time in [5u64, 1, 3, 2, 4] {
            let tx = entry(time, LATEST + 5);
            expected.push((time, tx.hash()));
            pool.insert(tx).unwrap();
        }
        expected.sort_by_key(|(time, _)| *time);

        let sealed = pool.batch_fetch(10, None, true, &validator);
        let hashes: Vec<_> = expected.into_iter().map(|(_, h)| h).collect();
        assert_eq!(sealed.txs, hashes);
        assert_eq!(pool.sealed_len(), 5);
        assert_eq!(pool.unsealed_len(), 0);
    }

    #[test]
    fn selection_skips_sealed_avoided_and_limits() {
        let validator = validator();
        let mut pool = TxPool::default();
        let txs: Vec<_> = (0..4u64).map(|i| entry(i, LATEST + 5)).collect();
        for tx in &txs {
            pool.insert(tx.clone()).unwrap();
        }

        let first = pool.batch_fetch(2, None, true, &validator);
        assert_eq!(first.txs, vec![txs[0].hash(), txs[1].hash()]);

        let mut avoid = HashSet::new();
        avoid.insert(txs[2].hash());
        let second = pool.batch_fetch(10, Some(&avoid), true, &validator);
        assert_eq!(second.txs, vec![txs[3].hash()]);
        assert_eq!(pool.unsealed_len(), 1);
    }

    #[test]
    fn expired_block_limit_is_tombstoned() {
        let validator = validator();
        let mut pool = TxPool::default();
        let fresh = entry(1, LATEST + 5);
        let stale = entry(0, LATEST + 5);
        pool.insert(fresh.clone()).unwrap();
        pool.insert(stale.clone()).unwrap();

        // advance the window past the stale transaction's limit
        validator.ledger_nonces().batch_insert(LATEST + 6, vec![random_nonce()]);
        // fresh is now stale as well; everything gets tombstoned
        let sealed = pool.batch_fetch(10, None, true, &validator);
        assert!(sealed.is_empty());
        assert!(pool.has_invalid());
        let (hashes, nonces) = pool.take_invalid();
        assert_eq!(hashes.len(), 2);
        assert_eq!(nonces.len(), 2);
        assert!(!pool.has_invalid());
    }

    #[test]
    fn fetch_preserves_request_order() {
        let mut pool = TxPool::default();
        let a = entry(1, LATEST + 5);
        let b = entry(2, LATEST + 5);
        pool.insert(a.clone()).unwrap();
        pool.insert(b.clone()).unwrap();

        let unknown = TxHash::repeat_byte(0xaa);
        let (txs, missed) = pool.fetch(&[b.hash(), unknown, a.hash()]);
        let fetched: Vec<_> = txs.iter().map(|tx| tx.hash()).collect();
        assert_eq!(fetched, vec![b.hash(), a.hash()]);
        assert_eq!(missed, vec![unknown]);
    }

    #[test]
    fn fetch_new_marks_entries_synced_once() {
        let mut pool = TxPool::default();
        for i in 0..3u64 {
            pool.insert(entry(i, LATEST + 5)).unwrap();
        }
        assert_eq!(pool.fetch_new(2).len(), 2);
        assert_eq!(pool.fetch_new(10).len(), 1);
        assert!(pool.fetch_new(10).is_empty());
    }

    #[test]
    fn mark_roundtrip_maintains_the_sealed_counter() {
        let mut pool = TxPool::default();
        let txs: Vec<_> = (0..3u64).map(|i| entry(i, LATEST + 5)).collect();
        for tx in &txs {
            pool.insert(tx.clone()).unwrap();
        }
        let hashes: Vec<_> = txs.iter().map(|tx| tx.hash()).collect();
        let batch_hash = BlockHash::repeat_byte(0x42);

        pool.batch_mark(&hashes, true, 7, batch_hash);
        assert_eq!(pool.sealed_len(), 3);
        assert_eq!(txs[0].batch(), Some((7, batch_hash)));

        // marking twice must not double-count
        pool.batch_mark(&hashes, true, 7, batch_hash);
        assert_eq!(pool.sealed_len(), 3);

        pool.batch_mark(&hashes[..1], false, 0, BlockHash::ZERO);
        assert_eq!(pool.sealed_len(), 2);
        assert_eq!(pool.unsealed_len(), 1);
        assert_eq!(txs[0].batch(), None);

        pool.mark_all(false);
        assert_eq!(pool.sealed_len(), 0);
        assert_eq!(pool.unsealed_len(), 3);
    }
}
