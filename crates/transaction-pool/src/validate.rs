//! Transaction validation: structural checks plus the dual-layer nonce
//! protection (in-flight pool nonces and the windowed committed-nonce
//! cache).

use crate::error::{PoolError, PoolResult};
use dashmap::DashSet;
use grove_primitives::{BlockNumber, CryptoSuite, Nonce, TransactionSigned};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, trace};

/// A concurrent set of nonces.
///
/// One instance tracks the nonces currently represented by a pool entry;
/// a second instance, embedded in [`LedgerNonceChecker`], tracks the nonces
/// of the committed window.
#[derive(Debug, Default)]
pub struct PoolNonceChecker {
    nonces: DashSet<Nonce>,
}

impl PoolNonceChecker {
    /// Whether the nonce is present.
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.nonces.contains(nonce)
    }

    /// Inserts a nonce.
    pub fn insert(&self, nonce: Nonce) {
        self.nonces.insert(nonce);
    }

    /// Removes a nonce.
    pub fn remove(&self, nonce: &Nonce) {
        self.nonces.remove(nonce);
    }

    /// Reserves the nonce, failing if it is already present.
    pub fn check_and_reserve(&self, nonce: Nonce) -> PoolResult<()> {
        if self.nonces.insert(nonce) {
            Ok(())
        } else {
            Err(PoolError::NonceCheckFail)
        }
    }

    /// Records all nonces of a batch (e.g. a sealed proposal).
    pub fn batch_insert(&self, nonces: impl IntoIterator<Item = Nonce>) {
        for nonce in nonces {
            self.nonces.insert(nonce);
        }
    }

    /// Drops all nonces of a batch.
    pub fn batch_remove<'a>(&self, nonces: impl IntoIterator<Item = &'a Nonce>) {
        for nonce in nonces {
            self.nonces.remove(nonce);
        }
    }

    /// Number of tracked nonces.
    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    /// Whether no nonce is tracked.
    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

/// Sliding-window cache of committed nonces.
///
/// Holds the nonce lists of the most recent `window` blocks, keyed by block
/// number, plus a membership set over their union. A submission whose nonce
/// appears in the window is a replay; a submission whose `block_limit` falls
/// outside `(latest, latest + window]` is stale or too far ahead.
#[derive(Debug)]
pub struct LedgerNonceChecker {
    /// Block number -> nonces of that block's transactions.
    cache: Mutex<BTreeMap<BlockNumber, Vec<Nonce>>>,
    /// Union of all cached nonce lists.
    committed: PoolNonceChecker,
    /// Number of the most recently committed block.
    latest: AtomicU64,
    /// Window width in blocks.
    window: u64,
}

impl LedgerNonceChecker {
    /// Creates an empty checker with the given window width.
    pub fn new(window: u64) -> Self {
        Self {
            cache: Mutex::new(BTreeMap::new()),
            committed: PoolNonceChecker::default(),
            latest: AtomicU64::new(0),
            window,
        }
    }

    /// Seeds the cache from ledger history at startup.
    pub fn init(&self, latest: BlockNumber, nonces: BTreeMap<BlockNumber, Vec<Nonce>>) {
        self.latest.store(latest, Ordering::Release);
        let mut cache = self.cache.lock();
        for (number, list) in nonces {
            self.committed.batch_insert(list.iter().copied());
            cache.insert(number, list);
        }
        debug!(target: "txpool", latest, blocks = cache.len(), "seeded ledger nonce cache");
    }

    /// Checks the transaction against the committed window and its block
    /// limit, recording the nonce when `should_update` is set.
    pub fn check_nonce(&self, tx: &TransactionSigned, should_update: bool) -> PoolResult<()> {
        if self.committed.contains(&tx.nonce()) {
            return Err(PoolError::NonceCheckFail)
        }
        self.check_block_limit(tx)?;
        if should_update {
            self.committed.insert(tx.nonce());
        }
        Ok(())
    }

    fn check_block_limit(&self, tx: &TransactionSigned) -> PoolResult<()> {
        let latest = self.latest.load(Ordering::Acquire);
        if latest >= tx.block_limit() || latest + self.window < tx.block_limit() {
            trace!(
                target: "txpool",
                block_limit = tx.block_limit(),
                latest,
                window = self.window,
                tx = %tx.hash(),
                "transaction block limit out of range"
            );
            return Err(PoolError::BlockLimitCheckFail)
        }
        Ok(())
    }

    /// Records the nonces of a newly committed block and evicts the expired
    /// end of the window.
    pub fn batch_insert(&self, block_number: BlockNumber, nonces: Vec<Nonce>) {
        if block_number <= self.latest.load(Ordering::Acquire) {
            return
        }
        self.latest.store(block_number, Ordering::Release);
        self.committed.batch_insert(nonces.iter().copied());

        let mut cache = self.cache.lock();
        cache.insert(block_number, nonces);

        let expired = block_number.saturating_sub(self.window);
        if !cache.contains_key(&expired) {
            // a hole at the expiry boundary means a committed block was lost
            error!(
                target: "txpool",
                expired,
                block_number,
                "fatal: nonce cache entry missing at expiry, the node cannot operate safely"
            );
        }
        let keep = cache.split_off(&(expired + 1));
        let evicted = core::mem::replace(&mut *cache, keep);
        for (number, list) in evicted {
            self.committed.batch_remove(list.iter());
            debug!(target: "txpool", number, nonces = list.len(), "evicted expired nonces");
        }
    }

    /// Number of the most recently committed block.
    pub fn latest_block_number(&self) -> BlockNumber {
        self.latest.load(Ordering::Acquire)
    }

    /// Whether a nonce is part of the committed window.
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.committed.contains(nonce)
    }
}

/// The single admission gate: structural checks followed by the dual nonce
/// check.
#[derive(Debug)]
pub struct TxValidator {
    chain_id: u64,
    group_id: u64,
    crypto: Arc<dyn CryptoSuite>,
    pool_nonces: PoolNonceChecker,
    ledger_nonces: LedgerNonceChecker,
}

impl TxValidator {
    /// Creates a validator for the given chain/group with an empty nonce
    /// window of `block_limit` blocks.
    pub fn new(chain_id: u64, group_id: u64, crypto: Arc<dyn CryptoSuite>, block_limit: u64) -> Self {
        Self {
            chain_id,
            group_id,
            crypto,
            pool_nonces: PoolNonceChecker::default(),
            ledger_nonces: LedgerNonceChecker::new(block_limit),
        }
    }

    /// Runs the full admission pipeline, short-circuiting on the first
    /// failure.
    ///
    /// On success the transaction's nonce is reserved in the pool nonce set;
    /// the caller releases it again if the transaction ultimately fails to
    /// enter the pool.
    pub fn verify(&self, tx: &TransactionSigned) -> PoolResult<()> {
        if tx.chain_id() != self.chain_id {
            return Err(PoolError::InvalidChainId)
        }
        if tx.group_id() != self.group_id {
            return Err(PoolError::InvalidGroupId)
        }
        if !tx.verify_signature(&*self.crypto) {
            return Err(PoolError::InvalidSignature)
        }
        self.pool_nonces.check_and_reserve(tx.nonce())?;
        if let Err(err) = self.ledger_nonces.check_nonce(tx, false) {
            self.pool_nonces.remove(&tx.nonce());
            return Err(err)
        }
        Ok(())
    }

    /// Selection-time re-check: did a block committed in the meantime use
    /// this nonce, and is the block limit still ahead of the chain?
    pub fn duplicate_tx(&self, tx: &TransactionSigned) -> PoolResult<()> {
        self.ledger_nonces.check_nonce(tx, false)
    }

    /// The in-flight pool nonce set.
    pub fn pool_nonces(&self) -> &PoolNonceChecker {
        &self.pool_nonces
    }

    /// The committed-window nonce checker.
    pub fn ledger_nonces(&self) -> &LedgerNonceChecker {
        &self.ledger_nonces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fake_transaction, random_nonce, MockCryptoSuite, MockKeyPair};
    use grove_primitives::U256;

    const CHAIN: u64 = 7;
    const GROUP: u64 = 3;
    const WINDOW: u64 = 10;

    fn validator_at(latest: BlockNumber) -> TxValidator {
        let validator =
            TxValidator::new(CHAIN, GROUP, Arc::new(MockCryptoSuite::default()), WINDOW);
        validator.ledger_nonces().init(latest, BTreeMap::new());
        validator
    }

    fn tx_with(nonce: Nonce, block_limit: BlockNumber) -> TransactionSigned {
        let crypto = MockCryptoSuite::default();
        let key = MockKeyPair::random();
        fake_transaction(&crypto, &key, nonce, block_limit, CHAIN, GROUP)
    }

    #[test]
    fn block_limit_boundaries() {
        let validator = validator_at(100);
        // exactly latest + window is accepted
        assert!(validator.verify(&tx_with(random_nonce(), 100 + WINDOW)).is_ok());
        // one past the window is rejected
        assert_eq!(
            validator.verify(&tx_with(random_nonce(), 100 + WINDOW + 1)),
            Err(PoolError::BlockLimitCheckFail)
        );
        // at or below latest is stale
        assert_eq!(
            validator.verify(&tx_with(random_nonce(), 100)),
            Err(PoolError::BlockLimitCheckFail)
        );
    }

    #[test]
    fn committed_nonce_is_rejected_until_evicted() {
        let validator = validator_at(20);
        let nonce = random_nonce();
        let mut seed = BTreeMap::new();
        seed.insert(11u64, vec![nonce]);
        validator.ledger_nonces().init(20, seed);

        assert_eq!(
            validator.verify(&tx_with(nonce, 25)),
            Err(PoolError::NonceCheckFail)
        );

        // committing block 21 expires block 11 and frees the nonce
        validator.ledger_nonces().batch_insert(21, vec![random_nonce()]);
        assert!(!validator.ledger_nonces().contains(&nonce));
        assert!(validator.verify(&tx_with(nonce, 26)).is_ok());
    }

    #[test]
    fn batch_insert_evicts_across_jumps() {
        let checker = LedgerNonceChecker::new(WINDOW);
        let nonces: Vec<Nonce> = (0..5u64).map(|_| random_nonce()).collect();
        let mut seed = BTreeMap::new();
        for (i, nonce) in nonces.iter().enumerate() {
            seed.insert(11 + i as u64, vec![*nonce]);
        }
        checker.init(20, seed);

        // a jump by the full window must drop every previously cached block
        checker.batch_insert(30, vec![random_nonce()]);
        assert_eq!(checker.latest_block_number(), 30);
        for nonce in &nonces {
            assert!(!checker.contains(nonce));
        }
    }

    #[test]
    fn stale_batches_are_ignored() {
        let checker = LedgerNonceChecker::new(WINDOW);
        checker.init(20, BTreeMap::new());
        let nonce = random_nonce();
        checker.batch_insert(20, vec![nonce]);
        assert_eq!(checker.latest_block_number(), 20);
        assert!(!checker.contains(&nonce));
    }

    #[test]
    fn structural_checks_come_first() {
        let validator = validator_at(100);
        let crypto = MockCryptoSuite::default();
        let key = MockKeyPair::random();

        let mut tx = fake_transaction(&crypto, &key, random_nonce(), 105, CHAIN + 1, GROUP);
        assert_eq!(validator.verify(&tx), Err(PoolError::InvalidChainId));

        tx = fake_transaction(&crypto, &key, random_nonce(), 105, CHAIN, GROUP + 1);
        assert_eq!(validator.verify(&tx), Err(PoolError::InvalidGroupId));

        let mut bad_sig = fake_transaction(&crypto, &key, random_nonce(), 105, CHAIN, GROUP);
        bad_sig.signature = grove_primitives::Bytes::from_static(b"garbage");
        assert_eq!(validator.verify(&bad_sig), Err(PoolError::InvalidSignature));
    }

    #[test]
    fn failed_verification_releases_the_nonce_reservation() {
        let validator = validator_at(100);
        let nonce = U256::from(42u64);
        // block limit is stale, so verification fails after the reservation
        let tx = tx_with(nonce, 100);
        assert_eq!(validator.verify(&tx), Err(PoolError::BlockLimitCheckFail));
        // the nonce must not linger in the in-flight set
        assert!(!validator.pool_nonces().contains(&nonce));
        assert_eq!(validator.verify(&tx), Err(PoolError::BlockLimitCheckFail));
    }

    #[test]
    fn duplicate_in_flight_nonce_is_rejected() {
        let validator = validator_at(100);
        let nonce = random_nonce();
        assert!(validator.verify(&tx_with(nonce, 105)).is_ok());
        assert_eq!(validator.verify(&tx_with(nonce, 106)), Err(PoolError::NonceCheckFail));
    }
}
