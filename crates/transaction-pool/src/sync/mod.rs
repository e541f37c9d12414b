//! Peer-to-peer transaction synchronization.
//!
//! A long-running reactor forwards freshly admitted transactions to peers
//! and imports transactions shipped by them. Locally submitted transactions
//! are announced to every eligible consensus peer; transactions forwarded
//! from other peers are re-announced to a bounded subset, with each
//! transaction's `known_nodes` set suppressing redundant hops. During block
//! verification the engine fetches transactions this pool missed from the
//! proposal's originator, falling back to the local ledger.

use crate::{
    error::{PoolError, PoolResult},
    metrics::TransactionSyncMetrics,
    pool::{PoolInner, ValidPoolTransaction},
    traits::{FrontService, TransactionOrigin},
};
use grove_primitives::{Block, Bytes, NodeId, TxHash};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

mod messages;
mod state;

pub use messages::{TxsSyncMsg, TxsSyncMsgType};
pub use state::SyncPeers;

/// The transaction sync engine.
pub(crate) struct TransactionSync {
    pool: Arc<PoolInner>,
    front: Arc<dyn FrontService>,
    /// Inbound response payloads, drained by the reactor outside any lock.
    download_buffer: RwLock<Vec<(NodeId, Bytes)>>,
    /// Wakes the reactor when the download buffer fills.
    signalled: Notify,
    running: AtomicBool,
    metrics: TransactionSyncMetrics,
}

impl TransactionSync {
    pub(crate) fn new(pool: Arc<PoolInner>, front: Arc<dyn FrontService>) -> Self {
        Self {
            pool,
            front,
            download_buffer: RwLock::new(Vec::new()),
            signalled: Notify::new(),
            running: AtomicBool::new(false),
            metrics: TransactionSyncMetrics::default(),
        }
    }

    pub(crate) fn front(&self) -> &Arc<dyn FrontService> {
        &self.front
    }

    /// Spawns the reactor.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(target: "txpool::sync", "transaction sync already started");
            return
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    /// Asks the reactor to exit; in-flight message handlers complete.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.signalled.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        debug!(target: "txpool::sync", "transaction sync started");
        let tick = self.pool.config().sync.tick;
        loop {
            if !self.running.load(Ordering::Acquire) || !self.pool.is_running() {
                break
            }
            let downloaded = self.maintain_downloading();
            let propagated = self.maintain_transactions();
            if downloaded == 0 && propagated == 0 {
                tokio::select! {
                    _ = self.signalled.notified() => {}
                    _ = self.pool.on_ready().notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }
            }
        }
        debug!(target: "txpool::sync", "transaction sync stopped");
    }

    // === outbound propagation ===

    /// Drains not-yet-announced transactions and pushes status
    /// announcements to peers. Returns the number of drained transactions.
    fn maintain_transactions(self: &Arc<Self>) -> usize {
        if !self.pool.peers().exists_in_group() {
            return 0
        }
        let txs = self.pool.fetch_new(self.pool.config().sync.max_new_txs_per_round);
        if txs.is_empty() {
            return 0
        }
        let connected = self.pool.peers().connected();
        let consensus = self.pool.peers().consensus_node_list();
        let forward_percent = self.pool.config().sync.forward_percent;

        let mut announcements: HashMap<NodeId, Vec<TxHash>> = HashMap::new();
        let mut announced = 0u64;
        for tx in &txs {
            let eligible = self.select_peers(tx, &connected, &consensus, usize::MAX);
            let targets = if tx.is_local() {
                eligible
            } else {
                // bounded forwarding keeps flooding near fanout * log(n) hops
                let expected = (eligible.len() * forward_percent).div_ceil(100).max(1);
                eligible.into_iter().take(expected).collect()
            };
            if targets.is_empty() {
                continue
            }
            for peer in &targets {
                announcements.entry(*peer).or_default().push(tx.hash());
            }
            tx.append_known_nodes(targets);
            announced += 1;
        }
        for (peer, hashes) in announcements {
            trace!(target: "txpool::sync", peer = %peer, txs = hashes.len(), "announcing transactions");
            self.front.send_message(peer, TxsSyncMsg::status(hashes).encoded());
        }
        self.metrics.propagated_transactions.increment(announced);
        txs.len()
    }

    /// Intersection of connected and consensus peers, minus peers already
    /// aware of `tx` and the local node, first `expected` in deterministic
    /// order.
    fn select_peers(
        &self,
        tx: &ValidPoolTransaction,
        connected: &HashSet<NodeId>,
        consensus: &[NodeId],
        expected: usize,
    ) -> Vec<NodeId> {
        let node_id = self.pool.peers().node_id();
        let mut peers: Vec<NodeId> = consensus
            .iter()
            .copied()
            .filter(|peer| *peer != node_id && connected.contains(peer) && !tx.is_known_by(peer))
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers.truncate(expected);
        peers
    }

    // === inbound messages ===

    /// Entry point for messages arriving on the transaction sync module.
    pub(crate) fn on_message(self: &Arc<Self>, from: NodeId, uuid: Option<String>, data: Bytes) {
        let msg = match TxsSyncMsg::decode(&data) {
            Ok(msg) => msg,
            Err(err) => {
                self.metrics.invalid_messages.increment(1);
                warn!(target: "txpool::sync", %err, peer = %from, "dropping undecodable sync message");
                return
            }
        };
        match msg.msg_type() {
            Some(TxsSyncMsgType::Status) => self.on_peer_status(from, msg.hashes),
            Some(TxsSyncMsgType::Request) => self.on_txs_request(from, uuid, msg.hashes),
            Some(TxsSyncMsgType::Response) => {
                self.download_buffer.write().push((from, msg.payload));
                self.signalled.notify_one();
            }
            None => {
                self.metrics.invalid_messages.increment(1);
                warn!(target: "txpool::sync", msg_type = msg.msg_type, peer = %from, "dropping sync message of unknown type");
            }
        }
    }

    /// A peer announced held transactions: request the ones this pool has
    /// never seen.
    fn on_peer_status(self: &Arc<Self>, from: NodeId, hashes: Vec<TxHash>) {
        let unknown = self.pool.filter_unknown(&hashes, from);
        if unknown.is_empty() {
            return
        }
        debug!(target: "txpool::sync", peer = %from, unknown = unknown.len(), "requesting unknown transactions");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let timeout = this.pool.config().sync.network_timeout;
            let request = TxsSyncMsg::request(unknown).encoded();
            match this.front.request(from, request, timeout).await {
                Ok(response) => this.on_requested_txs(from, response),
                Err(err) => {
                    warn!(target: "txpool::sync", %err, peer = %from, "transaction request failed")
                }
            }
        });
    }

    fn on_requested_txs(self: &Arc<Self>, from: NodeId, data: Bytes) {
        match TxsSyncMsg::decode(&data) {
            Ok(msg) if msg.msg_type() == Some(TxsSyncMsgType::Response) => {
                self.download_buffer.write().push((from, msg.payload));
                self.signalled.notify_one();
            }
            Ok(msg) => {
                self.metrics.invalid_messages.increment(1);
                warn!(target: "txpool::sync", msg_type = msg.msg_type, peer = %from, "unexpected reply to transaction request");
            }
            Err(err) => {
                self.metrics.invalid_messages.increment(1);
                warn!(target: "txpool::sync", %err, peer = %from, "undecodable reply to transaction request");
            }
        }
    }

    /// A peer asked for transactions: answer with the resident subset.
    /// Absent hashes cause no error.
    fn on_txs_request(self: &Arc<Self>, from: NodeId, uuid: Option<String>, hashes: Vec<TxHash>) {
        let Some(uuid) = uuid else {
            warn!(target: "txpool::sync", peer = %from, "transaction request without response handle");
            return
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let (txs, missed) = this.pool.fetch(&hashes);
            if !missed.is_empty() {
                debug!(target: "txpool::sync", peer = %from, missed = missed.len(), "answering transaction request partially");
            }
            let block =
                Block::with_transactions(txs.iter().map(|tx| tx.transaction.clone()).collect());
            let response = TxsSyncMsg::response(block.encoded());
            this.front.send_response(&uuid, from, response.encoded());
        });
    }

    // === importing ===

    /// Drains the download buffer and imports its transactions. Returns the
    /// number of drained payloads.
    fn maintain_downloading(self: &Arc<Self>) -> usize {
        let buffered = {
            let mut buffer = self.download_buffer.write();
            core::mem::take(&mut *buffer)
        };
        if buffered.is_empty() {
            return 0
        }
        if !self.pool.peers().exists_in_group() {
            debug!(
                target: "txpool::sync",
                payloads = buffered.len(),
                "dropping downloaded transactions, node is not in the group"
            );
            return buffered.len()
        }
        for (from, payload) in &buffered {
            match Block::decode_and_hash(payload, &**self.pool.crypto()) {
                Ok(block) => {
                    self.import_transactions(*from, block, false);
                }
                Err(err) => {
                    self.metrics.invalid_messages.increment(1);
                    warn!(target: "txpool::sync", %err, peer = %from, "undecodable transaction payload");
                }
            }
        }
        buffered.len()
    }

    /// Verifies and imports transactions shipped by a peer. Returns whether
    /// every signature checked out and how many transactions entered the
    /// pool.
    fn import_transactions(
        self: &Arc<Self>,
        from: NodeId,
        block: Block,
        enforce: bool,
    ) -> (bool, usize) {
        let mut all_valid = true;
        let mut imported = 0usize;
        let total = block.transactions.len();
        for tx in block.transactions {
            let hash = tx.hash();
            if self.pool.contains(&hash) {
                if enforce {
                    // seal the resident entry for the proposal
                    let _ = self.pool.enforce_import(tx);
                } else if let Some(entry) = self.pool.get(&hash) {
                    entry.append_known_node(from);
                }
                continue
            }
            if !tx.verify_signature(&**self.pool.crypto()) {
                all_valid = false;
                warn!(target: "txpool::sync", tx = %hash, peer = %from, "peer shipped transaction with invalid signature");
                continue
            }
            let outcome = if enforce {
                self.pool.enforce_import(tx)
            } else {
                self.pool.submit_transaction(TransactionOrigin::External, tx, None)
            };
            match outcome {
                Ok(_) => {
                    imported += 1;
                    if let Some(entry) = self.pool.get(&hash) {
                        entry.append_known_node(from);
                    }
                }
                Err(err) => {
                    trace!(target: "txpool::sync", %err, tx = %hash, "import into pool failed")
                }
            }
        }
        if imported > 0 {
            self.metrics.imported_transactions.increment(imported as u64);
        }
        debug!(target: "txpool::sync", imported, total, peer = %from, "imported downloaded transactions");
        (all_valid, imported)
    }

    // === missed transaction recovery ===

    /// Recovers the `missed` transactions of a proposal, preferring its
    /// originator and falling back to the local ledger. Only the final
    /// outcome is surfaced.
    pub(crate) async fn request_missed_txs(
        self: &Arc<Self>,
        origin: Option<NodeId>,
        missed: Vec<TxHash>,
    ) -> PoolResult<()> {
        if missed.is_empty() {
            return Ok(())
        }
        if let Some(peer) = origin {
            match self.fetch_from_peer(peer, &missed).await {
                Ok(()) => {
                    self.metrics.recovered_transactions.increment(missed.len() as u64);
                    return Ok(())
                }
                Err(err) => {
                    warn!(
                        target: "txpool::sync",
                        %err,
                        peer = %peer,
                        missed = missed.len(),
                        "peer fetch failed, falling back to the ledger"
                    );
                }
            }
        }
        self.fetch_from_ledger(&missed).await
    }

    async fn fetch_from_peer(self: &Arc<Self>, peer: NodeId, missed: &[TxHash]) -> PoolResult<()> {
        let timeout = self.pool.config().sync.network_timeout;
        let request = TxsSyncMsg::request(missed.to_vec()).encoded();
        let response = self
            .front
            .request(peer, request, timeout)
            .await
            .map_err(|_| PoolError::TransactionsMissing(missed.len()))?;
        let msg = TxsSyncMsg::decode(&response).map_err(|_| PoolError::Malform)?;
        if msg.msg_type() != Some(TxsSyncMsgType::Response) {
            return Err(PoolError::Malform)
        }
        let block = Block::decode_and_hash(&msg.payload, &**self.pool.crypto())
            .map_err(|_| PoolError::Malform)?;
        let received = block.transactions.len();
        // the response must carry exactly the requested transactions, in
        // the requested order
        let mut consistent = true;
        for (expected, tx) in missed.iter().zip(&block.transactions) {
            if *expected != tx.hash() {
                warn!(target: "txpool::sync", peer = %peer, expected = %expected, got = %tx.hash(), "inconsistent transaction in response");
                consistent = false;
                break
            }
        }
        // import whatever arrived even when the response is short or
        // inconsistent; each transaction stands on its own
        let (all_valid, _) = self.import_transactions(peer, block, true);
        if received != missed.len() {
            return Err(PoolError::TransactionsMissing(
                missed.len().saturating_sub(received).max(1),
            ))
        }
        if !all_valid {
            return Err(PoolError::InvalidSignature)
        }
        if !consistent {
            return Err(PoolError::Malform)
        }
        Ok(())
    }

    async fn fetch_from_ledger(self: &Arc<Self>, missed: &[TxHash]) -> PoolResult<()> {
        // a partial peer fetch may have recovered some of these already
        let wanted: Vec<TxHash> =
            missed.iter().filter(|hash| !self.pool.contains(hash)).copied().collect();
        if wanted.is_empty() {
            return Ok(())
        }
        let fetched = self
            .pool
            .ledger()
            .batch_txs(&wanted)
            .await
            .map_err(|_| PoolError::TransactionsMissing(wanted.len()))?;
        let mut txs = Vec::with_capacity(wanted.len());
        let mut absent = 0usize;
        for (hash, tx) in wanted.iter().zip(fetched) {
            match tx {
                Some(tx) => txs.push(tx),
                None => {
                    absent += 1;
                    trace!(target: "txpool::sync", tx = %hash, "transaction not found in the ledger");
                }
            }
        }
        // keep whatever the ledger did supply before reporting the rest
        if !txs.is_empty() {
            let block = Block::with_transactions(txs);
            self.import_transactions(self.pool.peers().node_id(), block, true);
        }
        if absent > 0 {
            return Err(PoolError::TransactionsMissing(absent))
        }
        let still_missing = missed.iter().filter(|hash| !self.pool.contains(hash)).count();
        if still_missing > 0 {
            return Err(PoolError::TransactionsMissing(still_missing))
        }
        debug!(target: "txpool::sync", recovered = missed.len(), "recovered missed transactions from the ledger");
        Ok(())
    }

    /// Checks a proposal received from `origin`: every referenced
    /// transaction must end up resident, fetching the missed ones from the
    /// originator or the ledger.
    pub(crate) async fn verify_block(
        self: &Arc<Self>,
        origin: NodeId,
        block_data: &[u8],
    ) -> PoolResult<()> {
        let block = Block::decode_and_hash(block_data, &**self.pool.crypto()).map_err(|err| {
            warn!(target: "txpool::sync", %err, "undecodable block proposal");
            PoolError::Malform
        })?;
        if block.tx_hashes.is_empty() {
            return Ok(())
        }
        let missed: Vec<TxHash> =
            block.tx_hashes.iter().filter(|hash| !self.pool.contains(hash)).copied().collect();
        let number = block.header.number;
        if missed.is_empty() {
            debug!(target: "txpool::sync", number, "verify block: hit all transactions in the pool");
            return Ok(())
        }
        debug!(
            target: "txpool::sync",
            number,
            total = block.tx_hashes.len(),
            missed = missed.len(),
            "verify block: fetching missed transactions"
        );
        self.request_missed_txs(Some(origin), missed).await
    }
}

impl fmt::Debug for TransactionSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionSync")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("buffered", &self.download_buffer.read().len())
            .finish_non_exhaustive()
    }
}
