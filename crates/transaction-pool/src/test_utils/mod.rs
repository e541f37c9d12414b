//! Internal helpers for testing the pool: a toy crypto suite, mock
//! capabilities and a loopback front service wiring several pools into a
//! small network.

use crate::{
    traits::{
        FrontService, Ledger, LedgerError, NodeType, RequestError, Sealer, SealerError,
    },
    Pool, PoolConfig,
};
use grove_primitives::{
    alloy_primitives::keccak256, BlockHash, BlockNumber, Bytes, CryptoSuite, NodeId, Nonce,
    Transaction, TransactionSigned, TxHash, B256, U256,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;

/// A deterministic stand-in for the chain's crypto suite.
///
/// Hashing is keccak256; a "signature" is the signer's secret concatenated
/// with the signed hash, and a public key is the keccak of the secret. Good
/// enough to exercise every verification path, useless for anything else.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockCryptoSuite;

impl CryptoSuite for MockCryptoSuite {
    fn hash(&self, data: &[u8]) -> TxHash {
        keccak256(data)
    }

    fn verify(&self, signature: &[u8], hash: &TxHash, public_key: &[u8]) -> bool {
        if signature.len() != 64 {
            return false
        }
        signature[32..] == hash[..] && keccak256(&signature[..32])[..] == public_key[..]
    }
}

/// A key pair for [`MockCryptoSuite`].
#[derive(Clone, Debug)]
pub struct MockKeyPair {
    secret: B256,
    public: Bytes,
}

impl MockKeyPair {
    /// Generates a fresh key pair.
    pub fn random() -> Self {
        let secret = B256::from(rand::random::<[u8; 32]>());
        let public = Bytes::from(keccak256(secret).to_vec());
        Self { secret, public }
    }

    /// The public key bytes.
    pub fn public_key(&self) -> Bytes {
        self.public.clone()
    }

    /// Signs a transaction hash.
    pub fn sign(&self, hash: &TxHash) -> Bytes {
        let mut signature = Vec::with_capacity(64);
        signature.extend_from_slice(self.secret.as_slice());
        signature.extend_from_slice(hash.as_slice());
        signature.into()
    }
}

/// A fresh random nonce.
pub fn random_nonce() -> Nonce {
    U256::from_be_bytes(rand::random::<[u8; 32]>())
}

/// A fresh random node id.
pub fn random_node_id() -> NodeId {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill(&mut bytes[..]);
    NodeId::from_slice(&bytes)
}

/// Builds a signed transaction with the given parameters and a small random
/// payload.
pub fn fake_transaction(
    crypto: &dyn CryptoSuite,
    key: &MockKeyPair,
    nonce: Nonce,
    block_limit: BlockNumber,
    chain_id: u64,
    group_id: u64,
) -> TransactionSigned {
    let transaction = Transaction {
        chain_id,
        group_id,
        block_limit,
        nonce,
        system: false,
        input: Bytes::from(rand::random::<[u8; 8]>().to_vec()),
    };
    let hash = crypto.hash(&transaction.signing_payload());
    let signature = key.sign(&hash);
    TransactionSigned::new(transaction, key.public_key(), signature, crypto)
}

/// An in-memory ledger pre-populated with a block history.
#[derive(Debug)]
pub struct MockLedger {
    number: AtomicU64,
    /// Block number -> nonces of that block's transactions.
    blocks: RwLock<BTreeMap<BlockNumber, Vec<Nonce>>>,
    /// Committed transactions, servable through `batch_txs`.
    txs: RwLock<HashMap<TxHash, TransactionSigned>>,
    /// Sink of `store_transactions`.
    stored: RwLock<HashMap<TxHash, Bytes>>,
    consensus: RwLock<Vec<NodeId>>,
    observers: RwLock<Vec<NodeId>>,
}

impl MockLedger {
    /// Builds a ledger of `blocks` blocks carrying `txs_per_block`
    /// transactions each, numbered from 0.
    pub fn new(blocks: u64, txs_per_block: usize, chain_id: u64, group_id: u64) -> Self {
        assert!(blocks > 0, "a ledger needs a genesis block");
        let crypto = MockCryptoSuite;
        let key = MockKeyPair::random();
        let mut history = BTreeMap::new();
        let mut txs = HashMap::new();
        for number in 0..blocks {
            let mut nonces = Vec::with_capacity(txs_per_block);
            for _ in 0..txs_per_block {
                let tx = fake_transaction(
                    &crypto,
                    &key,
                    random_nonce(),
                    number + 100,
                    chain_id,
                    group_id,
                );
                nonces.push(tx.nonce());
                txs.insert(tx.hash(), tx);
            }
            history.insert(number, nonces);
        }
        Self {
            number: AtomicU64::new(blocks - 1),
            blocks: RwLock::new(history),
            txs: RwLock::new(txs),
            stored: RwLock::new(HashMap::new()),
            consensus: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// The latest block number, without going through the async trait.
    pub fn block_number_sync(&self) -> BlockNumber {
        self.number.load(Ordering::Acquire)
    }

    /// The nonce list of the given block.
    pub fn nonces_of(&self, number: BlockNumber) -> Vec<Nonce> {
        self.blocks.read().get(&number).cloned().unwrap_or_default()
    }

    /// Whether `store_transactions` has seen this hash.
    pub fn contains_stored(&self, hash: &TxHash) -> bool {
        self.stored.read().contains_key(hash)
    }

    /// Seeds a committed transaction servable through `batch_txs`.
    pub fn add_transaction(&self, tx: TransactionSigned) {
        self.txs.write().insert(tx.hash(), tx);
    }

    /// Sets the consensus member list returned by `node_list_by_type`.
    pub fn set_consensus_nodes(&self, nodes: Vec<NodeId>) {
        *self.consensus.write() = nodes;
    }

    /// Sets the observer member list returned by `node_list_by_type`.
    pub fn set_observer_nodes(&self, nodes: Vec<NodeId>) {
        *self.observers.write() = nodes;
    }
}

#[async_trait::async_trait]
impl Ledger for MockLedger {
    async fn store_transactions(
        &self,
        txs: Vec<Bytes>,
        hashes: Vec<TxHash>,
    ) -> Result<(), LedgerError> {
        let mut stored = self.stored.write();
        for (hash, data) in hashes.into_iter().zip(txs) {
            stored.insert(hash, data);
        }
        Ok(())
    }

    async fn batch_txs(
        &self,
        hashes: &[TxHash],
    ) -> Result<Vec<Option<TransactionSigned>>, LedgerError> {
        let txs = self.txs.read();
        Ok(hashes.iter().map(|hash| txs.get(hash).cloned()).collect())
    }

    async fn block_number(&self) -> Result<BlockNumber, LedgerError> {
        Ok(self.number.load(Ordering::Acquire))
    }

    async fn block_hash_by_number(&self, number: BlockNumber) -> Result<BlockHash, LedgerError> {
        if self.blocks.read().contains_key(&number) {
            Ok(keccak256(number.to_be_bytes()))
        } else {
            Err(LedgerError::NotFound)
        }
    }

    async fn nonce_list(
        &self,
        start: BlockNumber,
        offset: u64,
    ) -> Result<BTreeMap<BlockNumber, Vec<Nonce>>, LedgerError> {
        let blocks = self.blocks.read();
        Ok(blocks
            .range(start..start.saturating_add(offset))
            .map(|(number, nonces)| (*number, nonces.clone()))
            .collect())
    }

    async fn node_list_by_type(&self, node_type: NodeType) -> Result<Vec<NodeId>, LedgerError> {
        Ok(match node_type {
            NodeType::ConsensusSealer => self.consensus.read().clone(),
            NodeType::ConsensusObserver => self.observers.read().clone(),
        })
    }
}

/// A sealer recording the sizes it is notified of.
#[derive(Debug, Default)]
pub struct MockSealer {
    unsealed: AtomicUsize,
    notifications: AtomicUsize,
}

impl MockSealer {
    /// The most recently reported unsealed size.
    pub fn unsealed_size(&self) -> usize {
        self.unsealed.load(Ordering::Acquire)
    }

    /// How many notifications arrived.
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Sealer for MockSealer {
    async fn note_unsealed_size(&self, size: usize) -> Result<(), SealerError> {
        self.unsealed.store(size, Ordering::Release);
        self.notifications.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// A loopback network connecting the pools of a test: messages are
/// delivered in-process, request/response pairs are correlated through a
/// shared responder table.
#[derive(Debug, Default)]
pub struct TestNet {
    pools: RwLock<HashMap<NodeId, Pool>>,
    responders: Mutex<HashMap<String, oneshot::Sender<Bytes>>>,
    next_uuid: AtomicU64,
}

impl TestNet {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node's pool so peers can reach it.
    pub fn register(&self, node_id: NodeId, pool: Pool) {
        self.pools.write().insert(node_id, pool);
    }

    /// The front service endpoint of the given node.
    pub fn front_for(self: &Arc<Self>, node_id: NodeId) -> Arc<NodeFront> {
        Arc::new(NodeFront { net: Arc::clone(self), node_id })
    }

    fn pool(&self, node_id: &NodeId) -> Option<Pool> {
        self.pools.read().get(node_id).cloned()
    }
}

/// The per-node endpoint of a [`TestNet`].
#[derive(Debug)]
pub struct NodeFront {
    net: Arc<TestNet>,
    node_id: NodeId,
}

#[async_trait::async_trait]
impl FrontService for NodeFront {
    fn send_message(&self, peer: NodeId, data: Bytes) {
        if let Some(pool) = self.net.pool(&peer) {
            pool.notify_txs_sync_message(self.node_id, None, data);
        }
    }

    async fn request(
        &self,
        peer: NodeId,
        data: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, RequestError> {
        let pool = self.net.pool(&peer).ok_or(RequestError::Disconnected)?;
        let uuid = format!("req-{}", self.net.next_uuid.fetch_add(1, Ordering::AcqRel));
        let (tx, rx) = oneshot::channel();
        self.net.responders.lock().insert(uuid.clone(), tx);
        pool.notify_txs_sync_message(self.node_id, Some(uuid.clone()), data);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RequestError::Disconnected),
            Err(_) => {
                self.net.responders.lock().remove(&uuid);
                Err(RequestError::Timeout)
            }
        }
    }

    fn send_response(&self, uuid: &str, _peer: NodeId, data: Bytes) {
        if let Some(tx) = self.net.responders.lock().remove(uuid) {
            let _ = tx.send(data);
        }
    }

    async fn connected_node_ids(&self) -> Result<Vec<NodeId>, RequestError> {
        Ok(self.net.pools.read().keys().copied().collect())
    }
}

/// A node of a test network: a pool with its mock capabilities.
#[derive(Debug)]
pub struct TestNode {
    /// The node's id on the network.
    pub node_id: NodeId,
    /// The pool under test.
    pub pool: Pool,
    /// The node's ledger.
    pub ledger: Arc<MockLedger>,
    /// The node's sealer.
    pub sealer: Arc<MockSealer>,
    /// The node's crypto suite.
    pub crypto: MockCryptoSuite,
    /// Key pair used to sign this node's test transactions.
    pub key: MockKeyPair,
    /// The pool configuration.
    pub config: PoolConfig,
}

impl TestNode {
    /// Builds a node with a 20-block ledger history of 10 transactions each
    /// and registers it on the network. The pool is neither initialized nor
    /// started.
    pub fn new(net: &Arc<TestNet>, config: PoolConfig) -> Self {
        let node_id = random_node_id();
        let crypto = MockCryptoSuite;
        let ledger = Arc::new(MockLedger::new(20, 10, config.chain_id, config.group_id));
        let sealer = Arc::new(MockSealer::default());
        let front = net.front_for(node_id);
        let pool = Pool::new(
            config.clone(),
            node_id,
            Arc::new(crypto),
            ledger.clone(),
            sealer.clone(),
            front,
        );
        net.register(node_id, pool.clone());
        Self { node_id, pool, ledger, sealer, crypto, key: MockKeyPair::random(), config }
    }

    /// A valid transaction for this node's chain state: fresh nonce, block
    /// limit a few blocks short of the window edge.
    pub fn valid_transaction(&self) -> TransactionSigned {
        self.transaction_with(
            random_nonce(),
            self.ledger.block_number_sync() + self.config.block_limit - 4,
        )
    }

    /// A transaction with the given nonce and block limit.
    pub fn transaction_with(&self, nonce: Nonce, block_limit: BlockNumber) -> TransactionSigned {
        fake_transaction(
            &self.crypto,
            &self.key,
            nonce,
            block_limit,
            self.config.chain_id,
            self.config.group_id,
        )
    }
}

/// Makes every given node a consensus member and connects them all to each
/// other.
pub fn join_group(nodes: &[&TestNode]) {
    let ids: Vec<NodeId> = nodes.iter().map(|node| node.node_id).collect();
    for node in nodes {
        node.pool.notify_consensus_node_list(ids.clone());
        node.pool.notify_connected_nodes(ids.iter().copied().collect());
    }
}
