//! Capabilities injected into the pool and the types exchanged with its
//! consumers.

use crate::error::PoolError;
use grove_primitives::{BlockHash, BlockNumber, Bytes, NodeId, Nonce, TransactionSigned, TxHash};
use std::{collections::BTreeMap, time::Duration};

/// Where a transaction entered this node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionOrigin {
    /// Submitted by a local client through the RPC layer.
    Local,
    /// Forwarded by a peer over the sync protocol.
    External,
}

impl TransactionOrigin {
    /// Whether the transaction originates from a local client.
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

/// The outcome reported for a transaction once its fate is decided: included
/// by a committed block, or invalidated by an expired block limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSubmitResult {
    /// Hash of the transaction.
    pub hash: TxHash,
    /// Nonce of the transaction, when known to the reporter.
    ///
    /// Consensus fills this in so nonces of transactions this pool never
    /// held still enter the committed window.
    pub nonce: Option<Nonce>,
    /// Block that included the transaction.
    pub block_number: Option<BlockNumber>,
    /// `None` for an included transaction, the rejection reason otherwise.
    pub error: Option<PoolError>,
}

impl TxSubmitResult {
    /// A successful inclusion result.
    pub fn committed(hash: TxHash) -> Self {
        Self { hash, nonce: None, block_number: None, error: None }
    }

    /// A rejection result.
    pub fn rejected(hash: TxHash, error: PoolError) -> Self {
        Self { hash, nonce: None, block_number: None, error: Some(error) }
    }

    /// Sets the including block number.
    pub fn with_block_number(mut self, number: BlockNumber) -> Self {
        self.block_number = Some(number);
        self
    }

    /// Sets the transaction nonce.
    pub fn with_nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Whether the transaction was included.
    pub fn is_committed(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a sealing request: transaction hashes in sealing order, system
/// transactions split out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedTxs {
    /// User transactions, ascending by import time.
    pub txs: Vec<TxHash>,
    /// System transactions, sealed ahead of user transactions.
    pub system_txs: Vec<TxHash>,
}

impl SealedTxs {
    /// Total number of sealed hashes.
    pub fn len(&self) -> usize {
        self.txs.len() + self.system_txs.len()
    }

    /// Whether nothing was sealed.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty() && self.system_txs.is_empty()
    }
}

/// Node roles the ledger keeps membership lists for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeType {
    /// Nodes sealing and voting on blocks.
    ConsensusSealer,
    /// Nodes following consensus without voting.
    ConsensusObserver,
}

/// Error returned by [`Ledger`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The requested entry does not exist.
    #[error("entry not found")]
    NotFound,
    /// The backing store failed.
    #[error("ledger backend failure: {0}")]
    Backend(String),
}

/// Read/write access to the persistent ledger.
///
/// The pool owns no persistent state itself: admitted transactions are
/// stored ahead of commit through [`Ledger::store_transactions`] and the
/// nonce window is rebuilt from [`Ledger::nonce_list`] at startup.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Durably stores encoded transactions under their hashes.
    async fn store_transactions(
        &self,
        txs: Vec<Bytes>,
        hashes: Vec<TxHash>,
    ) -> Result<(), LedgerError>;

    /// Looks up committed transactions by hash; absent entries are `None`.
    async fn batch_txs(
        &self,
        hashes: &[TxHash],
    ) -> Result<Vec<Option<TransactionSigned>>, LedgerError>;

    /// The number of the latest committed block.
    async fn block_number(&self) -> Result<BlockNumber, LedgerError>;

    /// The hash of the block with the given number.
    async fn block_hash_by_number(&self, number: BlockNumber) -> Result<BlockHash, LedgerError>;

    /// Nonce lists of `offset` blocks starting at `start`.
    async fn nonce_list(
        &self,
        start: BlockNumber,
        offset: u64,
    ) -> Result<BTreeMap<BlockNumber, Vec<Nonce>>, LedgerError>;

    /// Membership list of the given node role.
    async fn node_list_by_type(&self, node_type: NodeType) -> Result<Vec<NodeId>, LedgerError>;
}

/// Error returned by [`Sealer::note_unsealed_size`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sealer rejected notification: {0}")]
pub struct SealerError(pub String);

/// The block sealer, notified whenever the number of sealable transactions
/// changes.
#[async_trait::async_trait]
pub trait Sealer: Send + Sync + 'static {
    /// Reports the current number of unsealed transactions.
    async fn note_unsealed_size(&self, size: usize) -> Result<(), SealerError>;
}

/// Error returned by [`FrontService`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The peer did not answer within the deadline.
    #[error("request timed out")]
    Timeout,
    /// The peer is not connected.
    #[error("peer disconnected")]
    Disconnected,
    /// The transport failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// The node's p2p messaging transport.
///
/// All payloads travel on the transaction-sync module; responses to inbound
/// requests are correlated by the transport-assigned `uuid`.
#[async_trait::async_trait]
pub trait FrontService: Send + Sync + 'static {
    /// Sends a one-way message to `peer`.
    fn send_message(&self, peer: NodeId, data: Bytes);

    /// Performs a request/response round trip with `peer`.
    async fn request(
        &self,
        peer: NodeId,
        data: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, RequestError>;

    /// Answers the inbound request identified by `uuid`.
    fn send_response(&self, uuid: &str, peer: NodeId, data: Bytes);

    /// Node ids currently connected on the transport.
    async fn connected_node_ids(&self) -> Result<Vec<NodeId>, RequestError>;
}
