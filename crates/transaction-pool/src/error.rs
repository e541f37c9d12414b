//! Transaction pool errors.

use grove_primitives::TxHash;

/// Transaction pool result type.
pub type PoolResult<T> = Result<T, PoolError>;

/// All errors the transaction pool can throw.
///
/// Admission errors travel back to the submitter as the outcome of the
/// submit call; the remaining variants surface through the block
/// verification and fill paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The payload could not be decoded into a transaction or block.
    #[error("malformed payload")]
    Malform,
    /// The signature does not verify against the transaction hash.
    #[error("invalid transaction signature")]
    InvalidSignature,
    /// The transaction is bound to a different chain.
    #[error("chain id mismatch")]
    InvalidChainId,
    /// The transaction is bound to a different group.
    #[error("group id mismatch")]
    InvalidGroupId,
    /// The nonce is already held by the pool or was committed within the
    /// current window.
    #[error("nonce already known")]
    NonceCheckFail,
    /// The block limit is in the past or looks too far ahead.
    #[error("block limit out of range")]
    BlockLimitCheckFail,
    /// A transaction with this hash is already resident.
    #[error("transaction {0} already in the pool")]
    AlreadyInTxPool(TxHash),
    /// The pool reached its configured capacity.
    #[error("transaction pool is full")]
    TxPoolIsFull,
    /// This node is neither a consensus nor an observer member of the group.
    #[error("node does not belong to the group")]
    RequestNotBelongToTheGroup,
    /// Transactions remained unresolvable after peer fetch and ledger
    /// fallback.
    #[error("{0} transactions missing")]
    TransactionsMissing(usize),
    /// The pool is stopping and no longer accepts work.
    #[error("transaction pool is shutting down")]
    ShuttingDown,
    /// A ledger query required by the operation failed.
    #[error("ledger query failed: {0}")]
    Ledger(#[from] crate::traits::LedgerError),
}
