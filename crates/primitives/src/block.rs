use crate::{crypto::CryptoSuite, BlockNumber, TransactionSigned, TxHash};
use alloy_primitives::Bytes;
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};

/// Header of a block proposal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockHeader {
    /// Number of the proposed block.
    pub number: BlockNumber,
}

/// A block container.
///
/// Consensus proposals reference their transactions by hash only
/// (`tx_hashes`); the sync layer reuses the same container with the
/// `transactions` list populated to ship full transactions between peers.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Block {
    /// The block header.
    pub header: BlockHeader,
    /// Full transactions carried by this container, if any.
    pub transactions: Vec<TransactionSigned>,
    /// Hashes of the transactions making up the proposal.
    pub tx_hashes: Vec<TxHash>,
}

impl Block {
    /// Creates a hash-only proposal container.
    pub fn new_proposal(number: BlockNumber, tx_hashes: Vec<TxHash>) -> Self {
        Self { header: BlockHeader { number }, transactions: Vec::new(), tx_hashes }
    }

    /// Creates a container shipping full transactions.
    pub fn with_transactions(transactions: Vec<TransactionSigned>) -> Self {
        Self { header: BlockHeader::default(), transactions, tx_hashes: Vec::new() }
    }

    /// Decodes a block from its RLP wire form and computes the hash of every
    /// carried transaction.
    pub fn decode_and_hash(data: &[u8], crypto: &dyn CryptoSuite) -> alloy_rlp::Result<Self> {
        let mut buf = data;
        let mut block = Self::decode(&mut buf)?;
        if !buf.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength)
        }
        for tx in &mut block.transactions {
            tx.fill_hash(crypto);
        }
        Ok(block)
    }

    /// The RLP wire form of this block.
    pub fn encoded(&self) -> Bytes {
        alloy_rlp::encode(self).into()
    }

    /// Whether the container carries neither hashes nor full transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.tx_hashes.is_empty()
    }
}
