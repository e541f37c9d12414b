use crate::{crypto::CryptoSuite, BlockNumber, Nonce, TxHash};
use alloy_primitives::Bytes;
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};

/// The consensus fields of a transaction.
///
/// `block_limit` is the highest block number at which the transaction may
/// still be included; together with the random `nonce` it forms the replay
/// protection scheme enforced by the pool's nonce checkers.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Transaction {
    /// Chain this transaction is bound to.
    pub chain_id: u64,
    /// Group within the chain.
    pub group_id: u64,
    /// Highest block number at which the transaction is still valid.
    pub block_limit: BlockNumber,
    /// Random replay-protection nonce.
    pub nonce: Nonce,
    /// Whether this is a system transaction, sealed ahead of user
    /// transactions.
    pub system: bool,
    /// Call payload.
    pub input: Bytes,
}

impl Transaction {
    /// Returns the RLP encoding of the consensus fields, which is both the
    /// signing payload and the preimage of the transaction hash.
    pub fn signing_payload(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }
}

/// A [`Transaction`] together with the submitter's public key, the signature
/// over the transaction hash, and the hash itself.
///
/// The hash is intentionally not part of the wire format: it is recomputed
/// through the node's [`CryptoSuite`] after decoding, so a peer cannot lie
/// about it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionSigned {
    /// The consensus fields.
    pub transaction: Transaction,
    /// Public key of the submitter.
    pub sender: Bytes,
    /// Signature over the transaction hash.
    pub signature: Bytes,
    hash: TxHash,
}

impl TransactionSigned {
    /// Assembles a signed transaction, computing its hash with the given
    /// suite.
    pub fn new(
        transaction: Transaction,
        sender: Bytes,
        signature: Bytes,
        crypto: &dyn CryptoSuite,
    ) -> Self {
        let hash = crypto.hash(&transaction.signing_payload());
        Self { transaction, sender, signature, hash }
    }

    /// Decodes a signed transaction from its RLP wire form and computes its
    /// hash.
    ///
    /// Trailing bytes are rejected.
    pub fn decode_and_hash(data: &[u8], crypto: &dyn CryptoSuite) -> alloy_rlp::Result<Self> {
        let mut buf = data;
        let mut tx = Self::decode(&mut buf)?;
        if !buf.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength)
        }
        tx.hash = crypto.hash(&tx.transaction.signing_payload());
        Ok(tx)
    }

    /// Recomputes and caches the hash of this transaction.
    pub fn fill_hash(&mut self, crypto: &dyn CryptoSuite) {
        self.hash = crypto.hash(&self.transaction.signing_payload());
    }

    /// Checks the signature against the cached hash and the submitter's
    /// public key.
    pub fn verify_signature(&self, crypto: &dyn CryptoSuite) -> bool {
        crypto.verify(&self.signature, &self.hash, &self.sender)
    }

    /// The cached transaction hash.
    pub const fn hash(&self) -> TxHash {
        self.hash
    }

    /// The replay-protection nonce.
    pub const fn nonce(&self) -> Nonce {
        self.transaction.nonce
    }

    /// The highest block number at which this transaction may be included.
    pub const fn block_limit(&self) -> BlockNumber {
        self.transaction.block_limit
    }

    /// The chain id the transaction is bound to.
    pub const fn chain_id(&self) -> u64 {
        self.transaction.chain_id
    }

    /// The group id the transaction is bound to.
    pub const fn group_id(&self) -> u64 {
        self.transaction.group_id
    }

    /// Whether this is a system transaction.
    pub const fn is_system(&self) -> bool {
        self.transaction.system
    }

    /// The RLP wire form of this transaction.
    pub fn encoded(&self) -> Bytes {
        alloy_rlp::encode(self).into()
    }

    fn rlp_payload_length(&self) -> usize {
        self.transaction.length() + self.sender.length() + self.signature.length()
    }
}

impl Encodable for TransactionSigned {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.rlp_payload_length();
        alloy_rlp::Header { list: true, payload_length }.encode(out);
        self.transaction.encode(out);
        self.sender.encode(out);
        self.signature.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.rlp_payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for TransactionSigned {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = alloy_rlp::Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString)
        }
        let started_len = buf.len();
        let transaction = Transaction::decode(buf)?;
        let sender = Bytes::decode(buf)?;
        let signature = Bytes::decode(buf)?;
        let consumed = started_len - buf.len();
        if consumed != header.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: header.payload_length,
                got: consumed,
            })
        }
        // the hash is filled in by the caller once a crypto suite is at hand
        Ok(Self { transaction, sender, signature, hash: TxHash::ZERO })
    }
}
