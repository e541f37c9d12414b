#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! Commonly used types for the grove transaction pool and its collaborators.
//!
//! This crate holds the data model shared between the pool, the sealer and
//! the sync layer: transactions, block containers and the [`CryptoSuite`]
//! abstraction that supplies the chain's hash function and signature scheme.

mod block;
mod crypto;
mod transaction;

pub use block::{Block, BlockHeader};
pub use crypto::CryptoSuite;
pub use transaction::{Transaction, TransactionSigned};

pub use alloy_primitives::{self, Bytes, B256, B512, U256};

/// A block number.
pub type BlockNumber = u64;

/// A transaction hash.
pub type TxHash = B256;

/// A block hash.
pub type BlockHash = B256;

/// The per-transaction replay-protection nonce.
///
/// Unlike account-model chains this is not a sequence number: clients draw a
/// random value per transaction and the pool enforces uniqueness against a
/// sliding window of committed blocks.
pub type Nonce = U256;

/// Identifier of a node on the p2p layer (its long-term public key).
pub type NodeId = B512;
