use crate::TxHash;
use core::fmt;

/// Cryptographic primitives of the chain, injected into every component that
/// needs to hash or verify payloads.
///
/// The pool is agnostic over the concrete suite (keccak/secp256k1,
/// sm3/sm2, ...); nodes of a group must of course agree on one.
#[auto_impl::auto_impl(&, Arc)]
pub trait CryptoSuite: fmt::Debug + Send + Sync {
    /// Hashes arbitrary bytes with the chain's hash function.
    fn hash(&self, data: &[u8]) -> TxHash;

    /// Verifies `signature` over `hash` against the submitter's
    /// `public_key`.
    fn verify(&self, signature: &[u8], hash: &TxHash, public_key: &[u8]) -> bool;
}
