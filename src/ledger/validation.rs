// src/ledger/validation.rs
// Block-atomic validation of candidate blocks against the current tip

use super::transaction::Transaction;
use super::{AssetRecord, AssetSource, Block, Hash, StateDelta};
use crate::error::ValidationError;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::sync::Arc;

/// Authorization check applied to every transaction before state rules.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, tx: &Transaction) -> bool;
}

/// Treats signatures as opaque blobs that were checked upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueSignatures;

impl SignatureVerifier for OpaqueSignatures {
    fn verify(&self, _tx: &Transaction) -> bool {
        true
    }
}

/// `signature` is an Ed25519 signature by `from` over the unsigned transaction bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Signatures;

impl SignatureVerifier for Ed25519Signatures {
    fn verify(&self, tx: &Transaction) -> bool {
        let key = match VerifyingKey::from_bytes(&tx.from) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let sig = Signature::from_bytes(&tx.signature);
        key.verify(&tx.unsigned_bytes(), &sig).is_ok()
    }
}

/// Decides whether a block extends the tip and computes its state delta.
#[derive(Clone)]
pub struct Validator {
    verifier: Arc<dyn SignatureVerifier>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Arc::new(OpaqueSignatures))
    }
}

impl Validator {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { verifier }
    }

    /// Validate `block` against the tip `(tip_height, tip_hash)`.
    ///
    /// Transactions run in order over an overlay seeded lazily from `assets`, so a later
    /// transfer of the same asset is checked against the counter left by the earlier one.
    /// Any failing transaction rejects the whole block and nothing is written.
    pub fn validate<S: AssetSource + ?Sized>(
        &self,
        block: &Block,
        tip_height: u64,
        tip_hash: &Hash,
        assets: &S,
    ) -> Result<StateDelta, ValidationError> {
        if &block.previous_block_hash != tip_hash {
            log::debug!(
                "block {} does not extend tip at height {}",
                block.hash_hex(),
                tip_height
            );
            return Err(ValidationError::ChainMismatch {
                expected: hex::encode(tip_hash),
                got: hex::encode(block.previous_block_hash),
            });
        }

        let mut overlay = StateDelta::new();
        for tx in &block.transactions {
            if !self.verifier.verify(tx) {
                return Err(ValidationError::InvalidSignature { tx: tx.hash_hex() });
            }

            let current = match overlay.get(&tx.asset) {
                Some(record) => record.clone(),
                None => assets
                    .get_asset(&tx.asset)
                    .map_err(|e| ValidationError::Store(e.to_string()))?
                    .ok_or_else(|| ValidationError::UnknownAsset {
                        tx: tx.hash_hex(),
                        asset: hex::encode(tx.asset),
                    })?,
            };

            if tx.from != current.owner {
                return Err(ValidationError::OwnershipViolation {
                    tx: tx.hash_hex(),
                    asset: hex::encode(tx.asset),
                    from: hex::encode(tx.from),
                });
            }
            if u64::from(tx.counter) != current.counter {
                return Err(ValidationError::CounterMismatch {
                    tx: tx.hash_hex(),
                    expected: current.counter,
                    got: u64::from(tx.counter),
                });
            }

            overlay.insert(
                tx.asset,
                AssetRecord {
                    id: tx.asset,
                    owner: tx.to,
                    counter: current.counter + 1,
                },
            );
        }

        Ok(overlay)
    }
}
