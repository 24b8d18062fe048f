// src/ledger/mod.rs
pub mod block;
pub mod store;
pub mod transaction;
pub mod validation;

use crate::error::{StoreError, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use block::{Block, GENESIS_PARENT};
pub use store::LedgerStore;
pub use transaction::Transaction;
pub use validation::{Ed25519Signatures, OpaqueSignatures, SignatureVerifier, Validator};

pub type Hash = [u8; 32];
pub type AssetId = [u8; 32];
pub type PartyId = [u8; 32];

/// Current owner and transfer counter of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    #[serde(with = "hex_array")]
    pub id: AssetId,
    #[serde(with = "hex_array")]
    pub owner: PartyId,
    pub counter: u64,
}

/// Asset states produced by validating one block, keyed by asset id.
pub type StateDelta = BTreeMap<AssetId, AssetRecord>;

/// Most recently accepted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tip {
    pub height: u64,
    #[serde(with = "hex_array")]
    pub hash: Hash,
    #[serde(with = "hex_array")]
    pub anchor_ref: Hash,
}

/// Read access to committed asset state.
pub trait AssetSource {
    fn get_asset(&self, id: &AssetId) -> Result<Option<AssetRecord>, StoreError>;
}

/// Outcome of offering a block to the ledger.
#[derive(Debug)]
pub enum ImportOutcome {
    Accepted(Tip),
    Rejected(ValidationError),
}

/// Validate `block` against the current tip and commit it.
///
/// A concurrent writer winning the race surfaces as `StaleTip`; the block is then
/// re-validated against the fresh tip, which normally turns into `ChainMismatch`.
pub fn import_block(
    store: &LedgerStore,
    validator: &Validator,
    block: &Block,
) -> Result<ImportOutcome, StoreError> {
    const MAX_ATTEMPTS: usize = 8;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let tip = store.tip();
        let delta = match validator.validate(block, tip.height, &tip.hash, store) {
            Ok(delta) => delta,
            Err(reason) => return Ok(ImportOutcome::Rejected(reason)),
        };
        match store.commit_block(block, &delta) {
            Ok(new_tip) => return Ok(ImportOutcome::Accepted(new_tip)),
            Err(StoreError::StaleTip { .. }) if attempt < MAX_ATTEMPTS => {
                log::debug!(
                    "block {} lost commit race, re-validating",
                    block.hash_hex()
                );
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serde adapter: fixed-size byte arrays as lowercase hex strings.
pub(crate) mod hex_array {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(d: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        let mut out = [0u8; N];
        hex::decode_to_slice(s.as_str(), &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}

/// Serde adapter: optional 32-byte hash as a hex string or null.
pub(crate) mod hex_opt {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(d)? {
            Some(s) => {
                let mut out = [0u8; 32];
                hex::decode_to_slice(s.as_str(), &mut out).map_err(D::Error::custom)?;
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }
}

/// Parse a 64-character hex string into 32 bytes.
pub fn parse_hash(s: &str) -> Result<Hash, hex::FromHexError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s.trim(), &mut out)?;
    Ok(out)
}
