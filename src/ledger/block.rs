// src/ledger/block.rs
// Binary block layout and block identifiers

use super::transaction::Transaction;
use super::{hex_array, Hash};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Parent hash carried by the genesis block.
pub const GENESIS_PARENT: Hash = [0u8; 32];

const HEADER_LEN: usize = 64;

/// Sidechain block. `height` is assigned by the store on acceptance and is not part
/// of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Base-chain anchor transaction this block claims to be ordered under.
    #[serde(with = "hex_array")]
    pub anchor_ref: Hash,
    #[serde(with = "hex_array")]
    pub previous_block_hash: Hash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(
        anchor_ref: Hash,
        previous_block_hash: Hash,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            anchor_ref,
            previous_block_hash,
            transactions,
        }
    }

    /// The empty block every node derives from the configured genesis anchor.
    pub fn genesis(anchor_ref: Hash) -> Self {
        Self::new(anchor_ref, GENESIS_PARENT, Vec::new())
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_block_hash == GENESIS_PARENT
    }

    /// `anchor_ref || previous_block_hash || (u16 BE length, tx bytes)*`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.transactions.len() * 164);
        out.extend_from_slice(&self.anchor_ref);
        out.extend_from_slice(&self.previous_block_hash);
        for tx in &self.transactions {
            let raw = tx.encode();
            out.extend_from_slice(&(raw.len() as u16).to_be_bytes());
            out.extend_from_slice(&raw);
        }
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() < HEADER_LEN {
            return Err(CodecError::MalformedBlock(format!(
                "header needs {} bytes, got {}",
                HEADER_LEN,
                raw.len()
            )));
        }
        let mut anchor_ref = [0u8; 32];
        let mut previous_block_hash = [0u8; 32];
        anchor_ref.copy_from_slice(&raw[..32]);
        previous_block_hash.copy_from_slice(&raw[32..HEADER_LEN]);

        let mut transactions = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < raw.len() {
            if raw.len() - offset < 2 {
                return Err(CodecError::MalformedBlock(format!(
                    "truncated length prefix at offset {}",
                    offset
                )));
            }
            let size = u16::from_be_bytes([raw[offset], raw[offset + 1]]) as usize;
            offset += 2;
            if size > raw.len() - offset {
                return Err(CodecError::MalformedBlock(format!(
                    "entry at offset {} declares {} bytes, {} remain",
                    offset - 2,
                    size,
                    raw.len() - offset
                )));
            }
            let tx = Transaction::decode(&raw[offset..offset + size]).map_err(|e| {
                CodecError::MalformedBlock(format!("transaction {}: {}", transactions.len(), e))
            })?;
            transactions.push(tx);
            offset += size;
        }

        Ok(Self {
            anchor_ref,
            previous_block_hash,
            transactions,
        })
    }

    /// SHA-256 over the parent hash followed by each length-prefixed transaction, in order.
    /// The anchor reference is advisory and not committed to.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.previous_block_hash);
        for tx in &self.transactions {
            let raw = tx.encode();
            hasher.update((raw.len() as u16).to_be_bytes());
            hasher.update(&raw);
        }
        hasher.finalize().into()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }
}
