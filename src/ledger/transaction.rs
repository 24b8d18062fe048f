// src/ledger/transaction.rs
use super::{hex_array, AssetId, Hash, PartyId};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Serialized size of the unsigned prefix: counter, asset, from, to.
pub const UNSIGNED_TX_LEN: usize = 2 + 32 + 32 + 32;

/// Serialized size of a full transaction (unsigned prefix + 64-byte signature).
pub const TX_LEN: usize = UNSIGNED_TX_LEN + 64;

/// Transfer of one asset from its current owner to a new party.
///
/// A transaction is only meaningful against the asset's state at the time it is
/// applied: `counter` must equal the asset's running transfer counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub counter: u16,
    #[serde(with = "hex_array")]
    pub asset: AssetId,
    #[serde(with = "hex_array")]
    pub from: PartyId,
    #[serde(with = "hex_array")]
    pub to: PartyId,
    /// Opaque authorization blob; checked by the configured verifier, if any.
    #[serde(with = "hex_array")]
    pub signature: [u8; 64],
}

impl Transaction {
    /// Bytes covered by the signature.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(UNSIGNED_TX_LEN);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.asset);
        out.extend_from_slice(&self.from);
        out.extend_from_slice(&self.to);
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.unsigned_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode the fixed-width layout. Input must be exactly `TX_LEN` bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() < TX_LEN {
            return Err(CodecError::MalformedTransaction(format!(
                "need {} bytes, got {}",
                TX_LEN,
                raw.len()
            )));
        }
        if raw.len() > TX_LEN {
            return Err(CodecError::MalformedTransaction(format!(
                "{} trailing bytes",
                raw.len() - TX_LEN
            )));
        }

        let mut asset = [0u8; 32];
        let mut from = [0u8; 32];
        let mut to = [0u8; 32];
        let mut signature = [0u8; 64];
        asset.copy_from_slice(&raw[2..34]);
        from.copy_from_slice(&raw[34..66]);
        to.copy_from_slice(&raw[66..98]);
        signature.copy_from_slice(&raw[98..TX_LEN]);

        Ok(Self {
            counter: u16::from_be_bytes([raw[0], raw[1]]),
            asset,
            from,
            to,
            signature,
        })
    }

    /// SHA-256 of the serialized transaction.
    pub fn hash(&self) -> Hash {
        Sha256::digest(self.encode()).into()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction {
            counter: 0x0102,
            asset: [1u8; 32],
            from: [2u8; 32],
            to: [3u8; 32],
            signature: [4u8; 64],
        }
    }

    #[test]
    fn test_layout_is_fixed_width() {
        let raw = sample().encode();
        assert_eq!(raw.len(), TX_LEN);
        assert_eq!(&raw[..2], &[0x01, 0x02]);
        assert_eq!(raw[2], 1);
        assert_eq!(raw[34], 2);
        assert_eq!(raw[66], 3);
        assert_eq!(raw[98], 4);
    }

    #[test]
    fn test_decode_short_input_fails() {
        let raw = sample().encode();
        let err = Transaction::decode(&raw[..TX_LEN - 1]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedTransaction(_)));
        assert!(Transaction::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut raw = sample().encode();
        raw.push(0);
        assert!(Transaction::decode(&raw).is_err());
    }

    #[test]
    fn test_hash_covers_signature() {
        let a = sample();
        let mut b = sample();
        b.signature[63] ^= 0xff;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), sample().hash());
    }

    #[test]
    fn test_json_uses_hex() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["counter"], 0x0102);
        assert_eq!(json["asset"], hex::encode([1u8; 32]));
        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample());
    }
}
