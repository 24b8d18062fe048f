// src/anchor/log.rs
// Persisted anchor observations, one per base-chain height

use crate::error::StoreError;
use crate::ledger::{hex_opt, parse_hash, Hash};
use crate::storage::{self, RocksDb, CF_ANCHORS, CF_ANCHOR_COMMITMENTS, CF_ANCHOR_TXIDS};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorObservation {
    pub anchor_height: u64,
    pub anchor_txid: String,
    #[serde(default, with = "hex_opt")]
    pub commitment: Option<Hash>,
    pub observed_at: DateTime<Utc>,
}

/// Append-only record of the anchor spend-chain. Heights strictly increase.
pub struct AnchorLog {
    db: RocksDb,
    append: Mutex<()>,
}

impl AnchorLog {
    pub fn new(db: RocksDb) -> Self {
        Self {
            db,
            append: Mutex::new(()),
        }
    }

    pub fn record(&self, obs: &AnchorObservation) -> Result<(), StoreError> {
        let _guard = self.append.lock();
        if let Some(last) = self.last()? {
            if obs.anchor_height <= last.anchor_height {
                return Err(StoreError::Corrupt(format!(
                    "anchor height {} does not follow {}",
                    obs.anchor_height, last.anchor_height
                )));
            }
        }
        let txid = parse_hash(&obs.anchor_txid)
            .map_err(|e| StoreError::Corrupt(format!("txid {}: {}", obs.anchor_txid, e)))?;
        let height = obs.anchor_height.to_be_bytes();

        let mut batch = WriteBatch::default();
        storage::batch_put_json(&self.db, &mut batch, CF_ANCHORS, height, obs)?;
        batch.put_cf(storage::cf(&self.db, CF_ANCHOR_TXIDS)?, txid, height);
        if let Some(commitment) = obs.commitment {
            batch.put_cf(storage::cf(&self.db, CF_ANCHOR_COMMITMENTS)?, commitment, height);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn last(&self) -> Result<Option<AnchorObservation>, StoreError> {
        storage::last_json(&self.db, CF_ANCHORS)
    }

    pub fn get(&self, anchor_height: u64) -> Result<Option<AnchorObservation>, StoreError> {
        storage::get_json(&self.db, CF_ANCHORS, anchor_height.to_be_bytes())
    }

    /// Newest observations first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AnchorObservation>, StoreError> {
        storage::tail_json(&self.db, CF_ANCHORS, limit)
    }

    /// Base-chain height at which `txid` was observed as an anchor.
    pub fn height_of_txid(&self, txid: &Hash) -> Result<Option<u64>, StoreError> {
        storage::get_u64(&self.db, CF_ANCHOR_TXIDS, txid)
    }

    pub fn observation_for_commitment(
        &self,
        commitment: &Hash,
    ) -> Result<Option<AnchorObservation>, StoreError> {
        match storage::get_u64(&self.db, CF_ANCHOR_COMMITMENTS, commitment)? {
            Some(height) => self.get(height),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::try_open_db;

    fn obs(height: u64, txid_byte: u8, commitment: Option<Hash>) -> AnchorObservation {
        AnchorObservation {
            anchor_height: height,
            anchor_txid: hex::encode([txid_byte; 32]),
            commitment,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_and_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnchorLog::new(try_open_db(dir.path()).unwrap());
        assert!(log.last().unwrap().is_none());

        log.record(&obs(6, 0xa6, None)).unwrap();
        log.record(&obs(7, 0xa7, Some([0xc7; 32]))).unwrap();

        assert_eq!(log.last().unwrap().unwrap().anchor_height, 7);
        assert_eq!(log.height_of_txid(&[0xa6; 32]).unwrap(), Some(6));
        assert_eq!(
            log.observation_for_commitment(&[0xc7; 32])
                .unwrap()
                .unwrap()
                .anchor_height,
            7
        );
        assert!(log.observation_for_commitment(&[0xc6; 32]).unwrap().is_none());
        let recent = log.recent(10).unwrap();
        assert_eq!(
            recent.iter().map(|o| o.anchor_height).collect::<Vec<_>>(),
            vec![7, 6]
        );
    }

    #[test]
    fn test_heights_must_increase() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnchorLog::new(try_open_db(dir.path()).unwrap());
        log.record(&obs(10, 1, None)).unwrap();
        assert!(log.record(&obs(10, 2, None)).is_err());
        assert!(log.record(&obs(9, 3, None)).is_err());
        assert_eq!(log.get(10).unwrap().unwrap().anchor_txid, hex::encode([1u8; 32]));
    }

    #[test]
    fn test_commitment_serializes_as_hex_or_null() {
        let with = serde_json::to_value(obs(1, 1, Some([0xee; 32]))).unwrap();
        assert_eq!(with["commitment"], hex::encode([0xee; 32]));
        let without = serde_json::to_value(obs(1, 1, None)).unwrap();
        assert!(without["commitment"].is_null());
    }
}
