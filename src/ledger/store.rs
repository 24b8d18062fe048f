// src/ledger/store.rs
// Ledger State Store: accepted blocks and current asset ownership

use super::{hex_array, AssetId, AssetRecord, AssetSource, Block, Hash, PartyId, StateDelta, Tip};
use crate::error::StoreError;
use crate::storage::{self, RocksDb, CF_ASSETS, CF_BLOCKS, CF_BLOCK_INDEX, CF_META};
use parking_lot::{Mutex, RwLock};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};

const TIP_KEY: &[u8] = b"tip";

/// Block as persisted, with its acceptance height and identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub height: u64,
    #[serde(with = "hex_array")]
    pub hash: Hash,
    pub block: Block,
}

/// Owns the accepted chain and the asset table.
///
/// Reads go straight to RocksDB. All writes hold `writer`, and `commit_block` applies a
/// block, its state delta and the new tip in a single `WriteBatch`, so either every
/// effect is visible or none is.
pub struct LedgerStore {
    db: RocksDb,
    tip: RwLock<Tip>,
    writer: Mutex<()>,
}

impl LedgerStore {
    /// Open the ledger over `db`, writing the genesis block on first use.
    pub fn open(db: RocksDb, genesis_anchor: Hash) -> Result<Self, StoreError> {
        let tip = match storage::get_json::<Tip>(&db, CF_META, TIP_KEY)? {
            Some(tip) => {
                let genesis = storage::get_json::<StoredBlock>(&db, CF_BLOCKS, 0u64.to_be_bytes())?
                    .ok_or_else(|| StoreError::Corrupt("tip present but genesis missing".into()))?;
                if genesis.block.anchor_ref != genesis_anchor {
                    return Err(StoreError::Corrupt(format!(
                        "store was initialised for genesis anchor {}, configured {}",
                        hex::encode(genesis.block.anchor_ref),
                        hex::encode(genesis_anchor)
                    )));
                }
                tip
            }
            None => {
                let genesis = Block::genesis(genesis_anchor);
                let stored = StoredBlock {
                    height: 0,
                    hash: genesis.hash(),
                    block: genesis,
                };
                let tip = Tip {
                    height: 0,
                    hash: stored.hash,
                    anchor_ref: genesis_anchor,
                };
                let mut batch = WriteBatch::default();
                storage::batch_put_json(&db, &mut batch, CF_BLOCKS, 0u64.to_be_bytes(), &stored)?;
                batch.put_cf(
                    storage::cf(&db, CF_BLOCK_INDEX)?,
                    stored.hash,
                    0u64.to_be_bytes(),
                );
                storage::batch_put_json(&db, &mut batch, CF_META, TIP_KEY, &tip)?;
                db.write(batch)?;
                log::info!("initialised ledger with genesis block {}", hex::encode(tip.hash));
                tip
            }
        };

        Ok(Self {
            db,
            tip: RwLock::new(tip),
            writer: Mutex::new(()),
        })
    }

    pub fn db(&self) -> &RocksDb {
        &self.db
    }

    pub fn tip(&self) -> Tip {
        *self.tip.read()
    }

    pub fn get_block(&self, height: u64) -> Result<Option<StoredBlock>, StoreError> {
        storage::get_json(&self.db, CF_BLOCKS, height.to_be_bytes())
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        match storage::get_u64(&self.db, CF_BLOCK_INDEX, hash)? {
            Some(height) => self.get_block(height),
            None => Ok(None),
        }
    }

    /// Append `block` at `tip.height + 1`, apply `delta` and advance the tip atomically.
    ///
    /// Fails with `StaleTip` if the block does not extend the tip current at the time
    /// the writer lock is taken.
    pub fn commit_block(&self, block: &Block, delta: &StateDelta) -> Result<Tip, StoreError> {
        let _guard = self.writer.lock();
        let current = self.tip();
        if block.previous_block_hash != current.hash {
            return Err(StoreError::StaleTip {
                expected: hex::encode(block.previous_block_hash),
                actual: hex::encode(current.hash),
            });
        }

        let height = current.height + 1;
        let stored = StoredBlock {
            height,
            hash: block.hash(),
            block: block.clone(),
        };
        let next = Tip {
            height,
            hash: stored.hash,
            anchor_ref: block.anchor_ref,
        };

        let mut batch = WriteBatch::default();
        storage::batch_put_json(&self.db, &mut batch, CF_BLOCKS, height.to_be_bytes(), &stored)?;
        batch.put_cf(
            storage::cf(&self.db, CF_BLOCK_INDEX)?,
            stored.hash,
            height.to_be_bytes(),
        );
        for (id, record) in delta {
            storage::batch_put_json(&self.db, &mut batch, CF_ASSETS, id, record)?;
        }
        storage::batch_put_json(&self.db, &mut batch, CF_META, TIP_KEY, &next)?;
        self.db.write(batch)?;

        *self.tip.write() = next;
        Ok(next)
    }

    /// Create an asset out of band with counter 0.
    pub fn issue_asset(&self, id: AssetId, owner: PartyId) -> Result<AssetRecord, StoreError> {
        let _guard = self.writer.lock();
        if self.get_asset(&id)?.is_some() {
            return Err(StoreError::AlreadyExists(hex::encode(id)));
        }
        let record = AssetRecord {
            id,
            owner,
            counter: 0,
        };
        let mut batch = WriteBatch::default();
        storage::batch_put_json(&self.db, &mut batch, CF_ASSETS, id, &record)?;
        self.db.write(batch)?;
        log::info!("issued asset {} to {}", hex::encode(id), hex::encode(owner));
        Ok(record)
    }
}

impl AssetSource for LedgerStore {
    fn get_asset(&self, id: &AssetId) -> Result<Option<AssetRecord>, StoreError> {
        storage::get_json(&self.db, CF_ASSETS, id)
    }
}
