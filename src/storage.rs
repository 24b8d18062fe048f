// src/storage.rs
// RocksDB-backed persistent storage shared by the ledger and the anchor log

use crate::error::StoreError;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

/// Type alias for RocksDB (Arc for cheap cloning)
pub type RocksDb = Arc<DB>;

pub const CF_BLOCKS: &str = "blocks";
pub const CF_BLOCK_INDEX: &str = "block_index";
pub const CF_ASSETS: &str = "assets";
pub const CF_META: &str = "meta";
pub const CF_ANCHORS: &str = "anchors";
pub const CF_ANCHOR_TXIDS: &str = "anchor_txids";
pub const CF_ANCHOR_COMMITMENTS: &str = "anchor_commitments";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_BLOCKS,
    CF_BLOCK_INDEX,
    CF_ASSETS,
    CF_META,
    CF_ANCHORS,
    CF_ANCHOR_TXIDS,
    CF_ANCHOR_COMMITMENTS,
];

/// Try to open RocksDB, retrying with backoff while another process releases the lock.
pub fn try_open_db<P: AsRef<Path>>(path: P) -> Result<RocksDb, StoreError> {
    let path = path.as_ref();
    let mut attempt = 0u32;
    let max_attempts = 8u32;
    let mut wait = 250u64;

    loop {
        match open_rocksdb_internal(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    log::error!(
                        "failed to open RocksDB at '{}' after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    );
                    return Err(StoreError::Storage(e));
                }
                log::warn!(
                    "open_db attempt {}/{} failed: {}, retrying in {}ms",
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                sleep(Duration::from_millis(wait));
                wait = std::cmp::min(wait * 2, 2000);
            }
        }
    }
}

fn open_rocksdb_internal(path: &Path) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let num_cpus = num_cpus::get() as i32;
    opts.increase_parallelism(num_cpus);
    opts.set_max_background_jobs(4);
    opts.set_max_open_files(512);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

    let cfs = COLUMN_FAMILIES
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
    DB::open_cf_descriptors(&opts, path, cfs)
}

pub fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Corrupt(format!("column family '{}' not found", name)))
}

/// Get and deserialize a JSON value stored under a key in a column family.
pub fn get_json<T: DeserializeOwned>(
    db: &DB,
    family: &str,
    key: impl AsRef<[u8]>,
) -> Result<Option<T>, StoreError> {
    match db.get_cf(cf(db, family)?, key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Stage a JSON value into a write batch.
pub fn batch_put_json<V: Serialize>(
    db: &DB,
    batch: &mut WriteBatch,
    family: &str,
    key: impl AsRef<[u8]>,
    val: &V,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(val)?;
    batch.put_cf(cf(db, family)?, key, bytes);
    Ok(())
}

/// Read a big-endian u64 stored as a raw value.
pub fn get_u64(db: &DB, family: &str, key: impl AsRef<[u8]>) -> Result<Option<u64>, StoreError> {
    match db.get_cf(cf(db, family)?, key)? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt("invalid u64 bytes".into()))?;
            Ok(Some(u64::from_be_bytes(arr)))
        }
        None => Ok(None),
    }
}

/// Last value in a column family whose keys are big-endian heights.
pub fn last_json<T: DeserializeOwned>(db: &DB, family: &str) -> Result<Option<T>, StoreError> {
    let mut iter = db.iterator_cf(cf(db, family)?, rocksdb::IteratorMode::End);
    match iter.next() {
        Some(item) => {
            let (_, v) = item?;
            Ok(Some(serde_json::from_slice(&v)?))
        }
        None => Ok(None),
    }
}

/// Up to `limit` values from the end of a height-keyed column family, newest first.
pub fn tail_json<T: DeserializeOwned>(
    db: &DB,
    family: &str,
    limit: usize,
) -> Result<Vec<T>, StoreError> {
    let iter = db.iterator_cf(cf(db, family)?, rocksdb::IteratorMode::End);
    let mut out = Vec::new();
    for item in iter.take(limit) {
        let (_, v) = item?;
        out.push(serde_json::from_slice(&v)?);
    }
    Ok(out)
}
