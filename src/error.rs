// src/error.rs
// Error kinds shared across the ledger, anchor and gossip layers

use thiserror::Error;

/// Structural decode failures. Fatal to the decode only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),
    #[error("malformed block: {0}")]
    MalformedBlock(String),
}

/// Reasons a candidate block is refused. The block is dropped, never partially applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("previous block {got} does not match tip {expected}")]
    ChainMismatch { expected: String, got: String },
    #[error("tx {tx}: asset {asset} is not owned by {from}")]
    OwnershipViolation {
        tx: String,
        asset: String,
        from: String,
    },
    #[error("tx {tx}: expected counter {expected}, got {got}")]
    CounterMismatch { tx: String, expected: u64, got: u64 },
    #[error("tx {tx}: unknown asset {asset}")]
    UnknownAsset { tx: String, asset: String },
    #[error("tx {tx}: invalid signature")]
    InvalidSignature { tx: String },
    #[error("store read failed: {0}")]
    Store(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another writer advanced the tip first; re-validate against the new tip.
    #[error("stale tip: block extends {expected} but tip is {actual}")]
    StaleTip { expected: String, actual: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("asset {0} already issued")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Failures talking to the base-chain node. Always retried by the tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcFailure {
    #[error("{method}: transport error: {reason}")]
    Transport { method: String, reason: String },
    #[error("{method}: bad response status {status}")]
    Status { method: String, status: u16 },
    #[error("{method}: response is not JSON: {body}")]
    InvalidJson { method: String, body: String },
    #[error("{method}: rpc error: {message}")]
    Response { method: String, message: String },
    #[error("{method}: timed out after {secs}s")]
    Timeout { method: String, secs: u64 },
    #[error("{method}: unexpected result shape: {reason}")]
    UnexpectedShape { method: String, reason: String },
}

impl RpcFailure {
    /// True for failures that never reached an application-level answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcFailure::Transport { .. } | RpcFailure::Timeout { .. } | RpcFailure::Status { .. }
        )
    }
}

/// Unparseable gossip frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message: {0}")]
    Unknown(String),
    #[error("bad height in {0}")]
    BadHeight(String),
    #[error("bad commitment: {0}")]
    BadCommitment(String),
    #[error("bad payload: {0}")]
    BadPayload(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}
