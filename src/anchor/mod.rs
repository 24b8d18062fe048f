// src/anchor/mod.rs
pub mod log;
pub mod rpc;
pub mod tracker;

pub use self::log::{AnchorLog, AnchorObservation};
pub use self::rpc::{BaseChainRpc, BitcoindClient, RpcBlock, RpcTransaction};
pub use self::tracker::{
    AnchorEvent, AnchorSubscription, AnchorTracker, PollOutcome, TrackerConfig, TrackerError,
    TrackerHandle,
};
