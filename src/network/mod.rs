// src/network/mod.rs
pub mod memory;
pub mod messages;
pub mod sync;
pub mod transport;

use crate::ledger::Hash;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

pub use messages::{ChainSummary, GossipMessage};
pub use sync::{AcceptedBlock, GossipSynchronizer};

/// Largest frame a peer may send. A TCP peer announcing a longer frame is
/// disconnected before the body is read; the in-process link drops it.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Per-connection outbound queue depth.
pub const OUTBOUND_QUEUE: usize = 64;

pub type PeerId = u64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a transport reports to the synchronizer.
#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        peer: PeerId,
        addr: String,
        outbound: mpsc::Sender<Bytes>,
    },
    Data {
        peer: PeerId,
        payload: Bytes,
    },
    Closed {
        peer: PeerId,
    },
}

/// Gossip topic shared by every node following the same genesis anchor.
pub fn topic_for(genesis_txid: &str) -> Hash {
    let mut h = Sha256::new();
    h.update(b"sidechain:");
    h.update(genesis_txid.trim().to_ascii_lowercase().as_bytes());
    h.finalize().into()
}
