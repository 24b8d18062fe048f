// src/network/sync.rs
// Anti-entropy: converge on the longest well-anchored chain held by any peer

use super::messages::{ChainSummary, GossipMessage};
use super::{PeerId, TransportEvent};
use crate::anchor::AnchorLog;
use crate::error::StoreError;
use crate::ledger::{import_block, Block, Hash, ImportOutcome, LedgerStore, Validator};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

const ACCEPTED_CHANNEL_CAPACITY: usize = 256;

/// A block this node adopted from a peer.
#[derive(Debug, Clone)]
pub struct AcceptedBlock {
    pub height: u64,
    pub hash: Hash,
    pub block: Block,
    pub from: PeerId,
}

pub struct GossipSynchronizer {
    store: Arc<LedgerStore>,
    anchors: Arc<AnchorLog>,
    validator: Validator,
    peers: RwLock<HashMap<PeerId, mpsc::Sender<Bytes>>>,
    accepted: broadcast::Sender<AcceptedBlock>,
    sync_interval: Duration,
}

impl GossipSynchronizer {
    pub fn new(
        store: Arc<LedgerStore>,
        anchors: Arc<AnchorLog>,
        validator: Validator,
        sync_interval: Duration,
    ) -> Self {
        let (accepted, _) = broadcast::channel(ACCEPTED_CHANNEL_CAPACITY);
        Self {
            store,
            anchors,
            validator,
            peers: RwLock::new(HashMap::new()),
            accepted,
            sync_interval,
        }
    }

    /// Blocks accepted from peers, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<AcceptedBlock> {
        self.accepted.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Local tip height and the base-chain height of the anchor it references
    /// (0 when that anchor has not been observed).
    pub fn summary(&self) -> Result<ChainSummary, StoreError> {
        let tip = self.store.tip();
        let anchor_height = self.anchors.height_of_txid(&tip.anchor_ref)?.unwrap_or(0);
        Ok(ChainSummary {
            height: tip.height,
            anchor_height,
        })
    }

    /// Drive the synchronizer until shutdown or until every transport is gone.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_event(ev).await,
                    None => break,
                },
                _ = ticker.tick() => self.request_all(),
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("gossip synchronizer stopped");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                peer,
                addr,
                outbound,
            } => {
                tracing::debug!(peer, addr = %addr, "registering peer");
                self.peers.write().insert(peer, outbound);
                self.send(peer, &GossipMessage::RequestLatest);
            }
            TransportEvent::Closed { peer } => {
                self.peers.write().remove(&peer);
            }
            TransportEvent::Data { peer, payload } => {
                let text = match std::str::from_utf8(&payload) {
                    Ok(t) => t,
                    Err(_) => {
                        tracing::debug!(peer, "ignoring non-utf8 frame");
                        return;
                    }
                };
                match text.parse::<GossipMessage>() {
                    Ok(msg) => self.handle_message(peer, msg),
                    Err(e) => tracing::debug!(peer, "ignoring message: {}", e),
                }
            }
        }
    }

    fn handle_message(&self, peer: PeerId, msg: GossipMessage) {
        tracing::trace!(peer, "received {}", msg);
        if msg.is_request() {
            match self.respond(&msg) {
                Ok(Some(reply)) => self.send(peer, &reply),
                Ok(None) => {}
                Err(e) => tracing::warn!("cannot answer {} from peer {}: {}", msg, peer, e),
            }
            return;
        }

        match msg {
            GossipMessage::Latest(remote) => {
                let local = match self.summary() {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("cannot read local summary: {}", e);
                        return;
                    }
                };
                if local.is_behind(&remote) {
                    tracing::debug!(
                        peer,
                        "peer at {}/{}, we are at {}/{}; requesting {}",
                        remote.height,
                        remote.anchor_height,
                        local.height,
                        local.anchor_height,
                        local.height + 1
                    );
                    self.send(peer, &GossipMessage::RequestBlock(local.height + 1));
                }
            }
            GossipMessage::Block { block, .. } => self.offer(peer, block),
            _ => {}
        }
    }

    /// Answer a request from committed state. `None` means stay silent.
    pub fn respond(&self, request: &GossipMessage) -> Result<Option<GossipMessage>, StoreError> {
        match request {
            GossipMessage::RequestLatest => Ok(Some(GossipMessage::Latest(self.summary()?))),
            GossipMessage::RequestBlock(height) => Ok(self.store.get_block(*height)?.map(|s| {
                GossipMessage::Block {
                    height: Some(s.height),
                    block: s.block,
                }
            })),
            GossipMessage::RequestByCommitment(commitment) => {
                if self.anchors.observation_for_commitment(commitment)?.is_none() {
                    return Ok(None);
                }
                Ok(self
                    .store
                    .get_block_by_hash(commitment)?
                    .map(|s| GossipMessage::Block {
                        height: None,
                        block: s.block,
                    }))
            }
            _ => Ok(None),
        }
    }

    fn offer(&self, peer: PeerId, block: Block) {
        match import_block(&self.store, &self.validator, &block) {
            Ok(ImportOutcome::Accepted(tip)) => {
                tracing::info!(
                    peer,
                    "accepted block {} at height {}",
                    hex::encode(tip.hash),
                    tip.height
                );
                let _ = self.accepted.send(AcceptedBlock {
                    height: tip.height,
                    hash: tip.hash,
                    block,
                    from: peer,
                });
                self.send(peer, &GossipMessage::RequestLatest);
                match self.summary() {
                    Ok(s) => self.broadcast_except(peer, &GossipMessage::Latest(s)),
                    Err(e) => tracing::warn!("cannot read local summary: {}", e),
                }
            }
            Ok(ImportOutcome::Rejected(reason)) => {
                tracing::debug!(peer, "rejected block {}: {}", block.hash_hex(), reason);
            }
            Err(e) => tracing::error!("failed to store block {}: {}", block.hash_hex(), e),
        }
    }

    /// One anti-entropy round: ask every peer for its tip.
    pub fn request_all(&self) {
        self.broadcast_except(0, &GossipMessage::RequestLatest);
    }

    fn send(&self, peer: PeerId, msg: &GossipMessage) {
        let tx = match self.peers.read().get(&peer) {
            Some(tx) => tx.clone(),
            None => return,
        };
        self.deliver(peer, tx, msg);
    }

    fn broadcast_except(&self, except: PeerId, msg: &GossipMessage) {
        let targets: Vec<(PeerId, mpsc::Sender<Bytes>)> = self
            .peers
            .read()
            .iter()
            .filter(|(id, _)| **id != except)
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        for (peer, tx) in targets {
            self.deliver(peer, tx, msg);
        }
    }

    /// Queue `msg` for `peer` without waiting. A peer whose queue is full misses
    /// the message; the periodic round asks it again later.
    fn deliver(&self, peer: PeerId, tx: mpsc::Sender<Bytes>, msg: &GossipMessage) {
        let wire = match msg.encode() {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("cannot encode {}: {}", msg, e);
                return;
            }
        };
        match tx.try_send(Bytes::from(wire)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(peer, "outbound queue full, dropping {}", msg);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(peer, "peer went away");
                self.peers.write().remove(&peer);
            }
        }
    }
}
