// src/anchor/tracker.rs
// Follows the anchor spend-chain on the base chain and publishes anchor/tip events

use super::log::{AnchorLog, AnchorObservation};
use super::rpc::BaseChainRpc;
use crate::error::{RpcFailure, StoreError};
use crate::ledger::Hash;
use chrono::Utc;
use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorEvent {
    /// The spend-chain moved: `txid` spends output 0 of the previous anchor.
    Anchor {
        height: u64,
        txid: String,
        commitment: Option<Hash>,
    },
    /// No new base-chain block yet; current anchor restated.
    Tip {
        txid: String,
        commitment: Option<Hash>,
    },
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub genesis_txid: String,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Rpc(#[from] RpcFailure),
    #[error("anchor log: {0}")]
    Store(#[from] StoreError),
}

/// Result of one poll step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Base chain has not reached the next height.
    Waiting { best_height: u64 },
    Anchored(AnchorObservation),
    /// Height inspected, no spend of the current anchor in it.
    Skipped { height: u64 },
}

#[derive(Debug, Clone)]
struct Cursor {
    next_height: u64,
    current_txid: String,
    last_commitment: Option<Hash>,
}

pub struct AnchorTracker {
    rpc: Arc<dyn BaseChainRpc>,
    log: Arc<AnchorLog>,
    config: TrackerConfig,
    events: broadcast::Sender<AnchorEvent>,
    cursor: Option<Cursor>,
}

impl AnchorTracker {
    pub fn new(rpc: Arc<dyn BaseChainRpc>, log: Arc<AnchorLog>, config: TrackerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            rpc,
            log,
            config,
            events,
            cursor: None,
        }
    }

    pub fn subscribe(&self) -> AnchorSubscription {
        AnchorSubscription {
            rx: self.events.subscribe(),
        }
    }

    /// Next base-chain height to inspect, once positioned.
    pub fn next_height(&self) -> Option<u64> {
        self.cursor.as_ref().map(|c| c.next_height)
    }

    async fn call<T, F>(&self, method: &'static str, fut: F) -> Result<T, RpcFailure>
    where
        F: Future<Output = Result<T, RpcFailure>>,
    {
        match tokio::time::timeout(self.config.rpc_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(RpcFailure::Timeout {
                method: method.to_string(),
                secs: self.config.rpc_timeout.as_secs(),
            }),
        }
    }

    /// Position the cursor: after the last logged observation, or just above the
    /// block containing the genesis anchor.
    pub async fn resume(&mut self) -> Result<(), TrackerError> {
        if let Some(last) = self.log.last()? {
            log::info!(
                "resuming anchor tracking after height {} (anchor {})",
                last.anchor_height,
                last.anchor_txid
            );
            self.cursor = Some(Cursor {
                next_height: last.anchor_height + 1,
                current_txid: last.anchor_txid,
                last_commitment: last.commitment,
            });
            return Ok(());
        }

        let genesis = self.config.genesis_txid.clone();
        let tx = self
            .call(
                "getrawtransaction",
                self.rpc.get_raw_transaction_verbose(&genesis),
            )
            .await?;
        let blockhash = tx.blockhash.ok_or_else(|| RpcFailure::UnexpectedShape {
            method: "getrawtransaction".to_string(),
            reason: format!("genesis {} is not confirmed", genesis),
        })?;
        let block = self
            .call("getblock", self.rpc.get_block_by_hash(&blockhash))
            .await?;
        log::info!(
            "genesis anchor {} confirmed at height {}",
            genesis,
            block.height
        );
        self.cursor = Some(Cursor {
            next_height: block.height + 1,
            current_txid: genesis,
            last_commitment: None,
        });
        Ok(())
    }

    /// Inspect the next base-chain height if it exists.
    ///
    /// On failure the cursor is left untouched so the same height is retried.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, TrackerError> {
        if self.cursor.is_none() {
            self.resume().await?;
        }
        let cursor = match self.cursor.clone() {
            Some(c) => c,
            None => return Err(StoreError::NotFound("anchor cursor".into()).into()),
        };

        let best_height = self.call("getchaintips", self.rpc.get_chain_tip()).await?;
        if best_height < cursor.next_height {
            log::debug!(
                "base chain at {}, waiting for {}",
                best_height,
                cursor.next_height
            );
            self.emit(AnchorEvent::Tip {
                txid: cursor.current_txid,
                commitment: cursor.last_commitment,
            });
            return Ok(PollOutcome::Waiting { best_height });
        }

        let height = cursor.next_height;
        log::debug!("inspecting base-chain block {}", height);
        let block = self
            .call("getblock", self.rpc.get_block_by_height(height))
            .await?;

        let spend = block
            .tx
            .iter()
            .skip(1)
            .find(|tx| tx.spends(&cursor.current_txid, 0));

        let outcome = match spend {
            Some(tx) => {
                let obs = AnchorObservation {
                    anchor_height: height,
                    anchor_txid: tx.txid.clone(),
                    commitment: tx.commitment(),
                    observed_at: Utc::now(),
                };
                self.log.record(&obs)?;
                log::info!(
                    "anchor {} at height {} (commitment {})",
                    obs.anchor_txid,
                    height,
                    obs.commitment.map(hex::encode).unwrap_or_else(|| "none".into())
                );
                self.cursor = Some(Cursor {
                    next_height: height + 1,
                    current_txid: obs.anchor_txid.clone(),
                    last_commitment: obs.commitment,
                });
                self.emit(AnchorEvent::Anchor {
                    height,
                    txid: obs.anchor_txid.clone(),
                    commitment: obs.commitment,
                });
                PollOutcome::Anchored(obs)
            }
            None => {
                if let Some(c) = self.cursor.as_mut() {
                    c.next_height = height + 1;
                }
                PollOutcome::Skipped { height }
            }
        };
        Ok(outcome)
    }

    fn emit(&self, event: AnchorEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Run the poll loop on the runtime until the handle is stopped or dropped.
    pub fn spawn(self) -> TrackerHandle {
        let (shutdown, shutdown_rx) = broadcast::channel::<()>(1);
        let events = self.events.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        TrackerHandle {
            shutdown,
            events,
            join,
        }
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.config.poll_interval;
        loop {
            let pause = match self.poll_once().await {
                Ok(PollOutcome::Waiting { .. }) => Some(interval),
                Ok(_) => None,
                Err(TrackerError::Rpc(e)) => {
                    log::warn!("anchor poll failed: {}; retrying in {:?}", e, interval);
                    Some(interval)
                }
                Err(TrackerError::Store(e)) => {
                    log::error!("anchor log write failed: {}; retrying in {:?}", e, interval);
                    Some(interval)
                }
            };

            match pause {
                Some(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = shutdown.recv() => break,
                    }
                }
                None => match shutdown.try_recv() {
                    Err(broadcast::error::TryRecvError::Empty) => {}
                    _ => break,
                },
            }
        }
        log::info!("anchor tracker stopped");
    }
}

/// Receives anchor and tip events published after the subscription was created.
pub struct AnchorSubscription {
    rx: broadcast::Receiver<AnchorEvent>,
}

impl AnchorSubscription {
    /// Next event; `None` once the tracker is gone. Events missed by a slow
    /// subscriber are skipped.
    pub async fn recv(&mut self) -> Option<AnchorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("anchor subscriber lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = AnchorEvent> {
        BroadcastStream::new(self.rx).filter_map(|res| match res {
            Ok(ev) => Some(ev),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                log::warn!("anchor subscriber lagged, skipped {} events", n);
                None
            }
        })
    }
}

pub struct TrackerHandle {
    shutdown: broadcast::Sender<()>,
    events: broadcast::Sender<AnchorEvent>,
    join: JoinHandle<()>,
}

impl TrackerHandle {
    pub fn subscribe(&self) -> AnchorSubscription {
        AnchorSubscription {
            rx: self.events.subscribe(),
        }
    }

    /// Cancel the poll loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            log::error!("anchor tracker task failed: {}", e);
        }
    }
}
