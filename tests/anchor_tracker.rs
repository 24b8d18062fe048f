// tests/anchor_tracker.rs
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sidechain_node::anchor::{
    AnchorEvent, AnchorLog, AnchorSubscription, AnchorTracker, BaseChainRpc, PollOutcome,
    RpcBlock, RpcTransaction, TrackerConfig, TrackerError,
};
use sidechain_node::error::RpcFailure;
use sidechain_node::storage::try_open_db;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn txid(n: u64) -> String {
    format!("{:064x}", n)
}

fn tx(id: &str, spends: Option<&str>, commitment: Option<[u8; 32]>) -> RpcTransaction {
    let vin = match spends {
        Some(prev) => json!([{"txid": prev, "vout": 0}]),
        None => json!([{"coinbase": "03abcdef"}]),
    };
    let mut vout = vec![json!({"scriptPubKey": {"asm": "0 1234", "type": "witness_v0_keyhash"}})];
    if let Some(c) = commitment {
        vout.push(json!({"scriptPubKey": {
            "asm": format!("OP_RETURN {}", hex::encode(c)),
            "type": "nulldata"
        }}));
    }
    serde_json::from_value(json!({"txid": id, "vin": vin, "vout": vout})).unwrap()
}

fn block(height: u64, txs: Vec<RpcTransaction>) -> RpcBlock {
    let mut all = vec![tx(&txid(0xc0ffee00 + height), None, None)];
    all.extend(txs);
    RpcBlock {
        hash: format!("{:064x}", 0xb10c00 + height),
        height,
        tx: all,
    }
}

/// Base chain replaying a fixed script of tip heights; the last one repeats.
struct ScriptedChain {
    tips: Mutex<VecDeque<u64>>,
    last_tip: Mutex<u64>,
    blocks: HashMap<u64, RpcBlock>,
    genesis: RpcTransaction,
    failing_block_fetches: AtomicUsize,
    /// Block fetches that never answer.
    stalled_block_fetches: AtomicUsize,
    genesis_lookups: AtomicUsize,
}

impl ScriptedChain {
    fn new(tips: &[u64], blocks: Vec<RpcBlock>) -> Self {
        let mut genesis = tx(&txid(0x6e), Some(&txid(0x01)), None);
        genesis.blockhash = Some(format!("{:064x}", 0xb10c00 + 5));
        Self {
            tips: Mutex::new(tips.iter().copied().collect()),
            last_tip: Mutex::new(0),
            blocks: blocks.into_iter().map(|b| (b.height, b)).collect(),
            genesis,
            failing_block_fetches: AtomicUsize::new(0),
            stalled_block_fetches: AtomicUsize::new(0),
            genesis_lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BaseChainRpc for ScriptedChain {
    async fn get_chain_tip(&self) -> Result<u64, RpcFailure> {
        let mut last = self.last_tip.lock();
        if let Some(next) = self.tips.lock().pop_front() {
            *last = next;
        }
        Ok(*last)
    }

    async fn get_block_by_height(&self, height: u64) -> Result<RpcBlock, RpcFailure> {
        let failing = self.failing_block_fetches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_block_fetches.store(failing - 1, Ordering::SeqCst);
            return Err(RpcFailure::Transport {
                method: "getblockhash".into(),
                reason: "connection refused".into(),
            });
        }
        let stalled = self.stalled_block_fetches.load(Ordering::SeqCst);
        if stalled > 0 {
            self.stalled_block_fetches.store(stalled - 1, Ordering::SeqCst);
            return futures::future::pending().await;
        }
        match self.blocks.get(&height) {
            Some(b) => Ok(b.clone()),
            None => Ok(block(height, vec![])),
        }
    }

    async fn get_block_by_hash(&self, hash: &str) -> Result<RpcBlock, RpcFailure> {
        if hash == format!("{:064x}", 0xb10c00 + 5) {
            return Ok(block(5, vec![self.genesis.clone()]));
        }
        Err(RpcFailure::Response {
            method: "getblock".into(),
            message: "Block not found".into(),
        })
    }

    async fn get_raw_transaction_verbose(&self, id: &str) -> Result<RpcTransaction, RpcFailure> {
        self.genesis_lookups.fetch_add(1, Ordering::SeqCst);
        if id == self.genesis.txid {
            Ok(self.genesis.clone())
        } else {
            Err(RpcFailure::Response {
                method: "getrawtransaction".into(),
                message: "No such mempool or blockchain transaction".into(),
            })
        }
    }
}

/// Genesis confirmed at 5; first anchor at 6 with a commitment, second at 7 without.
fn chain(tips: &[u64]) -> ScriptedChain {
    ScriptedChain::new(
        tips,
        vec![
            block(6, vec![tx(&txid(0xa6), Some(&txid(0x6e)), Some([0xc6; 32]))]),
            block(
                7,
                vec![
                    tx(&txid(0x99), Some(&txid(0x42)), Some([0x99; 32])),
                    tx(&txid(0xa7), Some(&txid(0xa6)), None),
                ],
            ),
        ],
    )
}

fn config(poll: Duration) -> TrackerConfig {
    TrackerConfig {
        genesis_txid: txid(0x6e),
        poll_interval: poll,
        rpc_timeout: Duration::from_secs(5),
    }
}

async fn next_event(sub: &mut AnchorSubscription) -> AnchorEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for anchor event")
        .expect("tracker gone")
}

#[tokio::test]
async fn test_follows_spend_chain_across_polls() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AnchorLog::new(try_open_db(dir.path()).unwrap()));
    let rpc = Arc::new(chain(&[5, 5, 6, 7]));
    let mut tracker = AnchorTracker::new(rpc.clone(), log.clone(), config(Duration::from_secs(60)));
    let mut sub = tracker.subscribe();

    assert_eq!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Waiting { best_height: 5 }
    );
    assert_eq!(tracker.next_height(), Some(6));
    assert!(matches!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Waiting { .. }
    ));
    match tracker.poll_once().await.unwrap() {
        PollOutcome::Anchored(obs) => {
            assert_eq!(obs.anchor_height, 6);
            assert_eq!(obs.anchor_txid, txid(0xa6));
            assert_eq!(obs.commitment, Some([0xc6; 32]));
        }
        other => panic!("expected anchor at 6, got {:?}", other),
    }
    assert!(matches!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Anchored(ref obs) if obs.anchor_height == 7 && obs.commitment.is_none()
    ));
    assert!(matches!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Waiting { best_height: 7 }
    ));

    let tip = |id: u64, commitment| AnchorEvent::Tip {
        txid: txid(id),
        commitment,
    };
    let mut events = Vec::new();
    for _ in 0..5 {
        events.push(next_event(&mut sub).await);
    }
    assert_eq!(
        events,
        vec![
            tip(0x6e, None),
            tip(0x6e, None),
            AnchorEvent::Anchor {
                height: 6,
                txid: txid(0xa6),
                commitment: Some([0xc6; 32]),
            },
            AnchorEvent::Anchor {
                height: 7,
                txid: txid(0xa7),
                commitment: None,
            },
            tip(0xa7, None),
        ]
    );

    let recorded: Vec<u64> = log
        .recent(10)
        .unwrap()
        .into_iter()
        .map(|o| o.anchor_height)
        .collect();
    assert_eq!(recorded, vec![7, 6]);
    assert_eq!(
        log.observation_for_commitment(&[0xc6; 32])
            .unwrap()
            .map(|o| o.anchor_txid),
        Some(txid(0xa6))
    );
    // the decoy spend at 7 carried a commitment but is not on the chain
    assert!(log.observation_for_commitment(&[0x99; 32]).unwrap().is_none());
}

#[tokio::test]
async fn test_rpc_failure_keeps_cursor_and_empty_heights_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AnchorLog::new(try_open_db(dir.path()).unwrap()));
    let rpc = Arc::new(ScriptedChain::new(
        &[8],
        vec![block(8, vec![tx(&txid(0xa8), Some(&txid(0x6e)), None)])],
    ));
    rpc.failing_block_fetches.store(1, Ordering::SeqCst);
    let mut tracker = AnchorTracker::new(rpc.clone(), log.clone(), config(Duration::from_secs(60)));

    match tracker.poll_once().await {
        Err(TrackerError::Rpc(e)) => assert!(e.is_transport()),
        other => panic!("expected rpc failure, got {:?}", other),
    }
    assert_eq!(tracker.next_height(), Some(6));
    assert!(log.last().unwrap().is_none());

    assert_eq!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Skipped { height: 6 }
    );
    assert_eq!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Skipped { height: 7 }
    );
    assert!(matches!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Anchored(ref obs) if obs.anchor_height == 8
    ));
}

#[tokio::test]
async fn test_restart_resumes_from_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AnchorLog::new(try_open_db(dir.path()).unwrap()));
    {
        let rpc = Arc::new(chain(&[7]));
        let mut tracker = AnchorTracker::new(rpc, log.clone(), config(Duration::from_secs(60)));
        tracker.poll_once().await.unwrap();
        tracker.poll_once().await.unwrap();
        assert_eq!(tracker.next_height(), Some(8));
    }

    let rpc = Arc::new(chain(&[7]));
    let mut tracker = AnchorTracker::new(rpc.clone(), log.clone(), config(Duration::from_secs(60)));
    let mut sub = tracker.subscribe();
    assert_eq!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Waiting { best_height: 7 }
    );
    assert_eq!(tracker.next_height(), Some(8));
    assert_eq!(rpc.genesis_lookups.load(Ordering::SeqCst), 0);
    assert_eq!(
        next_event(&mut sub).await,
        AnchorEvent::Tip {
            txid: txid(0xa7),
            commitment: None
        }
    );
}

#[tokio::test]
async fn test_spawned_tracker_publishes_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AnchorLog::new(try_open_db(dir.path()).unwrap()));
    let rpc = Arc::new(chain(&[7]));
    let tracker = AnchorTracker::new(rpc, log.clone(), config(Duration::from_millis(20)));
    let mut sub = tracker.subscribe();
    let handle = tracker.spawn();

    let mut anchors = Vec::new();
    while anchors.len() < 2 {
        if let AnchorEvent::Anchor { height, .. } = next_event(&mut sub).await {
            anchors.push(height);
        }
    }
    assert_eq!(anchors, vec![6, 7]);

    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("tracker did not stop");
    assert_eq!(log.last().unwrap().map(|o| o.anchor_height), Some(7));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_rpc_times_out_and_keeps_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AnchorLog::new(try_open_db(dir.path()).unwrap()));
    let rpc = Arc::new(chain(&[7]));
    rpc.stalled_block_fetches.store(1, Ordering::SeqCst);
    let mut tracker = AnchorTracker::new(rpc.clone(), log.clone(), config(Duration::from_secs(60)));

    match tracker.poll_once().await {
        Err(TrackerError::Rpc(RpcFailure::Timeout { method, secs })) => {
            assert_eq!(method, "getblock");
            assert_eq!(secs, 5);
        }
        other => panic!("expected rpc timeout, got {:?}", other),
    }
    assert_eq!(tracker.next_height(), Some(6));
    assert!(log.last().unwrap().is_none());

    assert!(matches!(
        tracker.poll_once().await.unwrap(),
        PollOutcome::Anchored(ref obs) if obs.anchor_height == 6
    ));
}

#[tokio::test(start_paused = true)]
async fn test_spawned_tracker_outlives_stalled_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AnchorLog::new(try_open_db(dir.path()).unwrap()));
    let rpc = Arc::new(chain(&[7]));
    rpc.stalled_block_fetches.store(2, Ordering::SeqCst);
    let tracker = AnchorTracker::new(
        rpc.clone(),
        log.clone(),
        TrackerConfig {
            rpc_timeout: Duration::from_secs(1),
            ..config(Duration::from_millis(20))
        },
    );
    let mut sub = tracker.subscribe();
    let handle = tracker.spawn();

    let first = loop {
        if let AnchorEvent::Anchor { height, .. } = next_event(&mut sub).await {
            break height;
        }
    };
    assert_eq!(first, 6);
    assert_eq!(rpc.stalled_block_fetches.load(Ordering::SeqCst), 0);

    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("tracker did not stop");
    assert!(log.last().unwrap().is_some());
}
