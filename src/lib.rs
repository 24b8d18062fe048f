// src/lib.rs
// Sidechain node: asset ledger anchored to the base chain, synced by gossip

pub mod anchor;
pub mod config;
pub mod error;
pub mod ledger;
pub mod network;
pub mod storage;

use crate::anchor::{AnchorEvent, AnchorLog, AnchorTracker, BitcoindClient};
use crate::config::NodeConfig;
use crate::ledger::{parse_hash, LedgerStore};
use crate::network::{transport, GossipSynchronizer};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node: anchor tracker, gossip listener and synchronizer
    Start,
    /// Register a new asset with its initial owner (counter 0)
    IssueAsset {
        /// Asset id, 64 hex characters
        #[arg(long)]
        asset: String,
        /// Owner party id, 64 hex characters
        #[arg(long)]
        owner: String,
    },
    /// Print the current ledger tip
    Tip,
    /// Print the most recent anchor observations
    Anchors {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing(level: &str) {
    let level = tracing::Level::from_str(level).unwrap_or(tracing::Level::INFO);
    // also bridges `log` records
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}

pub async fn run() -> anyhow::Result<()> {
    // load .env for local development (if present)
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = NodeConfig::from_env()?;
    init_tracing(&cfg.log_level);

    match cli.command {
        Commands::Start => start_node(cfg).await,
        Commands::IssueAsset { asset, owner } => {
            let asset = parse_hash(&asset).map_err(|e| anyhow!("--asset: {}", e))?;
            let owner = parse_hash(&owner).map_err(|e| anyhow!("--owner: {}", e))?;
            let store = open_ledger(&cfg)?;
            let record = store.issue_asset(asset, owner)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::Tip => {
            let store = open_ledger(&cfg)?;
            println!("{}", serde_json::to_string_pretty(&store.tip())?);
            Ok(())
        }
        Commands::Anchors { limit } => {
            let db = storage::try_open_db(&cfg.rocksdb_path)?;
            let anchors = AnchorLog::new(db);
            for obs in anchors.recent(limit)? {
                println!("{}", serde_json::to_string(&obs)?);
            }
            Ok(())
        }
    }
}

fn open_ledger(cfg: &NodeConfig) -> anyhow::Result<LedgerStore> {
    let db = storage::try_open_db(&cfg.rocksdb_path)
        .with_context(|| format!("opening {}", cfg.rocksdb_path.display()))?;
    Ok(LedgerStore::open(db, cfg.genesis_anchor)?)
}

/// Run every node service until Ctrl+C.
pub async fn start_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let validation = cfg.validate();
    validation.print_summary();
    if !validation.valid {
        return Err(anyhow!(
            "invalid configuration ({} error(s))",
            validation.errors.len()
        ));
    }

    let db = storage::try_open_db(&cfg.rocksdb_path)
        .with_context(|| format!("opening {}", cfg.rocksdb_path.display()))?;
    let store = Arc::new(LedgerStore::open(db.clone(), cfg.genesis_anchor)?);
    let anchors = Arc::new(AnchorLog::new(db));
    let tip = store.tip();
    tracing::info!(
        "ledger tip at height {} ({})",
        tip.height,
        hex::encode(tip.hash)
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    // anchor tracker
    let rpc = Arc::new(BitcoindClient::new(
        &cfg.bitcoind_host,
        cfg.bitcoind_port,
        &cfg.bitcoind_user,
        &cfg.bitcoind_password,
        cfg.rpc_timeout,
    ));
    tracing::info!(
        "following {:?} anchors via {}:{} from genesis {}",
        cfg.chain,
        cfg.bitcoind_host,
        cfg.bitcoind_port,
        cfg.genesis_txid
    );
    let tracker = AnchorTracker::new(rpc, anchors.clone(), cfg.tracker_config()).spawn();
    let mut anchor_events = tracker.subscribe();
    tokio::spawn(async move {
        while let Some(ev) = anchor_events.recv().await {
            match ev {
                AnchorEvent::Anchor {
                    height,
                    txid,
                    commitment,
                } => tracing::info!(
                    "anchor {} at base height {} commits to {}",
                    txid,
                    height,
                    commitment.map(hex::encode).unwrap_or_else(|| "nothing".into())
                ),
                AnchorEvent::Tip { txid, .. } => {
                    tracing::debug!("base chain idle, current anchor {}", txid)
                }
            }
        }
    });

    // gossip
    let topic = cfg.topic();
    let (events_tx, events_rx) = mpsc::channel(1024);
    let sync = Arc::new(GossipSynchronizer::new(
        store.clone(),
        anchors.clone(),
        cfg.validator(),
        cfg.sync_interval,
    ));
    let sync_task = tokio::spawn(sync.clone().run(events_rx, shutdown_tx.subscribe()));
    let listener =
        transport::listen(&cfg.listen_addr, topic, events_tx.clone(), shutdown_tx.clone()).await?;
    for peer in &cfg.peers {
        tracing::info!("dialing peer {}", peer);
        transport::dial(peer.clone(), topic, events_tx.clone(), shutdown_tx.clone());
    }
    drop(events_tx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    tracing::info!("shutdown signal received, notifying tasks...");
    let _ = shutdown_tx.send(());
    tracker.stop().await;
    let _ = listener.await;
    let _ = sync_task.await;

    let tip = store.tip();
    tracing::info!("stopped at height {} ({})", tip.height, hex::encode(tip.hash));
    Ok(())
}
