// src/network/transport.rs
// TCP gossip transport: length-delimited frames, topic handshake, dial backoff

use super::{next_peer_id, PeerId, TransportEvent, MAX_FRAME_LEN, OUTBOUND_QUEUE};
use crate::ledger::Hash;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect delay schedule: 5s, 10s, 20s, ... capped at 300s.
#[derive(Debug, Default, Clone)]
pub struct DialBackoff {
    failures: u32,
}

impl DialBackoff {
    pub const BASE_SECS: u64 = 5;
    pub const MAX_SECS: u64 = 300;

    pub fn record_failure(&mut self) -> Duration {
        let exp = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        let secs = Self::BASE_SECS
            .saturating_mul(1u64 << exp)
            .min(Self::MAX_SECS);
        Duration::from_secs(secs)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Length-prefixed frames; a prefix above `MAX_FRAME_LEN` fails the read before
/// the body is buffered.
fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Exchange topics in the first frame of each direction.
async fn handshake<S>(framed: &mut Framed<S, LengthDelimitedCodec>, topic: &Hash) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Bytes::copy_from_slice(topic)).await?;
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| anyhow!("handshake timed out"))?
        .ok_or_else(|| anyhow!("closed during handshake"))??;
    if first.as_ref() != topic.as_slice() {
        return Err(anyhow!("topic mismatch: {}", hex::encode(&first)));
    }
    Ok(())
}

/// Pump frames between the socket and the synchronizer until either side closes.
async fn serve<S>(
    mut framed: Framed<S, LengthDelimitedCodec>,
    addr: String,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer: PeerId = next_peer_id();
    let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
    if events
        .send(TransportEvent::Connected {
            peer,
            addr: addr.clone(),
            outbound,
        })
        .await
        .is_err()
    {
        return;
    }
    tracing::info!(peer, addr = %addr, "peer connected");

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    // the synchronizer never waits on outbound queues, so this drains
                    let ev = TransportEvent::Data { peer, payload: bytes.freeze() };
                    if events.send(ev).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("read error from {}: {}", addr, e);
                    break;
                }
                None => break,
            },
            out = outbound_rx.recv() => match out {
                Some(payload) => {
                    if let Err(e) = framed.send(payload).await {
                        tracing::warn!("write error to {}: {}", addr, e);
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }

    tracing::info!(peer, addr = %addr, "peer disconnected");
    let _ = events.send(TransportEvent::Closed { peer }).await;
}

/// Bind the gossip listener and accept peers in the background.
pub async fn listen(
    listen_addr: &str,
    topic: Hash,
    events: mpsc::Sender<TransportEvent>,
    shutdown: broadcast::Sender<()>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow!("failed to bind gossip listener {}: {}", listen_addr, e))?;
    tracing::info!("gossip listener bound to {}", listen_addr);

    let mut stop = shutdown.subscribe();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let events = events.clone();
                        let conn_shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            let mut framed = Framed::new(stream, frame_codec());
                            match handshake(&mut framed, &topic).await {
                                Ok(()) => serve(framed, peer_addr.to_string(), events, conn_shutdown).await,
                                Err(e) => tracing::warn!("handshake failed from {}: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => tracing::warn!("accept error: {}", e),
                },
                _ = stop.recv() => {
                    tracing::info!("gossip listener shutting down");
                    break;
                }
            }
        }
    }))
}

/// Keep a connection to `addr` open, reconnecting with backoff.
pub fn dial(
    addr: String,
    topic: Hash,
    events: mpsc::Sender<TransportEvent>,
    shutdown: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let mut backoff = DialBackoff::default();
        loop {
            match connect(&addr, &topic).await {
                Ok(framed) => {
                    backoff.reset();
                    serve(framed, addr.clone(), events.clone(), shutdown.subscribe()).await;
                }
                Err(e) => tracing::debug!("dial {} failed: {}", addr, e),
            }
            if events.is_closed() {
                break;
            }
            let delay = backoff.record_failure();
            tracing::debug!("redialing {} in {:?}", addr, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.recv() => break,
            }
        }
    })
}

async fn connect(addr: &str, topic: &Hash) -> Result<Framed<TcpStream, LengthDelimitedCodec>> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| anyhow!("connect failed: {}", e))?;
    let mut framed = Framed::new(stream, frame_codec());
    handshake(&mut framed, topic).await?;
    Ok(framed)
}
