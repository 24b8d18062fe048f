// src/network/memory.rs
// In-process links between synchronizers, used by tests and local tooling

use super::{next_peer_id, PeerId, TransportEvent, MAX_FRAME_LEN, OUTBOUND_QUEUE};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Connect two event sinks as if over a socket. Returns the peer id each side
/// sees for the other: `(id_of_b_at_a, id_of_a_at_b)`.
pub async fn connect(
    a: &mpsc::Sender<TransportEvent>,
    b: &mpsc::Sender<TransportEvent>,
) -> anyhow::Result<(PeerId, PeerId)> {
    let b_at_a = next_peer_id();
    let a_at_b = next_peer_id();

    let (a_out, a_out_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
    let (b_out, b_out_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);

    // a's outbound lands at b, tagged with a's id as b knows it
    tokio::spawn(forward(a_out_rx, b.clone(), a_at_b, a.clone(), b_at_a));
    tokio::spawn(forward(b_out_rx, a.clone(), b_at_a, b.clone(), a_at_b));

    a.send(TransportEvent::Connected {
        peer: b_at_a,
        addr: format!("memory:{}", b_at_a),
        outbound: a_out,
    })
    .await?;
    b.send(TransportEvent::Connected {
        peer: a_at_b,
        addr: format!("memory:{}", a_at_b),
        outbound: b_out,
    })
    .await?;
    Ok((b_at_a, a_at_b))
}

async fn forward(
    mut rx: mpsc::Receiver<Bytes>,
    remote: mpsc::Sender<TransportEvent>,
    as_seen_by_remote: PeerId,
    local: mpsc::Sender<TransportEvent>,
    as_seen_locally: PeerId,
) {
    while let Some(payload) = rx.recv().await {
        if payload.len() > MAX_FRAME_LEN {
            tracing::warn!(
                peer = as_seen_by_remote,
                len = payload.len(),
                "dropping oversized frame"
            );
            continue;
        }
        let ev = TransportEvent::Data {
            peer: as_seen_by_remote,
            payload,
        };
        if remote.send(ev).await.is_err() {
            break;
        }
    }
    let _ = remote
        .send(TransportEvent::Closed {
            peer: as_seen_by_remote,
        })
        .await;
    let _ = local
        .send(TransportEvent::Closed {
            peer: as_seen_locally,
        })
        .await;
}
