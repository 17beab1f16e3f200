//! ConnIO: per-connection request/response bridge (see spec §4.1).
//!
//! Wraps one client stream: reads `CoordinateRequest`s off an inbound channel
//! and turns them into binding updates (→ Binder), tunnel updates (→
//! Tunneler), and ready-for-handshake signals (→ Handshaker). Outbound
//! `CoordinateResponse`s (mapping diffs from this peer's Mapper, or an
//! authorization/unhealthy error) are enqueued non-blockingly; a full buffer
//! is a fatal protocol error for the connection, matching the teacher's
//! `let _ = tx.try_send(...)` outbound idiom.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Authorizer;
use crate::handshaker::ReadyForHandshake;
use crate::model::{
    Binding, CoordinateRequest, CoordinateResponse, PeerUpdateKind, TunnelKey, TunnelUpdate,
};

const OUTBOUND_BUFFER: usize = 32;

/// Handle to one connected peer's stream. Shared (`Arc`) between the
/// Querier's `mappers` map, the Mapper's output task, and the inbound
/// request-handling task spawned by `ConnIo::spawn`.
pub struct ConnIo {
    peer_id: Uuid,
    outbound_tx: mpsc::Sender<CoordinateResponse>,
    overwrites: AtomicU64,
    cancel: CancellationToken,
}

impl ConnIo {
    /// Spawns the inbound-request handling loop. Returns the shared handle,
    /// the outbound receiver for the transport layer to drain, and the
    /// task's `JoinHandle` so callers can await full teardown.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        peer_id: Uuid,
        authorizer: Arc<dyn Authorizer>,
        inbound_rx: mpsc::Receiver<CoordinateRequest>,
        binder_tx: mpsc::UnboundedSender<Binding>,
        tunnel_tx: mpsc::UnboundedSender<TunnelUpdate>,
        handshake_tx: mpsc::Sender<ReadyForHandshake>,
    ) -> (Arc<Self>, mpsc::Receiver<CoordinateResponse>, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = Arc::new(Self {
            peer_id,
            outbound_tx,
            overwrites: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        let task = tokio::spawn(handle_inbound(
            conn.clone(),
            authorizer,
            inbound_rx,
            binder_tx,
            tunnel_tx,
            handshake_tx,
        ));
        (conn, outbound_rx, task)
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn overwrites(&self) -> u64 {
        self.overwrites.load(Ordering::SeqCst)
    }

    /// Bumped by the Querier when this connection displaces an older one for
    /// the same peer_id (spec §4.5.4).
    pub fn record_overwrite(&self) {
        self.overwrites.fetch_add(1, Ordering::SeqCst);
    }

    /// Non-blocking enqueue. A full buffer means this peer can't keep up;
    /// per spec §4.1 that's a fatal protocol error, so the connection closes.
    pub fn enqueue(&self, resp: CoordinateResponse) {
        if self.outbound_tx.try_send(resp).is_err() {
            warn!(peer_id = %self.peer_id, "outbound buffer full, closing connection");
            self.cancel.cancel();
        }
    }

    /// Requests the inbound loop to stop. Idempotent; safe to call from the
    /// Querier when displacing a duplicate connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn handle_inbound(
    conn: Arc<ConnIo>,
    authorizer: Arc<dyn Authorizer>,
    mut inbound_rx: mpsc::Receiver<CoordinateRequest>,
    binder_tx: mpsc::UnboundedSender<Binding>,
    tunnel_tx: mpsc::UnboundedSender<TunnelUpdate>,
    handshake_tx: mpsc::Sender<ReadyForHandshake>,
) {
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            maybe = inbound_rx.recv() => {
                match maybe {
                    None => break,
                    Some(req) => {
                        handle_request(&conn, &authorizer, req, &binder_tx, &tunnel_tx, &handshake_tx).await;
                    }
                }
            }
        }
    }
    debug!(peer_id = %conn.peer_id, "conn io closing, emitting disconnect");
    let _ = binder_tx.send(Binding {
        peer_id: conn.peer_id,
        node: None,
        kind: PeerUpdateKind::Disconnected,
    });
    let _ = tunnel_tx.send(TunnelUpdate {
        key: TunnelKey {
            src: conn.peer_id,
            dst: Uuid::nil(),
        },
        active: false,
    });
}

async fn handle_request(
    conn: &Arc<ConnIo>,
    authorizer: &Arc<dyn Authorizer>,
    req: CoordinateRequest,
    binder_tx: &mpsc::UnboundedSender<Binding>,
    tunnel_tx: &mpsc::UnboundedSender<TunnelUpdate>,
    handshake_tx: &mpsc::Sender<ReadyForHandshake>,
) {
    match req {
        CoordinateRequest::UpdateSelf(node) => {
            let _ = binder_tx.send(Binding {
                peer_id: conn.peer_id,
                node: Some(node),
                kind: PeerUpdateKind::Node,
            });
        }
        CoordinateRequest::AddTunnel(dst) => {
            if let Err(e) = authorizer.authorize_tunnel(conn.peer_id, dst).await {
                conn.enqueue(CoordinateResponse::Error(e.to_string()));
                return;
            }
            let _ = tunnel_tx.send(TunnelUpdate {
                key: TunnelKey {
                    src: conn.peer_id,
                    dst,
                },
                active: true,
            });
        }
        CoordinateRequest::RemoveTunnel(dst) => {
            let _ = tunnel_tx.send(TunnelUpdate {
                key: TunnelKey {
                    src: conn.peer_id,
                    dst,
                },
                active: false,
            });
        }
        CoordinateRequest::ReadyForHandshake(to) => {
            let _ = handshake_tx
                .send(ReadyForHandshake {
                    to,
                    from: conn.peer_id,
                })
                .await;
        }
        CoordinateRequest::Disconnect => conn.close(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, DenyAll};
    use crate::node::Node;
    use std::time::Duration;

    #[tokio::test]
    async fn update_self_forwards_node_binding() {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (binder_tx, mut binder_rx) = mpsc::unbounded_channel();
        let (tunnel_tx, _tunnel_rx) = mpsc::unbounded_channel();
        let (handshake_tx, _handshake_rx) = mpsc::channel(8);
        let peer = Uuid::new_v4();
        let (_conn, _outbound_rx, task) = ConnIo::spawn(
            peer,
            Arc::new(AllowAll),
            inbound_rx,
            binder_tx,
            tunnel_tx,
            handshake_tx,
        );
        let node = Node::from_bytes(vec![1, 2, 3]);
        inbound_tx
            .send(CoordinateRequest::UpdateSelf(node.clone()))
            .await
            .unwrap();
        let binding = binder_rx.recv().await.unwrap();
        assert_eq!(binding.peer_id, peer);
        assert!(matches!(binding.kind, PeerUpdateKind::Node));
        assert_eq!(binding.node.unwrap(), node);
        drop(inbound_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn denied_tunnel_emits_error_without_closing() {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (binder_tx, _binder_rx) = mpsc::unbounded_channel();
        let (tunnel_tx, mut tunnel_rx) = mpsc::unbounded_channel();
        let (handshake_tx, _handshake_rx) = mpsc::channel(8);
        let peer = Uuid::new_v4();
        let (conn, mut outbound_rx, _task) = ConnIo::spawn(
            peer,
            Arc::new(DenyAll),
            inbound_rx,
            binder_tx,
            tunnel_tx,
            handshake_tx,
        );
        inbound_tx
            .send(CoordinateRequest::AddTunnel(Uuid::new_v4()))
            .await
            .unwrap();
        let resp = outbound_rx.recv().await.unwrap();
        assert!(matches!(resp, CoordinateResponse::Error(_)));
        assert!(!conn.is_closed());
        let res = tokio::time::timeout(Duration::from_millis(20), tunnel_rx.recv()).await;
        assert!(res.is_err(), "no tunnel update should have been sent");
    }

    #[tokio::test]
    async fn disconnect_request_closes_and_emits_cleanup() {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (binder_tx, mut binder_rx) = mpsc::unbounded_channel();
        let (tunnel_tx, mut tunnel_rx) = mpsc::unbounded_channel();
        let (handshake_tx, _handshake_rx) = mpsc::channel(8);
        let peer = Uuid::new_v4();
        let (_conn, _outbound_rx, task) = ConnIo::spawn(
            peer,
            Arc::new(AllowAll),
            inbound_rx,
            binder_tx,
            tunnel_tx,
            handshake_tx,
        );
        inbound_tx.send(CoordinateRequest::Disconnect).await.unwrap();
        task.await.unwrap();
        let binding = binder_rx.recv().await.unwrap();
        assert!(matches!(binding.kind, PeerUpdateKind::Disconnected));
        let tunnel = tunnel_rx.recv().await.unwrap();
        assert_eq!(tunnel.key.dst, Uuid::nil());
        assert!(!tunnel.active);
    }
}
