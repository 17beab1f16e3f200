//! Coordinator: wires the five components into one running replica (see
//! spec §2, §9 design notes).
//!
//! Dependency order follows spec §2: Heartbeats first (Binder/Tunneler/
//! Querier worker pools wait on its start gate), then Binder, Tunneler,
//! Handshaker, then Querier on top. `new` returns once every component's
//! background tasks are spawned; `shutdown` tears them down in the order
//! the original `pgCoord.Close()` does: cancel, drain Querier (which itself
//! drains Heartbeats), then Binder, Tunneler, Handshaker.

use std::sync::Arc;

use uuid::Uuid;

use crate::auth::Authorizer;
use crate::binder::Binder;
use crate::connio::ConnIo;
use crate::handshaker::Handshaker;
use crate::heartbeats::Heartbeats;
use crate::model::{CoordinateRequest, CoordinateResponse, PeerUpdateKind};
use crate::pubsub::Pubsub;
use crate::querier::Querier;
use crate::startgate::start_gate;
use crate::store::Store;
use crate::tunneler::Tunneler;

/// A single running coordinator replica, identified by `self_id`.
pub struct Coordinator {
    self_id: Uuid,
    store: Arc<dyn Store>,
    heartbeats: Arc<Heartbeats>,
    binder: Binder,
    tunneler: Tunneler,
    handshaker: Handshaker,
    querier: Querier,
}

impl Coordinator {
    pub fn new(self_id: Uuid, store: Arc<dyn Store>, pubsub: Arc<dyn Pubsub>) -> Self {
        Self::with_config(
            self_id,
            store,
            pubsub,
            crate::heartbeats::DEFAULT_HEARTBEAT_PERIOD,
            crate::heartbeats::DEFAULT_MISSED_HEARTBEATS,
            crate::heartbeats::DEFAULT_CLEANUP_PERIOD,
        )
    }

    /// Same as [`Coordinator::new`] but with the heartbeat tunables and
    /// cleanup sweep interval taken from a [`crate::config::ServerConfig`]
    /// rather than the defaults.
    pub fn with_config(
        self_id: Uuid,
        store: Arc<dyn Store>,
        pubsub: Arc<dyn Pubsub>,
        heartbeat_period: std::time::Duration,
        missed_heartbeats: u32,
        cleanup_period: std::time::Duration,
    ) -> Self {
        let (gate_opener, start_gate) = start_gate();
        let (heartbeats, hb_updates) = Heartbeats::with_period(
            self_id,
            store.clone(),
            pubsub.clone(),
            gate_opener,
            heartbeat_period,
            missed_heartbeats,
            cleanup_period,
        );
        let heartbeats = Arc::new(heartbeats);

        let binder = Binder::new(self_id, store.clone(), pubsub.clone(), start_gate.clone());
        let tunneler = Tunneler::new(self_id, store.clone(), pubsub.clone(), start_gate.clone());
        let handshaker = Handshaker::new(pubsub.clone());
        let querier = Querier::new(store.clone(), pubsub, heartbeats.clone(), hb_updates);

        Self {
            self_id,
            store,
            heartbeats,
            binder,
            tunneler,
            handshaker,
            querier,
        }
    }

    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    /// Whether this replica still considers itself able to serve writes
    /// (spec §7 "replica unhealthy").
    pub fn is_healthy(&self) -> bool {
        self.querier.is_healthy()
    }

    /// Accepts a newly established client stream. `conn` must already be
    /// spawned (see [`ConnIo::spawn`]) with its inbound requests wired to
    /// this coordinator's `binder_sender`/`tunneler_sender`/
    /// `handshaker_sender`; this only registers it with the Querier so it
    /// starts receiving mapping updates.
    pub fn accept(&self, conn: Arc<ConnIo>) {
        self.querier.register(conn);
    }

    /// Tears down `conn`'s Mapper once its inbound task has finished.
    /// Callers must invoke this after awaiting the `JoinHandle` returned by
    /// [`ConnIo::spawn`]; otherwise a peer that disconnects and reconnects
    /// to this replica finds its stale Mapper still registered, which
    /// [`Querier::register`]'s displacement logic would misreport as a live
    /// duplicate connection.
    pub async fn disconnect(&self, conn: &Arc<ConnIo>) {
        self.querier.unregister(conn).await;
    }

    pub fn binder_sender(&self) -> tokio::sync::mpsc::UnboundedSender<crate::model::Binding> {
        self.binder.sender()
    }

    pub fn tunneler_sender(&self) -> tokio::sync::mpsc::UnboundedSender<crate::model::TunnelUpdate> {
        self.tunneler.sender()
    }

    pub fn handshaker_sender(
        &self,
    ) -> tokio::sync::mpsc::Sender<crate::handshaker::ReadyForHandshake> {
        self.handshaker.sender()
    }

    /// Direct-query accessor bypassing the Querier/Mapper machinery
    /// entirely: queries the store for every binding of `peer_id`, applies
    /// the Heartbeats filter, and returns the most recently updated NODE
    /// mapping's node, or `None` if the peer has no live NODE binding.
    pub async fn node(&self, peer_id: Uuid) -> Result<Option<crate::node::Node>, crate::error::CoordinatorError> {
        let bindings = self.store.get_tailnet_peers(peer_id).await?;
        let mappings: Vec<crate::model::Mapping> =
            bindings.into_iter().map(crate::model::Mapping::from).collect();
        let filtered = self.heartbeats.filter(mappings);
        let best = filtered
            .into_iter()
            .filter(|m| matches!(m.kind, PeerUpdateKind::Node))
            .max_by_key(|m| m.updated_at);
        Ok(best.map(|m| m.node))
    }

    /// Cancels and drains every component in dependency order: Querier
    /// first (it holds the only other `Arc<Heartbeats>` clones, via its
    /// Mappers), then Heartbeats, then Binder, Tunneler, Handshaker.
    pub async fn shutdown(self) {
        self.querier.close().await;
        match Arc::try_unwrap(self.heartbeats) {
            Ok(hb) => hb.close().await,
            Err(_) => unreachable!("heartbeats still referenced after querier shutdown"),
        }
        self.binder.close().await;
        self.tunneler.close().await;
        self.handshaker.close().await;
    }
}

/// Spawns a `ConnIo` wired into this coordinator's Binder/Tunneler/
/// Handshaker and registers it with the Querier. Returns the connection
/// handle and the outbound receiver the transport layer should drain. A
/// background task reaps the Mapper registration once the connection's
/// inbound task exits (see [`Coordinator::disconnect`]).
pub fn connect(
    coordinator: Arc<Coordinator>,
    peer_id: Uuid,
    authorizer: Arc<dyn Authorizer>,
    inbound_rx: tokio::sync::mpsc::Receiver<CoordinateRequest>,
) -> (Arc<ConnIo>, tokio::sync::mpsc::Receiver<CoordinateResponse>) {
    let (conn, outbound_rx, task) = ConnIo::spawn(
        peer_id,
        authorizer,
        inbound_rx,
        coordinator.binder_sender(),
        coordinator.tunneler_sender(),
        coordinator.handshaker_sender(),
    );
    coordinator.accept(conn.clone());
    let reap_coordinator = coordinator.clone();
    let reap_conn = conn.clone();
    tokio::spawn(async move {
        let _ = task.await;
        reap_coordinator.disconnect(&reap_conn).await;
    });
    (conn, outbound_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::node::Node;
    use crate::pubsub::LocalPubsub;
    use crate::store::SqliteStore;
    use tokio::sync::mpsc;

    fn test_coordinator() -> (Arc<Coordinator>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_memory().unwrap());
        let pubsub: Arc<dyn Pubsub> = LocalPubsub::new();
        let self_id = Uuid::new_v4();
        let coordinator = Arc::new(Coordinator::new(self_id, store.clone(), pubsub));
        (coordinator, store)
    }

    #[tokio::test]
    async fn basic_tunnel_delivers_mutual_updates() {
        let (coordinator, _store) = test_coordinator();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (a_inbound_tx, a_inbound_rx) = mpsc::channel(8);
        let (a_conn, mut a_outbound_rx) =
            connect(coordinator.clone(), a, Arc::new(AllowAll), a_inbound_rx);
        let (b_inbound_tx, b_inbound_rx) = mpsc::channel(8);
        let (_b_conn, mut b_outbound_rx) =
            connect(coordinator.clone(), b, Arc::new(AllowAll), b_inbound_rx);

        a_inbound_tx
            .send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"a1".to_vec())))
            .await
            .unwrap();
        b_inbound_tx
            .send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"b1".to_vec())))
            .await
            .unwrap();
        a_inbound_tx
            .send(CoordinateRequest::AddTunnel(b))
            .await
            .unwrap();
        b_inbound_tx
            .send(CoordinateRequest::AddTunnel(a))
            .await
            .unwrap();

        let resp = a_outbound_rx.recv().await.unwrap();
        let CoordinateResponse::PeerUpdates(update) = resp else {
            panic!("expected PeerUpdates");
        };
        assert_eq!(update[0].id, b);
        assert_eq!(update[0].reason, "new");

        let resp = b_outbound_rx.recv().await.unwrap();
        let CoordinateResponse::PeerUpdates(update) = resp else {
            panic!("expected PeerUpdates");
        };
        assert_eq!(update[0].id, a);
        assert_eq!(update[0].reason, "new");

        // a's own binding write races independently of the tunnel fan-out
        // above; give the Binder worker pool a moment to land it.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let node = coordinator.node(a).await.unwrap();
        assert_eq!(node, Some(Node::from_bytes(b"a1".to_vec())));

        drop(a_inbound_tx);
        drop(b_inbound_tx);
        // Let each connection's reaper task (see `connect`) finish
        // unregistering before reclaiming sole ownership of `coordinator`.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let coordinator = Arc::try_unwrap(coordinator)
            .unwrap_or_else(|_| panic!("connection reaper tasks did not finish in time"));
        coordinator.shutdown().await;
        let _ = a_conn.is_closed();
    }

    #[tokio::test]
    async fn node_returns_none_for_unknown_peer() {
        let (coordinator, _store) = test_coordinator();
        let node = coordinator.node(Uuid::new_v4()).await.unwrap();
        assert_eq!(node, None);
        let coordinator = Arc::try_unwrap(coordinator).unwrap_or_else(|_| panic!("unexpected extra ref"));
        coordinator.shutdown().await;
    }
}
