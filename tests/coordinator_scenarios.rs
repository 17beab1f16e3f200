//! End-to-end scenarios against a running `Coordinator`, using an in-memory
//! `SqliteStore` and the in-process `LocalPubsub`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use peercoord::auth::AllowAll;
use peercoord::coordinator::{connect, Coordinator};
use peercoord::error::StoreError;
use peercoord::heartbeats::DEFAULT_CLEANUP_PERIOD;
use peercoord::model::{CoordinateRequest, CoordinateResponse, PeerBinding, PeerStatus, PeerUpdateKind};
use peercoord::node::Node;
use peercoord::pubsub::{LocalPubsub, Pubsub};
use peercoord::store::{SqliteStore, Store};

fn make_store() -> Arc<dyn Store> {
    Arc::new(SqliteStore::open_memory().unwrap())
}

async fn next_update(rx: &mut mpsc::Receiver<CoordinateResponse>) -> peercoord::model::PeerUpdate {
    match rx.recv().await.unwrap() {
        CoordinateResponse::PeerUpdates(mut updates) => updates.remove(0),
        CoordinateResponse::Error(e) => panic!("unexpected error response: {e}"),
    }
}

#[tokio::test]
async fn basic_tunnel_then_node_update() {
    let store = make_store();
    let pubsub: Arc<dyn Pubsub> = LocalPubsub::new();
    let coordinator = Arc::new(Coordinator::new(Uuid::new_v4(), store, pubsub));

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (a_tx, a_rx) = mpsc::channel(8);
    let (_a_conn, mut a_out) = connect(coordinator.clone(), a, Arc::new(AllowAll), a_rx);
    let (b_tx, b_rx) = mpsc::channel(8);
    let (_b_conn, mut b_out) = connect(coordinator.clone(), b, Arc::new(AllowAll), b_rx);

    a_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"a1".to_vec())))
        .await
        .unwrap();
    b_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"b1".to_vec())))
        .await
        .unwrap();
    a_tx.send(CoordinateRequest::AddTunnel(b)).await.unwrap();
    b_tx.send(CoordinateRequest::AddTunnel(a)).await.unwrap();

    let update = next_update(&mut a_out).await;
    assert_eq!(update.id, b);
    assert_eq!(update.reason, "new");
    assert_eq!(update.node.unwrap(), Node::from_bytes(b"b1".to_vec()));

    let update = next_update(&mut b_out).await;
    assert_eq!(update.id, a);
    assert_eq!(update.reason, "new");

    // A updates its node; only B (the tunnel peer) should observe it.
    a_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"a2".to_vec())))
        .await
        .unwrap();
    let update = next_update(&mut b_out).await;
    assert_eq!(update.id, a);
    assert_eq!(update.reason, "update");
    assert_eq!(update.node.unwrap(), Node::from_bytes(b"a2".to_vec()));
}

#[tokio::test]
async fn graceful_disconnect_notifies_tunnel_peer() {
    let store = make_store();
    let pubsub: Arc<dyn Pubsub> = LocalPubsub::new();
    let coordinator = Arc::new(Coordinator::new(Uuid::new_v4(), store, pubsub));

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (a_tx, a_rx) = mpsc::channel(8);
    let (_a_conn, mut a_out) = connect(coordinator.clone(), a, Arc::new(AllowAll), a_rx);
    let (b_tx, b_rx) = mpsc::channel(8);
    let (_b_conn, mut b_out) = connect(coordinator.clone(), b, Arc::new(AllowAll), b_rx);

    a_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"a1".to_vec())))
        .await
        .unwrap();
    b_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"b1".to_vec())))
        .await
        .unwrap();
    a_tx.send(CoordinateRequest::AddTunnel(b)).await.unwrap();
    b_tx.send(CoordinateRequest::AddTunnel(a)).await.unwrap();
    let _ = next_update(&mut a_out).await;
    let _ = next_update(&mut b_out).await;

    b_tx.send(CoordinateRequest::Disconnect).await.unwrap();
    let update = next_update(&mut a_out).await;
    assert_eq!(update.id, b);
    assert!(matches!(update.kind, PeerUpdateKind::Disconnected));
    assert_eq!(update.reason, "disconnected");
}

#[tokio::test]
async fn duplicate_connection_does_not_emit_stray_disconnect() {
    let store = make_store();
    let pubsub: Arc<dyn Pubsub> = LocalPubsub::new();
    let coordinator = Arc::new(Coordinator::new(Uuid::new_v4(), store, pubsub));

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (a_tx, a_rx) = mpsc::channel(8);
    let (a_conn1, mut a_out1) = connect(coordinator.clone(), a, Arc::new(AllowAll), a_rx);
    let (b_tx, b_rx) = mpsc::channel(8);
    let (_b_conn, mut b_out) = connect(coordinator.clone(), b, Arc::new(AllowAll), b_rx);

    a_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"a1".to_vec())))
        .await
        .unwrap();
    b_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"b1".to_vec())))
        .await
        .unwrap();
    a_tx.send(CoordinateRequest::AddTunnel(b)).await.unwrap();
    b_tx.send(CoordinateRequest::AddTunnel(a)).await.unwrap();
    let _ = next_update(&mut a_out1).await;
    let _ = next_update(&mut b_out).await;

    // A reconnects while its first stream is still open.
    let (a_tx2, a_rx2) = mpsc::channel(8);
    let (a_conn2, mut a_out2) = connect(coordinator.clone(), a, Arc::new(AllowAll), a_rx2);
    a_tx2
        .send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"a1".to_vec())))
        .await
        .unwrap();
    let _ = next_update(&mut a_out2).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a_conn1.is_closed());
    assert_eq!(a_conn2.overwrites(), 1);

    // B must not see a stray DISCONNECTED for A from the displacement.
    let res = tokio::time::timeout(Duration::from_millis(100), b_out.recv()).await;
    if let Ok(Some(CoordinateResponse::PeerUpdates(updates))) = res {
        assert!(
            !updates.iter().any(|u| matches!(u.kind, PeerUpdateKind::Disconnected)),
            "unexpected stray disconnect: {updates:?}"
        );
    }
}

/// Wraps a `SqliteStore`, injecting failures into `upsert_tailnet_coordinator`
/// on demand, to drive the replica's own heartbeat-failure unhealthy path.
struct FlakyStore {
    inner: Arc<dyn Store>,
    fail_heartbeats: AtomicBool,
}

#[async_trait]
impl Store for FlakyStore {
    async fn upsert_tailnet_peer(
        &self,
        peer_id: Uuid,
        coordinator_id: Uuid,
        node: &Node,
        status: PeerStatus,
    ) -> Result<(), StoreError> {
        self.inner
            .upsert_tailnet_peer(peer_id, coordinator_id, node, status)
            .await
    }

    async fn delete_tailnet_peer(&self, peer_id: Uuid, coordinator_id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_tailnet_peer(peer_id, coordinator_id).await
    }

    async fn update_tailnet_peer_status_by_coordinator(
        &self,
        coordinator_id: Uuid,
        status: PeerStatus,
    ) -> Result<(), StoreError> {
        self.inner
            .update_tailnet_peer_status_by_coordinator(coordinator_id, status)
            .await
    }

    async fn upsert_tailnet_tunnel(&self, coordinator_id: Uuid, src: Uuid, dst: Uuid) -> Result<(), StoreError> {
        self.inner.upsert_tailnet_tunnel(coordinator_id, src, dst).await
    }

    async fn delete_tailnet_tunnel(&self, coordinator_id: Uuid, src: Uuid, dst: Uuid) -> Result<(), StoreError> {
        self.inner.delete_tailnet_tunnel(coordinator_id, src, dst).await
    }

    async fn delete_all_tailnet_tunnels(&self, coordinator_id: Uuid, src: Uuid) -> Result<(), StoreError> {
        self.inner.delete_all_tailnet_tunnels(coordinator_id, src).await
    }

    async fn get_tailnet_tunnel_peer_bindings(&self, peer_id: Uuid) -> Result<Vec<PeerBinding>, StoreError> {
        self.inner.get_tailnet_tunnel_peer_bindings(peer_id).await
    }

    async fn get_tailnet_tunnel_peer_ids(&self, peer_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.inner.get_tailnet_tunnel_peer_ids(peer_id).await
    }

    async fn get_tailnet_peers(&self, peer_id: Uuid) -> Result<Vec<PeerBinding>, StoreError> {
        self.inner.get_tailnet_peers(peer_id).await
    }

    async fn upsert_tailnet_coordinator(&self, coordinator_id: Uuid) -> Result<(), StoreError> {
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("injected heartbeat failure".to_string()));
        }
        self.inner.upsert_tailnet_coordinator(coordinator_id).await
    }

    async fn get_tailnet_coordinators(&self, max_age_seconds: i64) -> Result<Vec<Uuid>, StoreError> {
        self.inner.get_tailnet_coordinators(max_age_seconds).await
    }

    async fn clean_tailnet_coordinators(&self) -> Result<(), StoreError> {
        self.inner.clean_tailnet_coordinators().await
    }

    async fn clean_tailnet_lost_peers(&self) -> Result<(), StoreError> {
        self.inner.clean_tailnet_lost_peers().await
    }

    async fn clean_tailnet_tunnels(&self) -> Result<(), StoreError> {
        self.inner.clean_tailnet_tunnels().await
    }
}

#[tokio::test]
async fn replica_failure_demotes_to_lost_then_recovers_on_another_replica() {
    // R1 hosts A; R2 hosts B initially. Both share the same store/pubsub, as
    // replicas of one deployment would.
    let store = make_store();
    let pubsub: Arc<dyn Pubsub> = LocalPubsub::new();
    let r1 = Arc::new(Coordinator::with_config(
        Uuid::new_v4(),
        store.clone(),
        pubsub.clone(),
        Duration::from_millis(30),
        2,
        DEFAULT_CLEANUP_PERIOD,
    ));
    // Give R1's heartbeat subscription a moment to register before R2 sends
    // its one and only beat; LocalPubsub drops publishes with no subscriber.
    tokio::time::sleep(Duration::from_millis(10)).await;

    // R2 sends its one initial heartbeat, then effectively never again
    // within this test's lifetime, simulating a replica that goes dark.
    let r2 = Arc::new(Coordinator::with_config(
        Uuid::new_v4(),
        store.clone(),
        pubsub.clone(),
        Duration::from_secs(3600),
        2,
        DEFAULT_CLEANUP_PERIOD,
    ));

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (a_tx, a_rx) = mpsc::channel(8);
    let (_a_conn, mut a_out) = connect(r1.clone(), a, Arc::new(AllowAll), a_rx);
    let (b_tx, b_rx) = mpsc::channel(8);
    let (_b_conn, mut b_out) = connect(r2.clone(), b, Arc::new(AllowAll), b_rx);

    a_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"a1".to_vec())))
        .await
        .unwrap();
    b_tx.send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"b1".to_vec())))
        .await
        .unwrap();
    a_tx.send(CoordinateRequest::AddTunnel(b)).await.unwrap();
    b_tx.send(CoordinateRequest::AddTunnel(a)).await.unwrap();

    let update = next_update(&mut a_out).await;
    assert_eq!(update.id, b);
    assert_eq!(update.reason, "new");
    let _ = next_update(&mut b_out).await;

    // R2's beat lapses past R1's 2*30ms threshold.
    let update = next_update(&mut a_out).await;
    assert_eq!(update.id, b);
    assert!(matches!(update.kind, PeerUpdateKind::Lost));
    assert_eq!(update.reason, "lost");

    // B reconnects on a fresh replica R3 with a new node.
    let r3 = Arc::new(Coordinator::with_config(
        Uuid::new_v4(),
        store.clone(),
        pubsub.clone(),
        Duration::from_millis(30),
        2,
        DEFAULT_CLEANUP_PERIOD,
    ));
    let (b2_tx, b2_rx) = mpsc::channel(8);
    let (_b2_conn, mut b2_out) = connect(r3.clone(), b, Arc::new(AllowAll), b2_rx);
    b2_tx
        .send(CoordinateRequest::UpdateSelf(Node::from_bytes(b"b2".to_vec())))
        .await
        .unwrap();
    let _ = b2_out.recv().await; // B's initial mapping snapshot (A, from the persisted tunnel row)

    let update = next_update(&mut a_out).await;
    assert_eq!(update.id, b);
    assert!(matches!(update.kind, PeerUpdateKind::Node));
    assert_eq!(update.reason, "found");
    assert_eq!(update.node.unwrap(), Node::from_bytes(b"b2".to_vec()));
}

#[tokio::test]
async fn unhealthy_replica_rejects_new_connections_until_recovered() {
    let flaky = Arc::new(FlakyStore {
        inner: make_store(),
        fail_heartbeats: AtomicBool::new(false),
    });
    let store: Arc<dyn Store> = flaky.clone();
    let pubsub: Arc<dyn Pubsub> = LocalPubsub::new();
    let coordinator = Arc::new(Coordinator::with_config(
        Uuid::new_v4(),
        store,
        pubsub,
        Duration::from_millis(20),
        3,
        DEFAULT_CLEANUP_PERIOD,
    ));

    flaky.fail_heartbeats.store(true, Ordering::SeqCst);
    // Three missed heartbeats at a 20ms period, with slack for scheduling jitter.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!coordinator.is_healthy());

    let a = Uuid::new_v4();
    let (_a_tx, a_rx) = mpsc::channel(8);
    let (_a_conn, mut a_out) = connect(coordinator.clone(), a, Arc::new(AllowAll), a_rx);
    let resp = a_out.recv().await.unwrap();
    assert!(matches!(resp, CoordinateResponse::Error(_)));

    flaky.fail_heartbeats.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(coordinator.is_healthy());
}
