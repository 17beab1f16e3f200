//! Querier: the heart of the system (see spec §4.5).
//!
//! Maintains `mappers: peer_id → (ConnIo, Mapper)` for every peer connected to
//! this replica and reacts to three stimuli: new/closed local connections,
//! pubsub notifications (peer-update, tunnel-update, ready-for-handshake),
//! and heartbeat updates (filter change, health change). A coalescing work
//! queue keyed by `QuerierWorkKey` drives the actual store queries; a pool of
//! workers drains it with the same backoff-retry shape as Binder/Tunneler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connio::ConnIo;
use crate::error::CLOSE_ERR_UNHEALTHY;
use crate::heartbeats::{HbUpdate, Heartbeats};
use crate::mapper::{Mapper, MapperInput};
use crate::model::{CoordinateResponse, Mapping};
use crate::pubsub::Pubsub;
use crate::store::Store;
use crate::workqueue::WorkQueue;

const NUM_QUERIER_WORKERS: usize = 10;
const DB_MAX_BACKOFF: Duration = Duration::from_secs(10);

const TOPIC_PEER_UPDATE: &str = "tailnet_peer_update";
const TOPIC_TUNNEL_UPDATE: &str = "tailnet_tunnel_update";
const TOPIC_READY_FOR_HANDSHAKE: &str = "tailnet_ready_for_handshake";

/// Keys the single work queue shared by every mapping/tunnel recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QuerierWorkKey {
    /// Recompute and push updates to `peer_id`'s Mapper.
    MappingQuery(Uuid),
    /// Enumerate the tunnel peers of `peer_id` and schedule a mapping query
    /// for each.
    PeerUpdate(Uuid),
}

struct MappedConn {
    conn: Arc<ConnIo>,
    mapper: Mapper,
}

struct Shared {
    store: Arc<dyn Store>,
    pubsub: Arc<dyn Pubsub>,
    heartbeats: Arc<Heartbeats>,
    workq: Arc<WorkQueue<QuerierWorkKey>>,
    mappers: Mutex<HashMap<Uuid, MappedConn>>,
    healthy: std::sync::atomic::AtomicBool,
    cancel: CancellationToken,
}

/// Handle to a running Querier. Callers submit new connections via
/// [`Querier::register`]; the pubsub/heartbeat-driven machinery runs in the
/// background until [`Querier::close`].
pub struct Querier {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    subscribe_task: JoinHandle<()>,
    update_task: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Querier {
    pub fn new(
        store: Arc<dyn Store>,
        pubsub: Arc<dyn Pubsub>,
        heartbeats: Arc<Heartbeats>,
        hb_updates: mpsc::UnboundedReceiver<HbUpdate>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            store,
            pubsub,
            heartbeats,
            workq: Arc::new(WorkQueue::new()),
            mappers: Mutex::new(HashMap::new()),
            healthy: std::sync::atomic::AtomicBool::new(true),
            cancel: cancel.clone(),
        });

        let subscribe_task = tokio::spawn(subscribe_task(shared.clone()));
        let update_task = tokio::spawn(handle_updates_task(shared.clone(), hb_updates));
        let mut workers = Vec::with_capacity(NUM_QUERIER_WORKERS);
        for _ in 0..NUM_QUERIER_WORKERS {
            workers.push(tokio::spawn(worker_loop(shared.clone())));
        }

        Self {
            shared,
            cancel,
            subscribe_task,
            update_task,
            workers,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Registers a newly accepted connection. If the replica is currently
    /// unhealthy, rejects it immediately with `CLOSE_ERR_UNHEALTHY` (spec
    /// §4.6 self-health). Otherwise builds a Mapper for it, displacing any
    /// existing mapper for the same peer_id (spec §4.5.4), and schedules an
    /// initial mapping query.
    pub fn register(&self, conn: Arc<ConnIo>) {
        if !self.is_healthy() {
            conn.enqueue(CoordinateResponse::Error(CLOSE_ERR_UNHEALTHY.to_string()));
            conn.close();
            warn!(peer_id = %conn.peer_id(), "rejected incoming connection while unhealthy");
            return;
        }

        let peer_id = conn.peer_id();
        let mapper = Mapper::new(self.shared.heartbeats.clone(), conn.clone());
        let mut mappers = self.shared.mappers.lock();
        if let Some(dup) = mappers.remove(&peer_id) {
            conn.record_overwrite();
            dup.conn.close();
            debug!(peer_id = %peer_id, "displaced duplicate connection");
        }
        mappers.insert(peer_id, MappedConn { conn, mapper });
        drop(mappers);
        self.shared
            .workq
            .enqueue(QuerierWorkKey::MappingQuery(peer_id));
    }

    /// Removes and tears down the mapper for `peer_id`, but only if `conn`
    /// is still the one on file (an already-displaced connection's own
    /// cleanup must not clobber its replacement).
    pub async fn unregister(&self, conn: &Arc<ConnIo>) {
        let peer_id = conn.peer_id();
        let removed = {
            let mut mappers = self.shared.mappers.lock();
            match mappers.get(&peer_id) {
                Some(mapped) if Arc::ptr_eq(&mapped.conn, conn) => mappers.remove(&peer_id),
                _ => None,
            }
        };
        if let Some(mapped) = removed {
            mapped.conn.close();
            mapped.mapper.shutdown().await;
            debug!(peer_id = %peer_id, "removed mapper");
        }
    }

    pub async fn close(self) {
        self.cancel.cancel();
        self.shared.workq.cancel();
        let _ = self.subscribe_task.await;
        let _ = self.update_task.await;
        for w in self.workers {
            let _ = w.await;
        }
        let mappers = std::mem::take(&mut *self.shared.mappers.lock());
        for (_, mapped) in mappers {
            mapped.conn.close();
            mapped.mapper.shutdown().await;
        }
        debug!("querier exiting, mappers drained");
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        let key = match shared.workq.acquire().await {
            Ok(k) => k,
            Err(_) => return,
        };
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_max_interval(DB_MAX_BACKOFF)
            .with_max_elapsed_time(None)
            .build();
        loop {
            match run_query(&shared, key).await {
                Ok(()) => break,
                Err(()) if shared.cancel.is_cancelled() => break,
                Err(()) => {
                    let delay = backoff.next_backoff().unwrap_or(DB_MAX_BACKOFF);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        shared.workq.done(&key);
    }
}

async fn run_query(shared: &Shared, key: QuerierWorkKey) -> Result<(), ()> {
    match key {
        QuerierWorkKey::MappingQuery(peer) => mapping_query(shared, peer).await,
        QuerierWorkKey::PeerUpdate(peer) => peer_update(shared, peer).await,
    }
}

/// Work scheduled in response to a new peer->binding. Finds the other peers
/// sharing a tunnel with `peer` and schedules a mapping recomputation on each.
async fn peer_update(shared: &Shared, peer: Uuid) -> Result<(), ()> {
    debug!(peer_id = %peer, "querying peers that share a tunnel");
    let others = match shared.store.get_tailnet_tunnel_peer_ids(peer).await {
        Ok(ids) => ids,
        Err(e) => {
            if e.is_query_cancelled() {
                return Ok(());
            }
            error!(peer_id = %peer, error = %e, "failed to query tunnel peers");
            return Err(());
        }
    };
    debug!(peer_id = %peer, num_peers = others.len(), "queried tunnel peers");
    for other in others {
        shared
            .workq
            .enqueue(QuerierWorkKey::MappingQuery(other));
    }
    Ok(())
}

/// Queries the store for every mapping `peer` should know about and sends
/// the snapshot to its Mapper, if it still has one.
async fn mapping_query(shared: &Shared, peer: Uuid) -> Result<(), ()> {
    debug!(peer_id = %peer, "querying mappings");
    let bindings = match shared.store.get_tailnet_tunnel_peer_bindings(peer).await {
        Ok(b) => b,
        Err(e) => {
            if e.is_query_cancelled() {
                return Ok(());
            }
            error!(peer_id = %peer, error = %e, "failed to query mappings");
            return Err(());
        }
    };
    let mappings: Vec<Mapping> = bindings.into_iter().map(Mapping::from).collect();

    let sender = {
        let mappers = shared.mappers.lock();
        mappers.get(&peer).map(|m| m.mapper.sender())
    };
    let Some(sender) = sender else {
        debug!(peer_id = %peer, "query for missing mapper");
        return Ok(());
    };
    debug!(peer_id = %peer, mapping_len = mappings.len(), "sending mappings");
    if sender.send(MapperInput::Mappings(mappings)).is_err() {
        debug!(peer_id = %peer, "mapper already shut down");
    }
    Ok(())
}

async fn subscribe_task(shared: Arc<Shared>) {
    let peer_handler_shared = shared.clone();
    let peer_handler: crate::pubsub::Handler = Arc::new(move |msg| listen_peer(&peer_handler_shared, msg));
    let Some(peer_sub) = subscribe_retrying(&shared, TOPIC_PEER_UPDATE, peer_handler).await else {
        return;
    };

    let tunnel_handler_shared = shared.clone();
    let tunnel_handler: crate::pubsub::Handler =
        Arc::new(move |msg| listen_tunnel(&tunnel_handler_shared, msg));
    let Some(tunnel_sub) = subscribe_retrying(&shared, TOPIC_TUNNEL_UPDATE, tunnel_handler).await
    else {
        peer_sub.cancel();
        return;
    };

    let rfh_handler_shared = shared.clone();
    let rfh_handler: crate::pubsub::Handler =
        Arc::new(move |msg| listen_ready_for_handshake(&rfh_handler_shared, msg));
    let Some(rfh_sub) =
        subscribe_retrying(&shared, TOPIC_READY_FOR_HANDSHAKE, rfh_handler).await
    else {
        peer_sub.cancel();
        tunnel_sub.cancel();
        return;
    };

    shared.cancel.cancelled().await;
    debug!("canceling querier pubsub subscriptions");
    peer_sub.cancel();
    tunnel_sub.cancel();
    rfh_sub.cancel();
}

async fn subscribe_retrying(
    shared: &Shared,
    topic: &str,
    handler: crate::pubsub::Handler,
) -> Option<crate::pubsub::Subscription> {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_max_interval(DB_MAX_BACKOFF)
        .with_max_elapsed_time(None)
        .build();
    loop {
        if shared.cancel.is_cancelled() {
            return None;
        }
        match shared.pubsub.subscribe_with_err(topic, handler.clone()).await {
            Ok(sub) => return Some(sub),
            Err(e) => {
                warn!(topic, error = %e, "failed to subscribe");
                let delay = backoff.next_backoff().unwrap_or(DB_MAX_BACKOFF);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn listen_peer(shared: &Shared, msg: Result<&[u8], crate::error::PubsubError>) {
    let bytes = match msg {
        Ok(b) => b,
        Err(crate::error::PubsubError::DroppedMessages) => {
            warn!("pubsub may have dropped peer updates");
            resync_peer_mappings(shared);
            return;
        }
        Err(e) => {
            warn!(error = %e, "unhandled pubsub error");
            return;
        }
    };
    let text = String::from_utf8_lossy(bytes);
    let peer = match Uuid::parse_str(&text) {
        Ok(id) => id,
        Err(e) => {
            error!(msg = %text, error = %e, "failed to parse peer update");
            return;
        }
    };
    debug!(peer_id = %peer, "got peer update");
    shared.workq.enqueue(QuerierWorkKey::PeerUpdate(peer));
}

fn listen_tunnel(shared: &Shared, msg: Result<&[u8], crate::error::PubsubError>) {
    let bytes = match msg {
        Ok(b) => b,
        Err(crate::error::PubsubError::DroppedMessages) => {
            warn!("pubsub may have dropped tunnel updates");
            resync_peer_mappings(shared);
            return;
        }
        Err(e) => {
            warn!(error = %e, "unhandled pubsub error");
            return;
        }
    };
    let text = String::from_utf8_lossy(bytes);
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != 2 {
        error!(msg = %text, "failed to parse tunnel update");
        return;
    }
    let parsed: Result<Vec<Uuid>, _> = parts.iter().map(|p| Uuid::parse_str(p)).collect();
    let peers = match parsed {
        Ok(peers) => peers,
        Err(e) => {
            error!(msg = %text, error = %e, "failed to parse tunnel update uuid");
            return;
        }
    };
    for peer in peers {
        let mapped = shared.mappers.lock().contains_key(&peer);
        if !mapped {
            debug!(peer_id = %peer, "ignoring tunnel update, no mapper");
            continue;
        }
        shared.workq.enqueue(QuerierWorkKey::MappingQuery(peer));
    }
}

fn listen_ready_for_handshake(shared: &Shared, msg: Result<&[u8], crate::error::PubsubError>) {
    let bytes = match msg {
        Ok(b) => b,
        Err(crate::error::PubsubError::DroppedMessages) => return,
        Err(e) => {
            warn!(error = %e, "unhandled pubsub error");
            return;
        }
    };
    let text = String::from_utf8_lossy(bytes);
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != 2 {
        error!(msg = %text, "failed to parse ready for handshake");
        return;
    }
    let (Ok(to), Ok(from)) = (Uuid::parse_str(parts[0]), Uuid::parse_str(parts[1])) else {
        error!(msg = %text, "failed to parse ready for handshake uuid");
        return;
    };
    let sender = {
        let mappers = shared.mappers.lock();
        mappers.get(&to).map(|m| m.mapper.sender())
    };
    let Some(sender) = sender else {
        debug!(peer_id = %to, "ignoring ready for handshake, no mapper");
        return;
    };
    let _ = sender.send(MapperInput::ReadyForHandshake(from));
}

fn resync_peer_mappings(shared: &Shared) {
    let peers: Vec<Uuid> = shared.mappers.lock().keys().copied().collect();
    for peer in peers {
        shared.workq.enqueue(QuerierWorkKey::MappingQuery(peer));
    }
}

async fn handle_updates_task(shared: Arc<Shared>, mut updates: mpsc::UnboundedReceiver<HbUpdate>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            maybe = updates.recv() => {
                match maybe {
                    None => return,
                    Some(HbUpdate::FilterUpdated) => update_all(&shared),
                    Some(HbUpdate::Unhealthy) => unhealthy_close_all(&shared),
                    Some(HbUpdate::Healthy) => set_healthy(&shared),
                }
            }
        }
    }
}

fn update_all(shared: &Shared) {
    let mappers = shared.mappers.lock();
    for mapped in mappers.values() {
        let _ = mapped.mapper.sender().send(MapperInput::Update);
    }
}

/// Marks the replica unhealthy and closes every existing connection, so that
/// clients are forced to reconnect and hopefully land on a healthy replica.
fn unhealthy_close_all(shared: &Shared) {
    shared.healthy.store(false, std::sync::atomic::Ordering::SeqCst);
    let mappers = shared.mappers.lock();
    for mapped in mappers.values() {
        mapped
            .conn
            .enqueue(CoordinateResponse::Error(CLOSE_ERR_UNHEALTHY.to_string()));
        mapped.conn.close();
    }
}

fn set_healthy(shared: &Shared) {
    shared.healthy.store(true, std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::pubsub::LocalPubsub;
    use crate::store::SqliteStore;

    async fn test_querier() -> (Querier, Arc<dyn Store>, Arc<LocalPubsub>, Uuid) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_memory().unwrap());
        let pubsub = LocalPubsub::new();
        let self_id = Uuid::new_v4();
        let (opener, _gate) = crate::startgate::start_gate();
        let (hb, hb_rx) = Heartbeats::new(self_id, store.clone(), pubsub.clone(), opener);
        let hb = Arc::new(hb);
        let pubsub_dyn: Arc<dyn Pubsub> = pubsub.clone();
        let q = Querier::new(store.clone(), pubsub_dyn, hb, hb_rx);
        (q, store, pubsub, self_id)
    }

    #[tokio::test]
    async fn mapping_query_sends_snapshot_to_registered_mapper() {
        let (q, store, _pubsub, coord) = test_querier().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .upsert_tailnet_peer(b, coord, &Node::from_bytes(vec![9]), crate::model::PeerStatus::Ok)
            .await
            .unwrap();
        store.upsert_tailnet_tunnel(coord, a, b).await.unwrap();

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (binder_tx, _binder_rx) = mpsc::unbounded_channel();
        let (tunnel_tx, _tunnel_rx) = mpsc::unbounded_channel();
        let (handshake_tx, _handshake_rx) = mpsc::channel(8);
        let (conn, mut outbound_rx, _task) = ConnIo::spawn(
            a,
            Arc::new(crate::auth::AllowAll),
            inbound_rx,
            binder_tx,
            tunnel_tx,
            handshake_tx,
        );
        q.register(conn);

        let resp = outbound_rx.recv().await.unwrap();
        let CoordinateResponse::PeerUpdates(update) = resp else {
            panic!("expected PeerUpdates");
        };
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].id, b);
        assert_eq!(update[0].reason, "new");
        drop(inbound_tx);
        q.close().await;
    }

    #[tokio::test]
    async fn unhealthy_rejects_new_connections_and_closes_existing() {
        let (q, _store, _pubsub, _coord) = test_querier().await;
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (binder_tx, _binder_rx) = mpsc::unbounded_channel();
        let (tunnel_tx, _tunnel_rx) = mpsc::unbounded_channel();
        let (handshake_tx, _handshake_rx) = mpsc::channel(8);
        let peer = Uuid::new_v4();
        let (conn, mut outbound_rx, _task) = ConnIo::spawn(
            peer,
            Arc::new(crate::auth::AllowAll),
            inbound_rx,
            binder_tx,
            tunnel_tx,
            handshake_tx,
        );
        q.register(conn.clone());

        unhealthy_close_all(&q.shared);
        let resp = outbound_rx.recv().await.unwrap();
        assert!(matches!(resp, CoordinateResponse::Error(_)));
        assert!(conn.is_closed());

        let (inbound_tx2, inbound_rx2) = mpsc::channel(8);
        let (binder_tx2, _br2) = mpsc::unbounded_channel();
        let (tunnel_tx2, _tr2) = mpsc::unbounded_channel();
        let (handshake_tx2, _hr2) = mpsc::channel(8);
        let peer2 = Uuid::new_v4();
        let (conn2, mut outbound_rx2, _task2) = ConnIo::spawn(
            peer2,
            Arc::new(crate::auth::AllowAll),
            inbound_rx2,
            binder_tx2,
            tunnel_tx2,
            handshake_tx2,
        );
        q.register(conn2.clone());
        let resp = outbound_rx2.recv().await.unwrap();
        assert!(matches!(resp, CoordinateResponse::Error(_)));
        assert!(conn2.is_closed());
        drop(inbound_tx);
        drop(inbound_tx2);
        q.close().await;
    }

    #[tokio::test]
    async fn duplicate_connection_displaces_old_mapper() {
        let (q, _store, _pubsub, _coord) = test_querier().await;
        let peer = Uuid::new_v4();

        let (inbound_tx1, inbound_rx1) = mpsc::channel(8);
        let (binder_tx1, _br1) = mpsc::unbounded_channel();
        let (tunnel_tx1, _tr1) = mpsc::unbounded_channel();
        let (handshake_tx1, _hr1) = mpsc::channel(8);
        let (conn1, _outbound_rx1, _task1) = ConnIo::spawn(
            peer,
            Arc::new(crate::auth::AllowAll),
            inbound_rx1,
            binder_tx1,
            tunnel_tx1,
            handshake_tx1,
        );
        q.register(conn1.clone());

        let (inbound_tx2, inbound_rx2) = mpsc::channel(8);
        let (binder_tx2, _br2) = mpsc::unbounded_channel();
        let (tunnel_tx2, _tr2) = mpsc::unbounded_channel();
        let (handshake_tx2, _hr2) = mpsc::channel(8);
        let (conn2, _outbound_rx2, _task2) = ConnIo::spawn(
            peer,
            Arc::new(crate::auth::AllowAll),
            inbound_rx2,
            binder_tx2,
            tunnel_tx2,
            handshake_tx2,
        );
        q.register(conn2.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn1.is_closed());
        assert_eq!(conn2.overwrites(), 1);
        assert!(!conn2.is_closed());
        drop(inbound_tx1);
        drop(inbound_tx2);
        q.close().await;
    }
}
