//! Tunneler: writes tunnel (src, dst) subscriptions to the store, coalesced
//! per (src, dst) pair (see spec §4.3).
//!
//! Mirrors the Binder's shape: a fan-in task folds `TunnelUpdate`s into a
//! `latest` cache and enqueues the key; a worker pool retries the store
//! write with backoff. `dst == Nil` is the "remove all tunnels for src"
//! signal used on peer disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::model::{TunnelKey, TunnelUpdate};
use crate::pubsub::Pubsub;
use crate::startgate::StartGate;
use crate::store::Store;
use crate::workqueue::WorkQueue;

const NUM_TUNNELER_WORKERS: usize = 10;
const DB_MAX_BACKOFF: Duration = Duration::from_secs(10);
const TOPIC_TUNNEL_UPDATE: &str = "tailnet_tunnel_update";

#[derive(Debug, Clone, Copy)]
struct CachedTunnel {
    key: TunnelKey,
    active: bool,
}

struct Shared {
    coordinator_id: Uuid,
    store: Arc<dyn Store>,
    pubsub: Arc<dyn Pubsub>,
    latest: Mutex<HashMap<Uuid, HashMap<Uuid, CachedTunnel>>>,
    workq: Arc<WorkQueue<TunnelKey>>,
    cancel: CancellationToken,
}

pub struct Tunneler {
    updates_tx: mpsc::UnboundedSender<TunnelUpdate>,
    cancel: CancellationToken,
    fan_in: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Tunneler {
    pub fn new(
        coordinator_id: Uuid,
        store: Arc<dyn Store>,
        pubsub: Arc<dyn Pubsub>,
        start_gate: StartGate,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            coordinator_id,
            store,
            pubsub,
            latest: Mutex::new(HashMap::new()),
            workq: Arc::new(WorkQueue::new()),
            cancel: cancel.clone(),
        });

        let fan_in = tokio::spawn(fan_in_loop(shared.clone(), updates_rx));
        let mut workers = Vec::with_capacity(NUM_TUNNELER_WORKERS);
        for _ in 0..NUM_TUNNELER_WORKERS {
            let mut gate = start_gate.clone();
            let shared = shared.clone();
            workers.push(tokio::spawn(async move {
                gate.wait().await;
                worker_loop(shared).await
            }));
        }

        Self {
            updates_tx,
            cancel,
            fan_in,
            workers,
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<TunnelUpdate> {
        self.updates_tx.clone()
    }

    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.fan_in.await;
        for w in self.workers {
            let _ = w.await;
        }
        debug!("tunneler exiting, workers drained");
    }
}

async fn fan_in_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<TunnelUpdate>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("tunneler fan-in exiting");
                return;
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(update) => {
                        let key = update.key;
                        cache(&shared, update);
                        shared.workq.enqueue(key);
                    }
                    None => return,
                }
            }
        }
    }
}

fn cache(shared: &Shared, update: TunnelUpdate) {
    let mut latest = shared.latest.lock();
    if update.active {
        latest
            .entry(update.key.src)
            .or_default()
            .insert(
                update.key.dst,
                CachedTunnel {
                    key: update.key,
                    active: true,
                },
            );
    } else if update.key.dst == Uuid::nil() {
        latest.remove(&update.key.src);
    } else {
        if let Some(dst_map) = latest.get_mut(&update.key.src) {
            dst_map.remove(&update.key.dst);
            if dst_map.is_empty() {
                latest.remove(&update.key.src);
            }
        }
    }
}

fn retrieve(shared: &Shared, key: TunnelKey) -> CachedTunnel {
    let latest = shared.latest.lock();
    latest
        .get(&key.src)
        .and_then(|dst_map| dst_map.get(&key.dst))
        .copied()
        .unwrap_or(CachedTunnel { key, active: false })
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
            let tun = retrieve(&shared, key);
            match write_one(&shared, tun).await {
                Ok(()) => {
                    notify_tunnel_update(&shared, key).await;
                    break;
                }
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

/// Best-effort notification that the tunnel between `key.src` and `key.dst`
/// changed. A missed notification is covered by the Querier's
/// dropped-message resync.
async fn notify_tunnel_update(shared: &Shared, key: TunnelKey) {
    let payload = format!("{},{}", key.src, key.dst);
    if let Err(e) = shared
        .pubsub
        .publish(TOPIC_TUNNEL_UPDATE, payload.as_bytes())
        .await
    {
        error!(src = %key.src, dst = %key.dst, error = %e, "failed to publish tunnel update");
    }
}

async fn write_one(shared: &Shared, tun: CachedTunnel) -> Result<(), ()> {
    let result = if tun.key.dst == Uuid::nil() {
        shared
            .store
            .delete_all_tailnet_tunnels(shared.coordinator_id, tun.key.src)
            .await
    } else if tun.active {
        shared
            .store
            .upsert_tailnet_tunnel(shared.coordinator_id, tun.key.src, tun.key.dst)
            .await
    } else {
        match shared
            .store
            .delete_tailnet_tunnel(shared.coordinator_id, tun.key.src, tun.key.dst)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_rows() => Ok(()),
            Err(e) => Err(e),
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if !e.is_query_cancelled() {
                error!(src = %tun.key.src, dst = %tun.key.dst, error = %e, "failed to write tunnel to store");
            }
            Err(())
        }
    }
}
