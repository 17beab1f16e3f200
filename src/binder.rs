//! Binder: writes peer node bindings to the store, coalesced per peer
//! (see spec §4.2).
//!
//! Bindings arrive on an unbounded channel; a fan-in task folds each into a
//! `latest` map keyed by peer ID and enqueues the key on a `WorkQueue`. A
//! pool of workers pulls keys off the queue, re-reads the *current* latest
//! value (which may have moved on since enqueue — that's the coalescing),
//! and retries the store write with exponential backoff until it succeeds
//! or the binder is cancelled.

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

use crate::model::{Binding, PeerStatus, PeerUpdateKind};
use crate::pubsub::Pubsub;
use crate::startgate::StartGate;
use crate::store::Store;
use crate::workqueue::WorkQueue;

const NUM_BINDER_WORKERS: usize = 10;
const DB_MAX_BACKOFF: Duration = Duration::from_secs(10);
const TOPIC_PEER_UPDATE: &str = "tailnet_peer_update";

/// Handle to a running Binder. `bindings_tx` is the inbound channel; `close`
/// awaits worker drain followed by the final "set all mine to LOST" write.
pub struct Binder {
    bindings_tx: mpsc::UnboundedSender<Binding>,
    cancel: CancellationToken,
    fan_in: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

struct Shared {
    coordinator_id: Uuid,
    store: Arc<dyn Store>,
    pubsub: Arc<dyn Pubsub>,
    latest: Mutex<HashMap<Uuid, Binding>>,
    workq: Arc<WorkQueue<Uuid>>,
    cancel: CancellationToken,
}

impl Binder {
    pub fn new(
        coordinator_id: Uuid,
        store: Arc<dyn Store>,
        pubsub: Arc<dyn Pubsub>,
        start_gate: StartGate,
    ) -> Self {
        let (bindings_tx, bindings_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            coordinator_id,
            store,
            pubsub,
            latest: Mutex::new(HashMap::new()),
            workq: Arc::new(WorkQueue::new()),
            cancel: cancel.clone(),
        });

        let fan_in = tokio::spawn(fan_in_loop(shared.clone(), bindings_rx));
        let mut workers = Vec::with_capacity(NUM_BINDER_WORKERS);
        for _ in 0..NUM_BINDER_WORKERS {
            let mut gate = start_gate.clone();
            let shared = shared.clone();
            workers.push(tokio::spawn(async move {
                gate.wait().await;
                worker_loop(shared).await
            }));
        }

        Self {
            bindings_tx,
            cancel,
            fan_in,
            workers,
            shared,
        }
    }

    /// Sender half, handed to each ConnIO to submit binding updates.
    pub fn sender(&self) -> mpsc::UnboundedSender<Binding> {
        self.bindings_tx.clone()
    }

    /// Cancels the fan-in loop and workers, waits for them to drain, then
    /// issues the final bulk "set all mine to LOST" write under its own
    /// 15-second-bounded timeout so shutdown never hangs on the store.
    pub async fn close(self) {
        self.cancel.cancel();
        self.shared.workq.cancel();
        let _ = self.fan_in.await;
        for w in self.workers {
            let _ = w.await;
        }
        debug!("binder exiting, workers drained");

        let result = tokio::time::timeout(
            Duration::from_secs(15),
            self.shared
                .store
                .update_tailnet_peer_status_by_coordinator(
                    self.shared.coordinator_id,
                    PeerStatus::Lost,
                ),
        )
        .await;
        match result {
            Ok(Err(e)) => error!(error = %e, "update peer status to lost"),
            Err(_) => error!("timed out setting peers to lost on shutdown"),
            Ok(Ok(())) => {}
        }
    }
}

async fn fan_in_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Binding>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("binder fan-in exiting");
                return;
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(binding) => {
                        let key = binding.peer_id;
                        store_latest(&shared, binding);
                        shared.workq.enqueue(key);
                    }
                    None => return,
                }
            }
        }
    }
}

/// Folds `bnd` into the `latest` map. DISCONNECTED removes the entry so the
/// map doesn't grow without bound; LOST coalesces with the previously known
/// node since a binding row must always carry a non-null node.
fn store_latest(shared: &Shared, bnd: Binding) {
    let mut latest = shared.latest.lock();
    match bnd.kind {
        PeerUpdateKind::Node => {
            latest.insert(bnd.peer_id, bnd);
        }
        PeerUpdateKind::Disconnected => {
            latest.remove(&bnd.peer_id);
        }
        PeerUpdateKind::Lost => {
            if let Some(old) = latest.get(&bnd.peer_id) {
                let node = old.node.clone();
                latest.insert(
                    bnd.peer_id,
                    Binding {
                        peer_id: bnd.peer_id,
                        node,
                        kind: PeerUpdateKind::Lost,
                    },
                );
            }
            // lost before any node update ever arrived: no action
        }
        PeerUpdateKind::ReadyForHandshake => {
            // not a binding kind; the Binder never receives these
        }
    }
}

fn retrieve_latest(shared: &Shared, key: Uuid) -> Binding {
    let latest = shared.latest.lock();
    latest.get(&key).cloned().unwrap_or(Binding {
        peer_id: key,
        node: None,
        kind: PeerUpdateKind::Disconnected,
    })
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
            let bnd = retrieve_latest(&shared, key);
            match write_one(&shared, &bnd).await {
                Ok(()) => {
                    notify_peer_update(&shared, key).await;
                    break;
                }
                Err(_) if shared.cancel.is_cancelled() => break,
                Err(()) => {
                    let delay = backoff.next_backoff().unwrap_or(DB_MAX_BACKOFF);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        shared.workq.done(&key);
    }
}

/// Best-effort notification that `peer_id`'s binding changed. Failures are
/// logged, never retried: a missed notification is covered by the Querier's
/// dropped-message resync.
async fn notify_peer_update(shared: &Shared, peer_id: Uuid) {
    if let Err(e) = shared
        .pubsub
        .publish(TOPIC_PEER_UPDATE, peer_id.to_string().as_bytes())
        .await
    {
        error!(peer_id = %peer_id, error = %e, "failed to publish peer update");
    }
}

async fn write_one(shared: &Shared, bnd: &Binding) -> Result<(), ()> {
    let result = match bnd.kind {
        PeerUpdateKind::Disconnected => {
            match shared
                .store
                .delete_tailnet_peer(bnd.peer_id, shared.coordinator_id)
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if e.is_no_rows() => Ok(()),
                Err(e) => Err(e),
            }
        }
        _ => {
            let node = bnd
                .node
                .as_ref()
                .expect("non-DISCONNECTED binding always carries a node");
            let status = if matches!(bnd.kind, PeerUpdateKind::Lost) {
                PeerStatus::Lost
            } else {
                PeerStatus::Ok
            };
            shared
                .store
                .upsert_tailnet_peer(bnd.peer_id, shared.coordinator_id, node, status)
                .await
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if !e.is_query_cancelled() {
                error!(peer_id = %bnd.peer_id, error = %e, "failed to write binding to store");
            }
            Err(())
        }
    }
}
