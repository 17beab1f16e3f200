//! Heartbeats: liveness tracking across coordinator replicas (see spec §4.6).
//!
//! Sends this replica's heartbeat on a timer and monitors heartbeats from
//! other replicas via pubsub. A replica whose beat hasn't been seen in
//! `missed_heartbeats * heartbeat_period` is dropped from the live set and
//! every Mapper is nudged to recompute (a lost replica changes which
//! mappings `filter` should demote to LOST). Three consecutive failed
//! heartbeat upserts mark this replica itself unhealthy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::{Mapping, PeerUpdateKind};
use crate::pubsub::Pubsub;
use crate::startgate::StartGateOpener;
use crate::store::Store;

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 3;
pub const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(60 * 60);
const DB_MAX_BACKOFF: Duration = Duration::from_secs(10);
const TOPIC_HEARTBEAT: &str = "tailnet_coordinator_heartbeat";

/// Sent to the Querier whenever the live-replica set or self-health changes.
#[derive(Debug, Clone, Copy)]
pub enum HbUpdate {
    /// Recompute every Mapper's mappings (a replica's liveness changed).
    FilterUpdated,
    Unhealthy,
    Healthy,
}

struct State {
    coordinators: HashMap<Uuid, std::time::Instant>,
}

struct Shared {
    self_id: Uuid,
    store: Arc<dyn Store>,
    pubsub: Arc<dyn Pubsub>,
    state: RwLock<State>,
    update_tx: mpsc::UnboundedSender<HbUpdate>,
    cancel: CancellationToken,
    expiry_notify: tokio::sync::Notify,
    heartbeat_period: Duration,
    missed_heartbeats: u32,
    cleanup_period: Duration,
}

pub struct Heartbeats {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Heartbeats {
    /// `start_gate` is opened once the first heartbeat has been sent, letting
    /// Binder/Tunneler/Querier workers begin writing to the store.
    pub fn new(
        self_id: Uuid,
        store: Arc<dyn Store>,
        pubsub: Arc<dyn Pubsub>,
        start_gate: StartGateOpener,
    ) -> (Self, mpsc::UnboundedReceiver<HbUpdate>) {
        Self::with_period(
            self_id,
            store,
            pubsub,
            start_gate,
            DEFAULT_HEARTBEAT_PERIOD,
            DEFAULT_MISSED_HEARTBEATS,
            DEFAULT_CLEANUP_PERIOD,
        )
    }

    /// Same as [`Heartbeats::new`] but with an explicit heartbeat period,
    /// missed-heartbeat threshold, and cleanup sweep interval, for replicas
    /// started from a `ServerConfig` with overrides.
    pub fn with_period(
        self_id: Uuid,
        store: Arc<dyn Store>,
        pubsub: Arc<dyn Pubsub>,
        start_gate: StartGateOpener,
        heartbeat_period: Duration,
        missed_heartbeats: u32,
        cleanup_period: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<HbUpdate>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            self_id,
            store,
            pubsub,
            state: RwLock::new(State {
                coordinators: HashMap::new(),
            }),
            update_tx,
            cancel: cancel.clone(),
            expiry_notify: tokio::sync::Notify::new(),
            heartbeat_period,
            missed_heartbeats,
            cleanup_period,
        });

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(subscribe_task(shared.clone())));
        tasks.push(tokio::spawn(send_beats_task(shared.clone(), start_gate)));
        tasks.push(tokio::spawn(cleanup_task(shared.clone())));
        tasks.push(tokio::spawn(expiry_task(shared.clone())));

        (
            Self {
                shared,
                cancel,
                tasks,
            },
            update_rx,
        )
    }

    pub fn self_id(&self) -> Uuid {
        self.shared.self_id
    }

    /// Demotes mappings originating from a replica whose beats have lapsed
    /// to LOST, unless they already are. Mappings from `self_id` are always
    /// considered live.
    pub fn filter(&self, mappings: Vec<Mapping>) -> Vec<Mapping> {
        let state = self.shared.state.read();
        mappings
            .into_iter()
            .map(|mut m| {
                if m.coordinator != self.shared.self_id && !state.coordinators.contains_key(&m.coordinator) {
                    m.kind = PeerUpdateKind::Lost;
                }
                m
            })
            .collect()
    }

    pub async fn close(self) {
        self.cancel.cancel();
        self.shared.expiry_notify.notify_waiters();
        for t in self.tasks {
            let _ = t.await;
        }
    }
}

async fn subscribe_task(shared: Arc<Shared>) {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_max_interval(DB_MAX_BACKOFF)
        .with_max_elapsed_time(None)
        .build();
    let handler_shared = shared.clone();
    let handler: crate::pubsub::Handler = Arc::new(move |msg| handle_beat_message(&handler_shared, msg));

    let sub = loop {
        if shared.cancel.is_cancelled() {
            return;
        }
        match shared.pubsub.subscribe_with_err(TOPIC_HEARTBEAT, handler.clone()).await {
            Ok(sub) => break sub,
            Err(e) => {
                warn!(error = %e, "failed to subscribe to heartbeats");
                let delay = backoff.next_backoff().unwrap_or(DB_MAX_BACKOFF);
                tokio::time::sleep(delay).await;
            }
        }
    };

    shared.cancel.cancelled().await;
    info!("canceling heartbeat subscription");
    sub.cancel();
}

fn handle_beat_message(shared: &Shared, msg: Result<&[u8], crate::error::PubsubError>) {
    let bytes = match msg {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "heartbeat notification error");
            return;
        }
    };
    let text = String::from_utf8_lossy(bytes);
    let id = match Uuid::parse_str(&text) {
        Ok(id) => id,
        Err(e) => {
            error!(msg = %text, error = %e, "unable to parse heartbeat");
            return;
        }
    };
    if id == shared.self_id {
        return;
    }
    recv_beat(shared, id);
}

fn recv_beat(shared: &Shared, id: Uuid) {
    debug!(other_coordinator_id = %id, "got heartbeat");
    let mut became_new = false;
    {
        let mut state = shared.state.write();
        if !state.coordinators.contains_key(&id) {
            info!(other_coordinator_id = %id, "heartbeats (re)started");
            became_new = true;
        }
        state.coordinators.insert(id, std::time::Instant::now());
    }
    if became_new {
        let _ = shared.update_tx.send(HbUpdate::FilterUpdated);
    }
    shared.expiry_notify.notify_waiters();
}

/// Wakes whenever a beat is recorded (to recompute the next expiry) or the
/// expected interval elapses (to actually check for expiry), mirroring the
/// original's self-resetting timer.
async fn expiry_task(shared: Arc<Shared>) {
    loop {
        let sleep_for = {
            let state = shared.state.read();
            oldest_beat_deadline(&state.coordinators, shared.heartbeat_period, shared.missed_heartbeats)
        };
        match sleep_for {
            None => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = shared.expiry_notify.notified() => {}
                }
            }
            Some(duration) => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = shared.expiry_notify.notified() => {}
                    _ = tokio::time::sleep(duration) => {
                        check_expiry(&shared);
                    }
                }
            }
        }
    }
}

fn oldest_beat_deadline(
    coordinators: &HashMap<Uuid, std::time::Instant>,
    heartbeat_period: Duration,
    missed_heartbeats: u32,
) -> Option<Duration> {
    let oldest = coordinators.values().min()?;
    let deadline = *oldest + heartbeat_period * missed_heartbeats;
    Some(deadline.saturating_duration_since(std::time::Instant::now()))
}

fn check_expiry(shared: &Shared) {
    debug!("checking heartbeat expiry");
    let mut expired = false;
    {
        let mut state = shared.state.write();
        let now = std::time::Instant::now();
        let threshold = shared.heartbeat_period * shared.missed_heartbeats;
        state.coordinators.retain(|id, t| {
            let age = now.duration_since(*t);
            let alive = age < threshold;
            if !alive {
                expired = true;
                info!(other_coordinator_id = %id, age_secs = age.as_secs(), "coordinator failed heartbeat check");
            }
            alive
        });
    }
    if expired {
        let _ = shared.update_tx.send(HbUpdate::FilterUpdated);
    }
}

async fn send_beats_task(shared: Arc<Shared>, start_gate: StartGateOpener) {
    send_beat(&shared, &mut 0).await;
    start_gate.open();

    let mut failed: u32 = 0;
    let mut ticker = tokio::time::interval(shared.heartbeat_period);
    ticker.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("ending heartbeats");
                return;
            }
            _ = ticker.tick() => {
                send_beat(&shared, &mut failed).await;
            }
        }
    }
}

async fn send_beat(shared: &Shared, failed: &mut u32) {
    match shared.store.upsert_tailnet_coordinator(shared.self_id).await {
        Ok(()) => {
            debug!("sent heartbeat");
            if let Err(e) = shared
                .pubsub
                .publish(TOPIC_HEARTBEAT, shared.self_id.to_string().as_bytes())
                .await
            {
                warn!(error = %e, "failed to publish heartbeat notification");
            }
            if *failed >= 3 {
                info!("coordinator sent heartbeat and is healthy");
                let _ = shared.update_tx.send(HbUpdate::Healthy);
            }
            *failed = 0;
        }
        Err(e) => {
            if e.is_query_cancelled() {
                return;
            }
            error!(error = %e, "failed to send heartbeat");
            *failed += 1;
            if *failed == 3 {
                error!("coordinator failed 3 heartbeats and is unhealthy");
                let _ = shared.update_tx.send(HbUpdate::Unhealthy);
            }
        }
    }
}

async fn cleanup_task(shared: Arc<Shared>) {
    cleanup(&shared).await;
    let mut ticker = tokio::time::interval(shared.cleanup_period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("ending cleanup loop");
                return;
            }
            _ = ticker.tick() => {
                cleanup(&shared).await;
            }
        }
    }
}

async fn cleanup(shared: &Shared) {
    if let Err(e) = shared.store.clean_tailnet_coordinators().await {
        if !e.is_query_cancelled() {
            error!(error = %e, "failed to cleanup old coordinators");
        }
    }
    if let Err(e) = shared.store.clean_tailnet_lost_peers().await {
        if !e.is_query_cancelled() {
            error!(error = %e, "failed to cleanup lost peers");
        }
    }
    if let Err(e) = shared.store.clean_tailnet_tunnels().await {
        if !e.is_query_cancelled() {
            error!(error = %e, "failed to cleanup abandoned tunnels");
        }
    }
    debug!("completed cleanup");
}
