//! Mapper: per-connection diffing state machine (see spec §4.5.2).
//!
//! Owns `sent`, the last set of mappings actually transmitted to this
//! connection's peer. Each time a new snapshot arrives (or an `update` nudge
//! asks it to recompute the existing snapshot, e.g. because a replica's
//! heartbeat lapsed), it resolves the "best" mapping per peer and diffs
//! against `sent`, emitting only the updates whose externally observable
//! state actually changed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::connio::ConnIo;
use crate::heartbeats::Heartbeats;
use crate::model::{CoordinateResponse, Mapping, PeerUpdate, PeerUpdateKind};

/// A full mapping snapshot, or a nudge to recompute the last snapshot seen.
pub enum MapperInput {
    Mappings(Vec<Mapping>),
    Update,
    /// A ready-for-handshake signal, relayed straight through without
    /// touching `sent` or consulting the store (spec §4.5.3).
    ReadyForHandshake(Uuid),
}

pub struct Mapper {
    input_tx: mpsc::UnboundedSender<MapperInput>,
    task: JoinHandle<()>,
}

struct Runner {
    heartbeats: Arc<Heartbeats>,
    conn: Arc<ConnIo>,
    sent: HashMap<Uuid, Mapping>,
    last_snapshot: Vec<Mapping>,
}

impl Mapper {
    /// `conn` is the ConnIO this Mapper emits diffed updates to; it outlives
    /// the Mapper only briefly during shutdown (spec §9).
    pub fn new(heartbeats: Arc<Heartbeats>, conn: Arc<ConnIo>) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            heartbeats,
            conn,
            sent: HashMap::new(),
            last_snapshot: Vec::new(),
        };
        let task = tokio::spawn(run(runner, input_rx));
        Self { input_tx, task }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<MapperInput> {
        self.input_tx.clone()
    }

    pub async fn shutdown(self) {
        drop(self.input_tx);
        let _ = self.task.await;
    }
}

async fn run(mut runner: Runner, mut input_rx: mpsc::UnboundedReceiver<MapperInput>) {
    while let Some(input) = input_rx.recv().await {
        match input {
            MapperInput::Mappings(mappings) => {
                debug!("got new mappings");
                runner.last_snapshot = mappings.clone();
                let best = best_mappings(&runner.heartbeats, mappings);
                emit(&mut runner, best);
            }
            MapperInput::Update => {
                debug!("triggered update");
                let best = best_mappings(&runner.heartbeats, runner.last_snapshot.clone());
                emit(&mut runner, best);
            }
            MapperInput::ReadyForHandshake(from) => {
                let update = vec![PeerUpdate {
                    id: from,
                    kind: PeerUpdateKind::ReadyForHandshake,
                    node: None,
                    reason: "ready_for_handshake".to_string(),
                }];
                runner.conn.enqueue(CoordinateResponse::PeerUpdates(update));
            }
        }
    }
}

fn emit(runner: &mut Runner, best: HashMap<Uuid, Mapping>) {
    if let Some(update) = best_to_update(&mut runner.sent, best) {
        runner.conn.enqueue(CoordinateResponse::PeerUpdates(update));
    } else {
        debug!("skipping nil node update");
    }
}

/// Filters out dead-replica mappings (downgraded to LOST by Heartbeats, not
/// dropped) and resolves one winner per peer: NODE always beats LOST, and
/// between two NODEs the more recently updated one wins.
fn best_mappings(heartbeats: &Heartbeats, mappings: Vec<Mapping>) -> HashMap<Uuid, Mapping> {
    let mappings = heartbeats.filter(mappings);
    let mut best: HashMap<Uuid, Mapping> = HashMap::with_capacity(mappings.len());
    for mapping in mappings {
        match best.get(&mapping.peer) {
            None => {
                best.insert(mapping.peer, mapping);
            }
            Some(current) => {
                let replace = match (current.kind, mapping.kind) {
                    (PeerUpdateKind::Lost, PeerUpdateKind::Node) => true,
                    (_, PeerUpdateKind::Node) => mapping.updated_at > current.updated_at,
                    _ => false,
                };
                if replace {
                    best.insert(mapping.peer, mapping);
                }
            }
        }
    }
    best
}

/// Diffs `best` against `sent` per the table in spec §4.5.2 and updates
/// `sent` in place. Returns `None` if nothing changed.
fn best_to_update(
    sent: &mut HashMap<Uuid, Mapping>,
    best: HashMap<Uuid, Mapping>,
) -> Option<Vec<PeerUpdate>> {
    let mut updates = Vec::new();

    for (peer, mapping) in &best {
        let existing = sent.get(peer);
        let reason = match (existing, mapping.kind) {
            (None, PeerUpdateKind::Lost) => continue,
            (None, PeerUpdateKind::Node) => "new",
            (Some(s), PeerUpdateKind::Lost) if matches!(s.kind, PeerUpdateKind::Lost) => continue,
            (Some(s), PeerUpdateKind::Node) if matches!(s.kind, PeerUpdateKind::Lost) => "found",
            (Some(s), PeerUpdateKind::Lost) if matches!(s.kind, PeerUpdateKind::Node) => "lost",
            (Some(s), PeerUpdateKind::Node) if matches!(s.kind, PeerUpdateKind::Node) => {
                if s.node.node_eq(&mapping.node) {
                    continue;
                }
                "update"
            }
            _ => continue,
        };
        updates.push(PeerUpdate {
            id: *peer,
            kind: mapping.kind,
            node: Some(mapping.node.clone()),
            reason: reason.to_string(),
        });
        sent.insert(*peer, mapping.clone());
    }

    let disconnected: Vec<Uuid> = sent
        .keys()
        .filter(|peer| !best.contains_key(*peer))
        .copied()
        .collect();
    for peer in disconnected {
        updates.push(PeerUpdate {
            id: peer,
            kind: PeerUpdateKind::Disconnected,
            node: None,
            reason: "disconnected".to_string(),
        });
        sent.remove(&peer);
    }

    if updates.is_empty() {
        None
    } else {
        Some(updates)
    }
}
