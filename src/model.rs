//! Shared data model (see spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::Node;

/// Status of a persisted peer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Ok,
    Lost,
}

/// The four kinds of update a peer can observe on its response stream.
/// Reused internally for binding writes (only `Node`/`Lost`/`Disconnected`
/// apply there) and for in-memory mappings (only `Node`/`Lost` apply there),
/// mirroring the original implementation's single overloaded enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerUpdateKind {
    Node,
    Lost,
    Disconnected,
    ReadyForHandshake,
}

/// A durable (peer, replica, node, status) row, as read back from the store.
#[derive(Debug, Clone)]
pub struct PeerBinding {
    pub peer_id: Uuid,
    pub coordinator_id: Uuid,
    pub node: Node,
    pub status: PeerStatus,
    pub updated_at: DateTime<Utc>,
}

/// A message sent to the Binder: "peer_id should now be bound to node, as kind".
#[derive(Debug, Clone)]
pub struct Binding {
    pub peer_id: Uuid,
    pub node: Option<Node>,
    pub kind: PeerUpdateKind,
}

/// Key identifying a tunnel subscription: src wishes to reach dst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub src: Uuid,
    pub dst: Uuid,
}

/// A message sent to the Tunneler.
#[derive(Debug, Clone, Copy)]
pub struct TunnelUpdate {
    pub key: TunnelKey,
    pub active: bool,
}

/// In-memory projection of a peer binding as seen by a Querier.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub peer: Uuid,
    pub coordinator: Uuid,
    pub updated_at: DateTime<Utc>,
    pub node: Node,
    pub kind: PeerUpdateKind,
}

impl From<PeerBinding> for Mapping {
    fn from(b: PeerBinding) -> Self {
        Self {
            peer: b.peer_id,
            coordinator: b.coordinator_id,
            updated_at: b.updated_at,
            node: b.node,
            kind: match b.status {
                PeerStatus::Ok => PeerUpdateKind::Node,
                PeerStatus::Lost => PeerUpdateKind::Lost,
            },
        }
    }
}

/// A single update destined for a peer's response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub id: Uuid,
    pub kind: PeerUpdateKind,
    pub node: Option<Node>,
    pub reason: String,
}

/// What a ConnIO actually writes to its outbound channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinateResponse {
    PeerUpdates(Vec<PeerUpdate>),
    Error(String),
}

/// Inbound request variants a ConnIO reads from its client stream (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinateRequest {
    UpdateSelf(Node),
    AddTunnel(Uuid),
    RemoveTunnel(Uuid),
    ReadyForHandshake(Uuid),
    Disconnect,
}
