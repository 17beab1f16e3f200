//! Opaque peer network descriptor.
//!
//! The core never interprets a node's contents — it only needs to move it
//! around, persist it as bytes, and compare two of them for equality. Real
//! deployments carry a protobuf-encoded wireguard/DERP descriptor here; the
//! coordinator core doesn't know or care.

use serde::{Deserialize, Serialize};

/// A peer's network identity: endpoints, DERP home, keys. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node(Vec<u8>);

impl Node {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Semantic equality predicate (see spec §3, §4.5.2 `node_eq`).
    pub fn node_eq(&self, other: &Node) -> bool {
        self == other
    }
}

impl From<Vec<u8>> for Node {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
