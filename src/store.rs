//! The `Store` capability (see spec §6) and its SQLite-backed implementation.
//!
//! The core never talks to SQLite directly; every call goes through this
//! trait so that tests can swap in an in-memory fixture and so the
//! persistence technology stays an implementation detail, the way
//! `freeq-server` keeps `Db` behind a handful of narrow methods on `server.rs`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{PeerBinding, PeerStatus};
use crate::node::Node;

/// Abstract persistence capability consulted by the Binder, Tunneler, and
/// Querier worker pools. All methods are `async` so that a future
/// network-backed implementation (e.g. a real Postgres pool) doesn't need a
/// different trait shape; the bundled `SqliteStore` simply runs synchronously
/// under a held lock, matching `freeq-server`'s `Db`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_tailnet_peer(
        &self,
        peer_id: Uuid,
        coordinator_id: Uuid,
        node: &Node,
        status: PeerStatus,
    ) -> Result<(), StoreError>;

    async fn delete_tailnet_peer(
        &self,
        peer_id: Uuid,
        coordinator_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn update_tailnet_peer_status_by_coordinator(
        &self,
        coordinator_id: Uuid,
        status: PeerStatus,
    ) -> Result<(), StoreError>;

    async fn upsert_tailnet_tunnel(
        &self,
        coordinator_id: Uuid,
        src: Uuid,
        dst: Uuid,
    ) -> Result<(), StoreError>;

    async fn delete_tailnet_tunnel(
        &self,
        coordinator_id: Uuid,
        src: Uuid,
        dst: Uuid,
    ) -> Result<(), StoreError>;

    async fn delete_all_tailnet_tunnels(
        &self,
        coordinator_id: Uuid,
        src: Uuid,
    ) -> Result<(), StoreError>;

    /// All bindings of peers sharing a tunnel with `peer_id`, in either direction.
    async fn get_tailnet_tunnel_peer_bindings(
        &self,
        peer_id: Uuid,
    ) -> Result<Vec<PeerBinding>, StoreError>;

    /// IDs of peers sharing a tunnel with `peer_id`, in either direction.
    async fn get_tailnet_tunnel_peer_ids(&self, peer_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// All (replica, node, updated_at) rows for a given peer.
    async fn get_tailnet_peers(&self, peer_id: Uuid) -> Result<Vec<PeerBinding>, StoreError>;

    /// Records this replica's heartbeat.
    async fn upsert_tailnet_coordinator(&self, coordinator_id: Uuid) -> Result<(), StoreError>;

    /// Replica IDs with a heartbeat newer than `max_age_seconds`.
    async fn get_tailnet_coordinators(
        &self,
        max_age_seconds: i64,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn clean_tailnet_coordinators(&self) -> Result<(), StoreError>;
    async fn clean_tailnet_lost_peers(&self) -> Result<(), StoreError>;
    async fn clean_tailnet_tunnels(&self) -> Result<(), StoreError>;
}

fn status_to_str(status: PeerStatus) -> &'static str {
    match status {
        PeerStatus::Ok => "ok",
        PeerStatus::Lost => "lost",
    }
}

fn status_from_str(s: &str) -> PeerStatus {
    match s {
        "lost" => PeerStatus::Lost,
        _ => PeerStatus::Ok,
    }
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Transient(e.to_string())
}

/// SQLite-backed `Store`. Holds the connection behind a `parking_lot::Mutex`
/// and runs queries synchronously inside `async` methods, the way
/// `freeq-server`'s `Db` is called directly from handler code without a
/// `spawn_blocking` indirection — queries here are all simple indexed
/// point/range lookups.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(sql_err)?
        } else {
            Connection::open(path).map_err(sql_err)?
        };
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tailnet_peers (
                peer_id        TEXT NOT NULL,
                coordinator_id TEXT NOT NULL,
                node           BLOB NOT NULL,
                status         TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                PRIMARY KEY (peer_id, coordinator_id)
            );

            CREATE TABLE IF NOT EXISTS tailnet_tunnels (
                coordinator_id TEXT NOT NULL,
                src            TEXT NOT NULL,
                dst            TEXT NOT NULL,
                PRIMARY KEY (coordinator_id, src, dst)
            );
            CREATE INDEX IF NOT EXISTS idx_tunnels_src ON tailnet_tunnels(src);
            CREATE INDEX IF NOT EXISTS idx_tunnels_dst ON tailnet_tunnels(dst);

            CREATE TABLE IF NOT EXISTS tailnet_coordinators (
                coordinator_id TEXT PRIMARY KEY,
                heartbeat_at   TEXT NOT NULL
            );
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn row_to_binding(row: &rusqlite::Row) -> rusqlite::Result<PeerBinding> {
        let peer_id: String = row.get(0)?;
        let coordinator_id: String = row.get(1)?;
        let node: Vec<u8> = row.get(2)?;
        let status: String = row.get(3)?;
        let updated_at: String = row.get(4)?;
        Ok(PeerBinding {
            peer_id: Uuid::parse_str(&peer_id).unwrap_or_default(),
            coordinator_id: Uuid::parse_str(&coordinator_id).unwrap_or_default(),
            node: Node::from_bytes(node),
            status: status_from_str(&status),
            updated_at: updated_at
                .parse()
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_tailnet_peer(
        &self,
        peer_id: Uuid,
        coordinator_id: Uuid,
        node: &Node,
        status: PeerStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tailnet_peers (peer_id, coordinator_id, node, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(peer_id, coordinator_id) DO UPDATE SET
                node = excluded.node, status = excluded.status, updated_at = excluded.updated_at",
            params![
                peer_id.to_string(),
                coordinator_id.to_string(),
                node.as_bytes(),
                status_to_str(status),
                now,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_tailnet_peer(
        &self,
        peer_id: Uuid,
        coordinator_id: Uuid,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "DELETE FROM tailnet_peers WHERE peer_id = ?1 AND coordinator_id = ?2",
                params![peer_id.to_string(), coordinator_id.to_string()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NoRows);
        }
        Ok(())
    }

    async fn update_tailnet_peer_status_by_coordinator(
        &self,
        coordinator_id: Uuid,
        status: PeerStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tailnet_peers SET status = ?1, updated_at = ?2 WHERE coordinator_id = ?3",
            params![status_to_str(status), now, coordinator_id.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn upsert_tailnet_tunnel(
        &self,
        coordinator_id: Uuid,
        src: Uuid,
        dst: Uuid,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tailnet_tunnels (coordinator_id, src, dst) VALUES (?1, ?2, ?3)
             ON CONFLICT(coordinator_id, src, dst) DO NOTHING",
            params![coordinator_id.to_string(), src.to_string(), dst.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_tailnet_tunnel(
        &self,
        coordinator_id: Uuid,
        src: Uuid,
        dst: Uuid,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "DELETE FROM tailnet_tunnels WHERE coordinator_id = ?1 AND src = ?2 AND dst = ?3",
                params![coordinator_id.to_string(), src.to_string(), dst.to_string()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NoRows);
        }
        Ok(())
    }

    async fn delete_all_tailnet_tunnels(
        &self,
        coordinator_id: Uuid,
        src: Uuid,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM tailnet_tunnels WHERE coordinator_id = ?1 AND src = ?2",
            params![coordinator_id.to_string(), src.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_tailnet_tunnel_peer_bindings(
        &self,
        peer_id: Uuid,
    ) -> Result<Vec<PeerBinding>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT p.peer_id, p.coordinator_id, p.node, p.status, p.updated_at
                 FROM tailnet_peers p
                 WHERE p.peer_id IN (
                    SELECT dst FROM tailnet_tunnels WHERE src = ?1
                    UNION
                    SELECT src FROM tailnet_tunnels WHERE dst = ?1
                 )",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![peer_id.to_string()], Self::row_to_binding)
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)?);
        }
        Ok(out)
    }

    async fn get_tailnet_tunnel_peer_ids(&self, peer_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT dst FROM tailnet_tunnels WHERE src = ?1
                 UNION
                 SELECT src FROM tailnet_tunnels WHERE dst = ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![peer_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            let s = row.map_err(sql_err)?;
            out.push(Uuid::parse_str(&s).unwrap_or_default());
        }
        Ok(out)
    }

    async fn get_tailnet_peers(&self, peer_id: Uuid) -> Result<Vec<PeerBinding>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT peer_id, coordinator_id, node, status, updated_at
                 FROM tailnet_peers WHERE peer_id = ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![peer_id.to_string()], Self::row_to_binding)
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)?);
        }
        Ok(out)
    }

    async fn upsert_tailnet_coordinator(&self, coordinator_id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tailnet_coordinators (coordinator_id, heartbeat_at) VALUES (?1, ?2)
             ON CONFLICT(coordinator_id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
            params![coordinator_id.to_string(), now],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_tailnet_coordinators(
        &self,
        max_age_seconds: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(max_age_seconds)).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT coordinator_id FROM tailnet_coordinators WHERE heartbeat_at >= ?1")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            let s = row.map_err(sql_err)?;
            out.push(Uuid::parse_str(&s).unwrap_or_default());
        }
        Ok(out)
    }

    async fn clean_tailnet_coordinators(&self) -> Result<(), StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM tailnet_coordinators WHERE heartbeat_at < ?1",
            params![cutoff],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn clean_tailnet_lost_peers(&self) -> Result<(), StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM tailnet_peers WHERE status = 'lost' AND updated_at < ?1",
            params![cutoff],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn clean_tailnet_tunnels(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM tailnet_tunnels t
             WHERE NOT EXISTS (
                SELECT 1 FROM tailnet_coordinators c WHERE c.coordinator_id = t.coordinator_id
             )",
            [],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

/// Convenience used by `delete_tailnet_peer`/`delete_tailnet_tunnel` callers
/// that want idempotent-delete semantics (see spec §4.2, §4.3).
pub fn ignore_no_rows(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(e) if e.is_no_rows() => Ok(()),
        other => other,
    }
}
