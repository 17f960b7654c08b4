//! Per-connection Session state (`spec.md` §3). Owned exclusively by the one
//! Tokio task running that connection's command loop — no field here is ever
//! touched concurrently (`spec.md` §5).

use crate::backend::cluster::{ClusterError, ClusterHandle, ClusterResolver};
use crate::backend::conn::BackendConnection;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::session::registry::Registry;
use mysql_common::constants::CapabilityFlags;
use std::sync::Arc;
use tracing::warn;

/// A user record the (external) auth/config store hands the session at
/// connect time: the account's default database and the cluster it lives on.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub default_db: String,
    pub cluster_name: String,
}

pub struct Session {
    pub user: UserRecord,
    pub client_capabilities: CapabilityFlags,
    pub current_db: Option<String>,
    pub in_autocommit: bool,
    pub in_transaction: bool,
    pub last_command: u8,
    pub registry: Registry,
    cluster: Option<Box<dyn ClusterHandle>>,
    master: Option<BackendConnection>,
    replica: Option<BackendConnection>,
}

impl Session {
    pub fn new(user: UserRecord, client_capabilities: CapabilityFlags) -> Self {
        Self {
            user,
            client_capabilities,
            current_db: None,
            in_autocommit: true,
            in_transaction: false,
            last_command: 0,
            registry: Registry::new(),
            cluster: None,
            master: None,
            replica: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn bound_db_name(&self) -> Option<&str> {
        self.current_db.as_deref()
    }

    /// `COM_INIT_DB` / first-query cluster binding (`spec.md` §4.3). The
    /// first successful bind resolves the cluster and acquires master +
    /// replica (replica aliases to master if unavailable). A later bind to a
    /// different database fails with `ER_BAD_DB_ERROR` — one cluster per
    /// session.
    pub async fn bind(
        &mut self,
        resolver: &dyn ClusterResolver,
        db_name: &str,
    ) -> Result<(), ErrorKind> {
        if let Some(bound) = &self.current_db {
            return if bound == db_name {
                Ok(())
            } else {
                Err(ErrorKind::ER_BAD_DB_ERROR)
            };
        }
        if db_name != self.user.default_db {
            return Err(ErrorKind::ER_BAD_DB_ERROR);
        }

        let cluster = resolver
            .resolve(&self.user.cluster_name)
            .await
            .map_err(|_| ErrorKind::ER_BAD_DB_ERROR)?;
        let master = cluster.master().await.map_err(|_| ErrorKind::ER_BAD_DB_ERROR)?;
        let replica = match cluster.replica().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = ?e, "replica acquisition failed, falling back to master");
                None
            }
        };

        self.current_db = Some(db_name.to_string());
        self.cluster = Some(cluster);
        self.master = Some(master);
        self.replica = replica;
        Ok(())
    }

    /// Master handle, required once bound. Pinned for the whole transaction
    /// by the caller never requesting a rebind mid-transaction (`spec.md`
    /// §4.2).
    pub fn master_mut(&mut self) -> Option<&mut BackendConnection> {
        self.master.as_mut()
    }

    /// Falls back to master when no replica connection was acquired at bind
    /// time (`spec.md` §4.3: "if replica acquisition fails, replica = master").
    pub fn replica_mut(&mut self) -> Option<&mut BackendConnection> {
        self.replica.as_mut().or(self.master.as_mut())
    }

    /// A transport-fatal error on either backend invalidates the binding and
    /// every registered prepared statement (`spec.md` §5).
    pub fn invalidate_binding(&mut self) {
        self.cluster = None;
        self.master = None;
        self.replica = None;
        self.current_db = None;
        self.registry.invalidate_all();
    }
}

pub type SharedResolver = Arc<dyn ClusterResolver>;
