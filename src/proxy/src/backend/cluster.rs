//! Cluster Resolver + Handle: supplies master/replica backend connections
//! for a logical database name (`spec.md` §6). Grounded on
//! `backend/router/mod.rs`'s tagged-enum-over-trait shape (the REDESIGN FLAG
//! in `spec.md` §9 — a closed set of cases rather than runtime dispatch) and
//! on `backend/backend_mgr.rs`'s master/replica-handle-aliasing idea,
//! simplified to the flat model `spec.md` §3/§4.3 describes: no tenant key,
//! no dynamic topology sync, just a static host list per cluster.

use crate::backend::conn::BackendConnection;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),
    #[error("failed to dial backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ClusterResolver: Send + Sync {
    async fn resolve(&self, cluster_name: &str) -> Result<Box<dyn ClusterHandle>, ClusterError>;
}

#[async_trait]
pub trait ClusterHandle: Send + Sync {
    async fn master(&self) -> Result<BackendConnection, ClusterError>;
    /// `Ok(None)` means no replica is configured — the caller aliases to
    /// master. `Err` is a transient dial failure; callers fall back to
    /// master rather than failing the bind (`spec.md` §4.3, §9).
    async fn replica(&self) -> Result<Option<BackendConnection>, ClusterError>;
    fn db_name(&self) -> &str;
}

/// One logical cluster: a master address, an optional replica address, and
/// the database name clients bind to. Replica aliasing to master when no
/// replica is configured happens once, at bind time (`spec.md` §4.3, §9) —
/// not as a null check at every call site.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub db_name: String,
    pub master_addr: String,
    pub replica_addr: Option<String>,
    pub username: String,
    pub password: String,
}

pub struct StaticClusterHandle {
    spec: ClusterSpec,
}

#[async_trait]
impl ClusterHandle for StaticClusterHandle {
    async fn master(&self) -> Result<BackendConnection, ClusterError> {
        BackendConnection::connect(
            &self.spec.master_addr,
            &self.spec.username,
            &self.spec.password,
            Some(&self.spec.db_name),
        )
        .await
        .map_err(|source| ClusterError::Dial {
            addr: self.spec.master_addr.clone(),
            source,
        })
    }

    async fn replica(&self) -> Result<Option<BackendConnection>, ClusterError> {
        let Some(addr) = self.spec.replica_addr.as_deref() else {
            return Ok(None);
        };
        BackendConnection::connect(
            addr,
            &self.spec.username,
            &self.spec.password,
            Some(&self.spec.db_name),
        )
        .await
        .map(Some)
        .map_err(|source| ClusterError::Dial {
            addr: addr.to_string(),
            source,
        })
    }

    fn db_name(&self) -> &str {
        &self.spec.db_name
    }
}

/// Resolves a cluster name against a static, in-process table of cluster
/// specs (`server::cli_args`'s trimmed backend configuration). A real
/// deployment would swap this for a topology service; the contract stays
/// the same.
#[derive(Debug, Default, Clone)]
pub struct StaticClusterResolver {
    clusters: HashMap<String, ClusterSpec>,
}

impl StaticClusterResolver {
    pub fn new(clusters: Vec<ClusterSpec>) -> Self {
        Self {
            clusters: clusters
                .into_iter()
                .map(|spec| (spec.db_name.clone(), spec))
                .collect(),
        }
    }
}

#[async_trait]
impl ClusterResolver for StaticClusterResolver {
    async fn resolve(&self, cluster_name: &str) -> Result<Box<dyn ClusterHandle>, ClusterError> {
        self.clusters
            .get(cluster_name)
            .cloned()
            .map(|spec| Box::new(StaticClusterHandle { spec }) as Box<dyn ClusterHandle>)
            .ok_or_else(|| ClusterError::UnknownCluster(cluster_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_cluster_name_errors() {
        let resolver = StaticClusterResolver::new(vec![]);
        let err = resolver.resolve("app").await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownCluster(name) if name == "app"));
    }

    #[test]
    fn db_name_reflects_the_spec() {
        let spec = ClusterSpec {
            db_name: "app".to_string(),
            master_addr: "127.0.0.1:3306".to_string(),
            replica_addr: None,
            username: "root".to_string(),
            password: String::new(),
        };
        let handle = StaticClusterHandle { spec };
        assert_eq!(handle.db_name(), "app");
    }

    #[tokio::test]
    async fn replica_is_none_when_unconfigured_no_second_dial() {
        let spec = ClusterSpec {
            db_name: "app".to_string(),
            master_addr: "127.0.0.1:3306".to_string(),
            replica_addr: None,
            username: "root".to_string(),
            password: String::new(),
        };
        let handle = StaticClusterHandle { spec };
        assert!(handle.replica().await.unwrap().is_none());
    }
}
