//! Process-level configuration (`spec.md` §6 config loader is an external
//! collaborator — this is the proxy's own CLI surface around it). Generalized
//! from `server/proxy_cli_args.rs`: kept `port`/`works`/`http_port`/
//! `log_level`, dropped `cp_addr`/`ControlPlaneArgs` (see `DESIGN.md`) and
//! replaced the dynamic `BackendConfigArgs::Cluster` resolution with a static,
//! flag-driven cluster table good enough to run the proxy end-to-end without
//! the external topology resolver.

use crate::backend::cluster::{ClusterSpec, StaticClusterResolver};
use crate::backend::pool::BackendPoolConfig;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "my-proxy", about = "MySQL wire-protocol proxy")]
pub struct ProxyServerArgs {
    /// Port the proxy listens on for frontend (client) connections.
    #[arg(long, default_value_t = 3307)]
    pub port: u16,

    /// Tokio worker threads.
    #[arg(long, default_value_t = num_cpus())]
    pub works: usize,

    /// Port the metrics/REST sidecar listens on.
    #[arg(long, default_value_t = 9090)]
    pub http_port: u16,

    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long, default_value_t = false)]
    pub enable_metrics: bool,

    #[arg(long, default_value_t = false)]
    pub enable_rest: bool,

    /// Logical database name this proxy's one configured cluster serves.
    #[arg(long, default_value = "app")]
    pub db_name: String,

    #[arg(long, default_value = "127.0.0.1:3306")]
    pub master_addr: String,

    #[arg(long)]
    pub replica_addr: Option<String>,

    #[arg(long, default_value = "root")]
    pub backend_username: String,

    #[arg(long, default_value = "")]
    pub backend_password: String,

    /// Credential the proxy itself checks on the frontend handshake.
    #[arg(long, default_value = "root")]
    pub proxy_username: String,

    #[arg(long, default_value = "")]
    pub proxy_password: String,

    #[arg(long, default_value_t = 50)]
    pub backend_pool_max_size: u32,
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ProxyServerArgs {
    pub fn new_backend_pool_config(&self) -> BackendPoolConfig {
        BackendPoolConfig {
            max_size: self.backend_pool_max_size,
            ..Default::default()
        }
    }

    /// Builds the single static cluster this proxy instance serves. A real
    /// deployment resolves many clusters from the (external) Cluster
    /// Resolver; this CLI surface only configures the one this process is
    /// dedicated to.
    pub fn new_cluster_resolver(&self) -> StaticClusterResolver {
        StaticClusterResolver::new(vec![ClusterSpec {
            db_name: self.db_name.clone(),
            master_addr: self.master_addr.clone(),
            replica_addr: self.replica_addr.clone(),
            username: self.backend_username.clone(),
            password: self.backend_password.clone(),
        }])
    }
}
