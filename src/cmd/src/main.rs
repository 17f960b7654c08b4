use clap::Parser;
use common::metrics::process_unix::ProcessRecorder;
use common::ShutdownMessage;
use proxy::server::auth::StaticAuthenticator;
use proxy::server::cli_args::ProxyServerArgs;
use proxy::server::proxy_server::HaentglServer;
use proxy::server::ProxyServer;
use proxy::session::classifier::PrefixClassifier;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tokio::sync::Semaphore;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("ProxySrv process receive shutdown msg {msg}");
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("ProxySrv receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg =  format!("ProxySrv receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn start_metrics_and_rest(
    proxy_config: ProxyServerArgs,
    runtime: &Runtime,
    shutdown_rx: &Receiver<ShutdownMessage>,
) {
    let http_port = proxy_config.http_port;
    if proxy_config.enable_metrics {
        common::metrics::init_metrics_context();
        let mut process_recorder = ProcessRecorder::new(
            common::metrics::common_labels().clone(),
            shutdown_rx.clone(),
        );
        runtime.spawn(async move {
            process_recorder.start_auto_collect().await;
        });
        let shutdown_rx_clone = Box::new(shutdown_rx.clone());
        runtime.spawn(async move {
            web_service::http_server::HaentglProxyRest::start_server(
                "0.0.0.0".to_string(),
                http_port,
                true,
                shutdown_await(shutdown_rx_clone),
            )
            .await
        });
    }
    if proxy_config.enable_rest {
        let shutdown_rx_clone = Box::new(shutdown_rx.clone());
        runtime.spawn(async move {
            web_service::http_server::HaentglProxyRest::start_server(
                "0.0.0.0".to_string(),
                http_port,
                false,
                shutdown_await(shutdown_rx_clone),
            )
            .await
        });
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_config = ProxyServerArgs::parse();
    let log_level_string = proxy_config
        .log_level
        .clone()
        .unwrap_or("DEBUG".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("DEBUG,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let works = proxy_config.works;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("MONO_PROXY")
        .worker_threads(works)
        .build()?;

    info!("ProxySrv running config args={:?}", proxy_config);
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    start_metrics_and_rest(proxy_config.clone(), &runtime, &shutdown_rx);
    runtime.block_on(async {
        let resolver = Arc::new(proxy_config.new_cluster_resolver());
        let proxy_srv = HaentglServer::new(
            StaticAuthenticator::new(
                proxy_config.proxy_username.clone(),
                proxy_config.proxy_password.clone(),
            ),
            PrefixClassifier,
            resolver,
            proxy_config.db_name.clone(),
            proxy_config.db_name.clone(),
        );

        let port = proxy_config.port;
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await.unwrap();
        let proxy_srv_arc = Arc::new(proxy_srv);
        // Bounds how many sessions this process will hold backend connections
        // for concurrently (`backend::pool::BackendPoolConfig`, `spec.md` §1 —
        // connection pooling itself stays an external collaborator, this just
        // caps the proxy's own fan-out of dialed backend connections).
        let pool_config = proxy_config.new_backend_pool_config();
        let session_permits = Arc::new(Semaphore::new(pool_config.max_size as usize));
        loop {
            tokio::select! {
                shutdown_msg = shutdown_signal() => {
                    shutdown_tx.send(shutdown_msg.clone()).unwrap();
                    proxy_srv_arc.close().await;
                    break;
                }
                rs = tcp_listener.accept() => {
                   match rs {
                      Ok((stream, _addr)) => {
                         let proxy_arc_clone = Arc::clone(&proxy_srv_arc);
                         let permits_clone = Arc::clone(&session_permits);
                         runtime.spawn(async move {
                            let Ok(_permit) = permits_clone.acquire_owned().await else {
                                return;
                            };
                            if let Err(e) = proxy_arc_clone.serve_connection(stream).await {
                                warn!("ProxySrv session ended with error: {e:?}");
                            }
                         });
                      }
                      Err(e) => {
                          warn!("ProxySrv accept connection err. cause by {e:?}");
                      }
                   }
                }
            }
        };
        Ok(())
    })
}
