use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use samovar::rpc::pb::forward_server::ForwardServer;
use samovar::{
    discovery, ingest, proxy::ProxyRouter, server, Config, Discovery, ForwardService, HashRing,
    Mode, PipelineError, PipelineStats, Server, StaticDiscovery,
};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| PipelineError::from("usage: samovar <config.json>"))?;
    let config = Config::from_file(&path)?;
    config.validate()?;
    info!("starting samovar in {:?} mode", config.mode);

    match config.mode {
        Mode::Local | Mode::Global => run_aggregator(config).await,
        Mode::Proxy => run_proxy(config).await,
    }
}

async fn run_aggregator(config: Config) -> Result<(), PipelineError> {
    let stats = Arc::new(PipelineStats::default());
    let ring = Arc::new(HashRing::default());
    let discovery: Arc<dyn Discovery> = Arc::new(StaticDiscovery::new(config.initial_members()));
    // One synchronous refresh before accepting any traffic.
    discovery::refresh_once(discovery.as_ref(), &ring, &config.membership_service_name).await;

    let sinks = samovar::sink::build_sinks(&config.sinks)?;
    let server = Arc::new(Server::new(&config, sinks, ring.clone(), stats));

    let mut listeners: Vec<JoinHandle<()>> = Vec::new();
    if let Some(addr) = config.statsd_listen_address {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        listeners.extend(ingest::spawn_statsd_udp(
            socket,
            server.clone(),
            config.num_readers,
            config.read_buffer_bytes,
        ));
        let tcp = TcpListener::bind(addr).await?;
        listeners.push(ingest::spawn_statsd_tcp(tcp, server.clone()));
        info!("line-dialect listener on {addr}");
    }
    if let Some(addr) = config.binary_listen_address {
        let tcp = TcpListener::bind(addr).await?;
        listeners.push(ingest::spawn_binary_tcp(
            tcp,
            server.clone(),
            Arc::new(ingest::BundleDecoder),
        ));
        info!("binary-dialect listener on {addr}");
    }

    let watcher = discovery::spawn_watcher(
        discovery,
        ring,
        config.membership_service_name.clone(),
        config.membership_refresh_interval(),
    );
    let flush = server::spawn_flush_loop(server.clone());

    let (rpc_shutdown_tx, rpc_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let rpc = if config.mode == Mode::Global {
        let addr = config
            .grpc_address
            .ok_or_else(|| PipelineError::from("global mode needs grpc_address"))?;
        let service = ForwardServer::new(ForwardService::new(server.clone()));
        info!("forward rpc listener on {addr}");
        Some(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_shutdown(addr, async {
                    let _ = rpc_shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                error!("forward rpc server failed: {err}");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down: stopping ingest, running final flush");
    for listener in listeners {
        listener.abort();
    }
    watcher.abort();
    flush.abort();
    let _ = rpc_shutdown_tx.send(());
    server.shutdown(SHUTDOWN_DEADLINE).await;
    if let Some(task) = rpc {
        let _ = task.await;
    }
    info!("bye");
    Ok(())
}

async fn run_proxy(config: Config) -> Result<(), PipelineError> {
    let stats = Arc::new(PipelineStats::default());
    let ring = Arc::new(HashRing::default());
    let discovery: Arc<dyn Discovery> =
        Arc::new(StaticDiscovery::new(config.static_members.clone()));
    discovery::refresh_once(discovery.as_ref(), &ring, &config.membership_service_name).await;

    let watcher = discovery::spawn_watcher(
        discovery,
        ring.clone(),
        config.membership_service_name.clone(),
        config.membership_refresh_interval(),
    );

    let addr = config
        .grpc_address
        .ok_or_else(|| PipelineError::from("proxy mode needs grpc_address"))?;
    let router = ProxyRouter::new(ring, stats);
    info!("proxy forward rpc listener on {addr}");
    tonic::transport::Server::builder()
        .add_service(ForwardServer::new(router))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down: draining in-flight streams");
        })
        .await?;

    watcher.abort();
    info!("bye");
    Ok(())
}
