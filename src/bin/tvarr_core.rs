use anyhow::{Context, Result};
use clap::Parser;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tvarr_core::http::RelayService;
use tvarr_core::session::SessionManager;
use tvarr_core::settings::Settings;
use tvarr_core::transcode::{default_selection_strategy, TranscoderFactory};
use tvarr_core::worker::{DaemonRegistry, DaemonStreamManager, WorkerSpawner};

#[derive(Parser, Debug)]
#[command(name = "tvarr-core", version, about = "Live-streaming relay coordinator")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;
    info!(
        "tvarr-core {} starting, {} channels configured",
        env!("CARGO_PKG_VERSION"),
        settings.channels.len()
    );

    let cancel = CancellationToken::new();

    let registry = Arc::new(DaemonRegistry::new(settings.registry.clone()));
    registry.spawn_cleanup_task(cancel.clone());
    let stream_manager = Arc::new(DaemonStreamManager::new(registry.clone()));
    let spawner = WorkerSpawner::new(settings.spawner_config(), registry.clone());
    let factory = Arc::new(TranscoderFactory::new(
        registry.clone(),
        stream_manager.clone(),
        spawner,
        default_selection_strategy(),
        settings.transcoder_config(),
    ));

    let worker_addr: SocketAddr = settings
        .listen_worker
        .parse()
        .context("listen_worker address")?;
    {
        let stream_manager = stream_manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_manager.listen(worker_addr, cancel).await {
                error!("worker listener failed: {:#}", e);
            }
        });
    }

    let http_addr: SocketAddr = settings.listen_http.parse().context("listen_http address")?;
    let manager = SessionManager::new(settings, factory, cancel.clone());
    let service = RelayService::new(manager.clone());

    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding http listener on {http_addr}"))?;
    info!("http listening on {}", http_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!("connection {} ended: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                cancel.cancel();
                manager.shutdown().await;
                break;
            }
        }
    }
    info!("server closed");
    Ok(())
}
