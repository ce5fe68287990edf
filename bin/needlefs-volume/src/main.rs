//! needlefs volume server
//!
//! Serves needle I/O, batch delete and index sync over gRPC, admin
//! endpoints over HTTP, and optionally follows a leader's indexes.

use anyhow::{Context, Result};
use clap::Parser;
use needlefs_client::{VolumeServerPool, VolumeSyncer, to_grpc_address};
use needlefs_common::config::LogFormat;
use needlefs_common::{Config, NeedleMapKind, VolumeId};
use needlefs_replication::{Notifier, Registry};
use needlefs_storage::Store;
use needlefs_volume::admin::{self, AdminState};
use needlefs_volume::follower::run_follower;
use needlefs_volume::grpc_server;
use needlefs_volume::service::VolumeService;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "needlefs-volume")]
#[command(about = "needlefs volume server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/needlefs/volume.toml")]
    config: PathBuf,

    /// Admin HTTP listen address; gRPC listens on its port + 10000
    #[arg(short, long)]
    listen: Option<String>,

    /// Explicit gRPC listen address
    #[arg(long)]
    grpc_listen: Option<String>,

    /// Directory holding volume files
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Needle index backing structure (btree or compact)
    #[arg(long)]
    index_kind: Option<NeedleMapKind>,

    /// Volumes to create at startup when missing
    #[arg(long, value_delimiter = ',')]
    volumes: Vec<u32>,

    /// Leader volume server (HTTP address) to sync indexes from
    #[arg(long, env = "NEEDLEFS_LEADER")]
    leader: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Overlay command line flags on the configuration file
    fn merge_into(self, mut config: Config) -> Config {
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if self.grpc_listen.is_some() {
            config.server.grpc_listen = self.grpc_listen;
        }
        if let Some(dir) = self.dir {
            config.storage.dir = dir;
        }
        if let Some(kind) = self.index_kind {
            config.storage.index_kind = kind;
        }
        if !self.volumes.is_empty() {
            config.storage.volumes = self.volumes;
        }
        if self.leader.is_some() {
            config.sync.leader = self.leader;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.log_json {
            config.logging.format = LogFormat::Json;
        }
        config
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Ok(Config::from_file(path)?)
    } else {
        Ok(Config::default())
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();
    let config = args.merge_into(load_config(&config_path)?);

    init_logging(&config);

    info!("Starting needlefs volume server");
    info!("Config file: {}", config_path.display());
    info!(
        "Data directory: {} ({} index)",
        config.storage.dir.display(),
        config.storage.index_kind
    );

    let store = Arc::new(
        Store::open(&config.storage.dir, config.storage.index_kind)
            .context("failed to open volume store")?,
    );
    for &id in &config.storage.volumes {
        let id = VolumeId::new(id);
        if store.volume(id).is_err() {
            store.allocate_volume(id)?;
            info!("Created volume {}", id);
        }
    }

    let registry = Registry::with_builtins();
    let notifier = Notifier::new(registry.configured_queue(&config.notification).await?);

    let grpc_addr: SocketAddr = match &config.server.grpc_listen {
        Some(addr) => addr.clone(),
        None => to_grpc_address(&config.server.listen)?,
    }
    .parse()
    .context("invalid gRPC listen address")?;
    let admin_addr: SocketAddr = config
        .server
        .listen
        .parse()
        .context("invalid admin listen address")?;

    let service = Arc::new(VolumeService::new(
        Arc::clone(&store),
        notifier,
        config.sync.chunk_size,
    ));
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            cancel.cancel();
        });
    }

    let admin_state = Arc::new(AdminState {
        store: Arc::clone(&store),
        rpc_metrics: Arc::clone(service.rpc_metrics()),
        start_time: Instant::now(),
    });
    let admin_listener = TcpListener::bind(admin_addr).await?;
    info!("Admin endpoints on http://{}", admin_addr);
    let admin_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(admin_listener, admin::router(admin_state))
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Admin server error: {}", e);
            }
        })
    };

    let follower_handle = config.sync.leader.clone().map(|leader| {
        let syncer = VolumeSyncer::new(Arc::new(VolumeServerPool::new()), leader);
        tokio::spawn(run_follower(
            syncer,
            Arc::clone(&store),
            config.sync.interval(),
            cancel.clone(),
        ))
    });

    info!("Starting gRPC server on {}", grpc_addr);
    let result = Server::builder()
        .add_service(grpc_server(service, config.server.max_message_size))
        .serve_with_shutdown(grpc_addr, cancel.clone().cancelled_owned())
        .await;

    cancel.cancel();
    admin_handle.await.ok();
    if let Some(handle) = follower_handle {
        handle.await.ok();
    }
    store.sync().context("failed to sync volumes on shutdown")?;
    result?;

    info!("Volume server shut down gracefully");
    Ok(())
}
