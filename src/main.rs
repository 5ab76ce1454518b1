//! cloud-drive server binary.
//!
//! A small per-tenant file store: every request names its tenant through the
//! `X-Telegram-ID` header and can upload, list, download and delete flat files
//! inside `<data_dir>/<tenant>`. The main entry point builds storage and the
//! tenant policy, wires the Axum router and serves it until shutdown.

mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod etag;
mod files;
mod http;
mod locking;
mod logging;
mod router;
mod storage;
mod version;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::auth::policy_from_config;
use crate::background::spawn_background_tasks;
use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::files::UploadConfig;
use crate::locking::LockManager;
use crate::router::{AppServices, build_router};
use crate::storage::Storage;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.data_dir)));
    storage.ensure_root().await?;

    let policy = policy_from_config(args.allowed_tenants.as_deref());
    info!(policy = ?policy, "tenant policy configured");

    let services = AppServices {
        storage: storage.clone(),
        lock_manager: Arc::new(LockManager::new(Duration::from_secs(
            args.lock_wait_timeout_secs,
        ))),
        policy,
        upload: Arc::new(UploadConfig {
            max_size: args.upload_max_size,
        }),
    };
    let app = build_router(services, &args.cors_origins);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(data_dir = %args.data_dir, "🚀 Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(
        storage,
        Duration::from_secs(args.temp_ttl_secs),
        Duration::from_secs(args.temp_sweep_interval_secs),
    );
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
