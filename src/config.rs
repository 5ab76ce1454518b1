//! 命令行参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const TENANT_HEADER: &str = "x-telegram-id";
pub const MAX_TENANT_ID_LEN: usize = 128;
pub const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";
pub const CORS_MAX_AGE_SECS: u64 = 12 * 60 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_TEMP_SWEEP_INTERVAL_SECS: u64 = 900;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "cloud-drive", version = VERSION_INFO, about = "Per-tenant file store")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "CLOUD_DATA_DIR",
        default_value = "data",
        help = "Root directory holding one sub-directory per tenant"
    )]
    pub data_dir: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "CLOUD_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CLOUD_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "CLOUD_CORS_ORIGINS",
        default_value = DEFAULT_CORS_ORIGINS,
        help = "Comma separated CORS origins (empty to disable)"
    )]
    pub cors_origins: String,
    #[arg(
        long,
        env = "CLOUD_ALLOWED_TENANTS",
        help = "Comma separated tenant ids allowed to use the service (unset allows everyone)"
    )]
    pub allowed_tenants: Option<String>,
    #[arg(
        long,
        env = "CLOUD_UPLOAD_MAX_SIZE",
        default_value_t = 0,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "CLOUD_LOCK_WAIT_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "How long a write waits for a busy file before giving up"
    )]
    pub lock_wait_timeout_secs: u64,
    #[arg(
        long,
        env = "CLOUD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        help = "Age after which abandoned upload temp files are removed (0 to disable)"
    )]
    pub temp_ttl_secs: u64,
    #[arg(
        long,
        env = "CLOUD_TEMP_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_TEMP_SWEEP_INTERVAL_SECS,
        help = "Interval between temp file sweeps in seconds"
    )]
    pub temp_sweep_interval_secs: u64,
}

/// 拆分逗号分隔的配置值，去除空白与空项。
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
