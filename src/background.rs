//! 残留上传临时文件的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::Storage;

/// 启动后台任务：按间隔清理超过 `ttl` 的临时文件（`ttl` 为 0 时不启动）。
pub fn spawn_background_tasks(storage: Arc<Storage>, ttl: Duration, interval: Duration) {
    if ttl.is_zero() || interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match storage.sweep_stale_temp_files(ttl).await {
                Ok(removed) => debug!(removed, "temp sweep finished"),
                Err(err) => warn!(error = %err, "temp sweep failed"),
            }
        }
    });
}
