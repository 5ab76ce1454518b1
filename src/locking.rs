//! 内存文件锁：串行化同一租户同一文件上的写操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

use crate::storage::{FileName, TenantId};

/// Manages asynchronous mutexes keyed by `(tenant, file name)`.
#[derive(Debug)]
pub struct LockManager {
    locks: Mutex<HashMap<(TenantId, String), Arc<Mutex<()>>>>,
    wait_timeout: Duration,
}

/// Held while a file is being replaced or removed.
pub struct FileGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockManager {
    /// 创建新的锁管理器实例。
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    /// 在超时时间内获取文件锁，超时返回 None。
    pub async fn lock_file(&self, tenant: &TenantId, name: &FileName) -> Option<FileGuard> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds so the map tracks only live writers.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((tenant.clone(), name.as_str().to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(self.wait_timeout, lock.lock_owned())
            .await
            .ok()
            .map(|guard| FileGuard { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tenant: &str, name: &str) -> (TenantId, FileName) {
        (
            TenantId::parse(tenant).expect("tenant"),
            FileName::parse(name).expect("name"),
        )
    }

    #[tokio::test]
    async fn second_writer_times_out_while_held() {
        let manager = LockManager::new(Duration::from_millis(20));
        let (tenant, name) = key("T1", "a.txt");
        let held = manager.lock_file(&tenant, &name).await.expect("first lock");
        assert!(manager.lock_file(&tenant, &name).await.is_none());
        drop(held);
        assert!(manager.lock_file(&tenant, &name).await.is_some());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let manager = LockManager::new(Duration::from_millis(20));
        let (t1, name) = key("T1", "a.txt");
        let (t2, _) = key("T2", "a.txt");
        let (_, other) = key("T1", "b.txt");
        let _held = manager.lock_file(&t1, &name).await.expect("lock");
        assert!(manager.lock_file(&t2, &name).await.is_some());
        assert!(manager.lock_file(&t1, &other).await.is_some());
    }
}
