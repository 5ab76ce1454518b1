//! 按租户划分的文件存储：名称校验、路径解析与目录操作。

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MAX_TENANT_ID_LEN;

const MAX_FILE_NAME_LEN: usize = 255;
const TEMP_MARKER: &str = ".tmp.";
const TEMP_BASE_MAX_LEN: usize = 64;

/// Identifier of the tenant owning a directory under the data root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let value = raw.trim();
        if value.len() > MAX_TENANT_ID_LEN
            || value.starts_with('.')
            || !is_single_segment(value)
        {
            return Err(StorageError::InvalidTenant);
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A flat file name inside a tenant directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileName(String);

impl FileName {
    /// 校验文件名只能是单个普通路径段，且不与临时文件命名冲突。
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        if raw.len() > MAX_FILE_NAME_LEN || !is_single_segment(raw) || is_temp_name(raw) {
            return Err(StorageError::InvalidName);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_single_segment(value: &str) -> bool {
    if value.is_empty() || value.contains(['/', '\\']) || value.chars().any(char::is_control) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Builds the sibling temp name used while a file is being written.
///
/// Only a bounded prefix of `base` is kept so the temp name stays within
/// filesystem name limits for any name `FileName::parse` accepts.
pub fn temp_name_for(base: &str) -> String {
    let mut end = base.len().min(TEMP_BASE_MAX_LEN);
    while !base.is_char_boundary(end) {
        end -= 1;
    }
    format!(".{}{TEMP_MARKER}{}", &base[..end], Uuid::new_v4())
}

/// 判断名称是否为上传过程中的临时文件。
pub fn is_temp_name(name: &str) -> bool {
    if !name.starts_with('.') {
        return false;
    }
    name.rsplit_once(TEMP_MARKER)
        .map(|(_, suffix)| Uuid::parse_str(suffix).is_ok())
        .unwrap_or(false)
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str())
    }

    /// 确保租户目录存在（递归、幂等），错误会向上返回。
    pub async fn ensure_tenant_dir(&self, tenant: &TenantId) -> Result<PathBuf, StorageError> {
        let dir = self.tenant_dir(tenant);
        fs::create_dir_all(&dir).await?;
        self.ensure_no_symlink_components(&dir, false).await?;
        Ok(dir)
    }

    /// Resolves `<root>/<tenant>/<name>`, refusing symlinked components.
    pub async fn resolve_file(
        &self,
        tenant: &TenantId,
        name: &FileName,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.tenant_dir(tenant).join(name.as_str());
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidName)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidName);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidName);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 列出租户目录下的条目名称（含子目录，排除临时文件）。
    ///
    /// A tenant that never uploaded has no directory yet and gets an empty list.
    pub async fn list_files(&self, tenant: &TenantId) -> Result<Vec<String>, StorageError> {
        let dir_path = self.tenant_dir(tenant);
        match self.ensure_no_symlink_components(&dir_path, false).await {
            Ok(()) => {}
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        }

        let mut dir = fs::read_dir(&dir_path).await?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_temp_name(&name) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub async fn delete_file(&self, tenant: &TenantId, name: &FileName) -> Result<(), StorageError> {
        let target = self.resolve_file(tenant, name, false).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            return Err(StorageError::NotAFile);
        }
        fs::remove_file(target).await?;
        Ok(())
    }

    /// 清理超过 `ttl` 的残留临时文件，返回删除数量。
    pub async fn sweep_stale_temp_files(&self, ttl: Duration) -> io::Result<usize> {
        if ttl.is_zero() {
            return Ok(0);
        }
        let mut tenants = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(tenant) = tenants.next_entry().await? {
            let tenant_path = tenant.path();
            match tenant.file_type().await {
                Ok(file_type) if file_type.is_dir() => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(path = ?tenant_path, error = %err, "skipping tenant in temp sweep");
                    continue;
                }
            }
            let mut entries = match fs::read_dir(&tenant_path).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = ?tenant_path, error = %err, "skipping tenant in temp sweep");
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(path = ?tenant_path, error = %err, "temp sweep stopped for tenant");
                        break;
                    }
                };
                if !is_temp_name(&entry.file_name().to_string_lossy()) {
                    continue;
                }
                let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                    continue;
                };
                let Ok(age) = now.duration_since(modified) else {
                    continue;
                };
                if age < ttl {
                    continue;
                }
                let path = entry.path();
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        info!(path = ?path, "removed stale temp file");
                        removed += 1;
                    }
                    Err(err) => warn!(path = ?path, error = %err, "failed to remove stale temp file"),
                }
            }
        }
        Ok(removed)
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidTenant,
    InvalidName,
    NotAFile,
    Io(io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(err) if err.kind() == ErrorKind::NotFound)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidTenant => f.write_str("invalid tenant id"),
            StorageError::InvalidName => f.write_str("invalid file name"),
            StorageError::NotAFile => f.write_str("not a regular file"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
