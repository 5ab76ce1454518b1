//! 文件上传、列表、下载与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::{fmt_http_date, parse_http_date};
use serde::Serialize;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::locking::LockManager;
use crate::storage::{FileName, Storage, StorageError, TenantId};

const UPLOAD_FIELD: &str = "file";

#[derive(Debug)]
pub struct UploadConfig {
    /// 0 disables the limit.
    pub max_size: u64,
}

#[derive(Serialize)]
pub(crate) struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
pub(crate) struct FileListResponse {
    files: Vec<String>,
}

/// 接收 multipart 字段 `file`，原子写入租户目录（同名覆盖）。
pub async fn upload_file(
    Extension(tenant): Extension<TenantId>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let mut multipart = multipart.map_err(|rejection| {
        debug!(tenant = %tenant, error = %rejection, "upload is not a multipart form");
        ApiError::BadRequest("File error".into())
    })?;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                debug!(tenant = %tenant, error = %err, "malformed multipart body");
                return Err(ApiError::BadRequest("File error".into()));
            }
        };
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let name = field
            .file_name()
            .map(FileName::parse)
            .ok_or_else(|| ApiError::BadRequest("File error".into()))??;
        let size = store_upload(field, &tenant, &name, &storage, &lock_manager, &upload).await?;
        info!(tenant = %tenant, file = %name, size, "file uploaded");
        return Ok(JsonResponse(MessageResponse {
            message: "File uploaded",
        }));
    }

    debug!(tenant = %tenant, "upload without file field");
    Err(ApiError::BadRequest("File error".into()))
}

/// Streams one multipart field into place and returns the stored size.
async fn store_upload(
    mut field: Field<'_>,
    tenant: &TenantId,
    name: &FileName,
    storage: &Storage,
    lock_manager: &LockManager,
    upload: &UploadConfig,
) -> Result<u64, ApiError> {
    let _guard = lock_manager
        .lock_file(tenant, name)
        .await
        .ok_or_else(|| ApiError::Conflict("File is busy".into()))?;

    let cannot_save = |err: StorageError| match err {
        StorageError::InvalidName => ApiError::BadRequest("Invalid file name".into()),
        err => {
            error!(tenant = %tenant, file = %name, error = %err, "cannot prepare upload target");
            ApiError::Internal("Cannot save file".into())
        }
    };
    storage.ensure_tenant_dir(tenant).await.map_err(cannot_save)?;
    let target = storage
        .resolve_file(tenant, name, true)
        .await
        .map_err(cannot_save)?;
    if fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
        return Err(ApiError::BadRequest("Not a file".into()));
    }

    let mut atomic = AtomicFile::new(&target)
        .await
        .map_err(|err| cannot_save(err.into()))?;
    let write_result: Result<(), ApiError> = async {
        while let Some(chunk) = field.chunk().await.map_err(|err| {
            warn!(tenant = %tenant, file = %name, error = %err, "upload stream failed");
            ApiError::Internal("Failed to save".into())
        })? {
            if upload.max_size > 0 && atomic.written() + chunk.len() as u64 > upload.max_size {
                return Err(ApiError::PayloadTooLarge("File too large".into()));
            }
            atomic.write_all(&chunk).await.map_err(|err| {
                error!(tenant = %tenant, file = %name, error = %err, "upload write failed");
                ApiError::Internal("Failed to save".into())
            })?;
        }
        Ok(())
    }
    .await;
    if let Err(err) = write_result {
        atomic.cleanup().await;
        return Err(err);
    }

    let size = atomic.written();
    atomic.finalize().await.map_err(|err| {
        error!(tenant = %tenant, file = %name, error = %err, "upload commit failed");
        ApiError::Internal("Failed to save".into())
    })?;
    Ok(size)
}

/// 列出租户目录中的条目名称。
pub async fn list_files(
    Extension(tenant): Extension<TenantId>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<FileListResponse>, ApiError> {
    let files = storage.list_files(&tenant).await.map_err(|err| {
        warn!(tenant = %tenant, error = %err, "list files failed");
        ApiError::Internal("Cannot list files".into())
    })?;
    info!(tenant = %tenant, count = files.len(), "list files");
    Ok(JsonResponse(FileListResponse { files }))
}

/// 下载文件，支持 Range 与条件请求。
pub async fn download_file(
    Path(filename): Path<String>,
    request_headers: HeaderMap,
    Extension(tenant): Extension<TenantId>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let name = FileName::parse(&filename)?;
    let target = storage.resolve_file(&tenant, &name, false).await?;
    let metadata = fs::metadata(&target).await.map_err(StorageError::from)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("Not a file".into()));
    }

    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }

    if is_not_modified(&request_headers, &etag) {
        debug!(tenant = %tenant, file = %name, "download not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let mime = mime_guess::from_path(name.as_str()).first_or_octet_stream();
    response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = if if_range_allows(&request_headers, &etag, modified) {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = File::open(&target).await.map_err(StorageError::from)?;
    if let Some(ByteRange { start, end }) = range {
        let length = end - start + 1;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(StorageError::from)?;
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{file_size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        debug!(tenant = %tenant, file = %name, start, end, "download range");
        let stream = ReaderStream::new(file.take(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string())?);
    info!(tenant = %tenant, file = %name, size = file_size, "download file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 删除租户目录中的单个文件。
pub async fn delete_file(
    Path(filename): Path<String>,
    Extension(tenant): Extension<TenantId>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let name = FileName::parse(&filename)?;
    let _guard = lock_manager
        .lock_file(&tenant, &name)
        .await
        .ok_or_else(|| ApiError::Conflict("File is busy".into()))?;
    storage.delete_file(&tenant, &name).await.map_err(|err| {
        warn!(tenant = %tenant, file = %name, error = %err, "delete failed");
        ApiError::Internal("Cannot delete file".into())
    })?;
    info!(tenant = %tenant, file = %name, "file deleted");
    Ok(JsonResponse(MessageResponse { message: "Deleted" }))
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("Internal error".into()))
}

#[derive(Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

/// `If-Range` 与当前 ETag 或修改时间一致时才允许按范围响应。
fn if_range_allows(
    headers: &HeaderMap,
    etag: &str,
    modified: Option<SystemTime>,
) -> bool {
    let Some(value) = headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    else {
        return true;
    };
    if value.starts_with('"') || value.starts_with("W/") {
        return value == etag;
    }
    match (parse_http_date(value), modified) {
        (Ok(date), Some(ts)) => whole_seconds(ts) <= date,
        _ => false,
    }
}

/// HTTP dates carry whole seconds only; drop the sub-second part of mtimes.
fn whole_seconds(ts: SystemTime) -> SystemTime {
    ts.duration_since(UNIX_EPOCH)
        .map(|since| UNIX_EPOCH + Duration::from_secs(since.as_secs()))
        .unwrap_or(ts)
}

/// 解析单段 Range 头；多段与无效格式按 400 处理。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<ByteRange>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let invalid = || ApiError::BadRequest("Invalid Range header".into());
    let ranges = value
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("bytes="))
        .ok_or_else(invalid)?;
    if ranges.contains(',') {
        return Err(ApiError::BadRequest("Multiple ranges not supported".into()));
    }
    let (start_part, end_part) = ranges.split_once('-').ok_or_else(invalid)?;
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let last = file_size - 1;

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), last)
    } else {
        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end = if end_part.is_empty() {
            last
        } else {
            end_part.parse::<u64>().map_err(|_| invalid())?.min(last)
        };
        (start, end)
    };

    if start > end || start > last {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some(ByteRange { start, end }))
}
