//! 统一的 API 错误类型与 JSON 错误响应。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::storage::StorageError;

pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    RangeNotSatisfiable(u64),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    status,
                    headers,
                    Json(json!({ "error": "Range not satisfiable" })),
                )
                    .into_response()
            }
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::Internal(msg) => (status, Json(json!({ "error": msg }))).into_response(),
        }
    }
}

impl std::fmt::Debug for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::RangeNotSatisfiable(size) => write!(f, "{} (size {size})", self.status()),
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::Internal(msg) => write!(f, "{}: {msg}", self.status()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidTenant => ApiError::BadRequest("Invalid Telegram ID".into()),
            StorageError::InvalidName => ApiError::BadRequest("Invalid file name".into()),
            StorageError::NotAFile => ApiError::BadRequest("Not a file".into()),
            err if err.is_not_found() => ApiError::NotFound("File not found".into()),
            StorageError::Io(_) => ApiError::Internal("Internal error".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn renders_json_error_body() {
        let response = ApiError::Internal("Cannot list files".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value, json!({ "error": "Cannot list files" }));
    }

    #[test]
    fn range_error_carries_content_range() {
        let response = ApiError::RangeNotSatisfiable(42).into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).expect("header"),
            "bytes */42"
        );
    }

    #[test]
    fn storage_errors_keep_causes_private() {
        let not_found = StorageError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(matches!(ApiError::from(not_found), ApiError::NotFound(_)));

        let denied = StorageError::Io(std::io::Error::other("/data/T1/x: permission denied"));
        match ApiError::from(denied) {
            ApiError::Internal(msg) => assert!(!msg.contains("/data")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ApiError::from(StorageError::InvalidName),
            ApiError::BadRequest(_)
        ));
    }
}
