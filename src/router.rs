//! 路由表与中间件栈。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{TenantPolicy, tenant_middleware};
use crate::files::{self, UploadConfig};
use crate::http::{add_security_headers, build_cors_layer, resolve_client_ip};
use crate::locking::LockManager;
use crate::storage::Storage;
use crate::version;

/// Shared services handed to every handler as request extensions.
#[derive(Clone)]
pub struct AppServices {
    pub storage: Arc<Storage>,
    pub lock_manager: Arc<LockManager>,
    pub policy: Arc<dyn TenantPolicy>,
    pub upload: Arc<UploadConfig>,
}

/// 构建完整的 Axum 路由（文件接口需经过租户中间件）。
pub fn build_router(services: AppServices, cors_origins: &str) -> Router {
    let file_routes = Router::new()
        .route(
            "/upload",
            post(files::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/files", get(files::list_files))
        .route("/download/{filename}", get(files::download_file))
        .route("/delete/{filename}", delete(files::delete_file))
        .route_layer(middleware::from_fn(tenant_middleware));

    let mut app = Router::new()
        .merge(file_routes)
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(services.storage))
        .layer(Extension(services.lock_manager))
        .layer(Extension(services.policy))
        .layer(Extension(services.upload));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::{Method, StatusCode, header};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::auth::{AllowAll, AllowList};
    use crate::config::DEFAULT_CORS_ORIGINS;

    const BOUNDARY: &str = "cloud-drive-test-boundary";

    struct TestApp {
        _temp: tempfile::TempDir,
        root: std::path::PathBuf,
        router: Router,
    }

    fn test_app_with(policy: Arc<dyn TenantPolicy>, max_size: u64) -> TestApp {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("data");
        let services = AppServices {
            storage: Arc::new(Storage::new(root.clone())),
            lock_manager: Arc::new(LockManager::new(Duration::from_secs(5))),
            policy,
            upload: Arc::new(UploadConfig { max_size }),
        };
        TestApp {
            _temp: temp,
            root,
            router: build_router(services, DEFAULT_CORS_ORIGINS),
        }
    }

    fn test_app() -> TestApp {
        test_app_with(Arc::new(AllowAll), 0)
    }

    fn multipart_body(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    impl TestApp {
        async fn send(&self, request: Request<AxumBody>) -> Response {
            self.router
                .clone()
                .oneshot(request)
                .await
                .expect("router is infallible")
        }

        async fn upload(&self, tenant: &str, filename: &str, content: &[u8]) -> Response {
            self.upload_field(tenant, "file", filename, content).await
        }

        async fn upload_field(
            &self,
            tenant: &str,
            field: &str,
            filename: &str,
            content: &[u8],
        ) -> Response {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/upload")
                .header("x-telegram-id", tenant)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(AxumBody::from(multipart_body(field, filename, content)))
                .expect("request");
            self.send(request).await
        }

        async fn call(&self, method: Method, uri: &str, tenant: Option<&str>) -> Response {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(tenant) = tenant {
                builder = builder.header("x-telegram-id", tenant);
            }
            self.send(builder.body(AxumBody::empty()).expect("request"))
                .await
        }
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json body")
    }

    #[tokio::test]
    async fn notes_scenario_round_trip() {
        let app = test_app();

        let response = app.upload("T1", "notes.txt", b"hello").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "message": "File uploaded" }));

        let response = app.call(Method::GET, "/files", Some("T1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "files": ["notes.txt"] }));

        let response = app
            .call(Method::GET, "/download/notes.txt", Some("T1"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"hello");

        let response = app
            .call(Method::DELETE, "/delete/notes.txt", Some("T1"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "message": "Deleted" }));

        let response = app
            .call(Method::GET, "/download/notes.txt", Some("T1"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await, json!({ "error": "File not found" }));
    }

    #[tokio::test]
    async fn second_upload_overwrites_first() {
        let app = test_app();
        assert_eq!(
            app.upload("T1", "a.bin", b"first payload").await.status(),
            StatusCode::OK
        );
        assert_eq!(
            app.upload("T1", "a.bin", b"second").await.status(),
            StatusCode::OK
        );

        let response = app.call(Method::GET, "/download/a.bin", Some("T1")).await;
        assert_eq!(body_bytes(response).await, b"second");

        let response = app.call(Method::GET, "/files", Some("T1")).await;
        assert_eq!(body_json(response).await, json!({ "files": ["a.bin"] }));
    }

    #[tokio::test]
    async fn binary_content_round_trips() {
        let app = test_app();
        let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        assert_eq!(
            app.upload("T1", "blob.dat", &payload).await.status(),
            StatusCode::OK
        );
        let response = app
            .call(Method::GET, "/download/blob.dat", Some("T1"))
            .await;
        assert_eq!(body_bytes(response).await, payload);
    }

    #[tokio::test]
    async fn listing_before_first_upload_is_empty() {
        let app = test_app();
        let response = app.call(Method::GET, "/files", Some("fresh")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "files": [] }));
    }

    #[tokio::test]
    async fn deleting_missing_file_is_server_error() {
        let app = test_app();
        let response = app
            .call(Method::DELETE, "/delete/ghost.txt", Some("T1"))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Cannot delete file" })
        );
    }

    #[tokio::test]
    async fn tenants_cannot_see_each_other() {
        let app = test_app();
        app.upload("T1", "private.txt", b"mine").await;

        let response = app.call(Method::GET, "/files", Some("T2")).await;
        assert_eq!(body_json(response).await, json!({ "files": [] }));

        let response = app
            .call(Method::GET, "/download/private.txt", Some("T2"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .call(Method::GET, "/download/..%2FT1%2Fprivate.txt", Some("T2"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app.root.join("T1").join("private.txt").exists());
    }

    #[tokio::test]
    async fn upload_rejects_traversal_filename() {
        let app = test_app();
        let response = app.upload("T1", "..", b"x").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Invalid file name" })
        );
        assert!(!app.root.join("T1").exists());
    }

    #[tokio::test]
    async fn upload_without_file_field_is_client_error() {
        let app = test_app();
        let response = app
            .upload_field("T1", "attachment", "notes.txt", b"hello")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({ "error": "File error" }));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header("x-telegram-id", "T1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from("{}"))
            .expect("request");
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({ "error": "File error" }));
    }

    #[tokio::test]
    async fn upload_accepts_long_file_name() {
        let app = test_app();
        let name = "a".repeat(240);

        let response = app.upload("T1", &name, b"long").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .call(Method::GET, &format!("/download/{name}"), Some("T1"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"long");
    }

    #[tokio::test]
    async fn upload_fails_when_tenant_dir_cannot_be_created() {
        let app = test_app();
        std::fs::create_dir_all(&app.root).expect("root");
        std::fs::write(app.root.join("T1"), b"not a directory").expect("blocker");

        let response = app.upload("T1", "notes.txt", b"hello").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Cannot save file" })
        );
        assert_eq!(
            std::fs::read(app.root.join("T1")).expect("blocker"),
            b"not a directory"
        );
    }

    #[tokio::test]
    async fn upload_over_limit_leaves_nothing_behind() {
        let app = test_app_with(Arc::new(AllowAll), 4);
        let response = app.upload("T1", "big.bin", b"0123456789").await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let entries: Vec<_> = std::fs::read_dir(app.root.join("T1"))
            .expect("tenant dir")
            .collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn missing_tenant_header_is_unauthorized() {
        let app = test_app();
        let response = app.call(Method::GET, "/files", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await, json!({ "error": "No Telegram ID" }));
    }

    #[tokio::test]
    async fn malformed_tenant_is_rejected() {
        let app = test_app();
        let response = app.call(Method::GET, "/files", Some("..")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tenant_outside_allow_list_is_forbidden() {
        let app = test_app_with(Arc::new(AllowList::new(["1353152381"])), 0);
        let response = app.call(Method::GET, "/files", Some("42")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Subscription inactive" })
        );

        let response = app.call(Method::GET, "/files", Some("1353152381")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_preflight_allows_dev_origin() {
        let app = test_app();
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/upload")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(AxumBody::empty())
            .expect("request");
        let response = app.send(request).await;
        let headers = response.headers();
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .expect("allow origin"),
            "http://localhost:5173"
        );
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .expect("credentials"),
            "true"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_MAX_AGE).expect("max age"),
            "43200"
        );
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let app = test_app();
        let response = app.call(Method::GET, "/files", Some("T1")).await;
        assert_eq!(
            response.headers().get(header::X_FRAME_OPTIONS).expect("xfo"),
            "DENY"
        );
        assert_eq!(
            response
                .headers()
                .get(header::X_CONTENT_TYPE_OPTIONS)
                .expect("nosniff"),
            "nosniff"
        );
    }

    #[tokio::test]
    async fn version_needs_no_tenant() {
        let app = test_app();
        let response = app.call(Method::GET, "/api/version", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
