//! 租户识别与授权：从请求头解析租户，并交由可注入的策略判定。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::{middleware, response::Response};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{TENANT_HEADER, split_list};
use crate::error::ApiError;
use crate::storage::TenantId;

/// Decides whether a tenant may use the file endpoints.
pub trait TenantPolicy: Send + Sync + fmt::Debug {
    fn is_authorized(&self, tenant: &TenantId) -> bool;
}

/// Accepts every well-formed tenant id.
#[derive(Debug, Default)]
pub struct AllowAll;

impl TenantPolicy for AllowAll {
    fn is_authorized(&self, _tenant: &TenantId) -> bool {
        true
    }
}

/// Fixed set of tenants with an active subscription.
#[derive(Debug, Default)]
pub struct AllowList {
    tenants: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenants: tenants.into_iter().map(Into::into).collect(),
        }
    }
}

impl TenantPolicy for AllowList {
    fn is_authorized(&self, tenant: &TenantId) -> bool {
        self.tenants.contains(tenant.as_str())
    }
}

/// 根据配置构建授权策略：未配置名单时放行所有租户。
pub fn policy_from_config(allowed_tenants: Option<&str>) -> Arc<dyn TenantPolicy> {
    match allowed_tenants {
        Some(value) => Arc::new(AllowList::new(split_list(value))),
        None => Arc::new(AllowAll),
    }
}

/// 租户中间件：解析 `X-Telegram-ID`，校验策略后写入请求扩展。
pub async fn tenant_middleware(
    Extension(policy): Extension<Arc<dyn TenantPolicy>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let raw = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        return Err(ApiError::Unauthorized("No Telegram ID".into()));
    }

    let tenant = TenantId::parse(raw)?;
    if !policy.is_authorized(&tenant) {
        warn!(tenant = %tenant, "tenant not authorized");
        return Err(ApiError::Forbidden("Subscription inactive".into()));
    }

    debug!(tenant = %tenant, "tenant resolved");
    req.extensions_mut().insert(tenant);
    Ok(next.run(req).await)
}
