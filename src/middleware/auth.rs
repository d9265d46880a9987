//! 命名空间认证中间件
//!
//! 提供 `AuthorizedNamespace` extractor：从 `Authorization: Bearer` 解析租户命名空间，
//! 鉴权失败时在进入 handler 之前直接返回 401 / 403

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

use crate::domain::namespace::Namespace;
use crate::error::DeployError;
use crate::services::namespace::Credentials;
use crate::state::AppState;

/// 已鉴权的请求方命名空间
///
/// # Example
///
/// ```ignore
/// async fn protected_handler(
///     AuthorizedNamespace(namespace): AuthorizedNamespace,
///     State(state): State<Arc<AppState>>,
/// ) -> impl IntoResponse {
///     // handler 逻辑...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthorizedNamespace(pub Namespace);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthorizedNamespace {
    type Rejection = DeployError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let credentials = Credentials::from_headers(&parts.headers);
        state.resolver.authorize(&credentials).await.map(Self)
    }
}
