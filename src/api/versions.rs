//! 版本查询 API

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::DeployResult;
use crate::middleware::AuthorizedNamespace;
use crate::services::registry::VersionSummary;
use crate::state::AppState;

/// 版本列表响应
#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub author: String,
    pub name: String,
    pub versions: Vec<VersionSummary>,
}

/// 创建版本查询路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/apis/:author/:name", get(list_versions))
}

/// 列出请求方可见的版本
///
/// GET /apis/:author/:name
/// 需要 Bearer 认证；非 owner 只能看到已公开的版本
async fn list_versions(
    AuthorizedNamespace(namespace): AuthorizedNamespace,
    State(state): State<Arc<AppState>>,
    Path((author, name)): Path<(String, String)>,
) -> DeployResult<Json<VersionsResponse>> {
    let versions = state
        .registry
        .list_versions(&author, &name, &namespace)
        .await?;

    Ok(Json(VersionsResponse {
        author,
        name,
        versions,
    }))
}
