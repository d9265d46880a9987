//! 健康检查 API

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    image_registry: String,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

/// 健康检查
///
/// GET /health
/// 无需认证
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "xjp-api-deployer",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        image_registry: state.config.image_registry.clone(),
    })
}
