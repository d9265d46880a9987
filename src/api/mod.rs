//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod deploy;
pub mod health;
pub mod versions;

use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// multipart 边界和文本字段的额外余量
const MULTIPART_OVERHEAD_BYTES: u64 = 1 << 20;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state
        .config
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        // Health
        .merge(health::router())
        // Deploy & publish
        .merge(deploy::router())
        // Registry
        .merge(versions::router())
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::infra::kv::MemoryKv;
    use crate::services::apply::KubectlApplier;
    use crate::services::build::SkaffoldBuilder;
    use crate::services::namespace::StaticIdentityProvider;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let tokens = HashMap::from([("tok-alice".to_string(), "alice".to_string())]);
        let state = AppState::new(
            EnvConfig {
                max_upload_bytes: 1024,
                ..EnvConfig::default()
            },
            Arc::new(StaticIdentityProvider::new(tokens)),
            Arc::new(MemoryKv::new()),
            Arc::new(SkaffoldBuilder::new("skaffold")),
            Arc::new(KubectlApplier::new("kubectl", Duration::from_secs(1))),
        );
        router(Arc::new(state))
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deploy_requires_token() {
        let response = app()
            .oneshot(
                Request::post("/deploy")
                    .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_deploy_rejects_declared_oversize() {
        let response = app()
            .oneshot(
                Request::post("/deploy")
                    .header(header::AUTHORIZATION, "Bearer tok-alice")
                    .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
                    .header(header::CONTENT_LENGTH, "4096")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_publish_unknown_version() {
        let response = app()
            .oneshot(
                Request::post("/publish")
                    .header(header::AUTHORIZATION, "Bearer tok-alice")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"image":"alice/hello:1.0"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_versions_empty() {
        let response = app()
            .oneshot(
                Request::get("/apis/alice/hello")
                    .header(header::AUTHORIZATION, "Bearer tok-alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_versions_rejects_dot_segments() {
        let response = app()
            .oneshot(
                Request::get("/apis/alice/..")
                    .header(header::AUTHORIZATION, "Bearer tok-alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
