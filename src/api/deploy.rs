//! 部署与发布 API
//!
//! 包含 /deploy（SSE 事件流）和 /publish 端点

use axum::{
    extract::{Multipart, State},
    http::{header::CONTENT_LENGTH, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::env::constants::KEEPALIVE_INTERVAL_SECS;
use crate::domain::deploy::DeployEvent;
use crate::error::{DeployError, DeployResult};
use crate::middleware::AuthorizedNamespace;
use crate::services::pipeline::{self, DeploySource, PipelineContext};
use crate::state::{event_sink, AppState};

/// multipart 字段名
const FIELD_NAME: &str = "name";
const FIELD_FROM_PUBLISHED: &str = "from_published";
const FIELD_CONTEXT: &str = "context";

/// 创建部署路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/publish", post(publish))
}

/// 部署
///
/// POST /deploy
/// 需要 Bearer 认证。multipart 表单：`from_published`，或可选的 `name` 加 `context` 归档。
/// 响应为 SSE：`stage` / `log` 事件，最后是 `complete` 或 `error`。
async fn deploy(
    AuthorizedNamespace(namespace): AuthorizedNamespace,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> DeployResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // 声明长度超限时直接拒绝，不进入事件流
    let declared_len = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    state.extractor.check_declared_len(declared_len)?;

    let (sink, rx) = event_sink::channel();
    let ctx = PipelineContext::new(state, namespace, sink);
    debug!(request_id = %ctx.request_id, namespace = %ctx.namespace, "Deploy request accepted");

    tokio::spawn(handle_upload(ctx, multipart));

    Ok(Sse::new(event_stream(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS))
            .text("keepalive"),
    ))
}

/// 读取 multipart 字段并驱动流水线
///
/// 文本字段须在 `context` 之前；遇到 `context` 或 `from_published` 即开始部署。
async fn handle_upload(ctx: PipelineContext, mut multipart: Multipart) {
    let mut name = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                fail(&ctx, DeployError::validation(format!("invalid multipart body: {}", e))).await;
                return;
            }
        };

        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some(FIELD_NAME) => match field.text().await {
                Ok(text) => name = Some(text.trim().to_string()).filter(|s| !s.is_empty()),
                Err(e) => {
                    fail(&ctx, DeployError::validation(format!("invalid `name` field: {}", e))).await;
                    return;
                }
            },
            Some(FIELD_FROM_PUBLISHED) => {
                let reference = match field.text().await {
                    Ok(text) => text.trim().to_string(),
                    Err(e) => {
                        let err = DeployError::validation(format!(
                            "invalid `from_published` field: {}",
                            e
                        ));
                        fail(&ctx, err).await;
                        return;
                    }
                };
                let _ = pipeline::run(ctx, DeploySource::Published { reference }).await;
                return;
            }
            Some(FIELD_CONTEXT) => {
                let body = field
                    .map(|chunk| {
                        chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                    })
                    .boxed();
                let source = DeploySource::Archive {
                    name,
                    declared_len: None,
                    body,
                };
                let _ = pipeline::run(ctx, source).await;
                return;
            }
            other => {
                debug!(field = ?other, "Ignoring unknown multipart field");
            }
        }
    }

    fail(
        &ctx,
        DeployError::validation("expected a `context` archive or a `from_published` reference"),
    )
    .await;
}

async fn fail(ctx: &PipelineContext, err: DeployError) {
    warn!(request_id = %ctx.request_id, error = %err, "Rejected deploy request");
    let _ = ctx.sink.send(err.to_event()).await;
}

/// 把事件通道转换为 SSE 流，终止事件之后结束
fn event_stream(
    mut rx: mpsc::Receiver<DeployEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            let json = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.event_name()).data(json));
            if terminal {
                break;
            }
        }
    }
}

/// 发布请求
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// `author/name[:version]`
    pub image: String,
}

/// 发布响应
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub image: String,
    pub is_public: bool,
}

/// 公开已注册版本
///
/// POST /publish
/// 需要 Bearer 认证，只能公开自己命名空间下的版本
async fn publish(
    AuthorizedNamespace(namespace): AuthorizedNamespace,
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishRequest>,
) -> DeployResult<(StatusCode, Json<PublishResponse>)> {
    let image = pipeline::publish(&state, &namespace, &req.image).await?;
    Ok((
        StatusCode::OK,
        Json(PublishResponse {
            image: image.to_string(),
            is_public: true,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::PipelineState;
    use crate::state::event_sink;

    #[tokio::test]
    async fn test_event_stream_stops_after_terminal_event() {
        let (sink, rx) = event_sink::channel();
        sink.stage(PipelineState::Received).await.unwrap();
        sink.send(DeployError::conflict("alice/hello:0.1 is already registered").to_event())
            .await
            .unwrap();
        // 终止事件之后的内容不会出现在流中
        sink.log_stdout("late").await.unwrap();

        let events: Vec<_> = event_stream(rx).collect().await;
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_error_event_payload() {
        let event = DeployError::not_available("alice/hello:1.0").to_event();
        assert_eq!(event.event_name(), "error");

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["status"], 404);
        assert_eq!(json["message"], "alice/hello:1.0 not found or not available");
    }
}
