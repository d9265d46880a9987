//! 流水线上下文
//!
//! 一次部署请求的全部执行状态，显式传入每个阶段

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::deploy::PipelineState;
use crate::domain::namespace::Namespace;
use crate::state::{AppState, EventSink};

/// 流水线执行上下文
#[derive(Clone)]
pub struct PipelineContext {
    /// 请求 ID
    pub request_id: String,
    /// 请求方命名空间（已鉴权）
    pub namespace: Namespace,
    /// 应用状态
    pub state: Arc<AppState>,
    /// 事件通道
    pub sink: EventSink,
    /// 取消令牌（仅作用于构建阶段）
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(state: Arc<AppState>, namespace: Namespace, sink: EventSink) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            namespace,
            state,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// 进入新状态
    ///
    /// 客户端断开后事件发送失败，非构建阶段忽略
    pub async fn transition(&self, state: PipelineState) {
        info!(
            request_id = %self.request_id,
            namespace = %self.namespace,
            state = %state,
            "Pipeline transition"
        );
        let _ = self.sink.stage(state).await;
    }
}
