//! 部署流水线
//!
//! 两条入口：
//! - 从源码：Received → Authorized → Extracted → Built → ConfigGenerated → Applied → Registered → Done
//! - 从已发布版本：Received → Authorized → VersionResolved → VisibilityChecked → ConfigGenerated → Applied → Done
//!
//! 任一阶段失败立即终止，临时目录随作用域释放，不会把部分成功报告为成功。

pub mod context;
mod from_published;
mod from_source;


use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::{error, info};

use crate::domain::deploy::{DeployEvent, DeployOutcome, PipelineState};
use crate::domain::image::ImageName;
use crate::domain::namespace::Namespace;
use crate::error::{DeployError, DeployResult};
use crate::state::AppState;

pub use context::PipelineContext;

/// 上传内容（按块读取）
pub type Upload<'a> = BoxStream<'a, std::io::Result<Bytes>>;

/// 部署来源
pub enum DeploySource<'a> {
    /// 上传的源码归档
    Archive {
        /// 请求中给出的 API 名称（清单未声明时使用）
        name: Option<String>,
        /// 声明的长度，超过上限时在创建目录前拒绝
        declared_len: Option<u64>,
        body: Upload<'a>,
    },
    /// 已发布版本 `author/name[:version]`
    Published { reference: String },
}

/// 执行部署流水线，返回结果或首个失败阶段的错误
pub async fn deploy(ctx: &PipelineContext, source: DeploySource<'_>) -> DeployResult<DeployOutcome> {
    ctx.transition(PipelineState::Received).await;
    // 持有 Namespace 即已通过鉴权
    ctx.transition(PipelineState::Authorized).await;

    let outcome = match source {
        DeploySource::Archive {
            name,
            declared_len,
            body,
        } => from_source::execute(ctx, name, declared_len, body).await?,
        DeploySource::Published { reference } => from_published::execute(ctx, &reference).await?,
    };

    ctx.transition(PipelineState::Done).await;
    Ok(outcome)
}

/// 执行部署并把终止事件写入事件通道
pub async fn run(ctx: PipelineContext, source: DeploySource<'_>) -> DeployResult<DeployOutcome> {
    let result = deploy(&ctx, source).await;

    let event = match &result {
        Ok(outcome) => {
            info!(
                request_id = %ctx.request_id,
                namespace = %outcome.namespace,
                image = %outcome.image,
                flow = ?outcome.flow,
                "Deployment successful"
            );
            DeployEvent::complete(outcome)
        }
        Err(e) => {
            error!(
                request_id = %ctx.request_id,
                namespace = %ctx.namespace,
                error = %e,
                "Deployment failed"
            );
            e.to_event()
        }
    };
    let _ = ctx.sink.send(event).await;

    result
}

/// 公开一个已注册版本
///
/// 只能公开自己命名空间下的版本；其他情况与不存在返回相同的错误。
pub async fn publish(
    state: &AppState,
    namespace: &Namespace,
    reference: &str,
) -> DeployResult<ImageName> {
    let image = ImageName::parse_from(reference)?;
    if image.author != namespace.as_str() {
        return Err(DeployError::not_available(&image));
    }

    state.registry.publish(&image).await?;
    info!(namespace = %namespace, image = %image, "Published API version");
    Ok(image)
}
