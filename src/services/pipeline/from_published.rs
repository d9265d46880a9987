//! 从已发布版本部署
//!
//! VersionResolved → VisibilityChecked → ConfigGenerated → Applied。
//! 不解压也不构建，直接复用作者已推送的镜像，应用到请求方自己的命名空间。

use tracing::{info, warn};

use crate::domain::deploy::{DeployFlow, DeployOutcome, PipelineState};
use crate::domain::image::ImageName;
use crate::error::{DeployError, DeployResult};
use crate::services::descriptor::{DeploymentDescriptor, ServiceSummary};

use super::context::PipelineContext;

pub(super) async fn execute(ctx: &PipelineContext, reference: &str) -> DeployResult<DeployOutcome> {
    let state = &ctx.state;

    // VersionResolved
    let image = ImageName::parse_from(reference)?;
    let api = match state.registry.get_version(&image).await {
        Ok(api) => api,
        Err(DeployError::NotFound(_)) => return Err(DeployError::not_available(&image)),
        Err(e) => return Err(e),
    };
    ctx.transition(PipelineState::VersionResolved).await;

    // VisibilityChecked：私有版本对非 owner 与不存在无法区分
    if !api.is_visible_to(&ctx.namespace) {
        warn!(
            request_id = %ctx.request_id,
            namespace = %ctx.namespace,
            image = %image,
            "Requested version is private"
        );
        return Err(DeployError::not_available(&image));
    }
    ctx.transition(PipelineState::VisibilityChecked).await;

    // ConfigGenerated
    let artifact = image.artifact(&state.config.image_registry);
    let summary = ServiceSummary {
        name: image.name.clone(),
        namespace: ctx.namespace.clone(),
        docker_artifact: artifact.clone(),
    };
    let workspace = state.extractor.workspace(&ctx.namespace, &image.name)?;
    let descriptor_path = DeploymentDescriptor::generate(&summary, &api.manifest)?
        .write_to(workspace.path())
        .await?;
    ctx.transition(PipelineState::ConfigGenerated).await;

    // Applied
    state.applier.apply(&descriptor_path, &ctx.sink).await?;
    ctx.transition(PipelineState::Applied).await;

    info!(
        request_id = %ctx.request_id,
        namespace = %ctx.namespace,
        image = %image,
        "Published version deployed"
    );

    Ok(DeployOutcome {
        flow: DeployFlow::FromPublished,
        image: image.to_string(),
        namespace: ctx.namespace.to_string(),
        artifact,
    })
}
