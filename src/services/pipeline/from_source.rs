//! 从源码部署
//!
//! Extracted → Built → ConfigGenerated → Applied → Registered

use tracing::{error, info};

use crate::domain::deploy::{DeployFlow, DeployOutcome, PipelineState};
use crate::domain::image::ImageName;
use crate::domain::manifest::Manifest;
use crate::error::{DeployError, DeployResult};
use crate::services::build::{BuildConfig, BuildJob};
use crate::services::descriptor::{DeploymentDescriptor, ServiceSummary};
use crate::services::registry::ApiVersion;

use super::context::PipelineContext;
use super::Upload;

/// 名称未知时的临时目录前缀
const UNNAMED_PREFIX: &str = "upload";

pub(super) async fn execute(
    ctx: &PipelineContext,
    name: Option<String>,
    declared_len: Option<u64>,
    body: Upload<'_>,
) -> DeployResult<DeployOutcome> {
    let state = &ctx.state;

    // Extracted：上传落盘、解压、读取清单
    let prefix = name.as_deref().unwrap_or(UNNAMED_PREFIX);
    let context = state
        .extractor
        .extract(&ctx.namespace, prefix, declared_len, body)
        .await?;

    let mut manifest = Manifest::load(context.path()).await?;
    let api_name = manifest.name.clone().or(name).ok_or_else(|| {
        DeployError::validation("API name missing: set `name` in manifest.yaml or the request")
    })?;
    manifest.name = Some(api_name.clone());

    let image = ImageName::new(ctx.namespace.as_str(), api_name, manifest.version.clone())?;
    state.registry.ensure_unregistered(&image).await?;

    let artifact = image.artifact(&state.config.image_registry);
    info!(
        request_id = %ctx.request_id,
        image = %image,
        artifact = %artifact,
        "Source extracted"
    );
    ctx.transition(PipelineState::Extracted).await;

    // Built：构建并推送镜像，仅此阶段响应客户端断开
    let config_path = BuildConfig::generate(&image.repository(&state.config.image_registry), &manifest)
        .write_to(context.path())
        .await?;
    let job = BuildJob {
        context_dir: context.path().to_owned(),
        config_path,
        image: image.clone(),
        artifact: artifact.clone(),
        timeout: state.config.build_timeout,
    };
    if let Err(e) = state.builder.build(&job, &ctx.sink, ctx.cancel.clone()).await {
        // 已推送的制品不回收
        error!(request_id = %ctx.request_id, image = %image, error = %e, "Build stage failed");
        return Err(e);
    }
    ctx.transition(PipelineState::Built).await;

    // ConfigGenerated
    let summary = ServiceSummary {
        name: image.name.clone(),
        namespace: ctx.namespace.clone(),
        docker_artifact: artifact.clone(),
    };
    let descriptor_path = DeploymentDescriptor::generate(&summary, &manifest)?
        .write_to(context.path())
        .await?;
    ctx.transition(PipelineState::ConfigGenerated).await;

    // Applied
    state.applier.apply(&descriptor_path, &ctx.sink).await?;
    ctx.transition(PipelineState::Applied).await;

    // Registered
    state
        .registry
        .register_api(&ctx.namespace, ctx.namespace.as_str(), ApiVersion::new(manifest))
        .await?;
    ctx.transition(PipelineState::Registered).await;

    Ok(DeployOutcome {
        flow: DeployFlow::FromSource,
        image: image.to_string(),
        namespace: ctx.namespace.to_string(),
        artifact,
    })
}
