//! 镜像构建
//!
//! 构建器是外部黑盒：给定构建上下文和构建配置，产出已推送的镜像，
//! 过程中的输出逐行写入事件通道。

pub mod skaffold;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::image::ImageName;
use crate::error::DeployResult;
use crate::state::EventSink;

pub use skaffold::{BuildConfig, SkaffoldBuilder, BUILD_CONFIG_FILE};

/// 一次构建任务
#[derive(Clone, Debug)]
pub struct BuildJob {
    /// 构建上下文目录（解压后的源码）
    pub context_dir: PathBuf,
    /// 构建配置文件
    pub config_path: PathBuf,
    pub image: ImageName,
    /// 推送后的镜像地址
    pub artifact: String,
    pub timeout: Duration,
}

/// 镜像构建器
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// 构建并推送镜像
    ///
    /// 失败返回 `DeployError::Build`（附带最后若干行日志）；`cancel` 触发时终止构建。
    async fn build(
        &self,
        job: &BuildJob,
        sink: &EventSink,
        cancel: CancellationToken,
    ) -> DeployResult<()>;
}
