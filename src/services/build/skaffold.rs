//! Skaffold 构建后端
//!
//! 为上传的源码生成 skaffold `Config`，再执行 `skaffold build`，
//! 输出通过事件通道实时转发。

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::manifest::Manifest;
use crate::error::{DeployError, DeployResult};
use crate::infra::command::{CommandError, CommandRunner};
use crate::state::EventSink;

use super::{BuildJob, ImageBuilder};

/// 构建配置文件名（写入构建目录）
pub const BUILD_CONFIG_FILE: &str = "skaffold.yaml";

const SKAFFOLD_API_VERSION: &str = "skaffold/v1";

/// Skaffold 配置（单镜像构建所需的子集）
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub api_version: String,
    pub kind: String,
    pub build: BuildSection,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BuildSection {
    pub artifacts: Vec<Artifact>,
    pub local: LocalBuild,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Artifact {
    pub image: String,
    pub docker: DockerArtifact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<ArtifactSync>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DockerArtifact {
    pub dockerfile: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArtifactSync {
    pub manual: Vec<ManualSync>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ManualSync {
    pub src: String,
    pub dest: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalBuild {
    pub push: bool,
}

impl BuildConfig {
    /// `repository` 为不带 tag 的镜像地址，tag 由命令行传入
    pub fn generate(repository: &str, manifest: &Manifest) -> Self {
        let sync = (!manifest.sync.is_empty()).then(|| ArtifactSync {
            manual: manifest
                .sync
                .iter()
                .map(|src| ManualSync {
                    src: src.clone(),
                    dest: ".".to_string(),
                })
                .collect(),
        });

        Self {
            api_version: SKAFFOLD_API_VERSION.to_string(),
            kind: "Config".to_string(),
            build: BuildSection {
                artifacts: vec![Artifact {
                    image: repository.to_string(),
                    docker: DockerArtifact {
                        dockerfile: manifest.dockerfile.clone(),
                    },
                    sync,
                }],
                local: LocalBuild { push: true },
            },
        }
    }

    pub fn to_yaml(&self) -> DeployResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| DeployError::internal(format!("failed to render build config: {}", e)))
    }

    /// 写入 `<dir>/skaffold.yaml` 并返回路径
    pub async fn write_to(&self, dir: &Path) -> DeployResult<PathBuf> {
        let path = dir.join(BUILD_CONFIG_FILE);
        tokio::fs::write(&path, self.to_yaml()?).await?;
        Ok(path)
    }
}

/// 调用 `skaffold` 可执行文件的构建器
#[derive(Clone, Debug)]
pub struct SkaffoldBuilder {
    program: String,
}

impl SkaffoldBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ImageBuilder for SkaffoldBuilder {
    async fn build(
        &self,
        job: &BuildJob,
        sink: &EventSink,
        cancel: CancellationToken,
    ) -> DeployResult<()> {
        let config_path = job.config_path.to_string_lossy().into_owned();
        let args = ["build", "-f", config_path.as_str(), "-t", job.image.version.as_str()];

        info!(image = %job.image, artifact = %job.artifact, "Starting image build");
        let _ = sink
            .log_stdout(format!(">>> {} {}", self.program, args.join(" ")))
            .await;

        let result = CommandRunner::run_with_streaming(
            &self.program,
            &args,
            &job.context_dir,
            sink,
            cancel,
            job.timeout,
        )
        .await;

        match result {
            Ok(result) if result.timed_out => {
                error!(image = %job.image, timeout = ?job.timeout, "Image build timed out");
                Err(DeployError::build(
                    format!("build timed out after {}s", job.timeout.as_secs()),
                    result.tail,
                ))
            }
            Ok(result) if !result.status.success() => {
                let code = result.status.code().unwrap_or(-1);
                error!(image = %job.image, exit_code = code, "Image build failed");
                Err(DeployError::build(
                    format!("build exited with code {}", code),
                    result.tail,
                ))
            }
            Ok(_) => {
                info!(image = %job.image, "Image build finished");
                Ok(())
            }
            Err(CommandError::Cancelled) => {
                warn!(image = %job.image, "Image build cancelled");
                Err(DeployError::build("build cancelled", Vec::new()))
            }
            Err(CommandError::Timeout) => Err(DeployError::build(
                format!("build timed out after {}s", job.timeout.as_secs()),
                Vec::new(),
            )),
            Err(CommandError::SpawnFailed(e)) => Err(DeployError::build(
                format!("failed to start {}: {}", self.program, e),
                Vec::new(),
            )),
            Err(e @ CommandError::WaitFailed(_)) => Err(DeployError::internal(e.to_string())),
        }
    }
}
