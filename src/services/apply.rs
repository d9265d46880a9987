//! 集群应用
//!
//! 把部署描述提交给集群控制面。`kubectl apply` 是 create-or-update，
//! 重复应用相同描述不会产生变化。

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{DeployError, DeployResult};
use crate::infra::command::{CommandError, CommandRunner};
use crate::state::EventSink;

/// 集群应用器
#[async_trait]
pub trait ClusterApplier: Send + Sync {
    /// 应用描述文件，失败返回 `DeployError::Apply`
    async fn apply(&self, descriptor: &Path, sink: &EventSink) -> DeployResult<()>;
}

/// 通过 kubectl 应用
#[derive(Clone, Debug)]
pub struct KubectlApplier {
    program: String,
    timeout: Duration,
}

impl KubectlApplier {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ClusterApplier for KubectlApplier {
    async fn apply(&self, descriptor: &Path, sink: &EventSink) -> DeployResult<()> {
        let work_dir = descriptor.parent().unwrap_or_else(|| Path::new("."));
        let path = descriptor.to_string_lossy().into_owned();
        let args = ["apply", "-f", path.as_str()];

        let _ = sink
            .log_stdout(format!(">>> {} {}", self.program, args.join(" ")))
            .await;

        let output = CommandRunner::run_simple(&self.program, &args, work_dir, self.timeout)
            .await
            .map_err(|e| match e {
                CommandError::Timeout => DeployError::apply(format!(
                    "apply timed out after {}s",
                    self.timeout.as_secs()
                )),
                e => DeployError::apply(format!("failed to run {}: {}", self.program, e)),
            })?;

        // 输出较短，整体转发
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let _ = sink.log_stdout(line).await;
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                descriptor = %descriptor.display(),
                exit_code = output.status.code().unwrap_or(-1),
                stderr = %stderr,
                "Cluster apply failed"
            );
            return Err(DeployError::apply(format!(
                "cluster rejected descriptor: {}",
                stderr
            )));
        }

        info!(descriptor = %descriptor.display(), "Descriptor applied");
        Ok(())
    }
}
