//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 流水线状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Authorized,
    Extracted,
    Built,
    VersionResolved,
    VisibilityChecked,
    ConfigGenerated,
    Applied,
    Registered,
    Done,
}

impl PipelineState {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "received",
            PipelineState::Authorized => "authorized",
            PipelineState::Extracted => "extracted",
            PipelineState::Built => "built",
            PipelineState::VersionResolved => "version_resolved",
            PipelineState::VisibilityChecked => "visibility_checked",
            PipelineState::ConfigGenerated => "config_generated",
            PipelineState::Applied => "applied",
            PipelineState::Registered => "registered",
            PipelineState::Done => "done",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 部署入口类型
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployFlow {
    /// 从上传的源码构建
    FromSource,
    /// 复用已发布的镜像
    FromPublished,
}

impl DeployFlow {
    /// 成功路径上依次经过的状态
    pub fn states(&self) -> &'static [PipelineState] {
        use PipelineState::*;
        match self {
            DeployFlow::FromSource => &[
                Received,
                Authorized,
                Extracted,
                Built,
                ConfigGenerated,
                Applied,
                Registered,
                Done,
            ],
            DeployFlow::FromPublished => &[
                Received,
                Authorized,
                VersionResolved,
                VisibilityChecked,
                ConfigGenerated,
                Applied,
                Done,
            ],
        }
    }
}

/// 日志行
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    /// 创建新日志行
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    /// 创建 stdout 日志行
    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    /// 创建 stderr 日志行
    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}

/// 部署事件
///
/// 流水线把事件写入通道，传输层（SSE）独立消费。
/// `Complete` 和 `Error` 是终止事件，二者之一必然出现在流的末尾。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    Stage {
        state: PipelineState,
        at: DateTime<Utc>,
    },
    Log(LogLine),
    Complete {
        image: String,
        namespace: String,
        message: String,
    },
    Error {
        status: u16,
        error: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_tail: Option<Vec<String>>,
    },
}

impl DeployEvent {
    pub fn stage(state: PipelineState) -> Self {
        DeployEvent::Stage {
            state,
            at: Utc::now(),
        }
    }

    pub fn complete(outcome: &DeployOutcome) -> Self {
        DeployEvent::Complete {
            image: outcome.image.clone(),
            namespace: outcome.namespace.clone(),
            message: "Deployment successful!".to_string(),
        }
    }

    /// SSE 事件名
    pub fn event_name(&self) -> &'static str {
        match self {
            DeployEvent::Stage { .. } => "stage",
            DeployEvent::Log(_) => "log",
            DeployEvent::Complete { .. } => "complete",
            DeployEvent::Error { .. } => "error",
        }
    }

    /// 是否为终止事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployEvent::Complete { .. } | DeployEvent::Error { .. })
    }
}

/// 部署结果
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DeployOutcome {
    pub flow: DeployFlow,
    /// `author/name:version`
    pub image: String,
    /// 目标命名空间
    pub namespace: String,
    /// 镜像制品地址
    pub artifact: String,
}
