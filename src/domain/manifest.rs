//! 用户清单（随上传源码一同提交的 `manifest.yaml`）

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Component, Path};

use crate::domain::image::is_version_token;
use crate::error::{DeployError, DeployResult};

/// 清单文件名（位于上传归档根目录）
pub const MANIFEST_FILE: &str = "manifest.yaml";

const DEFAULT_DOCKERFILE: &str = "Dockerfile";
const DEFAULT_MAX_SCALE: u32 = 10;

/// 用户清单
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// API 名称（也可由部署请求提供）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "quoted_version")]
    pub version: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// 热更新同步的源路径 glob
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync: Vec<String>,
    #[serde(default)]
    pub deploy: DeploySection,
}

/// 部署设置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploySection {
    #[serde(default)]
    pub scaling: Scaling,
    #[serde(default, skip_serializing_if = "Resources::is_empty")]
    pub resources: Resources,
}

/// 扩缩容边界
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scaling {
    #[serde(default)]
    pub min: u32,
    #[serde(default = "default_max_scale")]
    pub max: u32,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            min: 0,
            max: DEFAULT_MAX_SCALE,
        }
    }
}

/// 资源限制
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.gpu.is_none()
    }
}

fn default_dockerfile() -> String {
    DEFAULT_DOCKERFILE.to_string()
}

fn default_max_scale() -> u32 {
    DEFAULT_MAX_SCALE
}

/// 版本必须是字符串
///
/// 未加引号的 `0.10` 会被 YAML 解析成浮点数 0.1，原文已无法还原，只能拒绝
fn quoted_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Err(serde::de::Error::custom(format!(
            "version {} must be quoted, e.g. version: \"{}\"",
            n, n
        ))),
        other => Err(serde::de::Error::custom(format!(
            "expected a version string, got {:?}",
            other
        ))),
    }
}

impl Manifest {
    /// 解析并校验
    pub fn from_yaml(content: &str) -> DeployResult<Self> {
        let manifest: Manifest = serde_yaml::from_str(content)
            .map_err(|e| DeployError::validation(format!("invalid {}: {}", MANIFEST_FILE, e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// 从构建上下文目录加载
    pub async fn load(context_dir: &Path) -> DeployResult<Self> {
        let path = context_dir.join(MANIFEST_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::validation(format!(
                    "{} not found at archive root",
                    MANIFEST_FILE
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(DeployError::validation(format!(
                    "{} is not valid UTF-8",
                    MANIFEST_FILE
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> DeployResult<()> {
        if !is_version_token(&self.version) {
            return Err(DeployError::validation(format!(
                "invalid version '{}'",
                self.version
            )));
        }
        if !is_relative_inside(&self.dockerfile) {
            return Err(DeployError::validation(format!(
                "dockerfile '{}' must be a relative path inside the archive",
                self.dockerfile
            )));
        }
        if let Some(rule) = self.sync.iter().find(|s| !is_relative_inside(s)) {
            return Err(DeployError::validation(format!(
                "sync rule '{}' must be a relative path inside the archive",
                rule
            )));
        }
        let scaling = &self.deploy.scaling;
        if scaling.max == 0 || scaling.min > scaling.max {
            return Err(DeployError::validation(format!(
                "invalid scaling bounds min={} max={}",
                scaling.min, scaling.max
            )));
        }
        Ok(())
    }
}

fn is_relative_inside(path: &str) -> bool {
    !path.trim().is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
