//! 部署描述生成
//!
//! 由清单和服务摘要生成集群部署描述（YAML）。生成过程是纯函数：字段顺序固定、
//! 同步规则保持清单顺序，同样的输入永远得到逐字节相同的输出。

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::domain::manifest::{Manifest, Resources, Scaling};
use crate::domain::namespace::Namespace;
use crate::error::{DeployError, DeployResult};

pub const DESCRIPTOR_API_VERSION: &str = "apps.xjp.dev/v1";
pub const DESCRIPTOR_KIND: &str = "ApiService";
/// 描述文件名（写入构建上下文目录）
pub const DESCRIPTOR_FILE: &str = "descriptor.yaml";

/// 同步规则的目标路径（容器工作目录）
const SYNC_DEST: &str = ".";

/// 生成描述所需的服务信息
#[derive(Clone, Debug)]
pub struct ServiceSummary {
    pub name: String,
    pub namespace: Namespace,
    pub docker_artifact: String,
}

/// 部署描述
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDescriptor {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: DescriptorSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DescriptorSpec {
    pub image: String,
    pub scaling: Scaling,
    #[serde(skip_serializing_if = "Resources::is_empty")]
    pub resources: Resources,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sync: Vec<SyncRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncRule {
    pub src: String,
    pub dest: String,
}

impl DeploymentDescriptor {
    /// 生成部署描述
    pub fn generate(service: &ServiceSummary, manifest: &Manifest) -> DeployResult<Self> {
        if service.docker_artifact.trim().is_empty() {
            return Err(DeployError::validation("image artifact must not be empty"));
        }

        let sync = manifest
            .sync
            .iter()
            .map(|src| SyncRule {
                src: src.clone(),
                dest: SYNC_DEST.to_string(),
            })
            .collect();

        Ok(Self {
            api_version: DESCRIPTOR_API_VERSION.to_string(),
            kind: DESCRIPTOR_KIND.to_string(),
            metadata: Metadata {
                name: service.name.clone(),
                namespace: service.namespace.to_string(),
            },
            spec: DescriptorSpec {
                image: service.docker_artifact.clone(),
                scaling: manifest.deploy.scaling.clone(),
                resources: manifest.deploy.resources.clone(),
                sync,
            },
        })
    }

    pub fn to_yaml(&self) -> DeployResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| DeployError::internal(format!("failed to render descriptor: {}", e)))
    }

    /// 写入 `<dir>/descriptor.yaml`，返回文件路径
    pub async fn write_to(&self, dir: &Path) -> DeployResult<PathBuf> {
        let path = dir.join(DESCRIPTOR_FILE);
        tokio::fs::write(&path, self.to_yaml()?).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> ServiceSummary {
        ServiceSummary {
            name: "hello".to_string(),
            namespace: Namespace::from_tenant("bob").unwrap(),
            docker_artifact: "registry.local/apis/alice/hello:1.0".to_string(),
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let manifest = Manifest::from_yaml(
            r#"
version: "1.0"
sync: ["src/**/*.py", "static/*"]
deploy:
  scaling: { min: 1, max: 3 }
  resources: { cpu: "500m", memory: 256Mi }
"#,
        )
        .unwrap();

        let first = DeploymentDescriptor::generate(&summary(), &manifest)
            .unwrap()
            .to_yaml()
            .unwrap();
        let second = DeploymentDescriptor::generate(&summary(), &manifest)
            .unwrap()
            .to_yaml()
            .unwrap();
        assert_eq!(first, second);

        let value: serde_yaml::Value = serde_yaml::from_str(&first).unwrap();
        assert_eq!(value["apiVersion"].as_str(), Some(DESCRIPTOR_API_VERSION));
        assert_eq!(value["kind"].as_str(), Some(DESCRIPTOR_KIND));
        assert_eq!(value["metadata"]["name"].as_str(), Some("hello"));
        assert_eq!(value["metadata"]["namespace"].as_str(), Some("bob"));
        assert_eq!(
            value["spec"]["image"].as_str(),
            Some("registry.local/apis/alice/hello:1.0")
        );
        assert_eq!(value["spec"]["scaling"]["min"].as_u64(), Some(1));
        assert_eq!(value["spec"]["scaling"]["max"].as_u64(), Some(3));
        assert_eq!(value["spec"]["resources"]["cpu"].as_str(), Some("500m"));
        assert_eq!(value["spec"]["sync"][0]["src"].as_str(), Some("src/**/*.py"));
        assert_eq!(value["spec"]["sync"][1]["src"].as_str(), Some("static/*"));
        assert_eq!(value["spec"]["sync"][1]["dest"].as_str(), Some("."));
    }

    #[test]
    fn test_optional_sections_omitted() {
        let manifest = Manifest::from_yaml("version: \"0.1\"\n").unwrap();
        let yaml = DeploymentDescriptor::generate(&summary(), &manifest)
            .unwrap()
            .to_yaml()
            .unwrap();

        assert!(!yaml.contains("sync"));
        assert!(!yaml.contains("resources"));
        assert!(yaml.contains("max: 10"));
    }

    #[test]
    fn test_empty_artifact_rejected() {
        let mut service = summary();
        service.docker_artifact = String::new();
        let manifest = Manifest::from_yaml("version: \"0.1\"\n").unwrap();

        let err = DeploymentDescriptor::generate(&service, &manifest).unwrap_err();
        assert!(matches!(err, DeployError::Validation(_)));
    }

    #[tokio::test]
    async fn test_write_to_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = Manifest::from_yaml("version: \"0.1\"\n").unwrap();
        let descriptor = DeploymentDescriptor::generate(&summary(), &manifest).unwrap();

        let path = descriptor.write_to(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join(DESCRIPTOR_FILE));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            descriptor.to_yaml().unwrap()
        );
    }
}
