//! 版本注册表
//!
//! 每个 (author, name, version) 对应一条不可变记录，存放在
//! `apis/<author>/<name>/versions/<version>`。所有写入都通过存储层的
//! compare-and-swap 完成，多副本并发写同一个键时只有一个成功。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::image::{is_path_token, ImageName};
use crate::domain::manifest::Manifest;
use crate::domain::namespace::Namespace;
use crate::error::{DeployError, DeployResult};
use crate::infra::kv::{KvBackend, KvError};

/// 发布时 CAS 冲突的最大重试次数
const PUBLISH_MAX_RETRIES: usize = 8;

/// 注册表记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub version: String,
    pub manifest: Manifest,
    pub is_public: bool,
    /// 注册者命名空间
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

impl ApiVersion {
    /// 新记录默认私有，owner 在注册时写入
    pub fn new(manifest: Manifest) -> Self {
        Self {
            version: manifest.version.clone(),
            manifest,
            is_public: false,
            owner: String::new(),
            created_at: Utc::now(),
        }
    }

    /// 公开版本对所有人可见，私有版本仅对 owner 可见
    pub fn is_visible_to(&self, requester: &Namespace) -> bool {
        self.is_public || self.owner == requester.as_str()
    }
}

/// 版本列表项
#[derive(Clone, Debug, Serialize)]
pub struct VersionSummary {
    pub version: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

/// 版本注册表
#[derive(Clone)]
pub struct VersionRegistry {
    store: Arc<dyn KvBackend>,
}

fn versions_prefix(author: &str, name: &str) -> String {
    format!("apis/{}/{}/versions/", author, name)
}

fn version_key(image: &ImageName) -> String {
    format!(
        "{}{}",
        versions_prefix(&image.author, &image.name),
        image.version
    )
}

fn storage_error(e: KvError) -> DeployError {
    DeployError::internal(format!("registry store: {}", e))
}

fn decode(key: &str, bytes: &[u8]) -> DeployResult<ApiVersion> {
    serde_json::from_slice(bytes)
        .map_err(|e| DeployError::internal(format!("corrupt registry record {}: {}", key, e)))
}

fn encode(api: &ApiVersion) -> DeployResult<Vec<u8>> {
    serde_json::to_vec(api)
        .map_err(|e| DeployError::internal(format!("failed to encode registry record: {}", e)))
}

impl VersionRegistry {
    pub fn new(store: Arc<dyn KvBackend>) -> Self {
        Self { store }
    }

    /// 读取记录，不存在时返回 NotFound
    pub async fn get_version(&self, image: &ImageName) -> DeployResult<ApiVersion> {
        let key = version_key(image);
        match self.store.get(&key).await.map_err(storage_error)? {
            Some(bytes) => decode(&key, &bytes),
            None => Err(DeployError::not_found(format!("{} not found", image))),
        }
    }

    /// 构建开始前的提前检查；真正的互斥由 `register_api` 的 CAS 保证
    pub async fn ensure_unregistered(&self, image: &ImageName) -> DeployResult<()> {
        let key = version_key(image);
        if self.store.get(&key).await.map_err(storage_error)?.is_some() {
            return Err(DeployError::conflict(format!(
                "{} is already registered",
                image
            )));
        }
        Ok(())
    }

    /// 创建记录（只写一次）
    ///
    /// 同一键的第二次注册返回 Conflict，已有记录保持不变。
    pub async fn register_api(
        &self,
        namespace: &Namespace,
        owner: &str,
        mut api: ApiVersion,
    ) -> DeployResult<ImageName> {
        let name = api
            .manifest
            .name
            .clone()
            .ok_or_else(|| DeployError::validation("API name is required for registration"))?;
        let image = ImageName::new(namespace.as_str(), name, api.version.clone())?;

        api.owner = owner.to_string();
        let key = version_key(&image);
        let value = encode(&api)?;

        let created = self
            .store
            .cas(&key, None, &value)
            .await
            .map_err(storage_error)?;
        if !created {
            warn!(image = %image, "Duplicate registration rejected");
            return Err(DeployError::conflict(format!(
                "{} is already registered",
                image
            )));
        }

        info!(image = %image, owner = %owner, "API version registered");
        Ok(image)
    }

    /// 标记为公开（幂等，不支持撤销）
    pub async fn publish(&self, image: &ImageName) -> DeployResult<()> {
        let key = version_key(image);

        for attempt in 0..PUBLISH_MAX_RETRIES {
            let current = self
                .store
                .get(&key)
                .await
                .map_err(storage_error)?
                .ok_or_else(|| DeployError::not_available(image))?;

            let mut api = decode(&key, &current)?;
            if api.is_public {
                debug!(image = %image, "Already public");
                return Ok(());
            }
            api.is_public = true;

            let swapped = self
                .store
                .cas(&key, Some(current.as_slice()), &encode(&api)?)
                .await
                .map_err(storage_error)?;
            if swapped {
                info!(image = %image, "API version published");
                return Ok(());
            }
            debug!(image = %image, attempt, "Publish raced with another writer, retrying");
        }

        Err(DeployError::internal(format!(
            "publish of {} kept conflicting with concurrent writers",
            image
        )))
    }

    /// 请求方可见的版本，按版本号排序
    pub async fn list_versions(
        &self,
        author: &str,
        name: &str,
        requester: &Namespace,
    ) -> DeployResult<Vec<VersionSummary>> {
        if !is_path_token(author) || !is_path_token(name) {
            return Err(DeployError::validation(format!(
                "invalid API reference '{}/{}'",
                author, name
            )));
        }
        let prefix = versions_prefix(author, name);
        let keys = self.store.list(&prefix).await.map_err(storage_error)?;

        let mut versions = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.store.get(&key).await.map_err(storage_error)? else {
                continue;
            };
            let api = decode(&key, &bytes)?;
            if api.is_visible_to(requester) {
                versions.push(VersionSummary {
                    version: api.version,
                    is_public: api.is_public,
                    created_at: api.created_at,
                });
            }
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::kv::{FsKv, MemoryKv};

    fn ns(tenant: &str) -> Namespace {
        Namespace::from_tenant(tenant).unwrap()
    }

    fn manifest(name: &str, version: &str) -> Manifest {
        let mut manifest =
            Manifest::from_yaml(&format!("version: \"{}\"\ndockerfile: Dockerfile\n", version))
                .unwrap();
        manifest.name = Some(name.to_string());
        manifest
    }

    fn registry() -> VersionRegistry {
        VersionRegistry::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_register_then_get() {
        let registry = registry();
        let alice = ns("alice");

        let image = registry
            .register_api(&alice, "alice", ApiVersion::new(manifest("hello", "0.1")))
            .await
            .unwrap();
        assert_eq!(image.to_string(), "alice/hello:0.1");

        let api = registry.get_version(&image).await.unwrap();
        assert_eq!(api.version, "0.1");
        assert!(!api.is_public);
        assert_eq!(api.owner, "alice");
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let registry = registry();
        let alice = ns("alice");

        let mut first = ApiVersion::new(manifest("hello", "0.1"));
        first.manifest.dockerfile = "first.Dockerfile".to_string();
        let image = registry.register_api(&alice, "alice", first).await.unwrap();

        let mut second = ApiVersion::new(manifest("hello", "0.1"));
        second.manifest.dockerfile = "second.Dockerfile".to_string();
        let err = registry
            .register_api(&alice, "alice", second)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));

        let stored = registry.get_version(&image).await.unwrap();
        assert_eq!(stored.manifest.dockerfile, "first.Dockerfile");

        let err = registry.ensure_unregistered(&image).await.unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_get_missing_version() {
        let image = ImageName::parse_from("alice/hello:9.9").unwrap();
        let err = registry().get_version(&image).await.unwrap_err();
        assert!(matches!(err, DeployError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let registry = registry();
        let image = registry
            .register_api(&ns("alice"), "alice", ApiVersion::new(manifest("hello", "1.0")))
            .await
            .unwrap();
        let before = registry.get_version(&image).await.unwrap();

        registry.publish(&image).await.unwrap();
        registry.publish(&image).await.unwrap();

        let after = registry.get_version(&image).await.unwrap();
        assert!(after.is_public);
        assert_eq!(after.manifest, before.manifest);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn test_publish_missing_version() {
        let image = ImageName::parse_from("alice/ghost:1.0").unwrap();
        let err = registry().publish(&image).await.unwrap_err();
        assert!(matches!(err, DeployError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_visibility_and_listing() {
        let registry = registry();
        let alice = ns("alice");
        let bob = ns("bob");

        for version in ["1.0", "0.9"] {
            registry
                .register_api(&alice, "alice", ApiVersion::new(manifest("hello", version)))
                .await
                .unwrap();
        }
        registry
            .publish(&ImageName::parse_from("alice/hello:1.0").unwrap())
            .await
            .unwrap();

        let private = registry
            .get_version(&ImageName::parse_from("alice/hello:0.9").unwrap())
            .await
            .unwrap();
        assert!(private.is_visible_to(&alice));
        assert!(!private.is_visible_to(&bob));

        let owner_view: Vec<_> = registry
            .list_versions("alice", "hello", &alice)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(owner_view, vec!["0.9", "1.0"]);

        let other_view: Vec<_> = registry
            .list_versions("alice", "hello", &bob)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(other_view, vec!["1.0"]);
    }

    #[tokio::test]
    async fn test_concurrent_registration_single_winner() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = VersionRegistry::new(Arc::new(FsKv::new(dir.path())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .register_api(&ns("alice"), "alice", ApiVersion::new(manifest("hello", "2.0")))
                    .await
            }));
        }

        let mut created = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(DeployError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((created, conflicts), (1, 7));
    }

    #[tokio::test]
    async fn test_list_rejects_unsafe_path_segments() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = VersionRegistry::new(Arc::new(FsKv::new(dir.path())));

        for (author, name) in [("..", "hello"), ("alice", ".."), ("Alice", "hello")] {
            let err = registry
                .list_versions(author, name, &ns("alice"))
                .await
                .unwrap_err();
            assert!(matches!(err, DeployError::Validation(_)), "{}/{}", author, name);
        }
    }
}
