//! 应用状态
//!
//! 所有外部协作方（身份提供方、注册表存储、构建器、集群）都在这里装配，
//! 以 `Arc<AppState>` 的形式显式传入每个请求，不使用进程级单例。

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::env::EnvConfig;
use crate::error::DeployResult;
use crate::infra::kv::{FsKv, KvBackend, MemoryKv};
use crate::services::apply::{ClusterApplier, KubectlApplier};
use crate::services::archive::ArchiveExtractor;
use crate::services::build::{ImageBuilder, SkaffoldBuilder};
use crate::services::namespace::{
    HttpIdentityProvider, IdentityProvider, NamespaceResolver, StaticIdentityProvider,
};
use crate::services::registry::VersionRegistry;

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 核心服务 ==========
    /// 命名空间解析
    pub resolver: NamespaceResolver,
    /// 版本注册表
    pub registry: VersionRegistry,
    /// 上传解压
    pub extractor: ArchiveExtractor,

    // ========== 外部执行器 ==========
    /// 镜像构建器
    pub builder: Arc<dyn ImageBuilder>,
    /// 集群应用器
    pub applier: Arc<dyn ClusterApplier>,
}

impl AppState {
    /// 由显式给定的协作方创建
    pub fn new(
        config: EnvConfig,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn KvBackend>,
        builder: Arc<dyn ImageBuilder>,
        applier: Arc<dyn ClusterApplier>,
    ) -> Self {
        let extractor = ArchiveExtractor::new(config.max_upload_bytes, config.temp_dir.clone());

        Self {
            started_at: Utc::now(),
            resolver: NamespaceResolver::new(identity),
            registry: VersionRegistry::new(store),
            extractor,
            builder,
            applier,
            config,
        }
    }

    /// 按环境配置装配默认实现
    pub fn from_config(config: EnvConfig) -> DeployResult<Self> {
        let identity: Arc<dyn IdentityProvider> = match &config.auth_url {
            Some(url) => {
                tracing::info!(auth_url = %url, "Using HTTP identity provider");
                Arc::new(HttpIdentityProvider::new(url.clone(), config.auth_timeout)?)
            }
            None => {
                tracing::info!(
                    token_count = config.static_tokens.len(),
                    "Using static token table"
                );
                Arc::new(StaticIdentityProvider::new(config.static_tokens.clone()))
            }
        };

        let store: Arc<dyn KvBackend> = match &config.store_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tracing::info!(store_dir = %dir.display(), "Using filesystem registry store");
                Arc::new(FsKv::new(dir.clone()))
            }
            None => {
                tracing::warn!("DEPLOYER_STORE_DIR not set, registry is in-memory and not shared between replicas");
                Arc::new(MemoryKv::new())
            }
        };

        let builder = Arc::new(SkaffoldBuilder::new(config.builder_bin.clone()));
        let applier = Arc::new(KubectlApplier::new(
            config.kubectl_bin.clone(),
            config.apply_timeout,
        ));

        tracing::info!(
            port = config.port,
            image_registry = %config.image_registry,
            max_upload_bytes = config.max_upload_bytes,
            build_timeout_secs = config.build_timeout.as_secs(),
            "Loaded configuration"
        );

        Ok(Self::new(config, identity, store, builder, applier))
    }
}
