//! 命名空间解析
//!
//! 通过外部身份提供方把请求令牌映射为租户命名空间，本地不做任何写入。

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::namespace::Namespace;
use crate::error::{DeployError, DeployResult};

/// 请求携带的凭据
#[derive(Clone, Default)]
pub struct Credentials {
    bearer: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("bearer", &self.bearer.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    /// 从 `Authorization: Bearer <token>` 提取
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                let (scheme, token) = v.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
            .filter(|token| !token.is_empty())
            .map(str::to_string);
        Self { bearer }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.bearer.as_deref()
    }
}

/// 身份提供方
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// 令牌对应的租户 ID；令牌无效时返回 `None`
    async fn tenant_for_token(&self, token: &str) -> DeployResult<Option<String>>;
}

/// 静态令牌表
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, String>,
}

impl StaticIdentityProvider {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn tenant_for_token(&self, token: &str) -> DeployResult<Option<String>> {
        Ok(self.tokens.get(token).cloned())
    }
}

/// 身份提供方校验响应
#[derive(Debug, Deserialize)]
struct IdentityResponse {
    #[serde(default)]
    tenant_id: Option<String>,
}

/// HTTP 身份提供方
///
/// `GET <url>`，携带原始 bearer 令牌，成功时返回 `{"tenant_id": "..."}`
pub struct HttpIdentityProvider {
    client: Client,
    url: String,
}

impl HttpIdentityProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> DeployResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| DeployError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn tenant_for_token(&self, token: &str) -> DeployResult<Option<String>> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DeployError::internal(format!("identity provider unreachable: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DeployError::internal(format!(
                "identity provider returned {}",
                status
            )));
        }

        let body: IdentityResponse = response
            .json()
            .await
            .map_err(|e| DeployError::internal(format!("invalid identity response: {}", e)))?;
        Ok(Some(body.tenant_id.unwrap_or_default()))
    }
}

/// 命名空间解析器
#[derive(Clone)]
pub struct NamespaceResolver {
    provider: Arc<dyn IdentityProvider>,
}

impl NamespaceResolver {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// 鉴权并解析命名空间
    ///
    /// - 缺少令牌 / 令牌无效 → 401
    /// - 令牌有效但无法映射到命名空间 → 403
    pub async fn authorize(&self, credentials: &Credentials) -> DeployResult<Namespace> {
        let token = credentials.token().ok_or_else(|| {
            warn!("Missing bearer token");
            DeployError::unauthorized("missing bearer token")
        })?;

        let tenant = self.provider.tenant_for_token(token).await?.ok_or_else(|| {
            warn!("Invalid bearer token provided");
            DeployError::unauthorized("invalid token")
        })?;

        let namespace = Namespace::from_tenant(&tenant).ok_or_else(|| {
            warn!("Token maps to no tenant namespace");
            DeployError::forbidden("token is not associated with a tenant")
        })?;

        debug!(namespace = %namespace, "Request authorized");
        Ok(namespace)
    }
}
