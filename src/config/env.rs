//! 环境变量配置加载

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use self::constants::*;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 服务监听端口
    pub port: u16,
    /// 镜像仓库前缀（如 registry.example.com/apis）
    pub image_registry: String,
    /// 注册表存储目录；未设置时使用进程内存储
    pub store_dir: Option<PathBuf>,
    /// 身份提供方校验地址
    pub auth_url: Option<String>,
    /// 静态令牌表 (token -> tenant id)
    pub static_tokens: HashMap<String, String>,
    /// 上传大小上限（字节）
    pub max_upload_bytes: u64,
    /// 构建超时
    pub build_timeout: Duration,
    /// kubectl apply 超时
    pub apply_timeout: Duration,
    /// 身份提供方请求超时
    pub auth_timeout: Duration,
    /// 构建器可执行文件
    pub builder_bin: String,
    /// kubectl 可执行文件
    pub kubectl_bin: String,
    /// 临时目录根；未设置时使用系统临时目录
    pub temp_dir: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            image_registry: DEFAULT_IMAGE_REGISTRY.to_string(),
            store_dir: None,
            auth_url: None,
            static_tokens: HashMap::new(),
            max_upload_bytes: MAX_UPLOAD_BYTES,
            build_timeout: Duration::from_secs(BUILD_TIMEOUT_SECS),
            apply_timeout: Duration::from_secs(APPLY_TIMEOUT_SECS),
            auth_timeout: Duration::from_secs(AUTH_TIMEOUT_SECS),
            builder_bin: "skaffold".to_string(),
            kubectl_bin: "kubectl".to_string(),
            temp_dir: None,
        }
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = parse_var("PORT").unwrap_or(defaults.port);

        let image_registry =
            env::var("DEPLOYER_IMAGE_REGISTRY").unwrap_or(defaults.image_registry);

        let store_dir = non_empty_var("DEPLOYER_STORE_DIR").map(PathBuf::from);
        let auth_url = non_empty_var("DEPLOYER_AUTH_URL");

        let static_tokens = env::var("DEPLOYER_STATIC_TOKENS")
            .map(|v| parse_token_table(&v))
            .unwrap_or_default();

        if auth_url.is_none() && static_tokens.is_empty() {
            warn!("Neither DEPLOYER_AUTH_URL nor DEPLOYER_STATIC_TOKENS is set, every request will be rejected");
        }

        let max_upload_bytes =
            parse_var("DEPLOYER_MAX_UPLOAD_BYTES").unwrap_or(defaults.max_upload_bytes);

        let build_timeout = parse_var("DEPLOYER_BUILD_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.build_timeout);

        let apply_timeout = parse_var("DEPLOYER_APPLY_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.apply_timeout);

        let auth_timeout = parse_var("DEPLOYER_AUTH_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.auth_timeout);

        let builder_bin = non_empty_var("DEPLOYER_BUILDER_BIN").unwrap_or(defaults.builder_bin);
        let kubectl_bin = non_empty_var("DEPLOYER_KUBECTL_BIN").unwrap_or(defaults.kubectl_bin);
        let temp_dir = non_empty_var("DEPLOYER_TEMP_DIR").map(PathBuf::from);

        Self {
            port,
            image_registry,
            store_dir,
            auth_url,
            static_tokens,
            max_upload_bytes,
            build_timeout,
            apply_timeout,
            auth_timeout,
            builder_bin,
            kubectl_bin,
            temp_dir,
        }
    }
}

/// 解析 `token=tenant,token2=tenant2`
pub fn parse_token_table(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| {
            let (token, tenant) = pair.split_once('=')?;
            let (token, tenant) = (token.trim(), tenant.trim());
            if token.is_empty() || tenant.is_empty() {
                warn!(entry = %pair, "Ignoring malformed static token entry");
                return None;
            }
            Some((token.to_string(), tenant.to_string()))
        })
        .collect()
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %value, "Ignoring unparsable environment variable");
            None
        }
    }
}

/// 常量
pub mod constants {
    /// 默认端口
    pub const DEFAULT_PORT: u16 = 8080;

    /// 默认镜像仓库
    pub const DEFAULT_IMAGE_REGISTRY: &str = "localhost:5000/apis";

    /// 上传大小上限（约 2GB）
    pub const MAX_UPLOAD_BYTES: u64 = (2 * 1000) << 20;

    /// 构建超时（秒）
    pub const BUILD_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// kubectl apply 超时（秒）
    pub const APPLY_TIMEOUT_SECS: u64 = 120;

    /// 身份提供方请求超时（秒）
    pub const AUTH_TIMEOUT_SECS: u64 = 10;

    /// 事件通道容量
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// 构建失败时保留的日志行数
    pub const LOG_TAIL_LINES: usize = 50;

    /// SSE keepalive 间隔（秒）
    pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_table() {
        let table = parse_token_table("tok-a=alice, tok-b = bob ,broken,=nobody,tok-c=");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("tok-a").map(String::as_str), Some("alice"));
        assert_eq!(table.get("tok-b").map(String::as_str), Some("bob"));
    }

    #[test]
    fn test_parse_var() {
        env::set_var("DEPLOYER_TEST_PARSE_VAR", "42");
        assert_eq!(parse_var::<u64>("DEPLOYER_TEST_PARSE_VAR"), Some(42));

        env::set_var("DEPLOYER_TEST_PARSE_VAR", "forty-two");
        assert_eq!(parse_var::<u64>("DEPLOYER_TEST_PARSE_VAR"), None);

        env::remove_var("DEPLOYER_TEST_PARSE_VAR");
        assert_eq!(parse_var::<u64>("DEPLOYER_TEST_PARSE_VAR"), None);
    }

    #[test]
    fn test_defaults() {
        let config = EnvConfig::default();
        assert_eq!(config.max_upload_bytes, 2_097_152_000);
        assert_eq!(config.build_timeout, Duration::from_secs(1800));
        assert!(config.store_dir.is_none());
    }
}
