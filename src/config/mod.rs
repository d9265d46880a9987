//! 配置模块
//!
//! 环境变量解析与配置管理

pub mod env;

pub use env::EnvConfig;

/// 命令行运行时配置
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    /// 覆盖监听端口
    pub port_override: Option<u16>,
}
