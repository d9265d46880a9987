//! XJP API Deployer - 多租户 API 部署服务
//!
//! 租户上传源码，服务构建并推送镜像、生成部署描述并应用到租户独立的命名空间，
//! 同时把结果登记为可发布的版本，其他租户无需重新构建即可部署。

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

pub use config::{EnvConfig, RuntimeConfig};

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::AppState;

/// 按运行时参数加载配置并启动服务，直到收到 Ctrl+C
pub async fn run_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        info!(port, "Using port from command line");
        config.port = port;
    }
    run(config).await
}

/// 启动 HTTP 服务
pub async fn run(config: EnvConfig) -> anyhow::Result<()> {
    let port = config.port;
    let state = Arc::new(AppState::from_config(config).context("failed to initialize services")?);
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, version = config::env::constants::VERSION, "XJP API Deployer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
