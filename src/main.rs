//! XJP API Deployer - 多租户 API 部署服务
//!
//! Usage:
//! - Normal mode: `xjp-api-deployer`
//! - With custom port: `xjp-api-deployer --port 19999`

use tracing_subscriber::EnvFilter;
use xjp_api_deployer::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("XJP API Deployer - 多租户 API 部署服务");
    println!();
    println!("USAGE:");
    println!("    xjp-api-deployer [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    DEPLOYER_IMAGE_REGISTRY    Image registry prefix");
    println!("    DEPLOYER_STORE_DIR         Shared registry store directory");
    println!("    DEPLOYER_AUTH_URL          Identity provider endpoint");
    println!("    DEPLOYER_STATIC_TOKENS     Static tokens (token=tenant,...)");
    println!("    RUST_LOG                   Log filter");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("xjp_api_deployer=info".parse()?),
        )
        .init();

    xjp_api_deployer::run_with_config(config).await
}
