use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use socks5_analytics::app;
use socks5_analytics::config::Config;
use socks5_analytics::logging;

#[derive(Parser)]
#[command(name = "socks5-analytics", version, about = "SOCKS5 流量分析代理")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 运行 SOCKS5 代理、事件流水线和 HTTP 接口
    Proxy {
        /// 配置文件路径（默认查找 socks5-analytics.toml）
        #[arg(short, long)]
        config: Option<String>,
    },

    /// 只运行 HTTP 查询接口
    Api {
        /// 配置文件路径（默认查找 socks5-analytics.toml）
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Proxy { config } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config.logging)?;
            info!("启动 SOCKS5 代理: {}", config.proxy.bind_addr());
            app::run_proxy(config, app::shutdown_signal()).await
        }
        Command::Api { config } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config.logging)?;
            info!("启动查询接口: {}", config.api.bind_addr());
            app::run_api(config, app::shutdown_signal()).await
        }
    }
}
