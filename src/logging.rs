//! 日志初始化

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// 日志文件名前缀，按天滚动
const LOG_FILE: &str = "socks5-analytics.log";

/// 未设置 RUST_LOG 时使用的过滤规则
fn default_directives(level: &str) -> String {
    format!("{},sqlx::query=warn,sea_orm=warn", level)
}

/// 初始化全局 tracing 订阅者
///
/// 配置了 `dir` 时写入按天滚动的日志文件（无颜色），否则输出到控制台。
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let json = config.format == "json";
    let output: Box<dyn Layer<Registry> + Send + Sync> = match (&config.dir, json) {
        (Some(dir), true) => fmt::layer()
            .json()
            .with_writer(tracing_appender::rolling::daily(dir, LOG_FILE))
            .with_ansi(false)
            .boxed(),
        (Some(dir), false) => fmt::layer()
            .with_writer(tracing_appender::rolling::daily(dir, LOG_FILE))
            .with_ansi(false)
            .boxed(),
        (None, true) => fmt::layer().json().boxed(),
        (None, false) => fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("初始化日志失败: {}", e))
}
