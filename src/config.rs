//! 配置模块
//!
//! 配置来源优先级：环境变量 > 配置文件 > 默认值。

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "socks5-analytics.toml";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// SOCKS5 代理配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_address")]
    pub address: String,

    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// 最大并发会话数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub auth: AuthConfig,

    /// 为空时放行所有来源
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

/// HTTP 查询接口配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_address")]
    pub address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

/// 流水线配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// normalizer worker 数量
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// 采集队列容量
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// normalizer 输出队列容量
    #[serde(default = "default_buffer_size")]
    pub output_buffer_size: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 定时刷新间隔（毫秒）
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// text 或 json
    #[serde(default = "default_log_format")]
    pub format: String,

    /// 设置后按天滚动写入该目录
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_proxy_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    1080
}

fn default_max_connections() -> usize {
    10000
}

fn default_api_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "./data/socks5-analytics.db".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_buffer_size() -> usize {
    10000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_requests_per_second() -> u32 {
    100
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address: default_proxy_address(),
            port: default_proxy_port(),
            max_connections: default_max_connections(),
            auth: AuthConfig::default(),
            ip_whitelist: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: default_api_address(),
            port: default_api_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer_size: default_buffer_size(),
            output_buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = fs::read_to_string(path_ref)
            .with_context(|| format!("无法读取配置文件: {}", path_ref.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path_ref.display()))?;

        Ok(config)
    }

    /// 加载配置：指定路径必须存在；未指定时依次查找可执行文件目录和当前目录，
    /// 都找不到则使用默认值。随后叠加环境变量并校验。
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::find_default_file() {
                Some(p) => {
                    let config = Self::from_file(&p)?;
                    tracing::info!("📋 加载配置文件: {}", p.display());
                    config
                }
                None => Config::default(),
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join(DEFAULT_CONFIG_FILE)));

        [exe_dir, Some(PathBuf::from(DEFAULT_CONFIG_FILE))]
            .into_iter()
            .flatten()
            .find(|p| p.exists())
    }

    /// 使用环境变量覆盖配置，`lookup` 便于测试时替换
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("PROXY_ADDRESS") {
            self.proxy.address = v;
        }
        if let Some(v) = get("PROXY_PORT") {
            self.proxy.port = parse_env("PROXY_PORT", &v)?;
        }
        if let Some(v) = get("PROXY_MAX_CONNECTIONS") {
            self.proxy.max_connections = parse_env("PROXY_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = get("PROXY_AUTH_ENABLED") {
            self.proxy.auth.enabled = parse_env("PROXY_AUTH_ENABLED", &v)?;
        }
        if let Some(v) = get("PROXY_AUTH_USERNAME") {
            self.proxy.auth.username = v;
        }
        if let Some(v) = get("PROXY_AUTH_PASSWORD") {
            self.proxy.auth.password = v;
        }
        if let Some(v) = get("PROXY_IP_WHITELIST") {
            self.proxy.ip_whitelist = v
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("API_ADDRESS") {
            self.api.address = v;
        }
        if let Some(v) = get("API_PORT") {
            self.api.port = parse_env("API_PORT", &v)?;
        }
        if let Some(v) = get("DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = get("PIPELINE_WORKERS") {
            self.pipeline.workers = parse_env("PIPELINE_WORKERS", &v)?;
        }
        if let Some(v) = get("PIPELINE_BUFFER_SIZE") {
            self.pipeline.buffer_size = parse_env("PIPELINE_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = get("PIPELINE_OUTPUT_BUFFER_SIZE") {
            self.pipeline.output_buffer_size = parse_env("PIPELINE_OUTPUT_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = get("PIPELINE_BATCH_SIZE") {
            self.pipeline.batch_size = parse_env("PIPELINE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("PIPELINE_FLUSH_INTERVAL_MS") {
            self.pipeline.flush_interval_ms = parse_env("PIPELINE_FLUSH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = v;
        }
        if let Some(v) = get("LOG_DIR") {
            self.logging.dir = Some(v);
        }
        if let Some(v) = get("RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parse_env("RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = get("RATE_LIMIT_RPS") {
            self.rate_limit.requests_per_second = parse_env("RATE_LIMIT_RPS", &v)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy.max_connections == 0 {
            bail!("proxy.max_connections 必须大于 0");
        }
        if self.proxy.auth.enabled && self.proxy.auth.username.is_empty() {
            bail!("启用认证时 proxy.auth.username 不能为空");
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers 必须大于 0");
        }
        if self.pipeline.buffer_size == 0 || self.pipeline.output_buffer_size == 0 {
            bail!("pipeline 队列容量必须大于 0");
        }
        if self.pipeline.batch_size == 0 {
            bail!("pipeline.batch_size 必须大于 0");
        }
        if self.pipeline.flush_interval_ms == 0 {
            bail!("pipeline.flush_interval_ms 必须大于 0");
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_second == 0 {
            bail!("启用限流时 rate_limit.requests_per_second 必须大于 0");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            bail!("不支持的日志格式: {}", self.logging.format);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("环境变量 {} 的值无效: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.proxy.bind_addr(), "0.0.0.0:1080");
        assert_eq!(config.proxy.max_connections, 10000);
        assert!(!config.proxy.auth.enabled);
        assert_eq!(config.api.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.database.path, "./data/socks5-analytics.db");
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.buffer_size, 10000);
        assert_eq!(config.pipeline.batch_size, 100);
        assert_eq!(config.pipeline.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "info");
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.requests_per_second, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            port = 1999
            ip_whitelist = ["127.0.0.1"]

            [proxy.auth]
            enabled = true
            username = "admin"
            password = "secret"

            [pipeline]
            batch_size = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.port, 1999);
        assert_eq!(config.proxy.address, "0.0.0.0");
        assert_eq!(config.proxy.ip_whitelist, vec!["127.0.0.1".to_string()]);
        assert!(config.proxy.auth.enabled);
        assert_eq!(config.pipeline.batch_size, 50);
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PROXY_PORT", "2080"),
            ("PROXY_IP_WHITELIST", "10.0.0.1, 10.0.0.2,,"),
            ("PIPELINE_WORKERS", "8"),
            ("RATE_LIMIT_ENABLED", "true"),
            ("RATE_LIMIT_RPS", "5"),
            ("LOG_FORMAT", "json"),
            ("DB_PATH", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.proxy.port, 2080);
        assert_eq!(config.proxy.ip_whitelist, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.pipeline.workers, 8);
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.requests_per_second, 5);
        assert_eq!(config.logging.format, "json");
        // 空值不覆盖
        assert_eq!(config.database.path, "./data/socks5-analytics.db");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let result = config.apply_overrides(|k| (k == "PROXY_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.auth.enabled = true;
        assert!(config.validate().is_err());
        config.proxy.auth.username = "admin".into();
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(Config::from_file("/nonexistent/socks5-analytics.toml").is_err());
    }
}
