use anyhow::Context;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::prelude::*;
use std::fs::create_dir_all;
use std::path::Path;
use tracing::info;

mod m20250301_000001_create_traffic_log;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250301_000001_create_traffic_log::Migration)]
    }
}

/// 内存数据库地址，测试使用
pub const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

/// 根据数据库文件路径生成连接地址（文件不存在时自动创建）
pub fn database_url(db_path: &str) -> String {
    format!("sqlite://{}?mode=rwc", db_path)
}

/// 打开 SQLite 数据库，必要时创建所在目录
pub async fn open_database(db_path: &str) -> anyhow::Result<DatabaseConnection> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)
                .with_context(|| format!("无法创建数据库目录: {}", parent.display()))?;
        }
    }

    let db = connect(&database_url(db_path)).await?;
    info!("数据库已连接: {}", db_path);
    Ok(db)
}

/// 按地址连接数据库并执行迁移
pub async fn connect(url: &str) -> anyhow::Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(url.to_string());
    options.sqlx_logging(false);
    // 内存库的每个连接都是独立数据库，只能保留单连接
    if url.contains(":memory:") {
        options.max_connections(1).min_connections(1);
    }

    let db = Database::connect(options)
        .await
        .with_context(|| format!("连接数据库失败: {}", url))?;

    Migrator::up(&db, None)
        .await
        .context("执行数据库迁移失败")?;

    Ok(db)
}
