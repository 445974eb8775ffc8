//! 进程编排：代理 + 流水线 + HTTP 接口

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::migration::open_database;
use crate::pipeline::Pipeline;
use crate::proxy::ProxyServer;
use crate::storage::{SqliteRepository, TrafficRepository};

/// 运行代理服务，直到 `shutdown` 完成
///
/// 停止顺序：停止接受连接 -> 关闭采集入口 -> 等待 normalizer 排空 -> 最后一次批量写入。
pub async fn run_proxy<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let db = open_database(&config.database.path).await?;
    let repo: Arc<dyn TrafficRepository> = Arc::new(SqliteRepository::new(db));
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();

    let listener = ProxyServer::bind(&config.proxy.bind_addr()).await?;

    let pipeline = Pipeline::start(&config.pipeline, repo.clone(), metrics.clone(), cancel.clone());
    let server = Arc::new(ProxyServer::new(
        &config.proxy,
        &config.rate_limit,
        pipeline.collector(),
        metrics.clone(),
    ));
    let proxy_task = tokio::spawn(server.run(listener, cancel.clone()));

    let api_task = spawn_api(
        config.api.bind_addr(),
        ApiState {
            repo,
            metrics: Some(metrics),
        },
        cancel.clone(),
    );

    shutdown.await;
    info!("正在关闭服务...");
    cancel.cancel();

    match proxy_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("代理服务错误: {:#}", e),
        Err(e) => error!("代理任务异常退出: {}", e),
    }

    pipeline.shutdown().await;

    if let Err(e) = api_task.await {
        error!("HTTP 任务异常退出: {}", e);
    }

    info!("服务已关闭");
    Ok(())
}

/// 只读查询服务，直接读取已有数据库
pub async fn run_api<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let db = open_database(&config.database.path).await?;
    let repo: Arc<dyn TrafficRepository> = Arc::new(SqliteRepository::new(db));
    let cancel = CancellationToken::new();

    let api_task = spawn_api(
        config.api.bind_addr(),
        ApiState {
            repo,
            metrics: None,
        },
        cancel.clone(),
    );

    shutdown.await;
    info!("正在关闭服务...");
    cancel.cancel();

    if let Err(e) = api_task.await {
        error!("HTTP 任务异常退出: {}", e);
    }

    info!("服务已关闭");
    Ok(())
}

fn spawn_api(
    bind_addr: String,
    state: ApiState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = api::serve(&bind_addr, state, cancel).await {
            error!("HTTP 接口错误: {:#}", e);
        }
    })
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn shutdown_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("收到 Ctrl+C 信号"),
                Err(e) => error!("监听 Ctrl+C 失败: {}", e),
            }
        }
        _ = terminate() => {
            info!("收到 SIGTERM 信号");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("无法监听 SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
