//! HTTP 查询接口

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Extension, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::metrics::Metrics;
use crate::storage::TrafficRepository;

mod handlers;

pub use handlers::{resolve_range, ApiResponse};

#[derive(Clone)]
pub struct ApiState {
    pub repo: Arc<dyn TrafficRepository>,
    /// 仅在与代理同进程运行时提供
    pub metrics: Option<Arc<Metrics>>,
}

pub fn router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/stats/top-domains", get(handlers::top_domains))
        .route("/stats/source-ips", get(handlers::top_source_ips))
        .route("/stats/traffic", get(handlers::traffic_stats))
        .route("/logs/traffic", get(handlers::traffic_logs));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", api_routes)
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
}

/// 启动 HTTP 服务，收到取消信号后优雅退出
pub async fn serve(bind_addr: &str, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("无法监听 HTTP 地址: {}", bind_addr))?;

    info!("🌐 HTTP 接口已启动: http://{}", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP 服务异常退出")?;

    info!("HTTP 接口已停止");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRepository;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_router_routes() {
        let metrics = Arc::new(Metrics::new());
        metrics.total_connections.inc();
        let state = ApiState {
            repo: Arc::new(MemoryRepository::new()),
            metrics: Some(metrics),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        let health = http_get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains("\"success\":true"));

        let domains = http_get(addr, "/api/stats/top-domains?limit=5").await;
        assert!(domains.contains("\"data\":[]"));

        let exported = http_get(addr, "/metrics").await;
        assert!(exported.contains("socks5_proxy_connections_total 1"));

        let missing = http_get(addr, "/api/unknown").await;
        assert!(missing.starts_with("HTTP/1.1 404"));
    }
}
