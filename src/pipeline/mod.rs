//! 流量事件流水线
//!
//! Collector -> Normalizer 池 -> Publisher -> 存储。
//! 所有入队操作都不阻塞，队列满时丢弃并计数。

mod collector;
mod normalizer;
mod publisher;

pub use collector::Collector;
pub use normalizer::{normalize, NormalizerPool};
pub use publisher::{Publisher, FLUSH_TIMEOUT};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::metrics::Metrics;
use crate::storage::TrafficRepository;

/// 运行中的流水线
pub struct Pipeline {
    collector: Collector,
    normalizers: NormalizerPool,
    publisher: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn start(
        config: &PipelineConfig,
        repo: Arc<dyn TrafficRepository>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(config.buffer_size.max(1));
        let (out_tx, out_rx) = mpsc::channel(config.output_buffer_size.max(1));

        let collector = Collector::new(raw_tx, metrics.clone());
        let normalizers = NormalizerPool::start(
            config.workers.max(1),
            raw_rx,
            out_tx,
            metrics.clone(),
            cancel.clone(),
        );
        let publisher = Publisher::new(
            repo,
            metrics,
            config.batch_size,
            config.flush_interval(),
        )
        .spawn(out_rx, cancel.clone());

        info!(
            "流水线已启动: {} 个 worker, 批量 {}, 刷新间隔 {}ms",
            normalizers.worker_count(),
            config.batch_size,
            config.flush_interval_ms
        );

        Self {
            collector,
            normalizers,
            publisher,
            cancel,
        }
    }

    /// 采集入口，可在各会话间克隆
    pub fn collector(&self) -> Collector {
        self.collector.clone()
    }

    /// 按顺序停止：关闭采集入口 -> 等待 worker 排空 -> 等待最后一次写入
    pub async fn shutdown(self) {
        info!("正在停止流水线...");
        self.cancel.cancel();
        self.collector.close();
        self.normalizers.join().await;

        if let Err(e) = self.publisher.await {
            error!("publisher 异常退出: {}", e);
        }
        info!("流水线已停止");
    }
}
