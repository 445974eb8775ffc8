use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::FlushError;
use crate::metrics::Metrics;
use crate::models::TrafficLog;
use crate::storage::TrafficRepository;

/// 单次批量写入的超时
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// 批量写入器
///
/// 唯一的输出队列消费者。批次达到 `batch_size` 时立即写入，
/// 定时器到期且批次非空时写入剩余部分；写入失败的批次直接丢弃。
pub struct Publisher {
    repo: Arc<dyn TrafficRepository>,
    metrics: Arc<Metrics>,
    batch_size: usize,
    flush_interval: Duration,
}

impl Publisher {
    pub fn new(
        repo: Arc<dyn TrafficRepository>,
        metrics: Arc<Metrics>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            repo,
            metrics,
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }

    pub fn spawn(
        self,
        input: mpsc::Receiver<TrafficLog>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(input, cancel))
    }

    /// 运行到输入队列关闭为止，退出前写入剩余批次
    pub async fn run(self, mut input: mpsc::Receiver<TrafficLog>, cancel: CancellationToken) {
        let mut batch: Vec<TrafficLog> = Vec::with_capacity(self.batch_size);
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut draining = false;

        loop {
            tokio::select! {
                record = input.recv() => {
                    let Some(record) = record else {
                        break;
                    };
                    batch.push(record);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        debug!("定时写入 {} 条记录", batch.len());
                        self.flush(&mut batch).await;
                    }
                }
                _ = cancel.cancelled(), if !draining => {
                    debug!("publisher 收到停止信号，等待上游排空");
                    draining = true;
                }
            }
        }

        if !batch.is_empty() {
            info!("写入最后 {} 条记录", batch.len());
            self.flush(&mut batch).await;
        }
        info!("publisher 已停止");
    }

    async fn flush(&self, batch: &mut Vec<TrafficLog>) {
        if batch.is_empty() {
            return;
        }

        let records = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let count = records.len();
        let started = std::time::Instant::now();

        let result = match timeout(FLUSH_TIMEOUT, self.repo.save_batch(&records)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FlushError::Storage(e)),
            Err(_) => Err(FlushError::Timeout(FLUSH_TIMEOUT)),
        };

        self.metrics
            .db_query_duration
            .observe(started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(()) => {
                self.metrics.events_published.inc_by(count as u64);
                debug!("已写入 {} 条流量记录", count);
            }
            Err(e) => {
                self.metrics.db_errors.inc();
                error!("丢弃 {} 条流量记录: {}", count, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PROTOCOL_TCP;
    use crate::storage::MemoryRepository;
    use chrono::Utc;

    fn record(port: u16) -> TrafficLog {
        TrafficLog {
            source_ip: "127.0.0.1".to_string(),
            destination_ip: "10.0.0.1".to_string(),
            domain: String::new(),
            port,
            timestamp: Utc::now(),
            latency_ms: 3,
            bytes_in: 1,
            bytes_out: 1,
            protocol: PROTOCOL_TCP.to_string(),
            created_at: Utc::now(),
        }
    }

    fn publisher(repo: &Arc<MemoryRepository>, metrics: &Arc<Metrics>, batch: usize) -> Publisher {
        Publisher::new(
            repo.clone(),
            metrics.clone(),
            batch,
            Duration::from_millis(5000),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_and_final_flush() {
        let repo = Arc::new(MemoryRepository::new());
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(1000);
        let handle = publisher(&repo, &metrics, 10).spawn(rx, CancellationToken::new());

        for port in 0..25 {
            tx.send(record(port)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(repo.batch_sizes(), vec![10, 10, 5]);
        assert_eq!(metrics.events_published.get(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch() {
        let repo = Arc::new(MemoryRepository::new());
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(1000);
        let handle = publisher(&repo, &metrics, 100).spawn(rx, CancellationToken::new());

        for port in 0..7 {
            tx.send(record(port)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(repo.batch_sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(repo.batch_sizes(), vec![7]);

        // 空批次不触发写入
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(repo.batch_sizes(), vec![7]);

        drop(tx);
        handle.await.unwrap();
        assert_eq!(repo.batch_sizes(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_is_discarded() {
        let repo = Arc::new(MemoryRepository::new());
        repo.set_fail_writes(true);
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(1000);
        let handle = publisher(&repo, &metrics, 5).spawn(rx, CancellationToken::new());

        for port in 0..5 {
            tx.send(record(port)).await.unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        repo.set_fail_writes(false);

        for port in 5..8 {
            tx.send(record(port)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(metrics.db_errors.get(), 1);
        assert_eq!(metrics.events_published.get(), 3);
        assert_eq!(repo.batch_sizes(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_consuming_until_closed() {
        let repo = Arc::new(MemoryRepository::new());
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1000);
        let handle = publisher(&repo, &metrics, 100).spawn(rx, cancel.clone());

        cancel.cancel();
        for port in 0..4 {
            tx.send(record(port)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(repo.batch_sizes(), vec![4]);
    }
}
