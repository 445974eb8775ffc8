use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::metrics::{DropStage, Metrics};
use crate::models::{RawTrafficEvent, TrafficLog};

/// 原始事件转换为规范记录，字段逐一复制并补充创建时间
pub fn normalize(event: RawTrafficEvent) -> TrafficLog {
    TrafficLog {
        source_ip: event.source_ip,
        destination_ip: event.destination_ip,
        domain: event.domain,
        port: event.port,
        timestamp: event.timestamp,
        latency_ms: event.latency_ms,
        bytes_in: event.bytes_in,
        bytes_out: event.bytes_out,
        protocol: event.protocol,
        created_at: Utc::now(),
    }
}

/// Normalizer worker 池
///
/// 所有 worker 共享同一个输入队列，空闲的 worker 取下一条事件。
/// 输入队列关闭并排空后 worker 退出；全部退出后输出队列随之关闭。
pub struct NormalizerPool {
    handles: Vec<JoinHandle<()>>,
}

impl NormalizerPool {
    pub fn start(
        workers: usize,
        input: mpsc::Receiver<RawTrafficEvent>,
        output: mpsc::Sender<TrafficLog>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let input = Arc::new(Mutex::new(input));

        let handles = (0..workers)
            .map(|id| {
                let input = input.clone();
                let output = output.clone();
                let metrics = metrics.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_worker(id, input, output, metrics, cancel).await;
                })
            })
            .collect();

        // 原始发送端在此释放，输出队列只由 worker 持有
        drop(output);

        Self { handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// 等待所有 worker 退出
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("normalizer worker 异常退出: {}", e);
            }
        }
    }
}

async fn run_worker(
    id: usize,
    input: Arc<Mutex<mpsc::Receiver<RawTrafficEvent>>>,
    output: mpsc::Sender<TrafficLog>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    debug!("normalizer worker #{} 已启动", id);
    let mut draining = false;

    loop {
        let next = {
            let mut rx = input.lock().await;
            if draining {
                rx.recv().await
            } else {
                tokio::select! {
                    event = rx.recv() => event,
                    _ = cancel.cancelled() => {
                        debug!("normalizer worker #{} 进入排空模式", id);
                        draining = true;
                        continue;
                    }
                }
            }
        };

        let Some(event) = next else {
            break;
        };

        let started = Instant::now();
        let record = normalize(event);
        metrics.events_processed.inc();
        metrics
            .processing_latency
            .observe(started.elapsed().as_secs_f64() * 1000.0);

        match output.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(
                    "输出队列已满，丢弃记录: {} -> {}:{}",
                    record.source_ip, record.destination_ip, record.port
                );
                metrics.record_dropped(DropStage::Normalizer);
            }
            Err(TrySendError::Closed(_)) => {
                warn!("输出队列已关闭，丢弃记录");
                metrics.record_dropped(DropStage::Normalizer);
            }
        }
    }

    debug!("normalizer worker #{} 已退出", id);
}
