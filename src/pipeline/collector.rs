use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::metrics::{DropStage, Metrics};
use crate::models::RawTrafficEvent;

/// 流量事件采集入口
///
/// `collect` 永不阻塞也不返回错误：队列满时直接丢弃事件。
#[derive(Clone)]
pub struct Collector {
    sender: Arc<RwLock<Option<mpsc::Sender<RawTrafficEvent>>>>,
    metrics: Arc<Metrics>,
}

impl Collector {
    pub fn new(sender: mpsc::Sender<RawTrafficEvent>, metrics: Arc<Metrics>) -> Self {
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
            metrics,
        }
    }

    pub fn collect(&self, event: RawTrafficEvent) {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            warn!(
                "采集器已关闭，丢弃事件: {} -> {}:{}",
                event.source_ip, event.destination_ip, event.port
            );
            self.metrics.record_dropped(DropStage::Collector);
            return;
        };

        match sender.try_send(event) {
            Ok(()) => {
                self.metrics.events_collected.inc();
            }
            Err(TrySendError::Full(event)) => {
                warn!(
                    "采集队列已满，丢弃事件: {} -> {}:{}",
                    event.source_ip, event.destination_ip, event.port
                );
                self.metrics.record_dropped(DropStage::Collector);
            }
            Err(TrySendError::Closed(_)) => {
                warn!("采集队列已关闭，丢弃事件");
                self.metrics.record_dropped(DropStage::Collector);
            }
        }
    }

    /// 关闭采集入口，之后的事件全部丢弃
    ///
    /// 所有克隆共享同一个发送端，关闭后下游 worker 会在排空队列后退出。
    pub fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
