//! Prometheus 指标
//!
//! 所有指标集中在 [`Metrics`] 中，由入口创建后以 `Arc<Metrics>` 显式传入各组件。
//! 计数器在导出时会自动带上 `_total` 后缀。

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// 连接延迟分桶（毫秒）
const LATENCY_BUCKETS: [f64; 9] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// 流水线处理延迟分桶（毫秒）
const PROCESSING_BUCKETS: [f64; 8] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0];

/// 会话被拒绝的原因
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RejectReason {
    Admission,
    RateLimit,
    Unauthorized,
    Forbidden,
    Dial,
    Protocol,
}

/// 事件被丢弃的流水线阶段
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DropStage {
    Collector,
    Normalizer,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
    pub reason: RejectReason,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub stage: DropStage,
}

pub struct Metrics {
    registry: Registry,

    // 连接
    pub active_connections: Gauge,
    pub total_connections: Counter,
    pub closed_connections: Counter,
    pub rejected_connections: Family<RejectLabels, Counter>,

    // 流量
    pub bytes_in: Counter,
    pub bytes_out: Counter,
    pub connection_latency: Histogram,

    // 流水线
    pub events_collected: Counter,
    pub events_processed: Counter,
    pub events_published: Counter,
    pub events_dropped: Family<StageLabels, Counter>,
    pub processing_latency: Histogram,

    // 数据库
    pub db_query_duration: Histogram,
    pub db_errors: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let active_connections = Gauge::default();
        let total_connections = Counter::default();
        let closed_connections = Counter::default();
        let rejected_connections = Family::<RejectLabels, Counter>::default();
        registry.register(
            "socks5_proxy_active_connections",
            "Current number of active proxy connections",
            active_connections.clone(),
        );
        registry.register(
            "socks5_proxy_connections",
            "Total number of proxy connections since start",
            total_connections.clone(),
        );
        registry.register(
            "socks5_proxy_closed_connections",
            "Total number of closed proxy connections",
            closed_connections.clone(),
        );
        registry.register(
            "socks5_proxy_rejected_connections",
            "Proxy connections rejected before relaying",
            rejected_connections.clone(),
        );

        let bytes_in = Counter::default();
        let bytes_out = Counter::default();
        let connection_latency = Histogram::new(LATENCY_BUCKETS.into_iter());
        registry.register("socks5_proxy_bytes_in", "Total bytes received by proxy", bytes_in.clone());
        registry.register("socks5_proxy_bytes_out", "Total bytes sent by proxy", bytes_out.clone());
        registry.register(
            "socks5_proxy_latency_ms",
            "Distribution of connection latencies in milliseconds",
            connection_latency.clone(),
        );

        let events_collected = Counter::default();
        let events_processed = Counter::default();
        let events_published = Counter::default();
        let events_dropped = Family::<StageLabels, Counter>::default();
        let processing_latency = Histogram::new(PROCESSING_BUCKETS.into_iter());
        registry.register(
            "pipeline_events_collected",
            "Total events collected by the pipeline",
            events_collected.clone(),
        );
        registry.register(
            "pipeline_events_processed",
            "Total events processed by the normalizer",
            events_processed.clone(),
        );
        registry.register(
            "pipeline_events_published",
            "Total events published to the database",
            events_published.clone(),
        );
        registry.register(
            "pipeline_events_dropped",
            "Events dropped because a pipeline queue was full",
            events_dropped.clone(),
        );
        registry.register(
            "pipeline_processing_latency_ms",
            "Pipeline event processing latency in milliseconds",
            processing_latency.clone(),
        );

        let db_query_duration = Histogram::new(LATENCY_BUCKETS.into_iter());
        let db_errors = Counter::default();
        registry.register(
            "db_query_duration_ms",
            "Database query duration in milliseconds",
            db_query_duration.clone(),
        );
        registry.register("db_errors", "Total database errors", db_errors.clone());

        Self {
            registry,
            active_connections,
            total_connections,
            closed_connections,
            rejected_connections,
            bytes_in,
            bytes_out,
            connection_latency,
            events_collected,
            events_processed,
            events_published,
            events_dropped,
            processing_latency,
            db_query_duration,
            db_errors,
        }
    }

    pub fn record_rejected(&self, reason: RejectReason) {
        self.rejected_connections
            .get_or_create(&RejectLabels { reason })
            .inc();
    }

    pub fn record_dropped(&self, stage: DropStage) {
        self.events_dropped.get_or_create(&StageLabels { stage }).inc();
    }

    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected_connections
            .get_or_create(&RejectLabels { reason })
            .get()
    }

    pub fn dropped(&self, stage: DropStage) -> u64 {
        self.events_dropped.get_or_create(&StageLabels { stage }).get()
    }

    /// 以 Prometheus 文本格式导出
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        let metrics = Metrics::new();
        metrics.total_connections.inc();
        metrics.record_dropped(DropStage::Collector);
        metrics.record_rejected(RejectReason::RateLimit);

        let text = metrics.encode().unwrap();
        assert!(text.contains("socks5_proxy_connections_total 1"));
        assert!(text.contains("pipeline_events_dropped_total{stage=\"Collector\"} 1"));
        assert!(text.contains("socks5_proxy_rejected_connections_total{reason=\"RateLimit\"} 1"));
        assert!(text.contains("db_query_duration_ms_bucket"));
    }

    #[test]
    fn test_labelled_counters_are_independent() {
        let metrics = Metrics::new();
        metrics.record_dropped(DropStage::Normalizer);
        metrics.record_dropped(DropStage::Normalizer);

        assert_eq!(metrics.dropped(DropStage::Normalizer), 2);
        assert_eq!(metrics.dropped(DropStage::Collector), 0);
        assert_eq!(metrics.rejected(RejectReason::Admission), 0);
    }
}
