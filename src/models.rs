//! 流量事件与统计模型

use chrono::{DateTime, Utc};
use sea_orm::FromQueryResult;
use serde::{Deserialize, Serialize};

/// 传输层协议标记（目前只代理 TCP）
pub const PROTOCOL_TCP: &str = "tcp";

/// 原始流量事件
///
/// 每个完成转发的代理会话在关闭时产生且仅产生一个。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTrafficEvent {
    pub source_ip: String,
    pub destination_ip: String,
    /// 客户端按域名请求时为原始域名，否则为空
    pub domain: String,
    pub port: u16,
    /// 会话开始拨号的时间
    pub timestamp: DateTime<Utc>,
    /// 拨号耗时（毫秒）
    pub latency_ms: i64,
    /// 从目标收到的字节数
    pub bytes_in: i64,
    /// 发往目标的字节数
    pub bytes_out: i64,
    pub protocol: String,
}

/// 规范化后的流量记录，可直接写入存储
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficLog {
    pub source_ip: String,
    pub destination_ip: String,
    pub domain: String,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub protocol: String,
    pub created_at: DateTime<Utc>,
}

/// 按域名聚合的统计
#[derive(Debug, Clone, PartialEq, Default, Serialize, FromQueryResult)]
pub struct DomainStats {
    pub domain: String,
    pub count: i64,
    pub total_bytes_in: i64,
    pub total_bytes_out: i64,
    pub avg_latency_ms: f64,
}

/// 按来源 IP 聚合的统计
#[derive(Debug, Clone, PartialEq, Default, Serialize, FromQueryResult)]
pub struct SourceIpStats {
    pub source_ip: String,
    pub count: i64,
    pub total_bytes_in: i64,
    pub total_bytes_out: i64,
    pub avg_latency_ms: f64,
}

/// 时间区间内的总体统计
#[derive(Debug, Clone, PartialEq, Default, Serialize, FromQueryResult)]
pub struct TrafficStats {
    pub total_connections: i64,
    pub total_bytes_in: i64,
    pub total_bytes_out: i64,
    pub avg_latency_ms: f64,
}
