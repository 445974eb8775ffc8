use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::ApiState;
use crate::entity::traffic_log;
use crate::models::{DomainStats, SourceIpStats, TrafficStats};

const DEFAULT_TOP_LIMIT: u64 = 10;
const DEFAULT_PAGE_LIMIT: u64 = 100;
const MAX_LIMIT: u64 = 1000;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        })
    }

    pub fn error(message: String) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            message,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TrafficPage {
    pub logs: Vec<traffic_log::Model>,
    pub limit: u64,
    pub offset: u64,
}

/// 解析时间区间，缺省为最近 24 小时
pub fn resolve_range(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), String> {
    let parse = |name: &str, value: &str| {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("参数 {} 不是合法的 RFC 3339 时间: {}", name, e))
    };

    let end = match end {
        Some(v) => parse("end", v)?,
        None => now,
    };
    let start = match start {
        Some(v) => parse("start", v)?,
        None => end - Duration::hours(24),
    };

    if start > end {
        return Err("start 不能晚于 end".to_string());
    }
    Ok((start, end))
}

fn clamp_limit(limit: Option<u64>, default: u64) -> u64 {
    limit.unwrap_or(default).clamp(1, MAX_LIMIT)
}

pub async fn health() -> Json<ApiResponse<HealthStatus>> {
    ApiResponse::success(HealthStatus {
        status: "ok",
        time: Utc::now(),
    })
}

/// 访问最多的域名
pub async fn top_domains(
    Extension(state): Extension<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Json<ApiResponse<Vec<DomainStats>>> {
    let limit = clamp_limit(query.limit, DEFAULT_TOP_LIMIT);
    match state.repo.top_domains(limit).await {
        Ok(stats) => ApiResponse::success(stats),
        Err(e) => {
            error!("查询域名统计失败: {}", e);
            ApiResponse::error(format!("Database error: {}", e))
        }
    }
}

/// 连接最多的来源 IP
pub async fn top_source_ips(
    Extension(state): Extension<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Json<ApiResponse<Vec<SourceIpStats>>> {
    let limit = clamp_limit(query.limit, DEFAULT_TOP_LIMIT);
    match state.repo.top_source_ips(limit).await {
        Ok(stats) => ApiResponse::success(stats),
        Err(e) => {
            error!("查询来源 IP 统计失败: {}", e);
            ApiResponse::error(format!("Database error: {}", e))
        }
    }
}

pub async fn traffic_stats(
    Extension(state): Extension<ApiState>,
    Query(query): Query<RangeQuery>,
) -> Json<ApiResponse<TrafficStats>> {
    let (start, end) = match resolve_range(query.start.as_deref(), query.end.as_deref(), Utc::now()) {
        Ok(range) => range,
        Err(message) => return ApiResponse::error(message),
    };

    match state.repo.traffic_stats(start, end).await {
        Ok(stats) => ApiResponse::success(stats),
        Err(e) => {
            error!("查询流量统计失败: {}", e);
            ApiResponse::error(format!("Database error: {}", e))
        }
    }
}

pub async fn traffic_logs(
    Extension(state): Extension<ApiState>,
    Query(query): Query<LogsQuery>,
) -> Json<ApiResponse<TrafficPage>> {
    let (start, end) = match resolve_range(query.start.as_deref(), query.end.as_deref(), Utc::now()) {
        Ok(range) => range,
        Err(message) => return ApiResponse::error(message),
    };
    let limit = clamp_limit(query.limit, DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);

    match state.repo.traffic_by_time_range(start, end, limit, offset).await {
        Ok(logs) => ApiResponse::success(TrafficPage { logs, limit, offset }),
        Err(e) => {
            error!("查询流量记录失败: {}", e);
            ApiResponse::error(format!("Database error: {}", e))
        }
    }
}

/// Prometheus 文本格式指标
pub async fn metrics(Extension(state): Extension<ApiState>) -> Response {
    let Some(metrics) = state.metrics.as_ref() else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("导出指标失败: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::models::{TrafficLog, PROTOCOL_TCP};
    use crate::storage::{MemoryRepository, TrafficRepository};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn log(domain: &str, source_ip: &str, timestamp: DateTime<Utc>) -> TrafficLog {
        TrafficLog {
            source_ip: source_ip.to_string(),
            destination_ip: "1.1.1.1".to_string(),
            domain: domain.to_string(),
            port: 443,
            timestamp,
            latency_ms: 8,
            bytes_in: 100,
            bytes_out: 50,
            protocol: PROTOCOL_TCP.to_string(),
            created_at: timestamp,
        }
    }

    async fn state_with_data() -> ApiState {
        let repo = Arc::new(MemoryRepository::new());
        let now = Utc::now();
        repo.save_batch(&[
            log("a.com", "10.0.0.1", now - Duration::minutes(5)),
            log("a.com", "10.0.0.2", now - Duration::minutes(4)),
            log("b.com", "10.0.0.1", now - Duration::minutes(3)),
            log("", "10.0.0.1", now - Duration::hours(48)),
        ])
        .await
        .unwrap();

        ApiState {
            repo,
            metrics: Some(Arc::new(Metrics::new())),
        }
    }

    #[test]
    fn test_resolve_range_defaults_to_last_day() {
        let now = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();
        let (start, end) = resolve_range(None, None, now).unwrap();
        assert_eq!(end, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_resolve_range_parses_rfc3339() {
        let now = Utc::now();
        let (start, end) = resolve_range(
            Some("2025-03-01T08:00:00+08:00"),
            Some("2025-03-01T12:00:00Z"),
            now,
        )
        .unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());

        assert!(resolve_range(Some("yesterday"), None, now).is_err());
        assert!(resolve_range(Some("2025-03-02T00:00:00Z"), Some("2025-03-01T00:00:00Z"), now).is_err());
    }

    #[test]
    fn test_response_envelope() {
        let Json(ok) = ApiResponse::success(vec![1, 2]);
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "success": true, "data": [1, 2], "message": "Success" })
        );

        let Json(err) = ApiResponse::<()>::error("boom".to_string());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["success"], false);
        assert!(value["data"].is_null());
        assert_eq!(value["message"], "boom");
    }

    #[tokio::test]
    async fn test_top_domains_handler() {
        let state = state_with_data().await;
        let Json(resp) = top_domains(Extension(state), Query(LimitQuery { limit: Some(1) })).await;

        assert!(resp.success);
        let data = resp.data.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].domain, "a.com");
        assert_eq!(data[0].count, 2);
    }

    #[tokio::test]
    async fn test_source_ips_handler() {
        let state = state_with_data().await;
        let Json(resp) = top_source_ips(Extension(state), Query(LimitQuery::default())).await;

        let data = resp.data.unwrap();
        assert_eq!(data[0].source_ip, "10.0.0.1");
        assert_eq!(data[0].count, 3);
    }

    #[tokio::test]
    async fn test_traffic_stats_handler_uses_last_day() {
        let state = state_with_data().await;
        let Json(resp) = traffic_stats(Extension(state), Query(RangeQuery::default())).await;

        let stats = resp.data.unwrap();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.total_bytes_in, 300);
    }

    #[tokio::test]
    async fn test_traffic_logs_handler_paginates() {
        let state = state_with_data().await;
        let Json(resp) = traffic_logs(
            Extension(state),
            Query(LogsQuery {
                limit: Some(2),
                offset: Some(1),
                ..LogsQuery::default()
            }),
        )
        .await;

        let page = resp.data.unwrap();
        assert_eq!(page.logs.len(), 2);
        assert_eq!(page.logs[0].domain, "a.com");
        assert_eq!(page.offset, 1);
    }

    #[tokio::test]
    async fn test_invalid_range_is_reported() {
        let state = state_with_data().await;
        let Json(resp) = traffic_stats(
            Extension(state),
            Query(RangeQuery {
                start: Some("not-a-time".into()),
                end: None,
            }),
        )
        .await;

        assert!(!resp.success);
        assert!(resp.data.is_none());
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let state = state_with_data().await;
        let response = metrics(Extension(state)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let disabled = ApiState {
            repo: Arc::new(MemoryRepository::new()),
            metrics: None,
        };
        let response = metrics(Extension(disabled)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
