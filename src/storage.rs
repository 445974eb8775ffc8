//! 流量记录存储
//!
//! 生产环境使用 SQLite（sea-orm），测试使用内存实现。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};

use crate::entity::{traffic_log, TrafficLog as TrafficLogEntity};
use crate::models::{DomainStats, SourceIpStats, TrafficLog, TrafficStats};

/// 单条 INSERT 语句最多携带的记录数
const INSERT_CHUNK_SIZE: usize = 100;

/// 流量记录存储能力
#[async_trait]
pub trait TrafficRepository: Send + Sync {
    async fn save_one(&self, log: &TrafficLog) -> Result<()>;

    /// 批量写入，要么全部成功要么全部失败
    async fn save_batch(&self, logs: &[TrafficLog]) -> Result<()>;

    /// 按连接数降序的域名统计（忽略空域名）
    async fn top_domains(&self, limit: u64) -> Result<Vec<DomainStats>>;

    /// 按连接数降序的来源 IP 统计
    async fn top_source_ips(&self, limit: u64) -> Result<Vec<SourceIpStats>>;

    /// `[start, end]` 区间内的总体统计
    async fn traffic_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<TrafficStats>;

    /// `[start, end]` 区间内的记录，按时间倒序分页
    async fn traffic_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<traffic_log::Model>>;
}

fn to_active_model(log: &TrafficLog) -> traffic_log::ActiveModel {
    traffic_log::ActiveModel {
        id: NotSet,
        source_ip: Set(log.source_ip.clone()),
        destination_ip: Set(log.destination_ip.clone()),
        domain: Set(log.domain.clone()),
        port: Set(i32::from(log.port)),
        timestamp: Set(log.timestamp),
        latency_ms: Set(log.latency_ms),
        bytes_in: Set(log.bytes_in),
        bytes_out: Set(log.bytes_out),
        protocol: Set(log.protocol.clone()),
        created_at: Set(log.created_at),
    }
}

/// SQLite 存储
#[derive(Clone)]
pub struct SqliteRepository {
    db: DatabaseConnection,
}

impl SqliteRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TrafficRepository for SqliteRepository {
    async fn save_one(&self, log: &TrafficLog) -> Result<()> {
        TrafficLogEntity::insert(to_active_model(log))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn save_batch(&self, logs: &[TrafficLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin().await?;
        for chunk in logs.chunks(INSERT_CHUNK_SIZE) {
            TrafficLogEntity::insert_many(chunk.iter().map(to_active_model))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;

        Ok(())
    }

    async fn top_domains(&self, limit: u64) -> Result<Vec<DomainStats>> {
        let stats = TrafficLogEntity::find()
            .select_only()
            .column(traffic_log::Column::Domain)
            .column_as(Expr::cust("COUNT(*)"), "count")
            .column_as(Expr::cust("COALESCE(SUM(bytes_in), 0)"), "total_bytes_in")
            .column_as(Expr::cust("COALESCE(SUM(bytes_out), 0)"), "total_bytes_out")
            .column_as(
                Expr::cust("CAST(COALESCE(AVG(latency_ms), 0) AS REAL)"),
                "avg_latency_ms",
            )
            .filter(traffic_log::Column::Domain.ne(""))
            .group_by(traffic_log::Column::Domain)
            .order_by_desc(Expr::cust("count"))
            .limit(limit)
            .into_model::<DomainStats>()
            .all(&self.db)
            .await?;

        Ok(stats)
    }

    async fn top_source_ips(&self, limit: u64) -> Result<Vec<SourceIpStats>> {
        let stats = TrafficLogEntity::find()
            .select_only()
            .column(traffic_log::Column::SourceIp)
            .column_as(Expr::cust("COUNT(*)"), "count")
            .column_as(Expr::cust("COALESCE(SUM(bytes_in), 0)"), "total_bytes_in")
            .column_as(Expr::cust("COALESCE(SUM(bytes_out), 0)"), "total_bytes_out")
            .column_as(
                Expr::cust("CAST(COALESCE(AVG(latency_ms), 0) AS REAL)"),
                "avg_latency_ms",
            )
            .group_by(traffic_log::Column::SourceIp)
            .order_by_desc(Expr::cust("count"))
            .limit(limit)
            .into_model::<SourceIpStats>()
            .all(&self.db)
            .await?;

        Ok(stats)
    }

    async fn traffic_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TrafficStats> {
        let stats = TrafficLogEntity::find()
            .select_only()
            .column_as(Expr::cust("COUNT(*)"), "total_connections")
            .column_as(Expr::cust("COALESCE(SUM(bytes_in), 0)"), "total_bytes_in")
            .column_as(Expr::cust("COALESCE(SUM(bytes_out), 0)"), "total_bytes_out")
            .column_as(
                Expr::cust("CAST(COALESCE(AVG(latency_ms), 0) AS REAL)"),
                "avg_latency_ms",
            )
            .filter(traffic_log::Column::Timestamp.gte(start))
            .filter(traffic_log::Column::Timestamp.lte(end))
            .into_model::<TrafficStats>()
            .one(&self.db)
            .await?;

        Ok(stats.unwrap_or_default())
    }

    async fn traffic_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<traffic_log::Model>> {
        let logs = TrafficLogEntity::find()
            .filter(traffic_log::Column::Timestamp.gte(start))
            .filter(traffic_log::Column::Timestamp.lte(end))
            .order_by_desc(traffic_log::Column::Timestamp)
            .limit(limit)
            .offset(offset)
            .all(&self.db)
            .await?;

        Ok(logs)
    }
}

/// 内存存储，记录每一次批量写入的大小
#[derive(Default)]
pub struct MemoryRepository {
    rows: Mutex<Vec<traffic_log::Model>>,
    batches: Mutex<Vec<usize>>,
    fail_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 收到的每个批次的大小，按到达顺序
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> Vec<traffic_log::Model> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 让后续写入全部失败
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn push(&self, rows: &mut Vec<traffic_log::Model>, log: &TrafficLog) {
        let id = rows.len() as i64 + 1;
        rows.push(traffic_log::Model {
            id,
            source_ip: log.source_ip.clone(),
            destination_ip: log.destination_ip.clone(),
            domain: log.domain.clone(),
            port: i32::from(log.port),
            timestamp: log.timestamp,
            latency_ms: log.latency_ms,
            bytes_in: log.bytes_in,
            bytes_out: log.bytes_out,
            protocol: log.protocol.clone(),
            created_at: log.created_at,
        });
    }

    fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<traffic_log::Model> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect()
    }
}

/// (count, bytes_in, bytes_out, latency_sum)
type Totals = (i64, i64, i64, i64);

fn group_totals<'a, K, I>(rows: I) -> Vec<(String, Totals)>
where
    I: IntoIterator<Item = (K, &'a traffic_log::Model)>,
    K: Into<String>,
{
    let mut groups: HashMap<String, Totals> = HashMap::new();
    for (key, row) in rows {
        let entry = groups.entry(key.into()).or_default();
        entry.0 += 1;
        entry.1 += row.bytes_in;
        entry.2 += row.bytes_out;
        entry.3 += row.latency_ms;
    }

    let mut groups: Vec<_> = groups.into_iter().collect();
    groups.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(&b.0)));
    groups
}

fn average(sum: i64, count: i64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

#[async_trait]
impl TrafficRepository for MemoryRepository {
    async fn save_one(&self, log: &TrafficLog) -> Result<()> {
        self.save_batch(std::slice::from_ref(log)).await
    }

    async fn save_batch(&self, logs: &[TrafficLog]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("内存存储写入失败");
        }

        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for log in logs {
            self.push(&mut rows, log);
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(logs.len());

        Ok(())
    }

    async fn top_domains(&self, limit: u64) -> Result<Vec<DomainStats>> {
        let rows = self.rows();
        let groups = group_totals(
            rows.iter()
                .filter(|r| !r.domain.is_empty())
                .map(|r| (r.domain.clone(), r)),
        );

        Ok(groups
            .into_iter()
            .take(limit as usize)
            .map(|(domain, (count, bytes_in, bytes_out, latency))| DomainStats {
                domain,
                count,
                total_bytes_in: bytes_in,
                total_bytes_out: bytes_out,
                avg_latency_ms: average(latency, count),
            })
            .collect())
    }

    async fn top_source_ips(&self, limit: u64) -> Result<Vec<SourceIpStats>> {
        let rows = self.rows();
        let groups = group_totals(rows.iter().map(|r| (r.source_ip.clone(), r)));

        Ok(groups
            .into_iter()
            .take(limit as usize)
            .map(|(source_ip, (count, bytes_in, bytes_out, latency))| SourceIpStats {
                source_ip,
                count,
                total_bytes_in: bytes_in,
                total_bytes_out: bytes_out,
                avg_latency_ms: average(latency, count),
            })
            .collect())
    }

    async fn traffic_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TrafficStats> {
        let rows = self.in_range(start, end);
        let count = rows.len() as i64;
        let latency: i64 = rows.iter().map(|r| r.latency_ms).sum();

        Ok(TrafficStats {
            total_connections: count,
            total_bytes_in: rows.iter().map(|r| r.bytes_in).sum(),
            total_bytes_out: rows.iter().map(|r| r.bytes_out).sum(),
            avg_latency_ms: average(latency, count),
        })
    }

    async fn traffic_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<traffic_log::Model>> {
        let mut rows = self.in_range(start, end);
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}
