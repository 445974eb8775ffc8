use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 创建 traffic_log 表
        manager
            .create_table(
                Table::create()
                    .table(TrafficLog::Table)
                    .if_not_exists()
                    .col(big_integer(TrafficLog::Id).auto_increment().primary_key())
                    .col(string(TrafficLog::SourceIp))
                    .col(string(TrafficLog::DestinationIp))
                    .col(string(TrafficLog::Domain).default(""))
                    .col(integer(TrafficLog::Port))
                    .col(timestamp_with_time_zone(TrafficLog::Timestamp))
                    .col(big_integer(TrafficLog::LatencyMs).default(0))
                    .col(big_integer(TrafficLog::BytesIn).default(0))
                    .col(big_integer(TrafficLog::BytesOut).default(0))
                    .col(string(TrafficLog::Protocol))
                    .col(timestamp_with_time_zone(TrafficLog::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // 聚合查询按这几列分组或过滤
        for (name, column) in [
            ("idx_traffic_log_source_ip", TrafficLog::SourceIp),
            ("idx_traffic_log_destination_ip", TrafficLog::DestinationIp),
            ("idx_traffic_log_domain", TrafficLog::Domain),
            ("idx_traffic_log_timestamp", TrafficLog::Timestamp),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(TrafficLog::Table)
                        .col(column)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TrafficLog::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TrafficLog {
    Table,
    Id,
    SourceIp,
    DestinationIp,
    Domain,
    Port,
    Timestamp,
    LatencyMs,
    BytesIn,
    BytesOut,
    Protocol,
    CreatedAt,
}
