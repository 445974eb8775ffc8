use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "traffic_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub source_ip: String,
    pub destination_ip: String,
    pub domain: String,
    pub port: i32,
    pub timestamp: DateTimeUtc,
    pub latency_ms: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub protocol: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
