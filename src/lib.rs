//! SOCKS5 流量分析代理
//!
//! 代理会话在关闭时产生流量事件，经采集、规范化后批量写入 SQLite，
//! 并通过 HTTP 接口提供统计查询。

pub mod api;
pub mod app;
pub mod config;
pub mod entity;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod pipeline;
pub mod proxy;
pub mod security;
pub mod storage;
