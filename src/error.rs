//! 会话与流水线错误类型

use std::io;
use thiserror::Error;

use crate::metrics::RejectReason;

/// 代理会话在进入转发前被终止的原因
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("连接池已满 (最大 {max})")]
    AdmissionRejected { max: usize },

    #[error("客户端 {0} 触发限流")]
    RateLimited(String),

    #[error("用户 {0} 认证失败")]
    Unauthorized(String),

    #[error("客户端 {0} 不在 IP 白名单中")]
    Forbidden(String),

    #[error("连接目标 {addr} 失败: {source}")]
    DialFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("SOCKS5 协商失败: {0}")]
    Protocol(String),

    #[error("SOCKS5 握手超时 ({0:?})")]
    HandshakeTimeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    /// 对应的拒绝原因指标标签
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            SessionError::AdmissionRejected { .. } => RejectReason::Admission,
            SessionError::RateLimited(_) => RejectReason::RateLimit,
            SessionError::Unauthorized(_) => RejectReason::Unauthorized,
            SessionError::Forbidden(_) => RejectReason::Forbidden,
            SessionError::DialFailure { .. } => RejectReason::Dial,
            SessionError::Protocol(_)
            | SessionError::HandshakeTimeout(_)
            | SessionError::Io(_) => RejectReason::Protocol,
        }
    }

    /// 准入阶段的拒绝（限流、认证、白名单、连接池），只记录日志
    pub fn is_gate_rejection(&self) -> bool {
        matches!(
            self,
            SessionError::AdmissionRejected { .. }
                | SessionError::RateLimited(_)
                | SessionError::Unauthorized(_)
                | SessionError::Forbidden(_)
        )
    }
}

/// 批量写入失败，批次直接丢弃
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("批量写入超时 ({0:?})")]
    Timeout(std::time::Duration),

    #[error("批量写入失败: {0}")]
    Storage(#[from] anyhow::Error),
}
