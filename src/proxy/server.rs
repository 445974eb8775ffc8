use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::socks5::{self, Method, Reply, TargetAddr};
use super::tracked::TrackedStream;
use crate::config::{ProxyConfig, RateLimitConfig};
use crate::error::SessionError;
use crate::metrics::Metrics;
use crate::models::{RawTrafficEvent, PROTOCOL_TCP};
use crate::pipeline::Collector;
use crate::security::{Authenticator, ConnectionPool, IpWhitelist, RateLimiter};

/// 连接目标的超时
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// 上游连接的 TCP keep-alive 间隔
pub const KEEPALIVE: Duration = Duration::from_secs(30);

/// 从协商到读完 CONNECT 请求的总时限，超时释放准入名额
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 代理服务
///
/// 每个入站连接依次经过：连接池准入 -> 限流 -> 认证 -> IP 白名单 -> 拨号 -> 转发。
/// 只有完成转发的会话会在关闭时产生一条流量事件。
pub struct ProxyServer {
    pool: Arc<ConnectionPool>,
    limiter: RateLimiter,
    authenticator: Authenticator,
    whitelist: Arc<IpWhitelist>,
    collector: Collector,
    metrics: Arc<Metrics>,
    handshake_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        proxy: &ProxyConfig,
        rate_limit: &RateLimitConfig,
        collector: Collector,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(proxy.max_connections)),
            limiter: RateLimiter::from_config(rate_limit),
            authenticator: Authenticator::from_config(&proxy.auth),
            whitelist: Arc::new(IpWhitelist::new(proxy.ip_whitelist.iter().cloned())),
            collector,
            metrics,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// 运行期可修改的 IP 白名单
    pub fn whitelist(&self) -> Arc<IpWhitelist> {
        self.whitelist.clone()
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("无法监听代理地址: {}", addr))
    }

    /// 接受连接直到收到取消信号；已建立的会话不会被中断
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("🚀 SOCKS5 代理已启动: {}", local_addr);
        if self.authenticator.is_enabled() {
            info!("🔐 已启用用户名/密码认证");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            error!("❌ 接受连接失败: {}", e);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("SOCKS5 代理停止接受新连接");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        self.metrics.total_connections.inc();

        let Some(slot) = self.pool.try_acquire() else {
            let e = SessionError::AdmissionRejected {
                max: self.pool.max_connections(),
            };
            warn!("拒绝来自 {} 的连接: {}", peer, e);
            self.metrics.record_rejected(e.reject_reason());
            return;
        };

        self.metrics.active_connections.inc();
        debug!("📥 新连接来自: {}", peer);

        match self.run_session(stream, peer).await {
            Ok(event) => {
                debug!(
                    "会话结束: {} -> {}:{} (收 {} 字节, 发 {} 字节)",
                    event.source_ip, event.destination_ip, event.port, event.bytes_in, event.bytes_out
                );
                self.collector.collect(event);
            }
            Err(e) => {
                if e.is_gate_rejection() {
                    warn!("拒绝来自 {} 的连接: {}", peer, e);
                } else {
                    debug!("会话 {} 提前结束: {}", peer, e);
                }
                self.metrics.record_rejected(e.reject_reason());
            }
        }

        self.metrics.active_connections.dec();
        self.metrics.closed_connections.inc();
        drop(slot);
    }

    async fn run_session(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
    ) -> Result<RawTrafficEvent, SessionError> {
        let source_ip = peer.ip().to_string();

        if !self.limiter.allow(&source_ip) {
            return Err(SessionError::RateLimited(source_ip));
        }

        let target = match timeout(self.handshake_timeout, self.handshake(&mut client)).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::HandshakeTimeout(self.handshake_timeout)),
        };

        if !self.whitelist.is_allowed(&source_ip) {
            socks5::send_reply(&mut client, Reply::NotAllowed, None).await?;
            return Err(SessionError::Forbidden(source_ip));
        }

        let timestamp = Utc::now();
        let started = Instant::now();
        let upstream = match dial(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                let reply = dial_failure_reply(&e);
                // 客户端可能已断开，应答失败无需处理
                let _ = socks5::send_reply(&mut client, reply, None).await;
                return Err(e);
            }
        };
        let latency_ms = started.elapsed().as_millis() as i64;

        let destination_ip = match upstream.peer_addr() {
            Ok(addr) => addr.ip().to_string(),
            Err(_) => target.to_string(),
        };
        let bind = upstream.local_addr().ok();
        socks5::send_reply(&mut client, Reply::Succeeded, bind).await?;

        debug!("🔗 {} -> {} ({}ms)", peer, target, latency_ms);
        self.metrics.connection_latency.observe(latency_ms as f64);

        let mut upstream = TrackedStream::new(upstream);
        if let Err(e) = copy_bidirectional(&mut client, &mut upstream).await {
            debug!("转发 {} -> {} 中断: {}", peer, target, e);
        }

        let bytes_in = upstream.bytes_in();
        let bytes_out = upstream.bytes_out();
        self.metrics.bytes_in.inc_by(bytes_in);
        self.metrics.bytes_out.inc_by(bytes_out);

        Ok(RawTrafficEvent {
            source_ip,
            destination_ip,
            domain: target.domain().to_string(),
            port: target.port(),
            timestamp,
            latency_ms,
            bytes_in: bytes_in as i64,
            bytes_out: bytes_out as i64,
            protocol: PROTOCOL_TCP.to_string(),
        })
    }

    /// 方法协商、认证，返回 CONNECT 目标
    async fn handshake(&self, client: &mut TcpStream) -> Result<TargetAddr, SessionError> {
        let method = socks5::negotiate_method(client, self.authenticator.is_enabled()).await?;
        if method == Method::UserPass {
            let credentials = socks5::read_credentials(client).await?;
            let ok = self
                .authenticator
                .authenticate(&credentials.username, &credentials.password);
            socks5::send_auth_status(client, ok).await?;
            if !ok {
                return Err(SessionError::Unauthorized(credentials.username));
            }
        }

        socks5::read_request(client).await
    }
}

/// 连接目标，超时或失败都返回 `DialFailure`
async fn dial(target: &TargetAddr) -> Result<TcpStream, SessionError> {
    let result = match target {
        TargetAddr::Ip(addr) => timeout(DIAL_TIMEOUT, TcpStream::connect(*addr)).await,
        TargetAddr::Domain(host, port) => {
            timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), *port))).await
        }
    };

    let stream = match result {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(SessionError::DialFailure {
                addr: target.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(SessionError::DialFailure {
                addr: target.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "连接超时"),
            })
        }
    };

    configure_upstream(&stream).map_err(|source| SessionError::DialFailure {
        addr: target.to_string(),
        source,
    })?;

    Ok(stream)
}

fn configure_upstream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE))?;
    Ok(())
}

fn dial_failure_reply(error: &SessionError) -> Reply {
    match error {
        SessionError::DialFailure { source, .. } => match source.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            _ => Reply::HostUnreachable,
        },
        _ => Reply::GeneralFailure,
    }
}
