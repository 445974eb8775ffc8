//! SOCKS5 协议（RFC 1928 / RFC 1929）
//!
//! 只实现 CONNECT 命令，认证方式支持无认证和用户名/密码。

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// 协商出的认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    NoAuth,
    UserPass,
}

/// 请求应答码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// 目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// 按域名请求时返回域名，否则为空
    pub fn domain(&self) -> &str {
        match self {
            TargetAddr::Ip(_) => "",
            TargetAddr::Domain(domain, _) => domain,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// 读取客户端问候并选择认证方式
///
/// 要求认证但客户端不支持用户名/密码时回复 0xFF 并返回 `Unauthorized`。
pub async fn negotiate_method<S>(stream: &mut S, auth_required: bool) -> Result<Method, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SessionError::Protocol(format!(
            "不支持的协议版本: {:#04x}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let (wanted, method) = if auth_required {
        (METHOD_USER_PASS, Method::UserPass)
    } else {
        (METHOD_NO_AUTH, Method::NoAuth)
    };

    if methods.contains(&wanted) {
        stream.write_all(&[SOCKS_VERSION, wanted]).await?;
        return Ok(method);
    }

    stream
        .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
        .await?;
    if auth_required {
        Err(SessionError::Unauthorized("-".to_string()))
    } else {
        Err(SessionError::Protocol("客户端没有可接受的认证方式".to_string()))
    }
}

/// 读取用户名/密码子协商
pub async fn read_credentials<S>(stream: &mut S) -> Result<Credentials, SessionError>
where
    S: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(SessionError::Protocol(format!(
            "不支持的认证子协议版本: {:#04x}",
            version
        )));
    }

    let username = read_string(stream).await?;
    let password = read_string(stream).await?;

    Ok(Credentials { username, password })
}

pub async fn send_auth_status<S>(stream: &mut S, success: bool) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    let status = if success { 0x00 } else { 0x01 };
    stream.write_all(&[AUTH_VERSION, status]).await?;
    Ok(())
}

/// 读取 CONNECT 请求
///
/// 不支持的命令或地址类型会先回复对应错误码再返回错误。
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;

    if version != SOCKS_VERSION {
        return Err(SessionError::Protocol(format!(
            "不支持的协议版本: {:#04x}",
            version
        )));
    }

    if command != CMD_CONNECT {
        send_reply(stream, Reply::CommandNotSupported, None).await?;
        return Err(SessionError::Protocol(format!(
            "不支持的命令: {:#04x}",
            command
        )));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        ATYP_DOMAIN => {
            let domain = read_string(stream).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Domain(domain, port)
        }
        other => {
            send_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(SessionError::Protocol(format!(
                "不支持的地址类型: {:#04x}",
                other
            )));
        }
    };

    Ok(target)
}

/// 发送请求应答，未提供绑定地址时使用 0.0.0.0:0
pub async fn send_reply<S>(
    stream: &mut S,
    reply: Reply,
    bind: Option<SocketAddr>,
) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    let bind = bind.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
    match bind {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
        }
    }
    buf.extend_from_slice(&bind.port().to_be_bytes());

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_string<S>(stream: &mut S) -> Result<String, SessionError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| SessionError::Protocol("字段不是合法的 UTF-8".to_string()))
}
