//! SOCKS5 代理

mod server;
pub mod socks5;
mod tracked;

pub use server::{ProxyServer, DIAL_TIMEOUT, KEEPALIVE};
pub use tracked::TrackedStream;
