//! 准入、限流与访问控制

mod admission;
mod auth;
mod rate_limiter;

pub use admission::{ConnectionPool, ConnectionSlot};
pub use auth::{Authenticator, IpWhitelist};
pub use rate_limiter::{Clock, RateLimiter, SystemClock};
