use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::config::AuthConfig;

/// SOCKS5 用户名/密码认证
#[derive(Debug, Clone)]
pub struct Authenticator {
    username: String,
    password: String,
    enabled: bool,
}

impl Authenticator {
    /// 使用固定凭据创建（启用认证）
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            enabled: true,
        }
    }

    /// 不做认证
    pub fn disabled() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            enabled: false,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        if config.enabled {
            Self::new(&config.username, &config.password)
        } else {
            Self::disabled()
        }
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        if !self.enabled {
            return true;
        }

        username == self.username && password == self.password
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// IP 白名单
///
/// 是否启用由创建时的名单决定：初始名单为空则始终放行，
/// 否则只放行名单内地址。运行期 `add_ip`/`remove_ip` 只改变成员，不改变启用状态，
/// 移除最后一个地址后拒绝所有来源。
#[derive(Debug, Default)]
pub struct IpWhitelist {
    allowed: RwLock<HashSet<String>>,
    enabled: bool,
}

impl IpWhitelist {
    pub fn new<I, S>(ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: HashSet<String> = ips.into_iter().map(Into::into).collect();
        Self {
            enabled: !allowed.is_empty(),
            allowed: RwLock::new(allowed),
        }
    }

    pub fn is_allowed(&self, ip: &str) -> bool {
        if !self.enabled {
            return true;
        }

        self.allowed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(ip)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_ip(&self, ip: impl Into<String>) {
        self.allowed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip.into());
    }

    pub fn remove_ip(&self, ip: &str) {
        self.allowed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ip);
    }

    pub fn len(&self) -> usize {
        self.allowed.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticator() {
        let auth = Authenticator::new("testuser", "testpass");
        assert!(auth.is_enabled());

        assert!(auth.authenticate("testuser", "testpass"));
        assert!(!auth.authenticate("wronguser", "testpass"));
        assert!(!auth.authenticate("testuser", "wrongpass"));
        assert!(!auth.authenticate("", ""));
    }

    #[test]
    fn test_authenticator_disabled() {
        let auth = Authenticator::disabled();
        assert!(!auth.is_enabled());
        assert!(auth.authenticate("anyone", "anything"));

        let from_config = Authenticator::from_config(&AuthConfig {
            enabled: false,
            username: "admin".into(),
            password: "secret".into(),
        });
        assert!(from_config.authenticate("x", "y"));
    }

    #[test]
    fn test_whitelist_membership() {
        let whitelist = IpWhitelist::new(["192.168.1.1", "192.168.1.2"]);

        assert!(whitelist.is_allowed("192.168.1.1"));
        assert!(whitelist.is_allowed("192.168.1.2"));
        assert!(!whitelist.is_allowed("10.0.0.1"));

        // 运行期添加
        whitelist.add_ip("10.0.0.1");
        assert!(whitelist.is_allowed("10.0.0.1"));

        // 运行期移除
        whitelist.remove_ip("192.168.1.1");
        assert!(!whitelist.is_allowed("192.168.1.1"));
        assert_eq!(whitelist.len(), 2);
    }

    #[test]
    fn test_empty_whitelist_allows_all() {
        let whitelist = IpWhitelist::new(Vec::<String>::new());

        assert!(whitelist.is_empty());
        assert!(whitelist.is_allowed("1.2.3.4"));
        assert!(whitelist.is_allowed("::1"));
        assert!(whitelist.is_allowed("not-even-an-ip"));
    }

    #[test]
    fn test_removing_last_ip_denies_all() {
        let whitelist = IpWhitelist::new(["10.0.0.1"]);
        assert!(whitelist.is_enabled());

        whitelist.remove_ip("10.0.0.1");
        assert!(whitelist.is_empty());
        assert!(!whitelist.is_allowed("10.0.0.1"));
        assert!(!whitelist.is_allowed("6.6.6.6"));

        whitelist.add_ip("6.6.6.6");
        assert!(whitelist.is_allowed("6.6.6.6"));
    }

    #[test]
    fn test_unconfigured_whitelist_stays_open_after_add() {
        let whitelist = IpWhitelist::new(Vec::<String>::new());
        assert!(!whitelist.is_enabled());

        whitelist.add_ip("10.0.0.1");
        assert!(whitelist.is_allowed("10.0.0.1"));
        assert!(whitelist.is_allowed("6.6.6.6"));
    }
}
