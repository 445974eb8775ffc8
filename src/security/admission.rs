use std::sync::{Arc, Mutex, PoisonError};

/// 并发会话准入控制
///
/// 计数器只在一把锁下读写，满额时直接拒绝，不排队。
#[derive(Debug)]
pub struct ConnectionPool {
    max_connections: usize,
    active: Mutex<usize>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active: Mutex::new(0),
        }
    }

    /// 未满时占用一个名额并返回 true，满额时不做修改返回 false
    pub fn add_connection(&self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active >= self.max_connections {
            return false;
        }
        *active += 1;
        true
    }

    /// 释放一个名额，不会减到 0 以下
    pub fn remove_connection(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
    }

    pub fn active_count(&self) -> usize {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// 占用名额，返回的 [`ConnectionSlot`] 被 drop 时自动释放
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        if self.add_connection() {
            Some(ConnectionSlot {
                pool: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

/// 已占用的会话名额
#[derive(Debug)]
pub struct ConnectionSlot {
    pool: Arc<ConnectionPool>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.pool.remove_connection();
    }
}
