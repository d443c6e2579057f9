//! 会话监管：运行中会话的取消令牌
//!
//! 根 token 对应整个进程（Ctrl+C 时 cancel_all），每个运行中的会话持有一个子 token，可单独取消。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 运行中会话的取消令牌登记表
#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// 登记会话并返回其子 token；同一会话重复登记时返回已有 token
    pub fn begin(&self, session_id: &str) -> CancellationToken {
        let mut running = match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        running
            .entry(session_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 会话结束后移除登记
    pub fn finish(&self, session_id: &str) {
        let mut running = match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        running.remove(session_id);
    }

    /// 取消单个会话；会话未在运行时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        let running = match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match running.get(session_id) {
            Some(token) => {
                tracing::info!(session_id = %session_id, "cancel requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部会话（用户 Ctrl+C）
    pub fn cancel_all(&self) {
        tracing::info!("cancelling all running sessions");
        self.root.cancel();
    }

    pub fn running(&self) -> Vec<String> {
        let running = match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ids: Vec<String> = running.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
