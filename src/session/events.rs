//! 会话过程事件：用于实时预览等外部订阅者（广播，无订阅者时丢弃）

use serde::Serialize;

use crate::core::TerminalReason;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 开始第几步（会话内步数，从 0 开始）
    StepStarted {
        session_id: String,
        step: usize,
        max_steps: usize,
    },
    /// 截图已保存
    ScreenshotCaptured {
        session_id: String,
        step: usize,
        image: String,
    },
    /// 后端给出决策
    Decided {
        session_id: String,
        step: usize,
        action: serde_json::Value,
        explain: String,
        decision_ms: u64,
    },
    /// 原语执行完成
    Executed {
        session_id: String,
        step: usize,
        execution_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// INFO 提问，等待回复
    AwaitingReply { session_id: String, question: String },
    Terminated {
        session_id: String,
        reason: TerminalReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::StepStarted { session_id, .. }
            | SessionEvent::ScreenshotCaptured { session_id, .. }
            | SessionEvent::Decided { session_id, .. }
            | SessionEvent::Executed { session_id, .. }
            | SessionEvent::AwaitingReply { session_id, .. }
            | SessionEvent::Terminated { session_id, .. } => session_id,
        }
    }
}
