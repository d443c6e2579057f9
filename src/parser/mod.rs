//! 响应解析：按任务类型构建决策请求并把后端原始文本解析为 Decision

pub mod invoke;
pub mod tagged;

use std::sync::Arc;

use crate::action::Decision;
use crate::core::PilotError;
use crate::llm::ChatMessage;
use crate::session::{Observation, Step, TaskType};

pub use invoke::InvokeParser;
pub use tagged::TaggedParser;

/// 一种后端对话格式
pub trait ResponseParser: Send + Sync {
    /// 任务、全部历史步骤与当前观测 → 对话消息
    fn build_messages(&self, task: &str, history: &[Step], current: &Observation) -> Vec<ChatMessage>;

    /// 原始响应 → 决策；失败对会话是致命的
    fn parse(&self, response: &str) -> Result<Decision, PilotError>;
}

pub fn parser_for(task_type: TaskType) -> Arc<dyn ResponseParser> {
    match task_type {
        TaskType::Tagged => Arc::new(TaggedParser),
        TaskType::Invoke => Arc::new(InvokeParser),
    }
}
