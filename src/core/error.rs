//! 错误类型与会话终止原因
//!
//! PilotError 按连接 / 协议决策 / 解析 / 控制四类划分；
//! 编排层通过 terminal_reason() 将错误映射为 TerminalReason，保证会话总以可检查的终止记录结束。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum PilotError {
    #[error("Device {device_id} unreachable: {reason}")]
    DeviceUnreachable { device_id: String, reason: String },

    #[error("Device execution failed: {0}")]
    DeviceExecution(String),

    #[error("Unsupported action type: {0}")]
    UnsupportedActionType(String),

    /// 动作缺少必填字段或字段非法（执行前拒绝）
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Backend timeout after {0}ms")]
    BackendTimeout(u64),

    #[error("Max steps reached ({0})")]
    MaxStepsReached(usize),

    /// 后端调用失败（网络 / 鉴权等，重试后仍失败）
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {session_id} already terminated: {reason}")]
    SessionTerminated {
        session_id: String,
        reason: TerminalReason,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 错误分类（决定由谁重试、是否终止会话）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 瞬时故障，由持有资源的组件在本地有限重试
    Connectivity,
    /// 协议 / 决策不匹配，对会话致命，不重试
    Protocol,
    /// 应用解析失败，上报但会话继续
    Resolution,
    /// 预期内的终止结果
    Control,
    /// 存储、配置、会话查找等
    Internal,
}

impl PilotError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PilotError::DeviceUnreachable { .. } | PilotError::DeviceExecution(_) => {
                ErrorClass::Connectivity
            }
            PilotError::UnsupportedActionType(_)
            | PilotError::InvalidAction(_)
            | PilotError::Parse(_) => ErrorClass::Protocol,
            PilotError::AppNotFound(_) => ErrorClass::Resolution,
            PilotError::Cancelled
            | PilotError::BackendTimeout(_)
            | PilotError::MaxStepsReached(_)
            | PilotError::Backend(_) => ErrorClass::Control,
            PilotError::SessionNotFound(_)
            | PilotError::SessionTerminated { .. }
            | PilotError::Store(_)
            | PilotError::Config(_) => ErrorClass::Internal,
        }
    }

    /// 该错误使会话终止时对应的原因；None 表示不终止会话（如 AppNotFound）或无法记录
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        match self {
            PilotError::DeviceUnreachable { .. } => Some(TerminalReason::DeviceUnreachable),
            PilotError::DeviceExecution(_) => Some(TerminalReason::DeviceExecutionError),
            PilotError::UnsupportedActionType(_)
            | PilotError::InvalidAction(_)
            | PilotError::Parse(_) => Some(TerminalReason::ParseError),
            PilotError::Cancelled => Some(TerminalReason::Cancelled),
            PilotError::BackendTimeout(_) => Some(TerminalReason::BackendTimeout),
            PilotError::MaxStepsReached(_) => Some(TerminalReason::MaxStepsReached),
            PilotError::Backend(_) => Some(TerminalReason::BackendError),
            PilotError::SessionTerminated { reason, .. } => Some(*reason),
            PilotError::AppNotFound(_)
            | PilotError::SessionNotFound(_)
            | PilotError::Store(_)
            | PilotError::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for PilotError {
    fn from(e: std::io::Error) -> Self {
        PilotError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(e: serde_json::Error) -> Self {
        PilotError::Store(format!("serde: {e}"))
    }
}

/// 会话终止原因（对外暴露的字符串见 as_str）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalReason {
    Complete,
    Abort,
    MaxStepsReached,
    Cancelled,
    BackendTimeout,
    BackendError,
    ParseError,
    DeviceExecutionError,
    DeviceUnreachable,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Complete => "COMPLETE",
            TerminalReason::Abort => "ABORT",
            TerminalReason::MaxStepsReached => "MAX_STEPS_REACHED",
            TerminalReason::Cancelled => "CANCELLED",
            TerminalReason::BackendTimeout => "BACKEND_TIMEOUT",
            TerminalReason::BackendError => "BACKEND_ERROR",
            TerminalReason::ParseError => "PARSE_ERROR",
            TerminalReason::DeviceExecutionError => "DEVICE_EXECUTION_ERROR",
            TerminalReason::DeviceUnreachable => "DEVICE_UNREACHABLE",
        }
    }

    /// Complete / Abort / MaxSteps / Cancelled 属于正常结束，其余为故障
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            TerminalReason::Complete
                | TerminalReason::Abort
                | TerminalReason::MaxStepsReached
                | TerminalReason::Cancelled
        )
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_end_in_parse_error() {
        for err in [
            PilotError::Parse("garbage".into()),
            PilotError::UnsupportedActionType("DANCE".into()),
            PilotError::InvalidAction("CLICK missing point".into()),
        ] {
            assert_eq!(err.class(), ErrorClass::Protocol);
            assert_eq!(err.terminal_reason(), Some(TerminalReason::ParseError));
        }
    }

    #[test]
    fn test_app_not_found_does_not_terminate() {
        let err = PilotError::AppNotFound("Foo".into());
        assert_eq!(err.class(), ErrorClass::Resolution);
        assert!(err.terminal_reason().is_none());
    }

    #[test]
    fn test_terminal_reason_wire_format() {
        let json = serde_json::to_string(&TerminalReason::MaxStepsReached).unwrap();
        assert_eq!(json, "\"MAX_STEPS_REACHED\"");
        let back: TerminalReason = serde_json::from_str("\"DEVICE_UNREACHABLE\"").unwrap();
        assert_eq!(back, TerminalReason::DeviceUnreachable);
        assert_eq!(TerminalReason::Complete.to_string(), "COMPLETE");
    }

    #[test]
    fn test_failure_classification() {
        assert!(!TerminalReason::Complete.is_failure());
        assert!(!TerminalReason::Cancelled.is_failure());
        assert!(TerminalReason::BackendTimeout.is_failure());
        assert!(TerminalReason::DeviceExecutionError.is_failure());
    }
}
