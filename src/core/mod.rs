//! 核心层：错误分类与终止原因、有界重试、运行中会话的取消监管

pub mod error;
pub mod retry;
pub mod session_supervisor;

pub use error::{ErrorClass, PilotError, TerminalReason};
pub use retry::RetryPolicy;
pub use session_supervisor::SessionSupervisor;
