//! 任务运行器：把会话编排与设备连接、动作翻译、原语执行串成完整的步骤循环

pub mod reply;
pub mod task;

pub use reply::{ChannelReplySource, ReplyPolicy, ReplySource, StdinReplySource};
pub use task::{RunReport, RunRequest, RunStop, RunTarget, TaskRunner};
