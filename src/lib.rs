//! PhonePilot - 手机 GUI Agent 会话编排引擎
//!
//! 模块划分：
//! - **action**: 坐标模型、规范动作、后端词表归一化、动作 → 设备原语翻译
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与终止原因、有界重试、会话取消监管
//! - **device**: 设备通道抽象、连接管理、原语执行、adb 适配
//! - **llm**: 决策后端客户端（OpenAI 兼容 / Provider 路由 / 脚本化 Mock）
//! - **observability**: tracing 初始化与步骤审计
//! - **parser**: 按任务类型构建决策请求并解析后端响应
//! - **runner**: 设备步骤循环与 INFO 回复策略
//! - **session**: 会话模型、追加写存储、决策编排与过程事件

pub mod action;
pub mod config;
pub mod core;
pub mod device;
pub mod llm;
pub mod observability;
pub mod parser;
pub mod runner;
pub mod session;

pub use crate::core::{PilotError, TerminalReason};
pub use runner::{RunReport, RunRequest, RunStop, TaskRunner};
pub use session::{SessionOrchestrator, StepOutcome};
