//! 可观测性：tracing 订阅器与步骤审计
//!
//! 默认过滤级别 info，可被 RUST_LOG 覆盖；RUST_LOG 非法时回退为 info 而不是 panic。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（测试或嵌入场景）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// 单步执行的审计记录（一行 JSON，对应每个已执行的步骤）
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepAudit<'a> {
    pub session_id: &'a str,
    pub device_id: &'a str,
    pub step: usize,
    pub action: &'a str,
    pub primitives: usize,
    pub decision_ms: u64,
    pub execution_ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

impl StepAudit<'_> {
    pub fn emit(&self) {
        let line = serde_json::to_string(self).unwrap_or_default();
        if self.ok {
            tracing::info!(event = "step_audit", audit = %line, "step");
        } else {
            tracing::warn!(event = "step_audit", audit = %line, "step");
        }
    }
}
