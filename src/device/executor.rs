//! 原语执行器
//!
//! 每个原语调用在超时内执行，失败按 [retry.execution] 有界重试，耗尽后转为 DeviceExecution；
//! Sleep 原语可被取消。截图按 [retry.screenshot] 重试，拿不到帧同样视为一次失败。

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::channel::{DeviceChannel, Frame};
use crate::action::PrimitiveCall;
use crate::core::{PilotError, RetryPolicy};

pub struct ActionExecutor {
    execution_retry: RetryPolicy,
    screenshot_retry: RetryPolicy,
    call_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(execution_retry: RetryPolicy, screenshot_retry: RetryPolicy) -> Self {
        Self {
            execution_retry,
            screenshot_retry,
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// 依次执行原语；任一原语重试耗尽即停止并返回 DeviceExecution
    pub async fn execute(
        &self,
        channel: &dyn DeviceChannel,
        calls: &[PrimitiveCall],
        cancel: &CancellationToken,
    ) -> Result<(), PilotError> {
        for call in calls {
            if let PrimitiveCall::Sleep { ms } = call {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(*ms)) => {}
                }
                continue;
            }
            tracing::debug!(primitive = call.name(), "dispatch");
            // 取消同时打断进行中的调用与重试退避
            let attempt = self
                .execution_retry
                .run(call.name(), || self.dispatch_once(channel, call));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                result = attempt => {
                    result.map_err(|e| PilotError::DeviceExecution(format!("{}: {}", call.name(), e)))?
                }
            }
        }
        Ok(())
    }

    async fn dispatch_once(&self, channel: &dyn DeviceChannel, call: &PrimitiveCall) -> Result<(), String> {
        let fut = async {
            match call {
                PrimitiveCall::Tap { point } => channel.tap(*point).await,
                PrimitiveCall::Swipe {
                    from,
                    to,
                    duration_ms,
                } => channel.swipe(*from, *to, *duration_ms).await,
                PrimitiveCall::LongPress { point, duration_ms } => {
                    channel.long_press(*point, *duration_ms).await
                }
                PrimitiveCall::InjectText { text } => channel.inject_text(text).await,
                PrimitiveCall::PressKey { keycode } => channel.press_key(*keycode).await,
                PrimitiveCall::StartApp { package } => channel.start_app(package).await,
                PrimitiveCall::StopApp { package } => channel.stop_app(package).await,
                PrimitiveCall::Sleep { .. } => Ok(()),
            }
        };
        match timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {}ms", self.call_timeout.as_millis())),
        }
    }

    /// 截图，拿不到帧时重试
    pub async fn capture(&self, channel: &dyn DeviceChannel) -> Result<Frame, PilotError> {
        self.screenshot_retry
            .run("screenshot", || async {
                match timeout(self.call_timeout, channel.screenshot()).await {
                    Ok(Ok(Some(frame))) => Ok(frame),
                    Ok(Ok(None)) => Err("no frame available".to_string()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err("screenshot timed out".to_string()),
                }
            })
            .await
            .map_err(|e| PilotError::DeviceExecution(format!("screenshot: {e}")))
    }
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new(
            RetryPolicy::new(3, Duration::from_millis(500)),
            RetryPolicy::new(10, Duration::from_millis(500)),
        )
    }
}
