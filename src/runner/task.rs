//! 设备步骤循环
//!
//! 截图 -> 附加回复 -> 决策 -> 翻译 -> 执行 -> 记录 -> 判断终止 -> 等待界面稳定 -> 下一步。
//! 取消在每个检查点生效（决策前后、截图、执行中的 Sleep、稳定等待、manual_reply 等待）；
//! 任何使会话结束的错误都会写成终止记录，调用方总能拿到可检查的终止原因。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::reply::ReplyPolicy;
use crate::action::ActionTranslator;
use crate::core::{PilotError, TerminalReason};
use crate::device::{ActionExecutor, ConnectionManager, DisplayMode};
use crate::observability::StepAudit;
use crate::session::{
    ModelConfig, Observation, SessionEvent, SessionId, SessionOrchestrator, StepOutcome, TaskType,
};

const EVENT_CAPACITY: usize = 256;

/// 新建任务或恢复已有会话
#[derive(Debug, Clone)]
pub enum RunTarget {
    New {
        task: String,
        task_type: TaskType,
        model_config: ModelConfig,
        extra_info: serde_json::Value,
    },
    Resume {
        session_id: SessionId,
        reply: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub device_id: String,
    pub target: RunTarget,
    pub reply_policy: ReplyPolicy,
    /// 覆盖运行器的默认步数上限
    pub max_steps: Option<usize>,
}

impl RunRequest {
    pub fn new_task(
        device_id: impl Into<String>,
        task: impl Into<String>,
        task_type: TaskType,
        model_config: ModelConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            target: RunTarget::New {
                task: task.into(),
                task_type,
                model_config,
                extra_info: serde_json::Value::Null,
            },
            reply_policy: ReplyPolicy::PassToClient,
            max_steps: None,
        }
    }

    pub fn resume(
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        reply: Option<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            target: RunTarget::Resume {
                session_id: session_id.into(),
                reply,
            },
            reply_policy: ReplyPolicy::PassToClient,
            max_steps: None,
        }
    }

    pub fn with_reply_policy(mut self, policy: ReplyPolicy) -> Self {
        self.reply_policy = policy;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_extra_info(mut self, info: serde_json::Value) -> Self {
        if let RunTarget::New { extra_info, .. } = &mut self.target {
            *extra_info = info;
        }
        self
    }
}

/// 循环停止的原因
#[derive(Debug, Clone, PartialEq)]
pub enum RunStop {
    Terminated(TerminalReason),
    /// pass_to_client：会话未结束，等待带回复恢复
    AwaitingReply { question: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub session_id: SessionId,
    pub stop: RunStop,
    /// 会话累计步数
    pub steps: usize,
}

pub struct TaskRunner {
    orchestrator: Arc<SessionOrchestrator>,
    connections: Arc<ConnectionManager>,
    translator: Arc<ActionTranslator>,
    executor: Arc<ActionExecutor>,
    display_mode: DisplayMode,
    max_steps: usize,
    settle_delay: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl TaskRunner {
    pub fn new(
        orchestrator: Arc<SessionOrchestrator>,
        connections: Arc<ConnectionManager>,
        translator: Arc<ActionTranslator>,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            orchestrator,
            connections,
            translator,
            executor,
            display_mode: DisplayMode::Headless,
            max_steps: 40,
            settle_delay: Duration::from_secs(2),
            events,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_display_mode(mut self, display_mode: DisplayMode) -> Self {
        self.display_mode = display_mode;
        self
    }

    /// 订阅过程事件（实时预览等）
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// 运行直到会话终止或在 pass_to_client 下等待回复
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> Result<RunReport, PilotError> {
        let RunRequest {
            device_id,
            target,
            reply_policy,
            max_steps,
        } = request;
        let (session_id, reply) = match target {
            RunTarget::New {
                task,
                task_type,
                model_config,
                extra_info,
            } => {
                let id = self
                    .orchestrator
                    .create_session(&task, task_type, model_config, extra_info)
                    .await?;
                (id, None)
            }
            RunTarget::Resume { session_id, reply } => {
                let session = self.orchestrator.load(&session_id).await?;
                if let Some(t) = session.terminal {
                    return Err(PilotError::SessionTerminated {
                        session_id,
                        reason: t.reason,
                    });
                }
                (session_id, reply)
            }
        };
        let max_steps = max_steps.unwrap_or(self.max_steps);
        tracing::info!(
            session_id = %session_id,
            device_id = %device_id,
            max_steps,
            reply_policy = reply_policy.name(),
            "run started"
        );

        let stop = match self
            .drive(&session_id, &device_id, &reply_policy, reply, max_steps, &cancel)
            .await
        {
            Ok(stop) => stop,
            Err(err) => {
                let Some(reason) = err.terminal_reason() else {
                    return Err(err);
                };
                tracing::warn!(session_id = %session_id, reason = %reason, error = %err, "run stopped");
                self.orchestrator
                    .terminate(&session_id, reason, Some(err.to_string()))
                    .await?;
                self.emit(SessionEvent::Terminated {
                    session_id: session_id.clone(),
                    reason,
                    detail: Some(err.to_string()),
                });
                RunStop::Terminated(reason)
            }
        };

        let steps = self.orchestrator.load(&session_id).await?.steps.len();
        tracing::info!(session_id = %session_id, steps, stop = ?stop, "run finished");
        Ok(RunReport {
            session_id,
            stop,
            steps,
        })
    }

    async fn drive(
        &self,
        session_id: &str,
        device_id: &str,
        policy: &ReplyPolicy,
        mut pending_reply: Option<String>,
        max_steps: usize,
        cancel: &CancellationToken,
    ) -> Result<RunStop, PilotError> {
        let store = self.orchestrator.store().clone();
        loop {
            if cancel.is_cancelled() {
                return Err(PilotError::Cancelled);
            }
            let session = self.orchestrator.load(session_id).await?;
            if let Some(t) = &session.terminal {
                return Ok(RunStop::Terminated(t.reason));
            }
            let index = session.next_index();
            if index >= max_steps {
                return Err(PilotError::MaxStepsReached(max_steps));
            }
            self.emit(SessionEvent::StepStarted {
                session_id: session_id.to_string(),
                step: index,
                max_steps,
            });

            let channel = self.connections.acquire(device_id, self.display_mode).await?;
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                frame = self.executor.capture(channel.as_ref()) => frame?,
            };
            let image = store.save_frame(session_id, index, &frame).await?;
            self.emit(SessionEvent::ScreenshotCaptured {
                session_id: session_id.to_string(),
                step: index,
                image: image.clone(),
            });

            let mut observation = Observation::new(image.clone());
            if let Some(question) = session.pending_question() {
                let reply = match pending_reply.take() {
                    Some(reply) => reply,
                    None => match policy {
                        ReplyPolicy::PassToClient => {
                            self.emit(SessionEvent::AwaitingReply {
                                session_id: session_id.to_string(),
                                question: question.to_string(),
                            });
                            return Ok(RunStop::AwaitingReply {
                                question: question.to_string(),
                            });
                        }
                        ReplyPolicy::AutoReply => {
                            self.orchestrator
                                .auto_reply(session_id, question, &image)
                                .await?
                        }
                        ReplyPolicy::ManualReply(source) => {
                            self.emit(SessionEvent::AwaitingReply {
                                session_id: session_id.to_string(),
                                question: question.to_string(),
                            });
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                                reply = source.reply(session_id, question) => reply.map_err(|e| {
                                    tracing::warn!(session_id, error = %e, "reply source failed");
                                    PilotError::Cancelled
                                })?,
                            }
                        }
                    },
                };
                observation = observation.with_reply(reply);
            } else if let Some(reply) = pending_reply.take() {
                observation = observation.with_reply(reply);
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                outcome = self.orchestrator.automate_step(session_id, observation) => outcome?,
            };
            let decision_ms = started.elapsed().as_millis() as u64;
            let (decision, step_index) = match outcome {
                StepOutcome::Decided {
                    decision,
                    step_index,
                } => (decision, step_index),
                StepOutcome::AwaitingReply { question } => {
                    return Ok(RunStop::AwaitingReply { question });
                }
            };
            self.emit(SessionEvent::Decided {
                session_id: session_id.to_string(),
                step: step_index,
                action: serde_json::to_value(&decision.action).unwrap_or_default(),
                explain: decision.explain.clone(),
                decision_ms,
            });

            if let Some(reason) = decision.action.terminal_reason() {
                self.emit(SessionEvent::Terminated {
                    session_id: session_id.to_string(),
                    reason,
                    detail: (!decision.summary.is_empty()).then(|| decision.summary.clone()),
                });
                return Ok(RunStop::Terminated(reason));
            }
            if cancel.is_cancelled() {
                return Err(PilotError::Cancelled);
            }

            let size = channel
                .size()
                .await
                .map_err(|e| PilotError::DeviceExecution(format!("size: {e}")))?;
            let orientation = channel.orientation().await.unwrap_or_default();
            let primitives = match self.translator.to_primitives(&decision.action, size, orientation) {
                Ok(primitives) => primitives,
                Err(err @ PilotError::AppNotFound(_)) => {
                    tracing::warn!(session_id, step = step_index, error = %err, "app not found, continuing");
                    self.finish_step(
                        session_id,
                        device_id,
                        step_index,
                        decision.action.kind(),
                        0,
                        decision_ms,
                        0,
                        Some(err.to_string()),
                    )
                    .await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let started = Instant::now();
            let result = self.executor.execute(channel.as_ref(), &primitives, cancel).await;
            let execution_ms = started.elapsed().as_millis() as u64;
            self.finish_step(
                session_id,
                device_id,
                step_index,
                decision.action.kind(),
                primitives.len(),
                decision_ms,
                execution_ms,
                result.as_ref().err().map(ToString::to_string),
            )
            .await?;
            if let Err(err) = result {
                if matches!(err, PilotError::DeviceExecution(_)) {
                    self.connections.health_check(device_id).await;
                }
                return Err(err);
            }

            if !primitives.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PilotError::Cancelled),
                    _ = tokio::time::sleep(self.settle_delay) => {}
                }
            }
        }
    }

    /// 写入 Executed 记录、广播事件、输出审计行
    #[allow(clippy::too_many_arguments)]
    async fn finish_step(
        &self,
        session_id: &str,
        device_id: &str,
        step: usize,
        action: &str,
        primitives: usize,
        decision_ms: u64,
        execution_ms: u64,
        error: Option<String>,
    ) -> Result<(), PilotError> {
        self.orchestrator
            .record_execution(session_id, step, execution_ms, error.clone())
            .await?;
        StepAudit {
            session_id,
            device_id,
            step,
            action,
            primitives,
            decision_ms,
            execution_ms,
            ok: error.is_none(),
            error: error.as_deref(),
        }
        .emit();
        self.emit(SessionEvent::Executed {
            session_id: session_id.to_string(),
            step,
            execution_ms,
            error,
        });
        Ok(())
    }
}
