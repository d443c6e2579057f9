//! 会话编排：决策请求、步骤记录与终止
//!
//! 历史以存储为准：每一步都从存储重新加载会话，同一会话的步骤由会话级异步锁串行化，
//! 不同会话互不阻塞。后端超时 / 失败 / 解析失败都会先写入带错误的步骤，再写终止记录。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::timeout;

use super::store::SessionStore;
use super::types::{
    new_session_id, ModelConfig, Observation, Session, SessionHeader, SessionId, SessionRecord,
    Step, TaskType,
};
use crate::action::Decision;
use crate::core::{PilotError, TerminalReason};
use crate::llm::{ChatMessage, ChatRequest, LlmClient};
use crate::parser::parser_for;

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(60);

const AUTO_REPLY_PROMPT: &str = "你在代替用户回答手机操作助手的提问。结合任务和当前截图，\
用一句简短的话直接给出答案，不要解释，不要反问。";

/// automate_step 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Decided { decision: Decision, step_index: usize },
    /// 上一步为 INFO 且本次观测没有回复：不调用后端
    AwaitingReply { question: String },
}

pub struct SessionOrchestrator {
    store: Arc<dyn SessionStore>,
    llm: Arc<dyn LlmClient>,
    default_timeout: Duration,
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionOrchestrator {
    pub fn new(store: Arc<dyn SessionStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            store,
            llm,
            default_timeout: DEFAULT_BACKEND_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 全局后端超时（ModelConfig.timeout_ms 优先）
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(session_id.to_string()).or_default().clone()
    }

    /// 归还会话锁；没有其他持有者时从表中移除
    fn release_lock(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(session_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
        if idle {
            locks.remove(session_id);
        }
    }

    fn backend_timeout(&self, model_config: &ModelConfig) -> Duration {
        model_config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    /// 写入 Start 记录，不接触设备
    pub async fn create_session(
        &self,
        task: &str,
        task_type: TaskType,
        model_config: ModelConfig,
        extra_info: serde_json::Value,
    ) -> Result<SessionId, PilotError> {
        let header = SessionHeader {
            id: new_session_id(),
            task: task.to_string(),
            task_type,
            model_config,
            extra_info,
            created_at: Utc::now(),
        };
        let id = header.id.clone();
        self.store.create(header).await?;
        tracing::info!(session_id = %id, task_type = task_type.as_str(), "session created");
        Ok(id)
    }

    pub async fn load(&self, session_id: &str) -> Result<Session, PilotError> {
        self.store.load(session_id).await
    }

    /// 决策一步：加载历史 → 构建请求 → 带超时调用后端 → 解析 → 追加步骤
    pub async fn automate_step(
        &self,
        session_id: &str,
        observation: Observation,
    ) -> Result<StepOutcome, PilotError> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.decide_locked(session_id, observation).await
        };
        self.release_lock(session_id, lock);
        result
    }

    async fn decide_locked(
        &self,
        session_id: &str,
        observation: Observation,
    ) -> Result<StepOutcome, PilotError> {
        let session = self.store.load(session_id).await?;
        if let Some(t) = &session.terminal {
            return Err(PilotError::SessionTerminated {
                session_id: session_id.to_string(),
                reason: t.reason,
            });
        }
        if observation.reply.is_none() {
            if let Some(question) = session.pending_question() {
                tracing::debug!(session_id, "previous step asked a question, waiting for reply");
                return Ok(StepOutcome::AwaitingReply {
                    question: question.to_string(),
                });
            }
        }

        let header = &session.header;
        let index = session.next_index();
        let parser = parser_for(header.task_type);
        let request = ChatRequest {
            provider: header.model_config.model_provider.clone(),
            model: header.model_config.model_name.clone(),
            messages: parser.build_messages(&header.task, &session.steps, &observation),
            params: header.model_config.args.clone(),
        };
        let limit = self.backend_timeout(&header.model_config);

        let started = Instant::now();
        let reply = timeout(limit, self.llm.complete(&request)).await;
        let decision_ms = started.elapsed().as_millis() as u64;

        let raw = match reply {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                let err = PilotError::Backend(e);
                self.fail_step(session_id, index, observation, String::new(), decision_ms, &err)
                    .await?;
                return Err(err);
            }
            Err(_) => {
                let err = PilotError::BackendTimeout(limit.as_millis() as u64);
                self.fail_step(session_id, index, observation, String::new(), decision_ms, &err)
                    .await?;
                return Err(err);
            }
        };

        let decision = match parser.parse(&raw).and_then(|d| d.action.validate().map(|_| d)) {
            Ok(d) => d,
            Err(err) => {
                self.fail_step(session_id, index, observation, raw, decision_ms, &err)
                    .await?;
                return Err(err);
            }
        };

        tracing::info!(
            session_id,
            step = index,
            action = decision.action.kind(),
            decision_ms,
            "decided"
        );
        self.store
            .append_step(
                session_id,
                Step {
                    index,
                    environment: observation,
                    decision: Some(decision.clone()),
                    raw_response: raw,
                    decision_ms,
                    error: None,
                    execution_error: None,
                    at: Utc::now(),
                },
            )
            .await?;

        if let Some(reason) = decision.action.terminal_reason() {
            let detail = match &decision.action {
                crate::action::Action::Abort { reason } => Some(reason.clone()),
                _ => (!decision.summary.is_empty()).then(|| decision.summary.clone()),
            };
            self.store.terminate(session_id, reason, detail).await?;
            tracing::info!(session_id, reason = %reason, "session terminated by decision");
        }

        Ok(StepOutcome::Decided {
            decision,
            step_index: index,
        })
    }

    /// 决策失败：写入带错误、无动作的步骤，并以对应原因终止
    async fn fail_step(
        &self,
        session_id: &str,
        index: usize,
        observation: Observation,
        raw_response: String,
        decision_ms: u64,
        err: &PilotError,
    ) -> Result<(), PilotError> {
        tracing::warn!(session_id, step = index, error = %err, "decision failed");
        self.store
            .append_step(
                session_id,
                Step {
                    index,
                    environment: observation,
                    decision: None,
                    raw_response,
                    decision_ms,
                    error: Some(err.to_string()),
                    execution_error: None,
                    at: Utc::now(),
                },
            )
            .await?;
        let reason = err.terminal_reason().unwrap_or(TerminalReason::ParseError);
        self.store
            .terminate(session_id, reason, Some(err.to_string()))
            .await
    }

    /// 记录某步的执行结果（耗时与可选错误）
    pub async fn record_execution(
        &self,
        session_id: &str,
        index: usize,
        execution_ms: u64,
        error: Option<String>,
    ) -> Result<(), PilotError> {
        self.store
            .append(
                session_id,
                SessionRecord::Executed {
                    index,
                    execution_ms,
                    error,
                },
            )
            .await
    }

    /// 写入终止记录；已终止时不再写入，返回 false
    pub async fn terminate(
        &self,
        session_id: &str,
        reason: TerminalReason,
        detail: Option<String>,
    ) -> Result<bool, PilotError> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.terminate_locked(session_id, reason, detail).await
        };
        self.release_lock(session_id, lock);
        result
    }

    async fn terminate_locked(
        &self,
        session_id: &str,
        reason: TerminalReason,
        detail: Option<String>,
    ) -> Result<bool, PilotError> {
        let session = self.store.load(session_id).await?;
        if session.terminal.is_some() {
            return Ok(false);
        }
        self.store.terminate(session_id, reason, detail).await?;
        tracing::info!(session_id, reason = %reason, "session terminated");
        Ok(true)
    }

    /// 用一次较小的后端请求代替用户回答 INFO 提问
    pub async fn auto_reply(
        &self,
        session_id: &str,
        question: &str,
        image: &str,
    ) -> Result<String, PilotError> {
        let session = self.store.load(session_id).await?;
        let header = &session.header;
        let request = ChatRequest {
            provider: header.model_config.model_provider.clone(),
            model: header.model_config.model_name.clone(),
            messages: vec![
                ChatMessage::system(AUTO_REPLY_PROMPT),
                ChatMessage::user(format!("任务：{}\n提问：{}", header.task, question))
                    .with_image(image),
            ],
            params: header.model_config.args.clone(),
        };
        let limit = self.backend_timeout(&header.model_config);
        let reply = match timeout(limit, self.llm.complete(&request)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(PilotError::Backend(e)),
            Err(_) => return Err(PilotError::BackendTimeout(limit.as_millis() as u64)),
        };
        let reply = reply.trim().to_string();
        tracing::info!(session_id, question, reply = %reply, "auto reply");
        Ok(reply)
    }
}
