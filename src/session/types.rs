//! 会话数据模型
//!
//! 会话以追加写的记录流持久化（Start / Step / Executed / Terminated），
//! Session::from_records 按顺序折叠得到当前视图；Step 一旦写入不再修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{Action, Decision};
use crate::core::{PilotError, TerminalReason};
use crate::llm::SamplingParams;

pub type SessionId = String;

pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

/// 任务类型，决定使用哪种响应解析器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// <STATUS>/<ACTION>/<PAYLOAD> 标签格式
    #[default]
    Tagged,
    /// <thinking>/<invoke> JSON 格式
    Invoke,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Tagged => "tagged",
            TaskType::Invoke => "invoke",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PilotError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tagged" => Ok(TaskType::Tagged),
            "invoke" => Ok(TaskType::Invoke),
            other => Err(PilotError::Config(format!("unknown task type '{other}'"))),
        }
    }
}

/// 后端模型配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    /// 为空时使用默认 provider
    #[serde(default)]
    pub model_provider: String,
    #[serde(default)]
    pub args: SamplingParams,
    /// 单次决策超时（毫秒），覆盖全局默认
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ModelConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            model_provider: String::new(),
            args: SamplingParams::default(),
            timeout_ms: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.model_provider = provider.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// 一次观测：当前截图引用及（对上一步 INFO 的）用户回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// data URL、http URL 或本地文件路径
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl Observation {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub environment: Observation,
    /// 解析失败或后端超时时为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub raw_response: String,
    pub decision_ms: u64,
    /// 决策阶段的错误（超时、解析失败）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 执行阶段的错误（由 Executed 记录折叠进来）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    pub at: DateTime<Utc>,
}

impl Step {
    pub fn action(&self) -> Option<&Action> {
        self.decision.as_ref().map(|d| &d.action)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: SessionId,
    pub task: String,
    pub task_type: TaskType,
    pub model_config: ModelConfig,
    #[serde(default)]
    pub extra_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terminal {
    pub reason: TerminalReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// 持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SessionRecord {
    Start(SessionHeader),
    Step(Step),
    Executed {
        index: usize,
        execution_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Terminated(Terminal),
}

/// 会话状态
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    Running,
    /// 上一步为 INFO，等待用户回复
    AwaitingReply { question: String },
    Terminated(TerminalReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub header: SessionHeader,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<Terminal>,
}

impl Session {
    pub fn new(header: SessionHeader) -> Self {
        Self {
            header,
            steps: Vec::new(),
            terminal: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    /// 按记录顺序折叠；首条必须是 Start，Terminated 之后的记录忽略
    pub fn from_records(records: Vec<SessionRecord>) -> Result<Self, PilotError> {
        let mut iter = records.into_iter();
        let mut session = match iter.next() {
            Some(SessionRecord::Start(header)) => Session::new(header),
            Some(_) => return Err(PilotError::Store("first record is not a start record".into())),
            None => return Err(PilotError::Store("empty session log".into())),
        };
        for record in iter {
            if session.terminal.is_some() {
                break;
            }
            session.apply(record);
        }
        Ok(session)
    }

    pub fn apply(&mut self, record: SessionRecord) {
        match record {
            SessionRecord::Start(_) => {}
            SessionRecord::Step(step) => self.steps.push(step),
            SessionRecord::Executed { index, error, .. } => {
                if let Some(step) = self.steps.iter_mut().find(|s| s.index == index) {
                    step.execution_error = error;
                }
            }
            SessionRecord::Terminated(t) => self.terminal = Some(t),
        }
    }

    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// 上一步为 INFO 时的提问
    pub fn pending_question(&self) -> Option<&str> {
        match self.last_step().and_then(Step::action) {
            Some(Action::Info { question }) => Some(question.as_str()),
            _ => None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if let Some(t) = &self.terminal {
            return SessionPhase::Terminated(t.reason);
        }
        match self.pending_question() {
            Some(q) => SessionPhase::AwaitingReply {
                question: q.to_string(),
            },
            None => SessionPhase::Running,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.header.id.clone(),
            task: self.header.task.clone(),
            steps: self.steps.len(),
            terminal: self.terminal.as_ref().map(|t| t.reason),
            created_at: self.header.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub task: String,
    pub steps: usize,
    pub terminal: Option<TerminalReason>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> SessionHeader {
        SessionHeader {
            id: "s1".into(),
            task: "打开微信".into(),
            task_type: TaskType::Tagged,
            model_config: ModelConfig::new("m"),
            extra_info: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    fn step(index: usize, action: Action) -> Step {
        Step {
            index,
            environment: Observation::new("img"),
            decision: Some(Decision::new(action)),
            raw_response: String::new(),
            decision_ms: 1,
            error: None,
            execution_error: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_fold_records() {
        let records = vec![
            SessionRecord::Start(header()),
            SessionRecord::Step(step(0, Action::Info { question: "哪个联系人？".into() })),
            SessionRecord::Executed {
                index: 0,
                execution_ms: 0,
                error: Some("boom".into()),
            },
        ];
        let session = Session::from_records(records).unwrap();
        assert_eq!(session.steps.len(), 1);
        assert_eq!(session.steps[0].execution_error.as_deref(), Some("boom"));
        assert_eq!(
            session.phase(),
            SessionPhase::AwaitingReply {
                question: "哪个联系人？".into()
            }
        );
    }

    #[test]
    fn test_records_after_terminal_ignored() {
        let records = vec![
            SessionRecord::Start(header()),
            SessionRecord::Terminated(Terminal {
                reason: TerminalReason::Cancelled,
                detail: None,
                at: Utc::now(),
            }),
            SessionRecord::Step(step(0, Action::Complete)),
        ];
        let session = Session::from_records(records).unwrap();
        assert!(session.steps.is_empty());
        assert_eq!(session.phase(), SessionPhase::Terminated(TerminalReason::Cancelled));
    }

    #[test]
    fn test_missing_start_rejected() {
        assert!(Session::from_records(vec![]).is_err());
        assert!(Session::from_records(vec![SessionRecord::Step(step(0, Action::Complete))]).is_err());
    }

    #[test]
    fn test_task_type_parse() {
        assert_eq!(TaskType::parse("Invoke").unwrap(), TaskType::Invoke);
        assert!(TaskType::parse("xml").is_err());
    }
}
