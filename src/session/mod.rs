//! 会话层：数据模型、追加写存储、过程事件与决策编排

pub mod events;
pub mod orchestrator;
pub mod store;
pub mod types;

pub use events::SessionEvent;
pub use orchestrator::{SessionOrchestrator, StepOutcome};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use types::{
    new_session_id, ModelConfig, Observation, Session, SessionHeader, SessionId, SessionPhase,
    SessionRecord, SessionSummary, Step, TaskType, Terminal,
};
