//! 会话存储抽象层
//!
//! 会话以追加写记录流保存：内存实现用于测试与嵌入，文件实现为每个会话一个 JSONL 日志，
//! 截图落到 image_dir/<session>/step_<n>.png。进程崩溃后从最后一条完整记录恢复。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;

use super::types::{Session, SessionHeader, SessionRecord, SessionSummary, Step, Terminal};
use crate::core::{PilotError, TerminalReason};
use crate::device::Frame;
use crate::llm::openai::data_url;

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 写入 Start 记录；id 已存在时报错
    async fn create(&self, header: SessionHeader) -> Result<(), PilotError>;

    /// 追加一条记录
    async fn append(&self, session_id: &str, record: SessionRecord) -> Result<(), PilotError>;

    /// 读出全部记录并折叠
    async fn load(&self, session_id: &str) -> Result<Session, PilotError>;

    /// 保存截图，返回可放入 Observation 的图片引用
    async fn save_frame(&self, session_id: &str, index: usize, frame: &Frame) -> Result<String, PilotError>;

    async fn list(&self) -> Result<Vec<SessionSummary>, PilotError>;

    async fn append_step(&self, session_id: &str, step: Step) -> Result<(), PilotError> {
        self.append(session_id, SessionRecord::Step(step)).await
    }

    async fn terminate(
        &self,
        session_id: &str,
        reason: TerminalReason,
        detail: Option<String>,
    ) -> Result<(), PilotError> {
        self.append(
            session_id,
            SessionRecord::Terminated(Terminal {
                reason,
                detail,
                at: Utc::now(),
            }),
        )
        .await
    }
}

/// 内存会话存储，截图编码为 data URL
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<SessionRecord>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self, session_id: &str) -> Vec<SessionRecord> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, header: SessionHeader) -> Result<(), PilotError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&header.id) {
            return Err(PilotError::Store(format!("session {} already exists", header.id)));
        }
        sessions.insert(header.id.clone(), vec![SessionRecord::Start(header)]);
        Ok(())
    }

    async fn append(&self, session_id: &str, record: SessionRecord) -> Result<(), PilotError> {
        self.sessions
            .write()
            .await
            .get_mut(session_id)
            .ok_or_else(|| PilotError::SessionNotFound(session_id.to_string()))?
            .push(record);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Session, PilotError> {
        let records = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| PilotError::SessionNotFound(session_id.to_string()))?;
        Session::from_records(records)
    }

    async fn save_frame(&self, _session_id: &str, _index: usize, frame: &Frame) -> Result<String, PilotError> {
        Ok(data_url("image/png", &frame.png))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, PilotError> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for records in sessions.values() {
            out.push(Session::from_records(records.clone())?.summary());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

/// 文件会话存储：log_dir/<id>.jsonl + image_dir/<id>/step_<n>.png
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    log_dir: PathBuf,
    image_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(log_dir: impl AsRef<Path>, image_dir: impl AsRef<Path>) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            image_dir: image_dir.as_ref().to_path_buf(),
        }
    }

    fn log_path(&self, session_id: &str) -> Result<PathBuf, PilotError> {
        check_session_id(session_id)?;
        Ok(self.log_dir.join(format!("{session_id}.jsonl")))
    }

    /// 崩溃留下的无换行残缺尾行截掉，保证下一条记录从新行开始
    async fn repair_tail(path: &Path) -> Result<(), PilotError> {
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| PilotError::Store(format!("open {}: {}", path.display(), e)))?;
        if file.metadata().await?.len() == 0 {
            return Ok(());
        }
        file.seek(std::io::SeekFrom::End(-1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(());
        }
        let raw = tokio::fs::read(path).await?;
        let keep = raw
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        tracing::warn!(
            path = %path.display(),
            dropped = raw.len() - keep,
            "truncate partial trailing record"
        );
        file.set_len(keep as u64).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn write_line(&self, path: &Path, record: &SessionRecord, create_new: bool) -> Result<(), PilotError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut options = tokio::fs::OpenOptions::new();
        if create_new {
            options.write(true).create_new(true);
        } else {
            options.append(true);
        }
        let mut file = options
            .open(path)
            .await
            .map_err(|e| PilotError::Store(format!("open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 逐行解析；末尾残缺行（写到一半崩溃）跳过
    fn parse_log(raw: &str, path: &Path) -> Result<Vec<SessionRecord>, PilotError> {
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<SessionRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) if i + 1 == lines.len() => {
                    tracing::warn!(path = %path.display(), error = %e, "skip truncated trailing record");
                }
                Err(e) => {
                    return Err(PilotError::Store(format!(
                        "{} line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    )))
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, header: SessionHeader) -> Result<(), PilotError> {
        let path = self.log_path(&header.id)?;
        tokio::fs::create_dir_all(&self.log_dir).await?;
        self.write_line(&path, &SessionRecord::Start(header), true).await
    }

    async fn append(&self, session_id: &str, record: SessionRecord) -> Result<(), PilotError> {
        let path = self.log_path(session_id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(PilotError::SessionNotFound(session_id.to_string()));
        }
        Self::repair_tail(&path).await?;
        self.write_line(&path, &record, false).await
    }

    async fn load(&self, session_id: &str) -> Result<Session, PilotError> {
        let path = self.log_path(session_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PilotError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Session::from_records(Self::parse_log(&raw, &path)?)
    }

    async fn save_frame(&self, session_id: &str, index: usize, frame: &Frame) -> Result<String, PilotError> {
        check_session_id(session_id)?;
        let dir = self.image_dir.join(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("step_{index}.png"));
        tokio::fs::write(&path, &frame.png).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, PilotError> {
        let mut entries = match tokio::fs::read_dir(&self.log_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match Self::parse_log(&raw, &path).and_then(Session::from_records) {
                Ok(session) => out.push(session.summary()),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skip unreadable session log"),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

/// 会话 id 会拼进文件路径，只接受字母数字、`-` 与 `_`
fn check_session_id(session_id: &str) -> Result<(), PilotError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PilotError::Store(format!("invalid session id '{session_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, DeviceSize, Decision};
    use crate::session::types::{ModelConfig, Observation, TaskType};

    fn header(id: &str) -> SessionHeader {
        SessionHeader {
            id: id.into(),
            task: "打开设置".into(),
            task_type: TaskType::Tagged,
            model_config: ModelConfig::new("m"),
            extra_info: serde_json::json!({"source": "test"}),
            created_at: Utc::now(),
        }
    }

    fn step(index: usize) -> Step {
        Step {
            index,
            environment: Observation::new(format!("img{index}")),
            decision: Some(Decision::new(Action::Complete).with_explain("done")),
            raw_response: "<ACTION>action:COMPLETE".into(),
            decision_ms: 5,
            error: None,
            execution_error: None,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySessionStore::new();
        store.create(header("a")).await.unwrap();
        assert!(store.create(header("a")).await.is_err());
        store.append_step("a", step(0)).await.unwrap();
        store
            .terminate("a", TerminalReason::Complete, None)
            .await
            .unwrap();
        let session = store.load("a").await.unwrap();
        assert_eq!(session.steps.len(), 1);
        assert_eq!(session.summary().terminal, Some(TerminalReason::Complete));
        assert!(matches!(
            store.append_step("missing", step(0)).await,
            Err(PilotError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let images = dir.path().join("images");
        {
            let store = FileSessionStore::new(&logs, &images);
            store.create(header("s1")).await.unwrap();
            store.append_step("s1", step(0)).await.unwrap();
        }
        let store = FileSessionStore::new(&logs, &images);
        let session = store.load("s1").await.unwrap();
        assert_eq!(session.header.task, "打开设置");
        assert_eq!(session.steps[0].environment.image, "img0");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_skips_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), dir.path());
        store.create(header("s2")).await.unwrap();
        store.append_step("s2", step(0)).await.unwrap();
        let path = dir.path().join("s2.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"record\":\"step\",\"ind");
        std::fs::write(&path, raw).unwrap();
        assert_eq!(store.load("s2").await.unwrap().steps.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_appends_after_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), dir.path());
        store.create(header("s3")).await.unwrap();
        store.append_step("s3", step(0)).await.unwrap();
        let path = dir.path().join("s3.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"record\":\"step\",\"ind");
        std::fs::write(&path, raw).unwrap();

        store.append_step("s3", step(1)).await.unwrap();
        store.append_step("s3", step(2)).await.unwrap();
        let session = store.load("s3").await.unwrap();
        let indexes: Vec<usize> = session.steps.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("l"), dir.path().join("i"));
        assert!(matches!(store.load("../x").await, Err(PilotError::Store(_))));
        assert!(matches!(store.create(header("a/b")).await, Err(PilotError::Store(_))));
        let frame = Frame {
            png: vec![1],
            size: DeviceSize::new(1, 1),
        };
        assert!(store.save_frame("..", 0, &frame).await.is_err());
        assert!(!dir.path().join("x.jsonl").exists());
    }

    #[tokio::test]
    async fn test_file_store_frames_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("l"), dir.path().join("i"));
        let frame = Frame {
            png: vec![1, 2, 3],
            size: DeviceSize::new(10, 20),
        };
        let reference = store.save_frame("s3", 4, &frame).await.unwrap();
        assert!(reference.ends_with("step_4.png"));
        assert_eq!(std::fs::read(&reference).unwrap(), vec![1, 2, 3]);
        assert!(matches!(store.load("s3").await, Err(PilotError::SessionNotFound(_))));
        assert!(store.list().await.unwrap().is_empty());
    }
}
