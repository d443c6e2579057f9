//! INFO 提问的回复策略

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};

/// 外部回复来源（manual_reply 策略下阻塞等待，可被取消）
#[async_trait]
pub trait ReplySource: Send + Sync {
    async fn reply(&self, session_id: &str, question: &str) -> Result<String, String>;
}

/// 三种可由调用方选择的策略，按单次运行传入
#[derive(Clone)]
pub enum ReplyPolicy {
    /// 再问一次后端，合成简短回复
    AutoReply,
    ManualReply(Arc<dyn ReplySource>),
    /// 停止循环并把提问交还调用方，之后带回复恢复
    PassToClient,
}

impl ReplyPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ReplyPolicy::AutoReply => "auto_reply",
            ReplyPolicy::ManualReply(_) => "manual_reply",
            ReplyPolicy::PassToClient => "pass_to_client",
        }
    }
}

impl std::fmt::Debug for ReplyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 通道回复：嵌入方或测试通过 Sender 推送回复
pub struct ChannelReplySource {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelReplySource {
    pub fn new(buffer: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl ReplySource for ChannelReplySource {
    async fn reply(&self, _session_id: &str, _question: &str) -> Result<String, String> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| "reply channel closed".to_string())
    }
}

/// 终端交互：打印提问，从标准输入读一行
#[derive(Debug, Default)]
pub struct StdinReplySource;

#[async_trait]
impl ReplySource for StdinReplySource {
    async fn reply(&self, _session_id: &str, question: &str) -> Result<String, String> {
        println!("? {question}");
        let mut line = String::new();
        let n = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("stdin closed".to_string());
        }
        Ok(line.trim().to_string())
    }
}
