//! invoke 格式解析器
//!
//! 模型输出：`<thinking>..</thinking><invoke>{json}</invoke>`，坐标为像素；
//! 没有 invoke 标签时退回 ```json 代码块或首个 `{` 到末个 `}`。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::ResponseParser;
use crate::action::{normalize_backend_action, Decision};
use crate::core::PilotError;
use crate::llm::ChatMessage;
use crate::session::{Observation, Step};

const SYSTEM_PROMPT: &str = "你是 Android 手机自动化助手的动作预测模块。根据用户指令和当前截图，每次只返回一个动作。\n\
输出格式：\n<thinking>看到了什么、要做什么、为什么</thinking>\n<invoke>{\"action\": \"...\", ...}</invoke>\n\
可用动作（坐标为像素，左上角为 (0,0)）：\n\
- click/tap: {\"action\": \"click\", \"coordinate\": [x, y]}\n\
- swipe: {\"action\": \"swipe\", \"start\": [x1, y1], \"end\": [x2, y2], \"duration_ms\": 300}\n\
- input_text: {\"action\": \"input_text\", \"text\": \"内容\"}\n\
- press_key: {\"action\": \"press_key\", \"key\": \"HOME|BACK|ENTER|MENU|VOLUME_UP|VOLUME_DOWN\"}\n\
- home / back: {\"action\": \"home\"}\n\
- wait: {\"action\": \"wait\", \"duration\": 1}\n\
- terminate: {\"action\": \"terminate\", \"status\": \"success|failure\"}\n\
- answer: {\"action\": \"answer\", \"text\": \"结果\"}";

fn thinking_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<thinking>(.*?)</thinking>").unwrap_or_else(|_| unreachable!()))
}

fn invoke_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<invoke>(.*?)</invoke>").unwrap_or_else(|_| unreachable!()))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InvokeParser;

impl ResponseParser for InvokeParser {
    fn build_messages(&self, task: &str, history: &[Step], current: &Observation) -> Vec<ChatMessage> {
        let mut text = format!("用户指令：{task}\n");
        for step in history {
            match &step.decision {
                Some(d) => {
                    let action = serde_json::to_string(&d.action).unwrap_or_default();
                    text.push_str(&format!("第{}步：{} -> {}\n", step.index + 1, d.explain, action));
                }
                None => text.push_str(&format!("第{}步：（无有效动作）\n", step.index + 1)),
            }
        }
        if let Some(reply) = &current.reply {
            text.push_str(&format!("用户回复：{reply}\n"));
        }
        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(text).with_image(current.image.clone()),
        ]
    }

    fn parse(&self, response: &str) -> Result<Decision, PilotError> {
        let thinking = thinking_re()
            .captures(response)
            .map(|c| c[1].trim().to_string());
        let json_str = match invoke_re().captures(response) {
            Some(c) => c.get(1).map(|m| m.as_str().trim()).unwrap_or_default(),
            None => extract_json(response)
                .ok_or_else(|| PilotError::Parse(format!("no <invoke> block in: {}", response.trim())))?,
        };
        let value: Value = serde_json::from_str(json_str)
            .map_err(|e| PilotError::Parse(format!("{}: {}", e, json_str)))?;
        let mut decision = normalize_backend_action(&value)?;
        if decision.explain.is_empty() {
            if let Some(t) = thinking {
                decision.explain = t;
            }
        }
        Ok(decision)
    }
}

/// ```json 代码块，或首个 `{` 到末个 `}`
fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}
