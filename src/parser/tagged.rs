//! 标签格式解析器
//!
//! 模型输出：`<STATUS>..<ACTION>explain:..\taction:CLICK\tpoint:x,y\t..<PAYLOAD>plan:..\tsummary:..`，
//! `</think>` 之前的推理内容丢弃。键值对按制表符 / 换行切分，坐标为 0–1000 定点。

use serde_json::{Map, Value};

use super::ResponseParser;
use crate::action::{normalize_backend_action, Action, Decision, Point};
use crate::core::PilotError;
use crate::llm::ChatMessage;
use crate::session::{Observation, Step};

const SYSTEM_PROMPT: &str = "你是一个手机 GUI 操作助手。根据任务、历史操作和当前截图，每次只输出一个动作。\n\
输出格式：<STATUS>当前状态<ACTION>explain:动作说明\\taction:动作类型\\t参数<PAYLOAD>plan:后续计划\\tsummary:截至目前的进展小结\n\
坐标使用 0-1000 的相对坐标，写作 x,y。可用动作：\n\
CLICK(point) | TYPE(value, point?, keyboard?) | LONGPRESS(point, duration?) | SLIDE(point1, point2, duration?) | \
SCROLL(point, direction=up|down|left|right) | AWAKE(value=应用名) | WAIT(value=秒, r1/p1 可关闭区域) | \
HOT_KEY(key=volume_up|volume_down|power|home|back|menu|enter) | BACK | HOME | INFO(value=向用户提出的问题) | ABORT(value=原因) | COMPLETE";

#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedParser;

impl ResponseParser for TaggedParser {
    fn build_messages(&self, task: &str, history: &[Step], current: &Observation) -> Vec<ChatMessage> {
        let mut text = format!("任务：{task}\n");
        if history.is_empty() {
            text.push_str("这是第一步。\n");
        } else {
            text.push_str("历史操作：\n");
            for step in history {
                text.push_str(&render_step(step));
            }
        }
        if let Some(reply) = &current.reply {
            text.push_str(&format!("用户回复：{reply}\n"));
        }
        text.push_str("请根据当前截图给出下一步动作。");
        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(text).with_image(current.image.clone()),
        ]
    }

    fn parse(&self, response: &str) -> Result<Decision, PilotError> {
        let body = match response.rfind("</think>") {
            Some(pos) => &response[pos + "</think>".len()..],
            None => response,
        };
        let action_start = body
            .find("<ACTION>")
            .ok_or_else(|| PilotError::Parse(format!("no <ACTION> section in: {}", preview(body))))?;
        let status = body[..action_start]
            .find("<STATUS>")
            .map(|s| body[s + "<STATUS>".len()..action_start].trim().to_string())
            .filter(|s| !s.is_empty());
        let rest = &body[action_start + "<ACTION>".len()..];
        let (action_part, payload_part) = match rest.find("<PAYLOAD>") {
            Some(p) => (&rest[..p], &rest[p + "<PAYLOAD>".len()..]),
            None => (rest, ""),
        };

        let mut obj = key_values(action_part);
        if !obj.contains_key("action") {
            return Err(PilotError::Parse(format!(
                "no action key in: {}",
                preview(action_part)
            )));
        }
        let payload = key_values(payload_part);
        if let Some(summary) = payload.get("summary") {
            obj.insert("summary".into(), summary.clone());
        }

        let mut decision = normalize_backend_action(&Value::Object(obj))?;
        decision.status = status;
        Ok(decision)
    }
}

/// 按制表符或换行切分，每段在第一个冒号处拆成键值
fn key_values(section: &str) -> Map<String, Value> {
    let mut map = Map::new();
    for field in section.split(['\t', '\n']) {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let Some((key, value)) = field.split_once([':', '：']) else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), Value::String(value.trim().to_string()));
    }
    map
}

fn preview(s: &str) -> String {
    let s = s.trim();
    if s.chars().count() > 120 {
        format!("{}...", s.chars().take(120).collect::<String>())
    } else {
        s.to_string()
    }
}

fn render_step(step: &Step) -> String {
    let Some(decision) = &step.decision else {
        return format!("第{}步：（无有效动作）\n", step.index + 1);
    };
    let mut line = format!(
        "第{}步：explain:{}\t{}",
        step.index + 1,
        decision.explain,
        render_action(&decision.action)
    );
    if !decision.summary.is_empty() {
        line.push_str(&format!("\tsummary:{}", decision.summary));
    }
    if let Some(reply) = &step.environment.reply {
        line.push_str(&format!("\t用户回复:{reply}"));
    }
    if let Some(err) = &step.execution_error {
        line.push_str(&format!("\t执行失败:{err}"));
    }
    line.push('\n');
    line
}

fn render_point(p: &Point) -> String {
    match *p {
        Point::Fixed { x, y } => format!("{x},{y}"),
        Point::Normalized { x, y } => {
            let f = crate::action::NormalizedPoint::new(x, y).to_fixed();
            format!("{},{}", f.x, f.y)
        }
        Point::Pixel { x, y } => format!("{x},{y}"),
    }
}

/// 把规范动作写回标签格式（用于历史）
pub fn render_action(action: &Action) -> String {
    match action {
        Action::Click { point, .. } => format!("action:CLICK\tpoint:{}", render_point(point)),
        Action::Type { text, point, .. } => match point {
            Some(p) => format!("action:TYPE\tvalue:{}\tpoint:{}", text, render_point(p)),
            None => format!("action:TYPE\tvalue:{text}"),
        },
        Action::LongPress { point, duration_ms } => format!(
            "action:LONGPRESS\tpoint:{}\tduration:{}",
            render_point(point),
            *duration_ms as f64 / 1000.0
        ),
        Action::Swipe { from, to, .. } => format!(
            "action:SLIDE\tpoint1:{}\tpoint2:{}",
            render_point(from),
            render_point(to)
        ),
        Action::Scroll { point, direction } => format!(
            "action:SCROLL\tpoint:{}\tdirection:{}",
            render_point(point),
            serde_json::to_value(direction)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default()
        ),
        Action::Wait { duration_ms, .. } => {
            format!("action:WAIT\tvalue:{}", *duration_ms as f64 / 1000.0)
        }
        Action::Awake { app_name } => format!("action:AWAKE\tvalue:{app_name}"),
        Action::Info { question } => format!("action:INFO\tvalue:{question}"),
        Action::Abort { reason } => format!("action:ABORT\tvalue:{reason}"),
        Action::Complete => "action:COMPLETE".to_string(),
        Action::HotKey { key } => format!(
            "action:HOT_KEY\tkey:{}",
            serde_json::to_value(key)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default()
        ),
    }
}
