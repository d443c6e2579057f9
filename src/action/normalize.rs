//! 后端动作归一化：三种词表 → 规范 Action
//!
//! 1. 模型词表（CLICK / TYPE / SLIDE ...），坐标为 0–1000 定点，文本放在 value
//! 2. step API 词表（Click / Type / Pop ...），参数在 args 对象里，坐标为归一化
//! 3. invoke 词表（click / swipe / input_text ...），坐标为像素
//!
//! 类型强转（数字字符串、"x,y" 坐标串、秒 → 毫秒、字符串布尔值）只在这里发生。

use serde_json::{Map, Value};

use super::coords::Point;
use super::types::{Action, ClosableRegion, Decision, Direction, HotKey};
use crate::core::PilotError;

/// 长按 / 滑动未给时长时的默认值（秒）
pub const DEFAULT_GESTURE_SECS: f64 = 1.5;
/// invoke 词表 swipe 未给时长时的默认值
const DEFAULT_INVOKE_SWIPE_MS: u64 = 300;

type Obj = Map<String, Value>;

/// 将后端返回的原始动作对象归一化为 Decision
pub fn normalize_backend_action(raw: &Value) -> Result<Decision, PilotError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| PilotError::InvalidAction(format!("action must be an object, got {raw}")))?;
    let tag = obj
        .get("action")
        .or_else(|| obj.get("action_type"))
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| PilotError::InvalidAction("missing 'action' or 'action_type'".into()))?;

    let action = match tag {
        "CLICK" | "TYPE" | "COMPLETE" | "WAIT" | "AWAKE" | "INFO" | "ABORT" | "SWIPE"
        | "SLIDE" | "LONGPRESS" | "LONG_PRESS" | "SCROLL" | "HOT_KEY" | "HOTKEY" | "BACK"
        | "HOME" => model_action(tag, obj)?,
        "Click" | "Type" | "Pop" | "Wait" | "Awake" | "Abort" | "Complete" | "Scroll"
        | "LongPress" | "HotKey" => step_api_action(tag, obj)?,
        "click" | "tap" | "swipe" | "input_text" | "press_key" | "home" | "back" | "wait"
        | "terminate" | "answer" => invoke_action(tag, obj)?,
        other => return Err(PilotError::UnsupportedActionType(other.to_string())),
    };
    action.validate()?;

    let mut decision = Decision::new(action);
    if let Some(explain) = text_field(obj, &["explain", "thought", "thinking"]) {
        decision.explain = explain;
    }
    if let Some(summary) = text_field(obj, &["summary"]) {
        decision.summary = summary;
    }
    if let Some(status) = text_field(obj, &["status"]) {
        if !matches!(tag, "terminate") {
            decision.status = Some(status);
        }
    }
    if tag == "answer" {
        if let Some(text) = text_field(obj, &["text"]) {
            decision.summary = text;
        }
    }
    Ok(decision)
}

fn model_action(tag: &str, obj: &Obj) -> Result<Action, PilotError> {
    let action = match tag {
        "CLICK" => Action::Click {
            point: fixed_point(required(obj, tag, "point")?, tag)?,
            search_type: text_field(obj, &["search_type"]),
        },
        "TYPE" => Action::Type {
            text: required_text(obj, tag, &["value", "text"])?,
            point: obj.get("point").map(|v| fixed_point(v, tag)).transpose()?,
            keyboard_present: keyboard_flag(obj, &["keyboard", "keyboard_exists"], tag)?,
        },
        "LONGPRESS" | "LONG_PRESS" => Action::LongPress {
            point: fixed_point(required(obj, tag, "point")?, tag)?,
            duration_ms: optional_secs(obj, &["duration", "value"], tag)?
                .unwrap_or(secs_to_ms(DEFAULT_GESTURE_SECS)),
        },
        "SWIPE" | "SLIDE" => Action::Swipe {
            from: fixed_point(required(obj, tag, "point1")?, tag)?,
            to: fixed_point(required(obj, tag, "point2")?, tag)?,
            duration_ms: optional_secs(obj, &["duration"], tag)?
                .unwrap_or(secs_to_ms(DEFAULT_GESTURE_SECS)),
        },
        "SCROLL" => Action::Scroll {
            point: fixed_point(required(obj, tag, "point")?, tag)?,
            direction: direction(required(obj, tag, "direction")?, tag)?,
        },
        "WAIT" => Action::Wait {
            duration_ms: secs_value(required(obj, tag, "value")?, tag)?,
            closable_regions: close_reasons(obj, tag)?,
        },
        "AWAKE" => Action::Awake {
            app_name: required_text(obj, tag, &["value", "app", "text"])?,
        },
        "INFO" => Action::Info {
            question: required_text(obj, tag, &["value", "text"])?,
        },
        "ABORT" => Action::Abort {
            reason: text_field(obj, &["value", "reason", "explain"]).unwrap_or_default(),
        },
        "COMPLETE" => Action::Complete,
        "HOT_KEY" | "HOTKEY" => Action::HotKey {
            key: hot_key(required(obj, tag, "key")?, tag)?,
        },
        "BACK" => Action::HotKey { key: HotKey::Back },
        "HOME" => Action::HotKey { key: HotKey::Home },
        other => return Err(PilotError::UnsupportedActionType(other.to_string())),
    };
    Ok(action)
}

fn step_api_action(tag: &str, obj: &Obj) -> Result<Action, PilotError> {
    let empty = Obj::new();
    let args = match obj.get("args") {
        Some(Value::Object(a)) => a,
        Some(other) => {
            return Err(PilotError::InvalidAction(format!(
                "{tag}: 'args' must be an object, got {other}"
            )))
        }
        None => &empty,
    };
    let action = match tag {
        "Click" => Action::Click {
            point: normalized_point(required(args, tag, "normalized_point")?, tag)?,
            search_type: text_field(args, &["search_type"]),
        },
        "Type" => Action::Type {
            text: required_text(args, tag, &["text"])?,
            point: args
                .get("normalized_point")
                .map(|v| normalized_point(v, tag))
                .transpose()?,
            keyboard_present: keyboard_flag(args, &["keyboard_exists", "keyboard"], tag)?,
        },
        "LongPress" => Action::LongPress {
            point: normalized_point(required(args, tag, "normalized_point")?, tag)?,
            duration_ms: optional_secs(args, &["duration"], tag)?
                .unwrap_or(secs_to_ms(DEFAULT_GESTURE_SECS)),
        },
        "Scroll" => match args.get("normalized_path") {
            Some(path) => {
                let (from, to) = normalized_path(path, tag)?;
                Action::Swipe {
                    from,
                    to,
                    duration_ms: optional_secs(args, &["duration"], tag)?
                        .unwrap_or(secs_to_ms(DEFAULT_GESTURE_SECS)),
                }
            }
            None => Action::Scroll {
                point: normalized_point(required(args, tag, "normalized_point")?, tag)?,
                direction: direction(required(args, tag, "direction")?, tag)?,
            },
        },
        "Wait" => Action::Wait {
            duration_ms: secs_value(required(args, tag, "duration")?, tag)?,
            closable_regions: Vec::new(),
        },
        "Awake" => Action::Awake {
            app_name: required_text(args, tag, &["text"])?,
        },
        "Pop" => Action::Info {
            question: required_text(args, tag, &["text"])?,
        },
        "Abort" => Action::Abort {
            reason: text_field(args, &["abort_reason", "text"]).unwrap_or_default(),
        },
        "Complete" => Action::Complete,
        "HotKey" => Action::HotKey {
            key: hot_key(required(args, tag, "key")?, tag)?,
        },
        other => return Err(PilotError::UnsupportedActionType(other.to_string())),
    };
    Ok(action)
}

fn invoke_action(tag: &str, obj: &Obj) -> Result<Action, PilotError> {
    let action = match tag {
        "click" | "tap" => Action::Click {
            point: pixel_point(required(obj, tag, "coordinate")?, tag)?,
            search_type: None,
        },
        "swipe" => Action::Swipe {
            from: pixel_point(required(obj, tag, "start")?, tag)?,
            to: pixel_point(required(obj, tag, "end")?, tag)?,
            duration_ms: match obj.get("duration_ms") {
                Some(v) => number(v)
                    .filter(|n| *n > 0.0)
                    .map(|n| n.round() as u64)
                    .ok_or_else(|| invalid(tag, "duration_ms", v))?,
                None => DEFAULT_INVOKE_SWIPE_MS,
            },
        },
        "input_text" => Action::Type {
            text: required_text(obj, tag, &["text"])?,
            point: None,
            keyboard_present: true,
        },
        "press_key" => Action::HotKey {
            key: hot_key(required(obj, tag, "key")?, tag)?,
        },
        "home" => Action::HotKey { key: HotKey::Home },
        "back" => Action::HotKey { key: HotKey::Back },
        "wait" => Action::Wait {
            duration_ms: match obj.get("duration") {
                Some(v) => secs_value(v, tag)?,
                None => 1000,
            },
            closable_regions: Vec::new(),
        },
        "terminate" => {
            let status = text_field(obj, &["status"]).unwrap_or_default();
            match status.to_ascii_lowercase().as_str() {
                "fail" | "failure" | "failed" | "error" => Action::Abort {
                    reason: text_field(obj, &["text", "reason"]).unwrap_or(status),
                },
                _ => Action::Complete,
            }
        }
        "answer" => Action::Complete,
        other => return Err(PilotError::UnsupportedActionType(other.to_string())),
    };
    Ok(action)
}

fn required<'a>(obj: &'a Obj, tag: &str, key: &str) -> Result<&'a Value, PilotError> {
    match obj.get(key) {
        Some(Value::Null) | None => Err(PilotError::InvalidAction(format!(
            "{tag}: missing required field '{key}'"
        ))),
        Some(v) => Ok(v),
    }
}

fn required_text(obj: &Obj, tag: &str, keys: &[&str]) -> Result<String, PilotError> {
    text_field(obj, keys).ok_or_else(|| {
        PilotError::InvalidAction(format!(
            "{tag}: missing required field '{}'",
            keys.first().copied().unwrap_or("value")
        ))
    })
}

/// 取第一个存在的文本字段；数字按字面量转成字符串
fn text_field(obj: &Obj, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn invalid(tag: &str, key: &str, v: &Value) -> PilotError {
    PilotError::InvalidAction(format!("{tag}: invalid '{key}': {v}"))
}

fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}

fn secs_value(v: &Value, tag: &str) -> Result<u64, PilotError> {
    number(v)
        .filter(|s| *s >= 0.0)
        .map(secs_to_ms)
        .ok_or_else(|| invalid(tag, "duration", v))
}

fn optional_secs(obj: &Obj, keys: &[&str], tag: &str) -> Result<Option<u64>, PilotError> {
    match keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null())) {
        Some(v) => secs_value(v, tag).map(Some),
        None => Ok(None),
    }
}

fn keyboard_flag(obj: &Obj, keys: &[&str], tag: &str) -> Result<bool, PilotError> {
    let Some(v) = keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null())) else {
        return Ok(true);
    };
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(1.0) != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(tag, "keyboard", v)),
        },
        _ => Err(invalid(tag, "keyboard", v)),
    }
}

/// 接受 [x, y]、"x,y"、"(x, y)"、{"x":..,"y":..}
fn pair(v: &Value) -> Option<(f64, f64)> {
    match v {
        Value::Array(items) if items.len() >= 2 => Some((number(&items[0])?, number(&items[1])?)),
        Value::String(s) => {
            let trimmed = s.trim().trim_matches(|c| matches!(c, '(' | ')' | '[' | ']'));
            let mut parts = trimmed.split(',').map(str::trim);
            let x = parts.next()?.parse::<f64>().ok()?;
            let y = parts.next()?.parse::<f64>().ok()?;
            (x.is_finite() && y.is_finite()).then_some((x, y))
        }
        Value::Object(o) => Some((number(o.get("x")?)?, number(o.get("y")?)?)),
        _ => None,
    }
}

fn fixed_point(v: &Value, tag: &str) -> Result<Point, PilotError> {
    let (x, y) = pair(v).ok_or_else(|| invalid(tag, "point", v))?;
    let axis = |n: f64| n.round().clamp(0.0, 1000.0) as u16;
    Ok(Point::fixed(axis(x), axis(y)))
}

fn normalized_point(v: &Value, tag: &str) -> Result<Point, PilotError> {
    let (x, y) = pair(v).ok_or_else(|| invalid(tag, "normalized_point", v))?;
    Ok(Point::normalized(x, y))
}

fn pixel_point(v: &Value, tag: &str) -> Result<Point, PilotError> {
    let (x, y) = pair(v).ok_or_else(|| invalid(tag, "coordinate", v))?;
    Ok(Point::pixel(x.round() as i32, y.round() as i32))
}

fn normalized_path(v: &Value, tag: &str) -> Result<(Point, Point), PilotError> {
    match v {
        Value::Array(items) if items.len() >= 2 => Ok((
            normalized_point(&items[0], tag)?,
            normalized_point(&items[items.len() - 1], tag)?,
        )),
        _ => Err(invalid(tag, "normalized_path", v)),
    }
}

fn direction(v: &Value, tag: &str) -> Result<Direction, PilotError> {
    v.as_str()
        .and_then(Direction::parse)
        .ok_or_else(|| invalid(tag, "direction", v))
}

fn hot_key(v: &Value, tag: &str) -> Result<HotKey, PilotError> {
    v.as_str()
        .and_then(HotKey::parse)
        .ok_or_else(|| invalid(tag, "key", v))
}

/// WAIT 的可关闭区域：close_reasons 数组，或标签格式里的 r1/p1、r2/p2 ... 成对字段
fn close_reasons(obj: &Obj, tag: &str) -> Result<Vec<ClosableRegion>, PilotError> {
    let mut regions = Vec::new();
    if let Some(Value::Array(items)) = obj.get("close_reasons") {
        for item in items {
            let o = item
                .as_object()
                .ok_or_else(|| invalid(tag, "close_reasons", item))?;
            let point = fixed_point(required(o, tag, "point")?, tag)?;
            let bbox = match o.get("bbox") {
                Some(Value::Array(b)) if b.len() >= 4 => {
                    let corner = |i: usize| -> Result<Point, PilotError> {
                        let x = number(&b[i]).ok_or_else(|| invalid(tag, "bbox", &b[i]))?;
                        let y = number(&b[i + 1]).ok_or_else(|| invalid(tag, "bbox", &b[i + 1]))?;
                        fixed_point(&Value::from(vec![x, y]), tag)
                    };
                    Some((corner(0)?, corner(2)?))
                }
                _ => None,
            };
            regions.push(ClosableRegion {
                point,
                reason: text_field(o, &["reason"]).unwrap_or_default(),
                bbox,
            });
        }
    }
    let mut i = 1;
    while let Some(p) = obj.get(&format!("p{i}")) {
        let reason_key = format!("r{i}");
        regions.push(ClosableRegion {
            point: fixed_point(p, tag)?,
            reason: text_field(obj, &[reason_key.as_str()]).unwrap_or_default(),
            bbox: None,
        });
        i += 1;
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(raw: Value) -> Action {
        normalize_backend_action(&raw).unwrap().action
    }

    #[test]
    fn test_model_click_with_string_point() {
        assert_eq!(
            action(json!({"action": "CLICK", "point": "500, 250", "search_type": "icon"})),
            Action::Click {
                point: Point::fixed(500, 250),
                search_type: Some("icon".into())
            }
        );
    }

    #[test]
    fn test_action_type_key_accepted() {
        assert_eq!(
            action(json!({"action_type": "COMPLETE"})),
            Action::Complete
        );
    }

    #[test]
    fn test_model_type_keyboard_string_false() {
        assert_eq!(
            action(json!({"action": "TYPE", "value": "你好", "point": [100, 200], "keyboard": "false"})),
            Action::Type {
                text: "你好".into(),
                point: Some(Point::fixed(100, 200)),
                keyboard_present: false
            }
        );
    }

    #[test]
    fn test_wait_seconds_to_ms_with_regions() {
        let a = action(json!({
            "action": "WAIT", "value": "2.5",
            "r1": "ad close", "p1": "950,50",
            "close_reasons": [{"point": [10, 20], "reason": "skip", "bbox": [0, 0, 30, 40]}]
        }));
        match a {
            Action::Wait { duration_ms, closable_regions } => {
                assert_eq!(duration_ms, 2500);
                assert_eq!(closable_regions.len(), 2);
                assert_eq!(closable_regions[0].reason, "skip");
                assert_eq!(
                    closable_regions[0].bbox,
                    Some((Point::fixed(0, 0), Point::fixed(30, 40)))
                );
                assert_eq!(closable_regions[1].point, Point::fixed(950, 50));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_longpress_defaults_duration() {
        assert_eq!(
            action(json!({"action": "LONGPRESS", "point": [1, 2]})),
            Action::LongPress {
                point: Point::fixed(1, 2),
                duration_ms: 1500
            }
        );
    }

    #[test]
    fn test_slide_and_back() {
        assert_eq!(
            action(json!({"action": "SLIDE", "point1": "0,0", "point2": "0,1000", "duration": 0.4})),
            Action::Swipe {
                from: Point::fixed(0, 0),
                to: Point::fixed(0, 1000),
                duration_ms: 400
            }
        );
        assert_eq!(action(json!({"action": "BACK"})), Action::HotKey { key: HotKey::Back });
    }

    #[test]
    fn test_step_api_vocabulary() {
        assert_eq!(
            action(json!({"action": "Click", "args": {"normalized_point": [0.5, 0.25]}})),
            Action::Click {
                point: Point::normalized(0.5, 0.25),
                search_type: None
            }
        );
        assert_eq!(
            action(json!({"action": "Pop", "args": {"text": "验证码是多少？"}})),
            Action::Info { question: "验证码是多少？".into() }
        );
        assert_eq!(
            action(json!({"action": "Scroll", "args": {"normalized_path": [[0.5, 0.8], [0.5, 0.2]]}})),
            Action::Swipe {
                from: Point::normalized(0.5, 0.8),
                to: Point::normalized(0.5, 0.2),
                duration_ms: 1500
            }
        );
    }

    #[test]
    fn test_invoke_vocabulary() {
        assert_eq!(
            action(json!({"action": "tap", "coordinate": [540, 1200]})),
            Action::Click {
                point: Point::pixel(540, 1200),
                search_type: None
            }
        );
        assert_eq!(
            action(json!({"action": "press_key", "key": "ENTER"})),
            Action::HotKey { key: HotKey::Enter }
        );
        assert_eq!(
            action(json!({"action": "terminate", "status": "failure"})),
            Action::Abort { reason: "failure".into() }
        );
        let d = normalize_backend_action(&json!({"action": "answer", "text": "42"})).unwrap();
        assert_eq!(d.action, Action::Complete);
        assert_eq!(d.summary, "42");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = normalize_backend_action(&json!({"action": "DANCE"})).unwrap_err();
        assert!(matches!(err, PilotError::UnsupportedActionType(t) if t == "DANCE"));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let err = normalize_backend_action(&json!({"action": "CLICK"})).unwrap_err();
        assert!(matches!(err, PilotError::InvalidAction(_)));
        let err = normalize_backend_action(&json!({"action": "CLICK", "point": "abc"})).unwrap_err();
        assert!(matches!(err, PilotError::InvalidAction(_)));
        let err = normalize_backend_action(&json!({"point": [1, 2]})).unwrap_err();
        assert!(matches!(err, PilotError::InvalidAction(_)));
    }

    #[test]
    fn test_explain_and_summary_carried() {
        let d = normalize_backend_action(&json!({
            "action": "COMPLETE", "explain": "done", "summary": "ordered coffee", "status": "ok"
        }))
        .unwrap();
        assert_eq!(d.explain, "done");
        assert_eq!(d.summary, "ordered coffee");
        assert_eq!(d.status.as_deref(), Some("ok"));
    }
}
