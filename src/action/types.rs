//! 规范动作模型
//!
//! Action 为封闭的标签枚举，所有后端词表在 normalize 中统一到这里；
//! Decision 额外携带后端给出的 explain / summary / status 文本。

use serde::{Deserialize, Serialize};

use super::coords::Point;
use crate::core::{PilotError, TerminalReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Click {
        point: Point,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        search_type: Option<String>,
    },
    Type {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        point: Option<Point>,
        #[serde(default = "default_keyboard_present")]
        keyboard_present: bool,
    },
    LongPress {
        point: Point,
        duration_ms: u64,
    },
    Swipe {
        from: Point,
        to: Point,
        duration_ms: u64,
    },
    Scroll {
        point: Point,
        direction: Direction,
    },
    Wait {
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        closable_regions: Vec<ClosableRegion>,
    },
    Awake {
        app_name: String,
    },
    Info {
        question: String,
    },
    Abort {
        reason: String,
    },
    Complete,
    HotKey {
        key: HotKey,
    },
}

fn default_keyboard_present() -> bool {
    true
}

impl Action {
    /// 动作类型名（日志、审计与历史渲染用）
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "CLICK",
            Action::Type { .. } => "TYPE",
            Action::LongPress { .. } => "LONG_PRESS",
            Action::Swipe { .. } => "SWIPE",
            Action::Scroll { .. } => "SCROLL",
            Action::Wait { .. } => "WAIT",
            Action::Awake { .. } => "AWAKE",
            Action::Info { .. } => "INFO",
            Action::Abort { .. } => "ABORT",
            Action::Complete => "COMPLETE",
            Action::HotKey { .. } => "HOT_KEY",
        }
    }

    /// Complete / Abort 结束会话
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        match self {
            Action::Complete => Some(TerminalReason::Complete),
            Action::Abort { .. } => Some(TerminalReason::Abort),
            _ => None,
        }
    }

    pub fn is_info(&self) -> bool {
        matches!(self, Action::Info { .. })
    }

    /// 结构性校验：在产生任何设备原语之前执行
    pub fn validate(&self) -> Result<(), PilotError> {
        match self {
            Action::Awake { app_name } if app_name.trim().is_empty() => Err(
                PilotError::InvalidAction("AWAKE requires a non-empty app name".into()),
            ),
            Action::LongPress { duration_ms: 0, .. } => Err(PilotError::InvalidAction(
                "LONG_PRESS duration must be positive".into(),
            )),
            Action::Swipe { duration_ms: 0, .. } => Err(PilotError::InvalidAction(
                "SWIPE duration must be positive".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "left" => Some(Direction::Left),
            "right" => Some(Direction::Right),
            _ => None,
        }
    }
}

/// 硬件 / 系统按键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotKey {
    VolumeUp,
    VolumeDown,
    Power,
    Home,
    Back,
    Menu,
    Enter,
}

impl HotKey {
    /// Android KEYCODE_*
    pub fn keycode(&self) -> u32 {
        match self {
            HotKey::VolumeUp => 24,
            HotKey::VolumeDown => 25,
            HotKey::Power => 26,
            HotKey::Home => 3,
            HotKey::Back => 4,
            HotKey::Menu => 82,
            HotKey::Enter => 66,
        }
    }

    /// 接受 volume_up / VOLUME_UP / KEYCODE_VOLUME_UP 等写法
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let key = lower.strip_prefix("keycode_").unwrap_or(&lower);
        match key {
            "volume_up" | "volumeup" => Some(HotKey::VolumeUp),
            "volume_down" | "volumedown" => Some(HotKey::VolumeDown),
            "power" => Some(HotKey::Power),
            "home" => Some(HotKey::Home),
            "back" => Some(HotKey::Back),
            "menu" => Some(HotKey::Menu),
            "enter" => Some(HotKey::Enter),
            _ => None,
        }
    }
}

/// WAIT 时后端标出的可关闭区域（例如广告倒计时的关闭按钮）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosableRegion {
    pub point: Point,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<(Point, Point)>,
}

/// 后端的一次决策：动作加上附带的说明文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default)]
    pub explain: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Decision {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            explain: String::new(),
            summary: String::new(),
            status: None,
        }
    }

    pub fn with_explain(mut self, explain: impl Into<String>) -> Self {
        self.explain = explain.into();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serde_tag() {
        let a = Action::Click {
            point: Point::fixed(10, 20),
            search_type: None,
        };
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["action"], "CLICK");
        assert_eq!(v["point"]["space"], "fixed");
        let back: Action = serde_json::from_value(v).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_type_keyboard_defaults_true() {
        let a: Action = serde_json::from_str(r#"{"action":"TYPE","text":"hi"}"#).unwrap();
        assert_eq!(
            a,
            Action::Type {
                text: "hi".into(),
                point: None,
                keyboard_present: true
            }
        );
    }

    #[test]
    fn test_hotkey_keycodes_and_parse() {
        assert_eq!(HotKey::parse("KEYCODE_HOME"), Some(HotKey::Home));
        assert_eq!(HotKey::parse("volume_down").map(|k| k.keycode()), Some(25));
        assert_eq!(HotKey::Menu.keycode(), 82);
        assert_eq!(HotKey::parse("camera"), None);
    }

    #[test]
    fn test_terminal_actions() {
        assert_eq!(Action::Complete.terminal_reason(), Some(TerminalReason::Complete));
        assert_eq!(
            Action::Abort { reason: "x".into() }.terminal_reason(),
            Some(TerminalReason::Abort)
        );
        assert!(Action::Info { question: "?".into() }.terminal_reason().is_none());
    }

    #[test]
    fn test_validate_rejects_empty_app() {
        let err = Action::Awake { app_name: " ".into() }.validate().unwrap_err();
        assert!(matches!(err, PilotError::InvalidAction(_)));
    }
}
