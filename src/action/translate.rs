//! 动作翻译：规范 Action → 设备原语序列
//!
//! 先完整校验再产出原语（任何原语都不会在校验失败后发出）；
//! 像素投影使用调用时的设备尺寸，横屏处理由 OrientationPolicy 决定。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::apps::{AppResolver, PackageMap};
use super::coords::{DeviceSize, Orientation, PixelPoint, Point};
use super::types::{Action, Direction};
use crate::core::PilotError;

/// 设备输入原语
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PrimitiveCall {
    Tap { point: PixelPoint },
    Swipe { from: PixelPoint, to: PixelPoint, duration_ms: u64 },
    LongPress { point: PixelPoint, duration_ms: u64 },
    InjectText { text: String },
    PressKey { keycode: u32 },
    StartApp { package: String },
    StopApp { package: String },
    Sleep { ms: u64 },
}

impl PrimitiveCall {
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveCall::Tap { .. } => "tap",
            PrimitiveCall::Swipe { .. } => "swipe",
            PrimitiveCall::LongPress { .. } => "long_press",
            PrimitiveCall::InjectText { .. } => "inject_text",
            PrimitiveCall::PressKey { .. } => "press_key",
            PrimitiveCall::StartApp { .. } => "start_app",
            PrimitiveCall::StopApp { .. } => "stop_app",
            PrimitiveCall::Sleep { .. } => "sleep",
        }
    }
}

/// 横屏时是否、以及对哪些动作交换宽高
pub trait OrientationPolicy: Send + Sync {
    fn effective_size(&self, action: &Action, size: DeviceSize, orientation: Orientation)
        -> DeviceSize;
}

/// 默认：始终使用设备上报的尺寸
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreOrientation;

impl OrientationPolicy for IgnoreOrientation {
    fn effective_size(&self, _: &Action, size: DeviceSize, _: Orientation) -> DeviceSize {
        size
    }
}

/// 仅对 CLICK 在 90°/270° 时交换宽高（适配上报竖屏尺寸的设备）
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapOnRotatedTap;

impl OrientationPolicy for SwapOnRotatedTap {
    fn effective_size(&self, action: &Action, size: DeviceSize, orientation: Orientation) -> DeviceSize {
        if matches!(action, Action::Click { .. }) && orientation.is_landscape() {
            size.swapped()
        } else {
            size
        }
    }
}

/// 翻译时序参数（[translator] 配置段）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslatorTimings {
    /// 无键盘时点击输入框后的等待
    pub type_focus_delay_ms: u64,
    /// 启动应用后的等待
    pub app_launch_delay_ms: u64,
    pub scroll_duration_ms: u64,
    /// 滚动距离占屏幕对应维度的比例
    pub scroll_ratio: f64,
    /// AWAKE 前先 force-stop 应用
    pub restart_app: bool,
}

impl Default for TranslatorTimings {
    fn default() -> Self {
        Self {
            type_focus_delay_ms: 1000,
            app_launch_delay_ms: 1000,
            scroll_duration_ms: 1200,
            scroll_ratio: 0.3,
            restart_app: false,
        }
    }
}

pub struct ActionTranslator {
    resolver: Arc<dyn AppResolver>,
    orientation: Arc<dyn OrientationPolicy>,
    timings: TranslatorTimings,
}

impl ActionTranslator {
    pub fn new(resolver: Arc<dyn AppResolver>) -> Self {
        Self {
            resolver,
            orientation: Arc::new(IgnoreOrientation),
            timings: TranslatorTimings::default(),
        }
    }

    pub fn with_orientation_policy(mut self, policy: Arc<dyn OrientationPolicy>) -> Self {
        self.orientation = policy;
        self
    }

    pub fn with_timings(mut self, timings: TranslatorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn timings(&self) -> &TranslatorTimings {
        &self.timings
    }

    /// 翻译为原语序列；INFO / ABORT / COMPLETE 得到空序列
    pub fn to_primitives(
        &self,
        action: &Action,
        size: DeviceSize,
        orientation: Orientation,
    ) -> Result<Vec<PrimitiveCall>, PilotError> {
        action.validate()?;
        if size.width == 0 || size.height == 0 {
            return Err(PilotError::DeviceExecution(format!(
                "invalid device size {}x{}",
                size.width, size.height
            )));
        }
        let size = self.orientation.effective_size(action, size, orientation);
        let t = &self.timings;

        let calls = match action {
            Action::Click { point, .. } => vec![PrimitiveCall::Tap {
                point: point.to_pixel(size),
            }],
            Action::LongPress { point, duration_ms } => vec![PrimitiveCall::LongPress {
                point: point.to_pixel(size),
                duration_ms: *duration_ms,
            }],
            Action::Swipe {
                from,
                to,
                duration_ms,
            } => vec![PrimitiveCall::Swipe {
                from: from.to_pixel(size),
                to: to.to_pixel(size),
                duration_ms: *duration_ms,
            }],
            Action::Scroll { point, direction } => {
                vec![self.scroll(point, *direction, size)]
            }
            Action::Type {
                text,
                point,
                keyboard_present,
            } => match (keyboard_present, point) {
                (false, Some(p)) => vec![
                    PrimitiveCall::Tap {
                        point: p.to_pixel(size),
                    },
                    PrimitiveCall::Sleep {
                        ms: t.type_focus_delay_ms,
                    },
                    PrimitiveCall::InjectText { text: text.clone() },
                ],
                (false, None) => {
                    tracing::debug!("TYPE without keyboard and without point, using current focus");
                    vec![PrimitiveCall::InjectText { text: text.clone() }]
                }
                (true, _) => vec![PrimitiveCall::InjectText { text: text.clone() }],
            },
            Action::Awake { app_name } => {
                let package = self
                    .resolver
                    .resolve(app_name)
                    .ok_or_else(|| PilotError::AppNotFound(app_name.clone()))?;
                let mut calls = Vec::with_capacity(4);
                if t.restart_app {
                    calls.push(PrimitiveCall::StopApp {
                        package: package.clone(),
                    });
                    calls.push(PrimitiveCall::Sleep {
                        ms: t.app_launch_delay_ms,
                    });
                }
                calls.push(PrimitiveCall::StartApp { package });
                calls.push(PrimitiveCall::Sleep {
                    ms: t.app_launch_delay_ms,
                });
                calls
            }
            Action::Wait { duration_ms, .. } => vec![PrimitiveCall::Sleep { ms: *duration_ms }],
            Action::HotKey { key } => vec![PrimitiveCall::PressKey {
                keycode: key.keycode(),
            }],
            Action::Info { .. } | Action::Abort { .. } | Action::Complete => Vec::new(),
        };
        Ok(calls)
    }

    /// "down" 表示向下浏览内容：手指向上移动
    fn scroll(&self, point: &Point, direction: Direction, size: DeviceSize) -> PrimitiveCall {
        let from = point.to_pixel(size);
        let dx = (self.timings.scroll_ratio * size.width as f64).round() as i32;
        let dy = (self.timings.scroll_ratio * size.height as f64).round() as i32;
        let to = match direction {
            Direction::Down => PixelPoint::new(from.x, from.y - dy),
            Direction::Up => PixelPoint::new(from.x, from.y + dy),
            Direction::Left => PixelPoint::new(from.x - dx, from.y),
            Direction::Right => PixelPoint::new(from.x + dx, from.y),
        };
        PrimitiveCall::Swipe {
            from,
            to: to.clamped(size),
            duration_ms: self.timings.scroll_duration_ms,
        }
    }
}

impl Default for ActionTranslator {
    fn default() -> Self {
        Self::new(Arc::new(PackageMap::builtin()))
    }
}
