//! 设备通道抽象
//!
//! DeviceChannel 是对一台已连接设备的输入 / 截图能力的抽象（adb、scrcpy 等实现放在外部）；
//! DeviceConnector 负责按 ConnectPlan 建立新通道。二者与 LlmClient 一样返回 Result<_, String>，
//! 由持有者映射为 PilotError。

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::{DeviceSize, Orientation, PixelPoint};

/// 一帧截图（PNG 字节）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub png: Vec<u8>,
    pub size: DeviceSize,
}

/// 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// USB 直连（低延迟）
    Wired,
    /// TCP/IP（host:port）
    Wireless,
}

impl TransportKind {
    /// host:port 形式的设备 id 已是无线连接，其余走 USB
    pub fn for_device(device_id: &str) -> Self {
        if device_id.contains(':') {
            TransportKind::Wireless
        } else {
            TransportKind::Wired
        }
    }
}

/// 显示模式：无头或带预览窗口（仅在新建连接时生效）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Headless,
    Preview,
}

/// 新建连接的计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPlan {
    pub transport: TransportKind,
    pub display_mode: DisplayMode,
}

/// 连接建立时确定、之后不变的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    pub device_id: String,
    pub transport: TransportKind,
    pub wireless: bool,
    pub size: DeviceSize,
    pub display_mode: DisplayMode,
    pub connected_at: SystemTime,
}

/// 已连接设备的能力
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn tap(&self, point: PixelPoint) -> Result<(), String>;

    async fn swipe(&self, from: PixelPoint, to: PixelPoint, duration_ms: u64) -> Result<(), String>;

    async fn long_press(&self, point: PixelPoint, duration_ms: u64) -> Result<(), String>;

    async fn inject_text(&self, text: &str) -> Result<(), String>;

    async fn press_key(&self, keycode: u32) -> Result<(), String>;

    async fn start_app(&self, package: &str) -> Result<(), String>;

    async fn stop_app(&self, package: &str) -> Result<(), String>;

    /// 截图；暂时拿不到帧时返回 Ok(None)
    async fn screenshot(&self) -> Result<Option<Frame>, String>;

    async fn size(&self) -> Result<DeviceSize, String>;

    async fn orientation(&self) -> Result<Orientation, String> {
        Ok(Orientation::Rotation0)
    }

    async fn is_alive(&self) -> bool;

    async fn disconnect(&self);
}

/// 按计划建立新通道
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(
        &self,
        device_id: &str,
        plan: &ConnectPlan,
    ) -> Result<std::sync::Arc<dyn DeviceChannel>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_device_id() {
        assert_eq!(TransportKind::for_device("192.168.1.8:5555"), TransportKind::Wireless);
        assert_eq!(TransportKind::for_device("R58N12ABCDE"), TransportKind::Wired);
        assert_eq!(TransportKind::for_device("emulator-5554"), TransportKind::Wired);
    }
}
