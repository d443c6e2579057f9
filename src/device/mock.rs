//! 设备测试替身：记录原语调用的 MockChannel 与统计建连次数的 MockConnector

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::channel::{ConnectPlan, DeviceChannel, DeviceConnector, Frame};
use crate::action::{DeviceSize, Orientation, PixelPoint, PrimitiveCall};

/// 最小合法 PNG 签名后跟占位字节
const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, b'm', b'o', b'c', b'k'];

/// 内存中的假设备
pub struct MockChannel {
    device_id: String,
    size: DeviceSize,
    orientation: Mutex<Orientation>,
    alive: AtomicBool,
    disconnected: AtomicBool,
    failures_left: AtomicU32,
    screenshot_misses_left: AtomicU32,
    calls: Mutex<Vec<PrimitiveCall>>,
}

impl MockChannel {
    pub fn new(device_id: &str, size: DeviceSize) -> Self {
        Self {
            device_id: device_id.to_string(),
            size,
            orientation: Mutex::new(Orientation::Rotation0),
            alive: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            failures_left: AtomicU32::new(0),
            screenshot_misses_left: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        if let Ok(mut o) = self.orientation.lock() {
            *o = orientation;
        }
    }

    /// 接下来 n 次输入原语返回错误
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// 接下来 n 次截图拿不到帧
    pub fn miss_screenshots(&self, n: u32) {
        self.screenshot_misses_left.store(n, Ordering::SeqCst);
    }

    /// 已成功执行的原语（不含 Sleep，Sleep 由执行器处理）
    pub fn calls(&self) -> Vec<PrimitiveCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record(&self, call: PrimitiveCall) -> Result<(), String> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(format!("{} disconnected", self.device_id));
        }
        if Self::take_one(&self.failures_left) {
            return Err(format!("injected failure on {}", call.name()));
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceChannel for MockChannel {
    async fn tap(&self, point: PixelPoint) -> Result<(), String> {
        self.record(PrimitiveCall::Tap { point })
    }

    async fn swipe(&self, from: PixelPoint, to: PixelPoint, duration_ms: u64) -> Result<(), String> {
        self.record(PrimitiveCall::Swipe {
            from,
            to,
            duration_ms,
        })
    }

    async fn long_press(&self, point: PixelPoint, duration_ms: u64) -> Result<(), String> {
        self.record(PrimitiveCall::LongPress { point, duration_ms })
    }

    async fn inject_text(&self, text: &str) -> Result<(), String> {
        self.record(PrimitiveCall::InjectText {
            text: text.to_string(),
        })
    }

    async fn press_key(&self, keycode: u32) -> Result<(), String> {
        self.record(PrimitiveCall::PressKey { keycode })
    }

    async fn start_app(&self, package: &str) -> Result<(), String> {
        self.record(PrimitiveCall::StartApp {
            package: package.to_string(),
        })
    }

    async fn stop_app(&self, package: &str) -> Result<(), String> {
        self.record(PrimitiveCall::StopApp {
            package: package.to_string(),
        })
    }

    async fn screenshot(&self) -> Result<Option<Frame>, String> {
        if Self::take_one(&self.screenshot_misses_left) {
            return Ok(None);
        }
        Ok(Some(Frame {
            png: FAKE_PNG.to_vec(),
            size: self.size,
        }))
    }

    async fn size(&self) -> Result<DeviceSize, String> {
        Ok(self.size)
    }

    async fn orientation(&self) -> Result<Orientation, String> {
        self.orientation
            .lock()
            .map(|o| *o)
            .map_err(|e| e.to_string())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.disconnected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// 每次 connect 新建一个 MockChannel
pub struct MockConnector {
    size: DeviceSize,
    connect_delay: Duration,
    fail: AtomicBool,
    created: AtomicUsize,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    plans: Mutex<Vec<(String, ConnectPlan)>>,
}

impl MockConnector {
    pub fn new(size: DeviceSize) -> Self {
        Self {
            size,
            connect_delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
            plans: Mutex::new(Vec::new()),
        }
    }

    /// 模拟建连耗时（并发测试用）
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.channels.lock().ok().and_then(|c| c.last().cloned())
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn plans(&self) -> Vec<(String, ConnectPlan)> {
        self.plans.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeviceConnector for MockConnector {
    async fn connect(
        &self,
        device_id: &str,
        plan: &ConnectPlan,
    ) -> Result<Arc<dyn DeviceChannel>, String> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Ok(mut plans) = self.plans.lock() {
            plans.push((device_id.to_string(), *plan));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(format!("device {device_id} not found"));
        }
        let channel = Arc::new(MockChannel::new(device_id, self.size));
        if let Ok(mut channels) = self.channels.lock() {
            channels.push(channel.clone());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }
}
