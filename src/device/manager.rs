//! 连接管理：每台设备至多一个存活连接
//!
//! - acquire：已有且存活则复用（忽略本次请求的显示模式）；缺失或已失效则拆掉旧连接后新建
//! - health_check：失败计数达到阈值即静默淘汰，成功清零
//! - 注册表只在查找槽位时持有全局锁；每台设备一个异步锁串行化建连 / 淘汰，不同设备互不阻塞

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use futures_util::future::join_all;
use tokio::sync::Mutex as AsyncMutex;

use super::channel::{
    ConnectPlan, ConnectionMetadata, DeviceChannel, DeviceConnector, DisplayMode, TransportKind,
};
use crate::core::PilotError;

/// 默认连续健康检查失败阈值
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

struct Connection {
    channel: Arc<dyn DeviceChannel>,
    metadata: ConnectionMetadata,
    last_used: Instant,
    failures: u32,
}

#[derive(Default)]
struct DeviceSlot {
    conn: Option<Connection>,
    /// 首次选定的传输方式，重连沿用直到 release
    pinned: Option<TransportKind>,
}

pub struct ConnectionManager {
    connector: Arc<dyn DeviceConnector>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<DeviceSlot>>>>,
    failure_threshold: u32,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    fn slot(&self, device_id: &str) -> Arc<AsyncMutex<DeviceSlot>> {
        let mut slots = match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(DeviceSlot::default())))
            .clone()
    }

    fn existing_slot(&self, device_id: &str) -> Option<Arc<AsyncMutex<DeviceSlot>>> {
        let slots = match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.get(device_id).cloned()
    }

    fn all_slots(&self) -> Vec<(String, Arc<AsyncMutex<DeviceSlot>>)> {
        let slots = match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// 获取设备通道：存活则复用，否则新建；建连失败返回 DeviceUnreachable（不在内部重试）
    pub async fn acquire(
        &self,
        device_id: &str,
        display_mode: DisplayMode,
    ) -> Result<Arc<dyn DeviceChannel>, PilotError> {
        let slot = self.slot(device_id);
        let mut guard = slot.lock().await;

        if let Some(conn) = guard.conn.as_mut() {
            if conn.channel.is_alive().await {
                conn.last_used = Instant::now();
                if conn.metadata.display_mode != display_mode {
                    tracing::debug!(
                        device_id = %device_id,
                        current = ?conn.metadata.display_mode,
                        requested = ?display_mode,
                        "display mode ignored on reuse"
                    );
                }
                tracing::debug!(device_id = %device_id, "reusing connection");
                return Ok(conn.channel.clone());
            }
            tracing::warn!(device_id = %device_id, "connection no longer alive, recreating");
        }
        if let Some(stale) = guard.conn.take() {
            stale.channel.disconnect().await;
        }

        let transport = *guard
            .pinned
            .get_or_insert_with(|| TransportKind::for_device(device_id));
        let plan = ConnectPlan {
            transport,
            display_mode,
        };
        let channel = self
            .connector
            .connect(device_id, &plan)
            .await
            .map_err(|reason| PilotError::DeviceUnreachable {
                device_id: device_id.to_string(),
                reason,
            })?;
        let size = match channel.size().await {
            Ok(size) => size,
            Err(reason) => {
                channel.disconnect().await;
                return Err(PilotError::DeviceUnreachable {
                    device_id: device_id.to_string(),
                    reason: format!("size query failed: {reason}"),
                });
            }
        };

        tracing::info!(
            device_id = %device_id,
            transport = ?transport,
            width = size.width,
            height = size.height,
            "connection created"
        );
        guard.conn = Some(Connection {
            channel: channel.clone(),
            metadata: ConnectionMetadata {
                device_id: device_id.to_string(),
                transport,
                wireless: transport == TransportKind::Wireless,
                size,
                display_mode,
                connected_at: SystemTime::now(),
            },
            last_used: Instant::now(),
            failures: 0,
        });
        Ok(channel)
    }

    /// 断开并遗忘（包括已固定的传输方式）；设备未连接时返回 false
    pub async fn release(&self, device_id: &str) -> bool {
        let Some(slot) = self.existing_slot(device_id) else {
            return false;
        };
        let released = Self::release_slot(device_id, &slot).await;
        self.prune_slot(device_id, slot);
        released
    }

    /// 槽位没有其他持有者时从注册表移除；并发的 acquire 持有克隆时保留
    fn prune_slot(&self, device_id: &str, slot: Arc<AsyncMutex<DeviceSlot>>) {
        let mut slots = match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let idle = slots
            .get(device_id)
            .is_some_and(|held| Arc::ptr_eq(held, &slot) && Arc::strong_count(held) == 2);
        if idle {
            slots.remove(device_id);
        }
    }

    async fn release_slot(device_id: &str, slot: &AsyncMutex<DeviceSlot>) -> bool {
        let mut guard = slot.lock().await;
        guard.pinned = None;
        match guard.conn.take() {
            Some(conn) => {
                conn.channel.disconnect().await;
                tracing::info!(
                    device_id = %device_id,
                    idle_ms = conn.last_used.elapsed().as_millis() as u64,
                    "connection released"
                );
                true
            }
            None => false,
        }
    }

    pub async fn release_all(&self) -> usize {
        let ids: Vec<String> = self.all_slots().into_iter().map(|(id, _)| id).collect();
        let mut released = 0;
        for device_id in ids {
            if self.release(&device_id).await {
                released += 1;
            }
        }
        released
    }

    /// 健康检查：失败计数达到阈值时淘汰连接；未知设备返回 false
    pub async fn health_check(&self, device_id: &str) -> bool {
        let Some(slot) = self.existing_slot(device_id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        let failures = match guard.conn.as_mut() {
            None => return false,
            Some(conn) => {
                if conn.channel.is_alive().await {
                    conn.failures = 0;
                    conn.last_used = Instant::now();
                    return true;
                }
                conn.failures += 1;
                conn.failures
            }
        };
        tracing::warn!(
            device_id = %device_id,
            failures,
            threshold = self.failure_threshold,
            "health check failed"
        );
        if failures >= self.failure_threshold {
            if let Some(conn) = guard.conn.take() {
                conn.channel.disconnect().await;
            }
            tracing::warn!(device_id = %device_id, "connection evicted");
        }
        false
    }

    /// 当前存活连接的设备 id（排序）
    pub async fn list_active(&self) -> Vec<String> {
        let checks = self.all_slots().into_iter().map(|(device_id, slot)| async move {
            let guard = slot.lock().await;
            let alive = match guard.conn.as_ref() {
                Some(conn) => conn.channel.is_alive().await,
                None => false,
            };
            alive.then_some(device_id)
        });
        let mut active: Vec<String> = join_all(checks).await.into_iter().flatten().collect();
        active.sort();
        active
    }

    pub async fn connection_info(&self, device_id: &str) -> Option<ConnectionMetadata> {
        let slot = self.existing_slot(device_id)?;
        let guard = slot.lock().await;
        guard.conn.as_ref().map(|c| c.metadata.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::DeviceSize;
    use crate::device::mock::MockConnector;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// "slow" 设备的建连一直挂起，直到 gate 放行；其余设备立即建连
    struct GatedConnector {
        inner: MockConnector,
        gate: Notify,
    }

    #[async_trait]
    impl DeviceConnector for GatedConnector {
        async fn connect(
            &self,
            device_id: &str,
            plan: &ConnectPlan,
        ) -> Result<Arc<dyn DeviceChannel>, String> {
            if device_id == "slow" {
                self.gate.notified().await;
            }
            self.inner.connect(device_id, plan).await
        }
    }

    fn manager() -> (Arc<MockConnector>, ConnectionManager) {
        let connector = Arc::new(MockConnector::new(DeviceSize::new(1080, 2400)));
        let manager = ConnectionManager::new(connector.clone());
        (connector, manager)
    }

    #[tokio::test]
    async fn test_reuse_returns_same_channel() {
        let (connector, manager) = manager();
        let a = manager.acquire("emulator-5554", DisplayMode::Headless).await.unwrap();
        let b = manager.acquire("emulator-5554", DisplayMode::Preview).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.created(), 1);
        let info = manager.connection_info("emulator-5554").await.unwrap();
        assert_eq!(info.display_mode, DisplayMode::Headless);
        assert_eq!(info.transport, TransportKind::Wired);
        assert!(!info.wireless);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_creates_one_connection() {
        let connector = Arc::new(
            MockConnector::new(DeviceSize::new(1080, 2400))
                .with_connect_delay(Duration::from_millis(20)),
        );
        let manager = Arc::new(ConnectionManager::new(connector.clone()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.acquire("R58N12", DisplayMode::Headless).await })
            })
            .collect();
        let mut channels = Vec::new();
        for h in handles {
            channels.push(h.await.unwrap().unwrap());
        }
        assert_eq!(connector.created(), 1);
        assert!(channels.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_device_does_not_block_other_devices() {
        let connector = Arc::new(GatedConnector {
            inner: MockConnector::new(DeviceSize::new(1080, 2400)),
            gate: Notify::new(),
        });
        let manager = Arc::new(ConnectionManager::new(connector.clone()));

        let m = manager.clone();
        let slow = tokio::spawn(async move { m.acquire("slow", DisplayMode::Headless).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            manager.acquire("fast", DisplayMode::Headless),
        )
        .await
        .expect("fast device waited on slow device");
        assert!(fast.is_ok());
        assert!(!slow.is_finished());
        assert!(manager.connection_info("fast").await.is_some());

        connector.gate.notify_one();
        slow.await.unwrap().unwrap();
        assert_eq!(manager.list_active().await, vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn test_different_devices_get_different_connections() {
        let (connector, manager) = manager();
        let a = manager.acquire("a", DisplayMode::Headless).await.unwrap();
        let b = manager.acquire("10.0.0.2:5555", DisplayMode::Headless).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.created(), 2);
        let plans = connector.plans();
        assert_eq!(plans[1].1.transport, TransportKind::Wireless);
        assert_eq!(manager.list_active().await, vec!["10.0.0.2:5555", "a"]);
    }

    #[tokio::test]
    async fn test_dead_connection_recreated() {
        let (connector, manager) = manager();
        let a = manager.acquire("d", DisplayMode::Headless).await.unwrap();
        let first = connector.last_channel().unwrap();
        first.set_alive(false);
        let b = manager.acquire("d", DisplayMode::Headless).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(first.is_disconnected());
        assert_eq!(connector.created(), 2);
    }

    #[tokio::test]
    async fn test_health_check_evicts_after_threshold() {
        let (connector, manager) = manager();
        let a = manager.acquire("d", DisplayMode::Headless).await.unwrap();
        let mock = connector.last_channel().unwrap();
        mock.set_alive(false);
        assert!(!manager.health_check("d").await);
        assert!(!manager.health_check("d").await);
        assert!(manager.connection_info("d").await.is_some());
        assert!(!manager.health_check("d").await);
        assert!(manager.connection_info("d").await.is_none());
        assert!(manager.list_active().await.is_empty());

        let b = manager.acquire("d", DisplayMode::Headless).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.created(), 2);
    }

    #[tokio::test]
    async fn test_health_success_resets_counter() {
        let (connector, manager) = manager();
        manager.acquire("d", DisplayMode::Headless).await.unwrap();
        let mock = connector.last_channel().unwrap();
        mock.set_alive(false);
        manager.health_check("d").await;
        manager.health_check("d").await;
        mock.set_alive(true);
        assert!(manager.health_check("d").await);
        mock.set_alive(false);
        manager.health_check("d").await;
        manager.health_check("d").await;
        assert!(manager.connection_info("d").await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_device_health_check() {
        let (_, manager) = manager();
        assert!(!manager.health_check("nope").await);
        assert!(!manager.release("nope").await);
    }

    #[tokio::test]
    async fn test_connect_failure_is_device_unreachable() {
        let (connector, manager) = manager();
        connector.set_fail(true);
        let err = match manager.acquire("ghost", DisplayMode::Headless).await {
            Err(e) => e,
            Ok(_) => panic!("expected failure"),
        };
        assert!(matches!(err, PilotError::DeviceUnreachable { ref device_id, .. } if device_id == "ghost"));
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_and_release_all() {
        let (connector, manager) = manager();
        manager.acquire("a", DisplayMode::Headless).await.unwrap();
        manager.acquire("b", DisplayMode::Headless).await.unwrap();
        assert!(manager.release("a").await);
        assert!(connector.channels()[0].is_disconnected());
        assert_eq!(manager.list_active().await, vec!["b"]);
        assert_eq!(manager.release_all().await, 1);
        assert!(manager.list_active().await.is_empty());
        assert!(manager.slots.lock().unwrap().is_empty());
    }
}
