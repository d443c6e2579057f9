//! 设备层：通道抽象、连接管理、原语执行、adb 适配与测试替身

pub mod adb;
pub mod channel;
pub mod executor;
pub mod manager;
pub mod mock;

pub use adb::{list_devices, AdbChannel, AdbConnector};
pub use channel::{
    ConnectPlan, ConnectionMetadata, DeviceChannel, DeviceConnector, DisplayMode, Frame,
    TransportKind,
};
pub use executor::ActionExecutor;
pub use manager::{ConnectionManager, DEFAULT_FAILURE_THRESHOLD};
pub use mock::{MockChannel, MockConnector};
