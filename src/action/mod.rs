//! 动作层：坐标模型、规范动作、后端词表归一化、应用名解析、动作 → 设备原语翻译

pub mod apps;
pub mod coords;
pub mod normalize;
pub mod translate;
pub mod types;

pub use apps::{AppResolver, PackageMap};
pub use coords::{DeviceSize, FixedPoint, NormalizedPoint, Orientation, PixelPoint, Point};
pub use normalize::normalize_backend_action;
pub use translate::{
    ActionTranslator, IgnoreOrientation, OrientationPolicy, PrimitiveCall, SwapOnRotatedTap,
    TranslatorTimings,
};
pub use types::{Action, ClosableRegion, Decision, Direction, HotKey};
