//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PILOT__*` 覆盖（双下划线表示嵌套，如 `PILOT__RUNNER__MAX_STEPS=20`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::action::{
    ActionTranslator, IgnoreOrientation, OrientationPolicy, PackageMap, SwapOnRotatedTap,
    TranslatorTimings,
};
use crate::core::{PilotError, RetryPolicy};
use crate::device::DisplayMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub device: DeviceSection,
    pub runner: RunnerSection,
    pub retry: RetrySection,
    pub translator: TranslatorSection,
    pub apps: AppsSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    #[default]
    File,
}

/// [app] 段：会话存储位置
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default)]
    pub store: StoreKind,
    /// 每个会话一个 JSONL 记录日志
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 截图：<image_dir>/<session>/step_<n>.png
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs/sessions")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("logs/images")
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            log_dir: default_log_dir(),
            image_dir: default_image_dir(),
        }
    }
}

/// [llm] 段：默认 provider、请求超时与各 provider 端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 单次决策超时（秒），ModelConfig.timeout_ms 可覆盖
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 后端瞬时失败的重试次数（含首次）
    #[serde(default = "default_llm_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSection>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_llm_attempts() -> u32 {
    2
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            model: default_model(),
            request_timeout_secs: default_request_timeout(),
            retry_attempts: default_llm_attempts(),
            providers: HashMap::new(),
        }
    }
}

/// [llm.providers.<name>]：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 从该环境变量读取 API Key（api_key 未设置时）
    pub api_key_env: Option<String>,
}

/// [device] 段
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    /// 连续健康检查失败多少次后驱逐连接
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub display_mode: DisplayMode,
    /// 单个 adb 命令超时（秒）
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_failure_threshold() -> u32 {
    crate::device::DEFAULT_FAILURE_THRESHOLD
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            failure_threshold: default_failure_threshold(),
            display_mode: DisplayMode::default(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// INFO 提问的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    AutoReply,
    /// 从标准输入读取
    ManualReply,
    #[default]
    PassToClient,
}

/// [runner] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    /// 会话总步数上限（含恢复前的步骤）
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// 执行动作后、下一次截图前的等待（毫秒）
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub reply_mode: ReplyMode,
}

fn default_max_steps() -> usize {
    40
}

fn default_settle_delay_ms() -> u64 {
    2000
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            settle_delay_ms: default_settle_delay_ms(),
            reply_mode: ReplyMode::default(),
        }
    }
}

/// [retry.*]：有界重试
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_execution_retry")]
    pub execution: RetryConfig,
    #[serde(default = "default_screenshot_retry")]
    pub screenshot: RetryConfig,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            execution: default_execution_retry(),
            screenshot: default_screenshot_retry(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.backoff_ms))
    }
}

fn default_execution_retry() -> RetryConfig {
    RetryConfig {
        attempts: 3,
        backoff_ms: 500,
    }
}

fn default_screenshot_retry() -> RetryConfig {
    RetryConfig {
        attempts: 10,
        backoff_ms: 500,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationMode {
    #[default]
    Ignore,
    /// 横屏时 CLICK 交换宽高（部分后端的坐标约定）
    SwapOnRotatedTap,
}

/// [translator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct TranslatorSection {
    #[serde(default)]
    pub orientation: OrientationMode,
    #[serde(default = "default_focus_delay")]
    pub type_focus_delay_ms: u64,
    #[serde(default = "default_launch_delay")]
    pub app_launch_delay_ms: u64,
    #[serde(default = "default_scroll_duration")]
    pub scroll_duration_ms: u64,
    /// AWAKE 前先强制停止应用
    #[serde(default)]
    pub restart_app: bool,
}

fn default_focus_delay() -> u64 {
    1000
}

fn default_launch_delay() -> u64 {
    1000
}

fn default_scroll_duration() -> u64 {
    1200
}

impl Default for TranslatorSection {
    fn default() -> Self {
        Self {
            orientation: OrientationMode::default(),
            type_focus_delay_ms: default_focus_delay(),
            app_launch_delay_ms: default_launch_delay(),
            scroll_duration_ms: default_scroll_duration(),
            restart_app: false,
        }
    }
}

/// [apps] 段：额外的应用名 → 包名映射文件（TOML，[packages] 表）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppsSection {
    pub package_map: Option<PathBuf>,
}

impl AppConfig {
    /// 按 [translator] 与 [apps] 构建翻译器
    pub fn build_translator(&self) -> Result<ActionTranslator, PilotError> {
        let mut packages = PackageMap::builtin();
        if let Some(path) = &self.apps.package_map {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| PilotError::Config(format!("read {}: {}", path.display(), e)))?;
            packages = packages.merge_toml(&raw)?;
        }
        let policy: Arc<dyn OrientationPolicy> = match self.translator.orientation {
            OrientationMode::Ignore => Arc::new(IgnoreOrientation),
            OrientationMode::SwapOnRotatedTap => Arc::new(SwapOnRotatedTap),
        };
        let t = &self.translator;
        let timings = TranslatorTimings {
            type_focus_delay_ms: t.type_focus_delay_ms,
            app_launch_delay_ms: t.app_launch_delay_ms,
            scroll_duration_ms: t.scroll_duration_ms,
            restart_app: t.restart_app,
            ..TranslatorTimings::default()
        };
        Ok(ActionTranslator::new(Arc::new(packages))
            .with_orientation_policy(policy)
            .with_timings(timings))
    }
}

/// 从 config 目录加载配置，环境变量 PILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
