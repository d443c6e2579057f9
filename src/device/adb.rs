//! adb 传输适配：以 adb 子进程实现 DeviceChannel / DeviceConnector
//!
//! 每条命令都带超时并在 drop 时杀掉子进程；输出解析（wm size、dumpsys input、adb devices、PNG 头）
//! 为纯函数，便于单测。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use super::channel::{ConnectPlan, DeviceChannel, DeviceConnector, DisplayMode, Frame, TransportKind};
use crate::action::{DeviceSize, Orientation, PixelPoint};

async fn run_adb(adb: &Path, args: &[&str], limit: Duration) -> Result<Vec<u8>, String> {
    let mut cmd = Command::new(adb);
    cmd.args(args).kill_on_drop(true);
    let output = match timeout(limit, cmd.output()).await {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => return Err(format!("spawn {}: {}", adb.display(), e)),
        Err(_) => {
            return Err(format!(
                "adb {} timed out after {}s",
                args.join(" "),
                limit.as_secs()
            ))
        }
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("adb {} failed: {}", args.join(" "), stderr.trim()));
    }
    Ok(output.stdout)
}

/// 通过 adb 驱动的一台设备
pub struct AdbChannel {
    adb: PathBuf,
    serial: String,
    transport: TransportKind,
    command_timeout: Duration,
    disconnected: AtomicBool,
}

impl AdbChannel {
    pub fn new(adb: PathBuf, serial: &str, transport: TransportKind, command_timeout: Duration) -> Self {
        Self {
            adb,
            serial: serial.to_string(),
            transport,
            command_timeout,
            disconnected: AtomicBool::new(false),
        }
    }

    async fn shell(&self, args: &[&str]) -> Result<String, String> {
        let mut full = vec!["-s", self.serial.as_str(), "shell"];
        full.extend_from_slice(args);
        let out = run_adb(&self.adb, &full, self.command_timeout).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn input(&self, args: &[&str]) -> Result<(), String> {
        let mut full = vec!["input"];
        full.extend_from_slice(args);
        self.shell(&full).await.map(|_| ())
    }
}

#[async_trait]
impl DeviceChannel for AdbChannel {
    async fn tap(&self, point: PixelPoint) -> Result<(), String> {
        let (x, y) = (point.x.to_string(), point.y.to_string());
        self.input(&["tap", &x, &y]).await
    }

    async fn swipe(&self, from: PixelPoint, to: PixelPoint, duration_ms: u64) -> Result<(), String> {
        let args = [
            from.x.to_string(),
            from.y.to_string(),
            to.x.to_string(),
            to.y.to_string(),
            duration_ms.to_string(),
        ];
        let mut full = vec!["swipe"];
        full.extend(args.iter().map(String::as_str));
        self.input(&full).await
    }

    /// 原地 swipe 即长按
    async fn long_press(&self, point: PixelPoint, duration_ms: u64) -> Result<(), String> {
        self.swipe(point, point, duration_ms).await
    }

    /// ASCII 走 `input text`；其余文本交给设备上的 yadb 键盘注入，缺少 yadb 时报错
    async fn inject_text(&self, text: &str) -> Result<(), String> {
        if text.is_ascii() {
            let escaped = escape_input_text(text);
            return self.input(&["text", &escaped]).await;
        }
        let args = yadb_keyboard_args(text);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.shell(&args).await?;
        if yadb_failed(&out) {
            return Err(format!(
                "yadb keyboard unavailable on {} (push it to {}): {}",
                self.serial,
                YADB_PATH,
                out.trim()
            ));
        }
        Ok(())
    }

    async fn press_key(&self, keycode: u32) -> Result<(), String> {
        self.input(&["keyevent", &keycode.to_string()]).await
    }

    async fn start_app(&self, package: &str) -> Result<(), String> {
        let out = self
            .shell(&[
                "monkey",
                "-p",
                package,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ])
            .await?;
        if out.contains("No activities found") {
            return Err(format!("no launchable activity in {package}"));
        }
        Ok(())
    }

    async fn stop_app(&self, package: &str) -> Result<(), String> {
        self.shell(&["am", "force-stop", package]).await.map(|_| ())
    }

    async fn screenshot(&self) -> Result<Option<Frame>, String> {
        let png = run_adb(
            &self.adb,
            &["-s", &self.serial, "exec-out", "screencap", "-p"],
            self.command_timeout,
        )
        .await?;
        let Some(size) = png_size(&png) else {
            return Ok(None);
        };
        Ok(Some(Frame { png, size }))
    }

    async fn size(&self) -> Result<DeviceSize, String> {
        let out = self.shell(&["wm", "size"]).await?;
        parse_wm_size(&out).ok_or_else(|| format!("unrecognized wm size output: {}", out.trim()))
    }

    async fn orientation(&self) -> Result<Orientation, String> {
        let out = self.shell(&["dumpsys", "input"]).await?;
        Ok(parse_orientation(&out).unwrap_or_default())
    }

    async fn is_alive(&self) -> bool {
        if self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        match run_adb(&self.adb, &["-s", &self.serial, "get-state"], self.command_timeout).await {
            Ok(out) => String::from_utf8_lossy(&out).trim() == "device",
            Err(_) => false,
        }
    }

    async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.transport == TransportKind::Wireless {
            if let Err(e) = run_adb(&self.adb, &["disconnect", &self.serial], self.command_timeout).await {
                tracing::debug!(serial = %self.serial, error = %e, "adb disconnect failed");
            }
        }
    }
}

/// 建立 adb 通道；无线设备先执行 adb connect
pub struct AdbConnector {
    adb: PathBuf,
    command_timeout: Duration,
}

impl AdbConnector {
    pub fn new(adb: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            adb: adb.into(),
            command_timeout,
        }
    }
}

#[async_trait]
impl DeviceConnector for AdbConnector {
    async fn connect(&self, device_id: &str, plan: &ConnectPlan) -> Result<Arc<dyn DeviceChannel>, String> {
        if plan.transport == TransportKind::Wireless {
            let out = run_adb(&self.adb, &["connect", device_id], self.command_timeout).await?;
            let text = String::from_utf8_lossy(&out);
            if !text.contains("connected") {
                return Err(format!("adb connect {device_id}: {}", text.trim()));
            }
        }
        if plan.display_mode == DisplayMode::Preview {
            tracing::info!(device_id = %device_id, "adb channel has no preview window, running headless");
        }
        let channel = AdbChannel::new(self.adb.clone(), device_id, plan.transport, self.command_timeout);
        if !channel.is_alive().await {
            return Err(format!("device {device_id} is not in 'device' state"));
        }
        Ok(Arc::new(channel))
    }
}

/// `adb devices` 中状态为 device 的序列号
pub async fn list_devices(adb: &Path, limit: Duration) -> Result<Vec<String>, String> {
    let out = run_adb(adb, &["devices"], limit).await?;
    Ok(parse_devices(&String::from_utf8_lossy(&out)))
}

pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            (parts.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

/// 优先 Override size，其次 Physical size
pub fn parse_wm_size(output: &str) -> Option<DeviceSize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(Physical|Override) size:\s*(\d+)x(\d+)").unwrap_or_else(|_| unreachable!())
    });
    let mut physical = None;
    let mut overridden = None;
    for cap in re.captures_iter(output) {
        let size = DeviceSize::new(cap[2].parse().ok()?, cap[3].parse().ok()?);
        if &cap[1] == "Override" {
            overridden = Some(size);
        } else {
            physical = Some(size);
        }
    }
    overridden.or(physical)
}

pub fn parse_orientation(dumpsys: &str) -> Option<Orientation> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"orientation=(\d)").unwrap_or_else(|_| unreachable!()));
    let cap = re.captures(dumpsys)?;
    cap[1].parse::<u8>().ok().map(Orientation::from_index)
}

/// 从 PNG IHDR 读宽高；不是 PNG 时返回 None
pub fn png_size(bytes: &[u8]) -> Option<DeviceSize> {
    const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    if bytes.len() < 24 || bytes[..8] != SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some(DeviceSize::new(width, height))
}

const YADB_PATH: &str = "/data/local/tmp/yadb";

/// yadb 注入任意 UTF-8 文本的 shell 参数；文本整体单引号包裹，换行与制表符换成空格
pub fn yadb_keyboard_args(text: &str) -> Vec<String> {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .collect();
    vec![
        "app_process".to_string(),
        format!("-Djava.class.path={YADB_PATH}"),
        "/data/local/tmp".to_string(),
        "com.ysbing.yadb.Main".to_string(),
        "-keyboard".to_string(),
        format!("'{}'", flat.replace('\'', "'\\''")),
    ]
}

/// app_process 找不到类时退出码常为 0，只能看输出
pub fn yadb_failed(output: &str) -> bool {
    output.contains("ClassNotFoundException")
        || output.contains("Unable to find class")
        || output.contains("Error:")
}

/// `input text` 的转义：空格写作 %s，shell 元字符加反斜杠
pub fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '\\' | '"' | '\'' | '`' | '$' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*' | '?'
            | '~' | '#' | '!' | '%' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let out = "* daemon started *\nList of devices attached\nR58N12ABC\tdevice\n192.168.1.5:5555\tdevice\nemulator-5556\toffline\n\n";
        assert_eq!(parse_devices(out), vec!["R58N12ABC", "192.168.1.5:5555"]);
    }

    #[test]
    fn test_parse_wm_size_prefers_override() {
        assert_eq!(
            parse_wm_size("Physical size: 1080x2400\n"),
            Some(DeviceSize::new(1080, 2400))
        );
        assert_eq!(
            parse_wm_size("Physical size: 1440x3200\nOverride size: 1080x2400\n"),
            Some(DeviceSize::new(1080, 2400))
        );
        assert_eq!(parse_wm_size("error"), None);
    }

    #[test]
    fn test_parse_orientation() {
        let dump = "  Viewport INTERNAL: displayId=0, orientation=1, logicalFrame=[0, 0, 2400, 1080]";
        assert_eq!(parse_orientation(dump), Some(Orientation::Rotation90));
        assert_eq!(parse_orientation("nothing"), None);
    }

    #[test]
    fn test_png_size() {
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13];
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&1080u32.to_be_bytes());
        png.extend_from_slice(&2400u32.to_be_bytes());
        assert_eq!(png_size(&png), Some(DeviceSize::new(1080, 2400)));
        assert_eq!(png_size(b"not a png"), None);
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
    }

    #[test]
    fn test_yadb_args_quote_utf8_text() {
        let args = yadb_keyboard_args("你好\n世界 it's");
        assert_eq!(args[0], "app_process");
        assert_eq!(args[4], "-keyboard");
        assert_eq!(args[5], "'你好 世界 it'\\''s'");
    }

    #[test]
    fn test_yadb_failure_detected() {
        assert!(yadb_failed(
            "Exception in thread \"main\" java.lang.ClassNotFoundException: com.ysbing.yadb.Main"
        ));
        assert!(!yadb_failed(""));
    }
}
