//! 应用名解析：AWAKE 的应用名 → 包名
//!
//! 内置常用应用表，可由 TOML 文件（[packages] 段）追加或覆盖；匹配不区分大小写。
//! 已经是包名形式（如 com.example.app）的输入原样放行。

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::core::PilotError;

/// 应用名解析能力
pub trait AppResolver: Send + Sync {
    fn resolve(&self, app_name: &str) -> Option<String>;
}

const BUILTIN: &[(&str, &str)] = &[
    ("微信", "com.tencent.mm"),
    ("wechat", "com.tencent.mm"),
    ("qq", "com.tencent.mobileqq"),
    ("支付宝", "com.eg.android.AlipayGphone"),
    ("alipay", "com.eg.android.AlipayGphone"),
    ("淘宝", "com.taobao.taobao"),
    ("京东", "com.jingdong.app.mall"),
    ("拼多多", "com.xunmeng.pinduoduo"),
    ("美团", "com.sankuai.meituan"),
    ("饿了么", "me.ele"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("小红书", "com.xingin.xhs"),
    ("哔哩哔哩", "tv.danmaku.bili"),
    ("bilibili", "tv.danmaku.bili"),
    ("微博", "com.sina.weibo"),
    ("知乎", "com.zhihu.android"),
    ("网易云音乐", "com.netease.cloudmusic"),
    ("高德地图", "com.autonavi.minimap"),
    ("百度地图", "com.baidu.BaiduMap"),
    ("携程", "ctrip.android.view"),
    ("设置", "com.android.settings"),
    ("settings", "com.android.settings"),
    ("chrome", "com.android.chrome"),
];

#[derive(Debug, Deserialize)]
struct PackageFile {
    #[serde(default)]
    packages: HashMap<String, String>,
}

/// 应用名 → 包名表
#[derive(Debug, Clone)]
pub struct PackageMap {
    entries: HashMap<String, String>,
}

impl PackageMap {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// 内置常用应用
    pub fn builtin() -> Self {
        let mut map = Self::empty();
        for (name, package) in BUILTIN {
            map.insert(name, package);
        }
        map
    }

    pub fn insert(&mut self, app_name: &str, package: &str) {
        self.entries
            .insert(key(app_name), package.trim().to_string());
    }

    /// 在内置表基础上合并 TOML 文件中的 [packages]
    pub fn from_file(path: &Path) -> Result<Self, PilotError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PilotError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::builtin().merge_toml(&raw)
    }

    pub fn merge_toml(mut self, raw: &str) -> Result<Self, PilotError> {
        let file: PackageFile =
            toml::from_str(raw).map_err(|e| PilotError::Config(format!("package map: {e}")))?;
        for (name, package) in &file.packages {
            self.insert(name, package);
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PackageMap {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AppResolver for PackageMap {
    fn resolve(&self, app_name: &str) -> Option<String> {
        let name = app_name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(pkg) = self.entries.get(&key(name)) {
            return Some(pkg.clone());
        }
        looks_like_package(name).then(|| name.to_string())
    }
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// 至少两段、每段以字母开头、只含字母数字下划线
fn looks_like_package(name: &str) -> bool {
    let segments: Vec<&str> = name.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|s| {
            s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_case_insensitive() {
        let map = PackageMap::builtin();
        assert_eq!(map.resolve("微信").as_deref(), Some("com.tencent.mm"));
        assert_eq!(map.resolve("WeChat").as_deref(), Some("com.tencent.mm"));
        assert_eq!(map.resolve(" Bilibili ").as_deref(), Some("tv.danmaku.bili"));
    }

    #[test]
    fn test_package_name_passes_through() {
        let map = PackageMap::empty();
        assert_eq!(
            map.resolve("com.example.shop").as_deref(),
            Some("com.example.shop")
        );
        assert_eq!(map.resolve("Foo"), None);
        assert_eq!(map.resolve("1.2"), None);
    }

    #[test]
    fn test_merge_toml_overrides() {
        let map = PackageMap::builtin()
            .merge_toml("[packages]\n\"微信\" = \"com.tencent.mm.beta\"\n\"Notes\" = \"com.example.notes\"\n")
            .unwrap();
        assert_eq!(map.resolve("微信").as_deref(), Some("com.tencent.mm.beta"));
        assert_eq!(map.resolve("notes").as_deref(), Some("com.example.notes"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.toml");
        std::fs::write(&path, "[packages]\nTodo = \"org.todo\"\n").unwrap();
        let map = PackageMap::from_file(&path).unwrap();
        assert_eq!(map.resolve("TODO").as_deref(), Some("org.todo"));
        assert!(PackageMap::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
