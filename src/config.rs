use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// 上传目录的环境变量
pub const ENV_UPLOAD_DIR: &str = "FB2_MERGER_UPLOAD_DIR";
/// 默认书名的环境变量
pub const ENV_DEFAULT_TITLE: &str = "FB2_MERGER_DEFAULT_TITLE";

/// 合并器配置
///
/// 所有字段都有默认值，配置文件可以只写需要改的项
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergerConfig {
    /// 临时文件目录（上传的源文件和生成的结果）
    pub upload_dir: PathBuf,
    /// 源文件缺少标题时使用的占位标题
    pub default_title: String,
    /// 书名最大字符数
    pub max_title_chars: usize,
    /// 输出文件扩展名
    pub file_extension: String,
    /// 认可的 FB2 媒体类型
    pub accepted_mime: String,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            default_title: "Untitled".to_string(),
            max_title_chars: 100,
            file_extension: ".fb2".to_string(),
            accepted_mime: "application/x-fictionbook+xml".to_string(),
        }
    }
}

impl MergerConfig {
    /// 加载配置
    ///
    /// # 参数
    /// - `path`: TOML 配置文件路径，文件不存在时使用默认值
    ///
    /// # 返回
    /// 合并了环境变量覆盖后的配置
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_toml(&fs::read_to_string(p)?)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// 从 TOML 文本解析配置
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_UPLOAD_DIR).ok(),
            std::env::var(ENV_DEFAULT_TITLE).ok(),
        );
    }

    fn apply_overrides(&mut self, upload_dir: Option<String>, default_title: Option<String>) {
        if let Some(dir) = upload_dir.filter(|d| !d.trim().is_empty()) {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(title) = default_title.filter(|t| !t.trim().is_empty()) {
            self.default_title = title;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MergerConfig::default();
        assert_eq!(config.default_title, "Untitled");
        assert_eq!(config.max_title_chars, 100);
        assert_eq!(config.file_extension, ".fb2");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MergerConfig::from_toml("max_title_chars = 40\n").unwrap();
        assert_eq!(config.max_title_chars, 40);
        assert_eq!(config.default_title, "Untitled");
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(MergerConfig::from_toml("bot_token = \"x\"\n").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = MergerConfig::default();
        config.apply_overrides(Some("/tmp/fb2".to_string()), Some("  ".to_string()));
        assert_eq!(config.upload_dir, PathBuf::from("/tmp/fb2"));
        assert_eq!(config.default_title, "Untitled");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MergerConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.max_title_chars, 100);
    }
}
