use serde::Serialize;
use thiserror::Error;

/// 标题校验失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TitleError {
    #[error("标题不能为空")]
    Empty,
    #[error("标题过长 (最多 {max} 个字符, 实际 {actual})")]
    TooLong { max: usize, actual: usize },
}

/// 对外接口的拒绝原因
///
/// 除 `AssemblyFailure` 外，所有拒绝都不会改变会话状态
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectionReason {
    #[error("仅支持 FB2 文件: {name} ({mime})")]
    UnsupportedFormat { name: String, mime: String },
    #[error("请先发送文件")]
    EmptySession,
    #[error("标题无效: {0}")]
    InvalidTitle(#[from] TitleError),
    #[error("当前没有等待标题的合并")]
    NotAwaitingTitle,
    #[error("保存文件失败: {0}")]
    Storage(String),
    #[error("生成书籍失败: {0}")]
    AssemblyFailure(String),
    #[error("会话不可用: {0}")]
    SessionUnavailable(String),
}

/// 临时文件存储错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("路径不在上传目录内: {0}")]
    OutsideUploadDir(String),
}

impl From<StorageError> for RejectionReason {
    fn from(err: StorageError) -> Self {
        RejectionReason::Storage(err.to_string())
    }
}

/// 配置加载错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("配置文件格式错误: {0}")]
    Toml(#[from] toml::de::Error),
}
