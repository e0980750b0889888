// FB2 合并器核心：解析 -> 重映射资源 -> 拼接正文 -> 组装，外加按用户划分的会话状态机

pub mod config;
pub mod error;
pub mod logging;
pub mod merge;
pub mod parser;
pub mod service;
pub mod session;
pub mod storage;

// 重新导出主要类型
pub use config::MergerConfig;
pub use error::{RejectionReason, StorageError, TitleError};
pub use merge::{merge_documents, MergeReport, MergedBook};
pub use parser::{BinaryResource, Fb2Parser, ParseDegradation, ParsedDocument};
pub use service::{CancelAck, MergeAck, MergeService, MergedFile};
pub use session::{SessionState, UserId};
