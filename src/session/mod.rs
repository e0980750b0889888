// 会话状态机：收集文件 -> 输入书名 -> 生成 -> 清理

pub mod store;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::config::MergerConfig;
use crate::error::{RejectionReason, TitleError};

pub use store::SessionStore;

/// 文件名中不允许出现的字符，书名中的这些字符会被直接去掉
pub const FORBIDDEN_TITLE_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// 用户标识（对本模块不透明）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 可安全用于文件名的形式
    pub fn file_component(&self) -> String {
        let component: String = self
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        if component.is_empty() {
            "anonymous".to_string()
        } else {
            component
        }
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// 还没有文件
    Idle,
    /// 已收到至少一个文件
    Collecting,
    /// 已触发合并，等待书名
    AwaitingTitle,
    /// 书名已接受，正在合并
    Completed,
    /// 已取消
    Cancelled,
}

/// 已保存到临时目录的源文档
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// 用户上传时的文件名
    pub name: String,
    pub path: PathBuf,
    pub submitted_at: DateTime<Utc>,
}

/// 书名规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRules {
    pub max_chars: usize,
    /// 输出扩展名，例如 `.fb2`
    pub extension: String,
}

impl From<&MergerConfig> for TitleRules {
    fn from(config: &MergerConfig) -> Self {
        Self {
            max_chars: config.max_title_chars,
            extension: config.file_extension.clone(),
        }
    }
}

/// 通过校验的书名
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedTitle {
    /// 交付给用户的文件名，带扩展名
    pub file_name: String,
    /// 写入 book-title 的书名，不带扩展名
    pub book_title: String,
}

/// 校验并清理书名
///
/// 1. 去掉首尾空白后不能为空，且不超过 `max_chars` 个字符
/// 2. 去掉文件系统不允许的字符和控制字符
/// 3. 缺少扩展名时补上一次
///
/// # 参数
/// - `text`: 用户输入的原始文本
/// - `rules`: 书名规则
pub fn sanitize_title(text: &str, rules: &TitleRules) -> Result<AcceptedTitle, TitleError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(TitleError::Empty);
    }

    let length = trimmed.chars().count();
    if length > rules.max_chars {
        return Err(TitleError::TooLong {
            max: rules.max_chars,
            actual: length,
        });
    }

    let cleaned: String = trimmed
        .chars()
        .filter(|c| !FORBIDDEN_TITLE_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim();

    let extension = rules.extension.as_str();
    let has_extension = !extension.is_empty()
        && cleaned.len() >= extension.len()
        && cleaned
            .get(cleaned.len() - extension.len()..)
            .is_some_and(|tail| tail.eq_ignore_ascii_case(extension));

    let book_title = if has_extension {
        cleaned[..cleaned.len() - extension.len()].trim_end()
    } else {
        cleaned
    };
    // 全部由非法字符组成的书名
    if book_title.is_empty() {
        return Err(TitleError::Empty);
    }

    let file_name = if has_extension {
        cleaned.to_string()
    } else {
        format!("{cleaned}{extension}")
    };

    Ok(AcceptedTitle {
        file_name,
        book_title: book_title.to_string(),
    })
}

/// 单个用户的会话
#[derive(Debug)]
pub struct UserSession {
    user: UserId,
    state: SessionState,
    documents: Vec<SourceDocument>,
    /// 本轮会话开始的时间
    opened_at: DateTime<Utc>,
}

impl UserSession {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            state: SessionState::Idle,
            documents: Vec::new(),
            opened_at: Utc::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn documents(&self) -> &[SourceDocument] {
        &self.documents
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle && self.documents.is_empty()
    }

    /// 追加一个源文档
    ///
    /// Idle/Collecting -> Collecting；等待书名时追加的文件同样参与本次合并
    ///
    /// # 返回
    /// 当前待合并的文件数
    pub fn submit_document(&mut self, document: SourceDocument) -> Result<usize, RejectionReason> {
        match self.state {
            SessionState::Idle | SessionState::Collecting => {
                self.state = SessionState::Collecting;
            }
            SessionState::AwaitingTitle => {}
            SessionState::Completed | SessionState::Cancelled => {
                return Err(RejectionReason::SessionUnavailable(format!(
                    "会话处于 {:?} 状态",
                    self.state
                )));
            }
        }
        self.documents.push(document);
        Ok(self.documents.len())
    }

    /// 触发合并：Collecting -> AwaitingTitle
    ///
    /// 没有待合并文件时拒绝，状态不变。重复触发保持 AwaitingTitle。
    pub fn begin_merge(&mut self) -> Result<usize, RejectionReason> {
        if self.documents.is_empty() {
            return Err(RejectionReason::EmptySession);
        }
        match self.state {
            SessionState::Collecting | SessionState::AwaitingTitle => {
                self.state = SessionState::AwaitingTitle;
                Ok(self.documents.len())
            }
            _ => Err(RejectionReason::EmptySession),
        }
    }

    /// 提交书名：AwaitingTitle -> Completed
    ///
    /// 校验失败时状态保持 AwaitingTitle，可以重新提交
    pub fn submit_title(&mut self, text: &str, rules: &TitleRules) -> Result<AcceptedTitle, RejectionReason> {
        if self.state != SessionState::AwaitingTitle {
            return Err(RejectionReason::NotAwaitingTitle);
        }
        let accepted = sanitize_title(text, rules).inspect_err(|e| {
            tracing::debug!(user = %self.user, error = %e, "title rejected");
        })?;
        self.state = SessionState::Completed;
        tracing::debug!(
            user = %self.user,
            title = %accepted.book_title,
            documents = self.documents.len(),
            elapsed_secs = (Utc::now() - self.opened_at).num_seconds(),
            "title accepted"
        );
        Ok(accepted)
    }

    /// 取出全部待合并文件，按提交顺序
    pub fn take_documents(&mut self) -> Vec<SourceDocument> {
        std::mem::take(&mut self.documents)
    }

    /// 取消：任意非终止状态 -> Cancelled
    ///
    /// # 返回
    /// 被丢弃的文件，调用方负责删除
    pub fn cancel(&mut self) -> Vec<SourceDocument> {
        if self.state != SessionState::Completed {
            self.state = SessionState::Cancelled;
        }
        self.take_documents()
    }

    /// 回到 Idle，开始一个新的会话
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.documents.clear();
        self.opened_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> TitleRules {
        TitleRules {
            max_chars: 100,
            extension: ".fb2".to_string(),
        }
    }

    fn document(name: &str) -> SourceDocument {
        SourceDocument {
            name: name.to_string(),
            path: PathBuf::from(format!("/tmp/{name}")),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_forbidden_chars_stripped() {
        let title = sanitize_title(r#"a\b/c*d?e:f"g<h>i|j"#, &rules()).unwrap();
        assert_eq!(title.file_name, "abcdefghij.fb2");
        assert_eq!(title.book_title, "abcdefghij");
    }

    #[test]
    fn test_extension_appended_once() {
        assert_eq!(sanitize_title("Combo", &rules()).unwrap().file_name, "Combo.fb2");
        assert_eq!(sanitize_title("Combo.fb2", &rules()).unwrap().file_name, "Combo.fb2");
        let upper = sanitize_title("Combo.FB2", &rules()).unwrap();
        assert_eq!(upper.file_name, "Combo.FB2");
        assert_eq!(upper.book_title, "Combo");
    }

    #[test]
    fn test_empty_and_blank_rejected() {
        assert_eq!(sanitize_title("", &rules()), Err(TitleError::Empty));
        assert_eq!(sanitize_title("   \n", &rules()), Err(TitleError::Empty));
        assert_eq!(sanitize_title("???", &rules()), Err(TitleError::Empty));
        assert_eq!(sanitize_title(".fb2", &rules()), Err(TitleError::Empty));
    }

    #[test]
    fn test_length_limit_counts_chars() {
        let exact = "я".repeat(100);
        assert!(sanitize_title(&exact, &rules()).is_ok());

        let long = "я".repeat(101);
        assert_eq!(
            sanitize_title(&long, &rules()),
            Err(TitleError::TooLong { max: 100, actual: 101 })
        );
    }

    #[test]
    fn test_surrounding_whitespace_not_counted() {
        let padded = format!("  {}  ", "a".repeat(100));
        assert!(sanitize_title(&padded, &rules()).is_ok());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut session = UserSession::new(UserId::from(1_i64));
        assert_eq!(session.state(), SessionState::Idle);

        assert_eq!(session.submit_document(document("a.fb2")).unwrap(), 1);
        assert_eq!(session.state(), SessionState::Collecting);
        assert_eq!(session.submit_document(document("b.fb2")).unwrap(), 2);

        assert_eq!(session.begin_merge().unwrap(), 2);
        assert_eq!(session.state(), SessionState::AwaitingTitle);

        let title = session.submit_title("Combo", &rules()).unwrap();
        assert_eq!(title.file_name, "Combo.fb2");
        assert_eq!(session.state(), SessionState::Completed);

        let docs = session.take_documents();
        assert_eq!(docs[0].name, "a.fb2");
        assert_eq!(docs[1].name, "b.fb2");

        session.reset();
        assert!(session.is_idle());
    }

    #[test]
    fn test_begin_merge_without_documents() {
        let mut session = UserSession::new(UserId::from(1_i64));
        assert_eq!(session.begin_merge(), Err(RejectionReason::EmptySession));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_invalid_title_keeps_awaiting() {
        let mut session = UserSession::new(UserId::from(1_i64));
        session.submit_document(document("a.fb2")).unwrap();
        session.begin_merge().unwrap();

        let err = session.submit_title("x".repeat(101).as_str(), &rules()).unwrap_err();
        assert!(matches!(err, RejectionReason::InvalidTitle(TitleError::TooLong { .. })));
        assert_eq!(session.state(), SessionState::AwaitingTitle);
        assert_eq!(session.documents().len(), 1);

        assert!(session.submit_title("ok", &rules()).is_ok());
    }

    #[test]
    fn test_title_before_merge_rejected() {
        let mut session = UserSession::new(UserId::from(1_i64));
        session.submit_document(document("a.fb2")).unwrap();
        assert_eq!(
            session.submit_title("Combo", &rules()),
            Err(RejectionReason::NotAwaitingTitle)
        );
        assert_eq!(session.state(), SessionState::Collecting);
    }

    #[test]
    fn test_document_while_awaiting_title_joins_merge() {
        let mut session = UserSession::new(UserId::from(1_i64));
        session.submit_document(document("a.fb2")).unwrap();
        session.begin_merge().unwrap();
        assert_eq!(session.submit_document(document("b.fb2")).unwrap(), 2);
        assert_eq!(session.state(), SessionState::AwaitingTitle);
    }

    #[test]
    fn test_cancel_discards_documents() {
        let mut session = UserSession::new(UserId::from(1_i64));
        session.submit_document(document("a.fb2")).unwrap();
        session.begin_merge().unwrap();

        let discarded = session.cancel();
        assert_eq!(discarded.len(), 1);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(session.documents().is_empty());
    }

    #[test]
    fn test_user_id_file_component() {
        assert_eq!(UserId::from(-5_i64).file_component(), "-5");
        assert_eq!(UserId::from("a/b c").file_component(), "a_b_c");
        assert_eq!(UserId::from("").file_component(), "anonymous");
    }
}
