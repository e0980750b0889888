// 合并服务：对传输层暴露的入口
// 同一用户的操作串行执行，合并结束后无论成败都会清理临时文件

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

use crate::config::MergerConfig;
use crate::error::{RejectionReason, StorageError};
use crate::merge::{self, MergeReport};
use crate::parser::{self, Fb2Parser, ParseDegradation, ParsedDocument};
use crate::session::{
    AcceptedTitle, SessionState, SessionStore, SourceDocument, TitleRules, UserId,
    FORBIDDEN_TITLE_CHARS,
};
use crate::storage::UploadStore;
use chrono::Utc;

/// 触发合并后的确认，附带书名规则供传输层提示用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeAck {
    pub pending: usize,
    pub max_title_chars: usize,
    pub forbidden_chars: String,
}

/// 取消后的确认
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelAck {
    /// 被丢弃的文件数
    pub discarded: usize,
}

/// 生成的书
///
/// 传输层读取并发送后调用 [`MergedFile::dispose`]；
/// 即使忘记调用，drop 时也会删除文件
#[derive(Debug)]
pub struct MergedFile {
    path: PathBuf,
    file_name: String,
    report: MergeReport,
    disposed: bool,
}

impl MergedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 交付给用户的文件名（已清理，带扩展名）
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn report(&self) -> &MergeReport {
        &self.report
    }

    pub async fn read(&self) -> Result<Vec<u8>, StorageError> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    /// 删除生成的文件
    pub async fn dispose(mut self) -> Result<(), StorageError> {
        self.disposed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for MergedFile {
    /// 未调用 `dispose` 时的兜底删除
    ///
    /// 在运行时线程上也是同步删除：drop 返回时文件一定已经不存在
    fn drop(&mut self) {
        if !self.disposed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 合并服务
pub struct MergeService {
    config: MergerConfig,
    rules: TitleRules,
    parser: Fb2Parser,
    uploads: UploadStore,
    sessions: SessionStore,
}

impl MergeService {
    /// 创建服务
    ///
    /// 打开上传目录并清理上次运行遗留的文件
    pub async fn new(config: MergerConfig) -> Result<Self, StorageError> {
        let uploads = UploadStore::open(&config.upload_dir, &config.file_extension).await?;
        let sessions = SessionStore::new();

        let cleaned = uploads.sweep_orphans(&sessions.live_paths().await).await?;
        if cleaned > 0 {
            tracing::info!(cleaned, dir = %uploads.dir().display(), "removed leftover temporary files");
        }

        Ok(Self {
            rules: TitleRules::from(&config),
            parser: Fb2Parser::new(config.default_title.clone()),
            config,
            uploads,
            sessions,
        })
    }

    /// 用户当前的会话状态，没有会话时为 Idle
    pub async fn state(&self, user: &UserId) -> SessionState {
        let Some(handle) = self.sessions.get(user) else {
            return SessionState::Idle;
        };
        let state = handle.lock().await.state();
        state
    }

    /// 用户当前待合并的文件数
    pub async fn pending(&self, user: &UserId) -> usize {
        let Some(handle) = self.sessions.get(user) else {
            return 0;
        };
        let pending = handle.lock().await.documents().len();
        pending
    }

    /// 提交一个源文档
    ///
    /// # 参数
    /// - `user`: 用户 ID
    /// - `name`: 原始文件名
    /// - `mime`: 传输层给出的媒体类型
    /// - `source`: 文件内容
    ///
    /// # 返回
    /// 当前待合并的文件数
    pub async fn submit_document<R>(
        &self,
        user: &UserId,
        name: &str,
        mime: &str,
        source: R,
    ) -> Result<usize, RejectionReason>
    where
        R: AsyncRead + Unpin,
    {
        if !parser::is_supported(name, mime, &self.config.file_extension, &self.config.accepted_mime) {
            return Err(RejectionReason::UnsupportedFormat {
                name: name.to_string(),
                mime: mime.to_string(),
            });
        }

        let handle = self.sessions.open(user)?;
        let mut session = handle.lock().await;

        let path = self.uploads.store_source(user, source).await.map_err(|e| {
            tracing::error!(%user, error = %e, "failed to store uploaded document");
            RejectionReason::from(e)
        })?;

        let document = SourceDocument {
            name: name.to_string(),
            path: path.clone(),
            submitted_at: Utc::now(),
        };
        match session.submit_document(document) {
            Ok(count) => {
                tracing::info!(%user, name, pending = count, "document stored");
                Ok(count)
            }
            Err(e) => {
                self.uploads.purge(&[path]).await;
                Err(e)
            }
        }
    }

    /// 触发合并，之后等待书名
    pub async fn begin_merge(&self, user: &UserId) -> Result<MergeAck, RejectionReason> {
        let handle = self.sessions.get(user).ok_or(RejectionReason::EmptySession)?;
        let mut session = handle.lock().await;
        let pending = session.begin_merge()?;

        tracing::info!(%user, pending, "awaiting title");
        Ok(MergeAck {
            pending,
            max_title_chars: self.rules.max_chars,
            forbidden_chars: FORBIDDEN_TITLE_CHARS.iter().collect(),
        })
    }

    /// 提交书名并生成合并后的书
    ///
    /// 书名无效时会话保持等待书名的状态；书名被接受后，无论合并成功与否，
    /// 源文件都会被删除，会话回到 Idle
    pub async fn submit_title(&self, user: &UserId, text: &str) -> Result<MergedFile, RejectionReason> {
        let handle = self.sessions.get(user).ok_or(RejectionReason::NotAwaitingTitle)?;
        let mut session = handle.lock().await;

        let title = session.submit_title(text, &self.rules)?;
        let documents = session.take_documents();

        let outcome = self.run_merge(user, &title, &documents).await;

        // 无论结果如何都要清理
        let paths: Vec<PathBuf> = documents.iter().map(|d| d.path.clone()).collect();
        let removed = self.uploads.purge(&paths).await;
        session.reset();
        drop(session);
        drop(handle);
        let _ = self.sessions.close(user);

        match &outcome {
            Ok(file) => tracing::info!(
                %user,
                file = file.file_name(),
                documents = documents.len(),
                resources = file.report().resources,
                removed,
                "merge completed"
            ),
            Err(e) => tracing::error!(%user, error = %e, removed, "merge failed"),
        }
        outcome
    }

    /// 取消当前会话，丢弃所有待合并文件
    pub async fn cancel(&self, user: &UserId) -> Result<CancelAck, RejectionReason> {
        let Some(handle) = self.sessions.get(user) else {
            return Ok(CancelAck { discarded: 0 });
        };

        let mut session = handle.lock().await;
        let discarded = session.cancel();
        let paths: Vec<PathBuf> = discarded.iter().map(|d| d.path.clone()).collect();
        self.uploads.purge(&paths).await;
        session.reset();
        drop(session);
        drop(handle);
        self.sessions.close(user)?;

        tracing::info!(%user, discarded = discarded.len(), "session cancelled");
        Ok(CancelAck {
            discarded: discarded.len(),
        })
    }

    /// 读取、解析、合并并写出结果
    async fn run_merge(
        &self,
        user: &UserId,
        title: &AcceptedTitle,
        documents: &[SourceDocument],
    ) -> Result<MergedFile, RejectionReason> {
        tracing::info!(%user, documents = documents.len(), "merge started");

        let mut sources = Vec::with_capacity(documents.len());
        for document in documents {
            match self.uploads.read(&document.path).await {
                Ok(bytes) => sources.push(Ok(bytes)),
                Err(e) => {
                    tracing::warn!(%user, name = %document.name, error = %e, "source document unreadable");
                    sources.push(Err(e.to_string()));
                }
            }
        }

        // 解析和组装是纯计算，放到阻塞线程池，避免卡住其他用户
        let parser = self.parser.clone();
        let default_title = self.config.default_title.clone();
        let book_title = title.book_title.clone();
        let (xml, mut report) = tokio::task::spawn_blocking(move || {
            let parsed = sources.into_iter().map(|source| match source {
                Ok(bytes) => parser.parse(&bytes),
                Err(message) => ParsedDocument::fallback(
                    &default_title,
                    vec![ParseDegradation::Unreadable { message }],
                ),
            });
            let book = merge::merge_documents(&book_title, parsed);
            (book.to_xml(), book.report())
        })
        .await
        .map_err(|e| RejectionReason::AssemblyFailure(format!("合并任务异常: {}", e)))?;
        report.attach_uploads(documents.iter().map(|d| (d.name.clone(), d.submitted_at)));

        let path = self
            .uploads
            .write_merged(user, &xml)
            .await
            .map_err(|e| RejectionReason::AssemblyFailure(e.to_string()))?;

        Ok(MergedFile {
            path,
            file_name: title.file_name.clone(),
            report,
            disposed: false,
        })
    }
}
