use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::StorageError;
use crate::session::UserId;

const MERGED_PREFIX: &str = "merged_";

/// 上传文件存储
///
/// 负责把源文档和合并结果写入临时目录，并在会话结束时清理
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    /// 文件扩展名，例如 `.fb2`
    extension: String,
}

impl UploadStore {
    /// 打开（必要时创建）上传目录
    pub async fn open(dir: impl Into<PathBuf>, extension: &str) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            extension: extension.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 保存一个源文档
    ///
    /// # 参数
    /// - `user`: 用户 ID
    /// - `source`: 传输层提供的字节流
    ///
    /// # 返回
    /// 保存后的路径（格式：{dir}/{user}_{uuid}.fb2）
    pub async fn store_source<R>(&self, user: &UserId, source: R) -> Result<PathBuf, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.dir.join(self.file_name(user, ""));
        self.write_stream(&path, source).await?;
        Ok(path)
    }

    /// 写入合并结果
    ///
    /// # 返回
    /// 结果路径（格式：{dir}/merged_{user}_{uuid}.fb2）
    pub async fn write_merged(&self, user: &UserId, content: &str) -> Result<PathBuf, StorageError> {
        let path = self.dir.join(self.file_name(user, MERGED_PREFIX));
        self.write_stream(&path, content.as_bytes()).await?;
        Ok(path)
    }

    /// 读取一个已保存的文件
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        self.ensure_inside(path)?;
        Ok(fs::read(path).await?)
    }

    /// 删除一组临时文件
    ///
    /// 已经不存在的文件视为删除成功，删除失败只记录日志
    ///
    /// # 返回
    /// 实际删除的文件数
    pub async fn purge(&self, paths: &[PathBuf]) -> usize {
        let mut removed = 0;
        for path in paths {
            if let Err(e) = self.ensure_inside(path) {
                tracing::warn!(error = %e, "refusing to purge file");
                continue;
            }
            match fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to purge file"),
            }
        }
        removed
    }

    /// 列出某个用户在目录中的所有临时文件（源文档和合并结果）
    #[cfg(test)]
    pub async fn artifacts_of(&self, user: &UserId) -> Result<Vec<PathBuf>, StorageError> {
        let owner = user.file_component();
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if self.owner_of(&name.to_string_lossy()).as_deref() == Some(owner.as_str()) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// 清理孤立的临时文件（不属于任何在用会话的文件）
    ///
    /// 用于进程重启后回收上次遗留的文件
    ///
    /// # 参数
    /// - `live`: 仍被会话引用的路径
    pub async fn sweep_orphans(&self, live: &HashSet<PathBuf>) -> Result<u32, StorageError> {
        let mut cleaned = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ours = self.owner_of(&entry.file_name().to_string_lossy()).is_some();
            if ours && !live.contains(&path) && entry.file_type().await?.is_file() {
                fs::remove_file(&path).await?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    fn file_name(&self, user: &UserId, prefix: &str) -> String {
        format!(
            "{}{}_{}{}",
            prefix,
            user.file_component(),
            uuid::Uuid::new_v4().simple(),
            self.extension
        )
    }

    /// 从文件名解析出所属用户，不是本存储生成的文件返回 None
    fn owner_of(&self, file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(self.extension.as_str())?;
        let stem = stem.strip_prefix(MERGED_PREFIX).unwrap_or(stem);
        let (owner, id) = stem.rsplit_once('_')?;
        let is_uuid = id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit());
        (is_uuid && !owner.is_empty()).then(|| owner.to_string())
    }

    fn ensure_inside(&self, path: &Path) -> Result<(), StorageError> {
        if path.starts_with(&self.dir) {
            Ok(())
        } else {
            Err(StorageError::OutsideUploadDir(path.display().to_string()))
        }
    }

    /// 写入文件，失败时删除写了一半的文件
    async fn write_stream<R>(&self, path: &Path, mut source: R) -> Result<(), StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let result = async {
            let mut file = fs::File::create(path).await?;
            tokio::io::copy(&mut source, &mut file).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(path).await;
            return Err(e.into());
        }
        Ok(())
    }
}
