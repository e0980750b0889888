use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use super::{UserId, UserSession};
use crate::error::RejectionReason;

/// 共享的单用户会话句柄
///
/// 同一用户的操作通过这把异步锁串行执行，不同用户互不阻塞
pub type SessionHandle = Arc<AsyncMutex<UserSession>>;

/// 会话存储
///
/// 按用户 ID 管理会话，外层锁只在查找/插入时短暂持有
pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 获取用户的会话，不存在时创建一个 Idle 会话
    pub fn open(&self, user: &UserId) -> Result<SessionHandle, RejectionReason> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| RejectionReason::SessionUnavailable(format!("锁定会话表失败: {}", e)))?;

        let handle = sessions
            .entry(user.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(UserSession::new(user.clone()))));
        Ok(Arc::clone(handle))
    }

    /// 获取已有的会话
    pub fn get(&self, user: &UserId) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().ok()?;
        sessions.get(user).cloned()
    }

    /// 关闭空闲会话
    ///
    /// 只有在会话为 Idle 且没有其他任务持有句柄时才移除，
    /// 否则保留，避免正在排队的操作落到一个已被移除的会话上
    ///
    /// # 返回
    /// 会话是否被移除
    pub fn close(&self, user: &UserId) -> Result<bool, RejectionReason> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| RejectionReason::SessionUnavailable(format!("锁定会话表失败: {}", e)))?;

        let removable = match sessions.get(user) {
            Some(handle) => {
                Arc::strong_count(handle) == 1
                    && handle.try_lock().map(|s| s.is_idle()).unwrap_or(false)
            }
            None => false,
        };
        if removable {
            sessions.remove(user);
        }
        Ok(removable)
    }

    /// 所有会话仍在引用的临时文件
    pub async fn live_paths(&self) -> HashSet<PathBuf> {
        let handles: Vec<SessionHandle> = match self.sessions.lock() {
            Ok(sessions) => sessions.values().cloned().collect(),
            Err(_) => return HashSet::new(),
        };

        let mut paths = HashSet::new();
        for handle in handles {
            let session = handle.lock().await;
            paths.extend(session.documents().iter().map(|d| d.path.clone()));
        }
        paths
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
