//! 恢复归档
//!
//! 终态会话（完成/失败/取消）从活跃存储移出后保留在这里，供产出查询与事后恢复。
//! 内存实现用于默认配置；文件实现把每个会话写成一个 JSON 文件：
//!
//! ```text
//! data_dir/
//! └── sessions/
//!     ├── session_xxx.json
//!     └── session_yyy.json
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::CoreError;
use crate::session::model::Session;

/// 终态会话归档接口
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn archive(&self, session: Session) -> Result<(), CoreError>;

    async fn load(&self, id: &str) -> Option<Session>;

    /// 按归档时间倒序
    async fn list(&self) -> Vec<Session>;
}

/// 内存归档
#[derive(Default)]
pub struct MemoryRecoveryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryStore for MemoryRecoveryStore {
    async fn archive(&self, session: Session) -> Result<(), CoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn load(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }
}

/// JSON 文件归档
pub struct FileRecoveryStore {
    base_dir: PathBuf,
}

impl FileRecoveryStore {
    /// 创建归档目录结构；失败返回存储错误
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let sessions_dir = base_dir.join("sessions");
        fs::create_dir_all(&sessions_dir)
            .map_err(|e| CoreError::Storage(format!("create {:?}: {}", sessions_dir, e)))?;
        Ok(Self { base_dir })
    }

    fn session_file_path(&self, session_id: &str) -> PathBuf {
        self.base_dir
            .join("sessions")
            .join(format!("{}.json", session_id))
    }

    fn load_from_path(&self, path: &Path) -> Result<Session, CoreError> {
        let json = fs::read_to_string(path)
            .map_err(|e| CoreError::Storage(format!("read {:?}: {}", path, e)))?;
        serde_json::from_str(&json)
            .map_err(|e| CoreError::Storage(format!("deserialize {:?}: {}", path, e)))
    }
}

#[async_trait]
impl RecoveryStore for FileRecoveryStore {
    async fn archive(&self, session: Session) -> Result<(), CoreError> {
        let path = self.session_file_path(&session.id);
        let json = serde_json::to_string_pretty(&session)
            .map_err(|e| CoreError::Storage(format!("serialize session: {}", e)))?;
        fs::write(&path, json).map_err(|e| CoreError::Storage(format!("write {:?}: {}", path, e)))
    }

    async fn load(&self, id: &str) -> Option<Session> {
        let path = self.session_file_path(id);
        if !path.exists() {
            return None;
        }
        match self.load_from_path(&path) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!("failed to load archived session {}: {}", id, e);
                None
            }
        }
    }

    async fn list(&self) -> Vec<Session> {
        let sessions_dir = self.base_dir.join("sessions");
        let entries = match fs::read_dir(&sessions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("failed to read archive dir {:?}: {}", sessions_dir, e);
                return Vec::new();
            }
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Ok(session) = self.load_from_path(&path) {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::Step;
    use tempfile::TempDir;

    fn make_session(objective: &str) -> Session {
        Session::new("user_1", objective, vec![Step::new("第一步", "demo_tool")])
    }

    #[tokio::test]
    async fn test_memory_archive_round_trip() {
        let store = MemoryRecoveryStore::new();
        let session = make_session("目标 A");
        let id = session.id.clone();

        store.archive(session).await.unwrap();
        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.objective, "目标 A");
    }

    #[tokio::test]
    async fn test_file_archive_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(temp.path()).unwrap();

        let session = make_session("目标 B");
        let id = session.id.clone();
        store.archive(session).await.unwrap();

        // 新实例也能读到（真正落盘）
        let store2 = FileRecoveryStore::new(temp.path()).unwrap();
        let loaded = store2.load(&id).await.unwrap();
        assert_eq!(loaded.objective, "目标 B");
        assert_eq!(loaded.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_file_archive_list() {
        let temp = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(temp.path()).unwrap();

        store.archive(make_session("first")).await.unwrap();
        store.archive(make_session("second")).await.unwrap();

        assert_eq!(store.list().await.len(), 2);
        assert!(store.load("session_missing").await.is_none());
    }
}
