//! 会话存储抽象层
//!
//! 活跃会话按 id 索引，修改统一走 apply(SessionOp)：状态机守卫与步骤提交的
//! 纯逻辑在模型上，存储实现只负责在自己的锁内调用它，保证单次修改原子完成。
//! 默认实现是内存表；接口存在是为了以后接持久化时不动引擎逻辑。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::CoreError;
use crate::session::model::{Session, SessionOp};

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session);

    async fn get(&self, id: &str) -> Option<Session>;

    async fn list(&self) -> Vec<Session>;

    /// 移出存储（终态会话转入恢复归档前调用）
    async fn remove(&self, id: &str) -> Option<Session>;

    async fn active_count(&self) -> usize;

    /// 原子应用一次修改，返回修改后的快照
    async fn apply(&self, id: &str, op: SessionOp) -> Result<Session, CoreError>;
}

/// 内存会话存储（session_id → Session）
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.write().await.remove(id)
    }

    async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn apply(&self, id: &str, op: SessionOp) -> Result<Session, CoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        session.apply(op)?;
        Ok(session.clone())
    }
}
