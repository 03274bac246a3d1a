//! 执行历史
//!
//! 按会话追加的执行记录，进程生命周期内保留（或显式清除），
//! 供分析查询与编排层的熔断/自适应触发使用。放在接口后面便于以后接持久化。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::session::model::StepStatus;

/// 一次步骤尝试的记录（每次 attempt 一条，含重试）
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub step_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub failure: Option<String>,
    /// 选定的恢复动作（retry / adapt / ...）
    pub recovery: Option<String>,
    pub timestamp: i64,
}

impl ExecutionRecord {
    pub fn success(step_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            status: StepStatus::Completed,
            failure: None,
            recovery: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failure(
        step_id: impl Into<String>,
        attempt: u32,
        failure: impl Into<String>,
        recovery: Option<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            status: StepStatus::Failed,
            failure: Some(failure.into()),
            recovery,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 执行历史存储接口
#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    async fn append(&self, session_id: &str, record: ExecutionRecord);

    async fn for_session(&self, session_id: &str) -> Vec<ExecutionRecord>;

    /// 该会话累计失败尝试数（熔断判断用）
    async fn failure_count(&self, session_id: &str) -> usize;

    async fn clear_session(&self, session_id: &str);
}

/// 内存执行历史（session_id → 追加记录）
#[derive(Default)]
pub struct MemoryExecutionHistory {
    records: RwLock<HashMap<String, Vec<ExecutionRecord>>>,
}

impl MemoryExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionHistory for MemoryExecutionHistory {
    async fn append(&self, session_id: &str, record: ExecutionRecord) {
        self.records
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(record);
    }

    async fn for_session(&self, session_id: &str) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn failure_count(&self, session_id: &str) -> usize {
        self.records
            .read()
            .await
            .get(session_id)
            .map(|rs| rs.iter().filter(|r| r.status == StepStatus::Failed).count())
            .unwrap_or(0)
    }

    async fn clear_session(&self, session_id: &str) {
        self.records.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_count() {
        let history = MemoryExecutionHistory::new();
        history
            .append("s1", ExecutionRecord::success("step_a", 1))
            .await;
        history
            .append(
                "s1",
                ExecutionRecord::failure("step_b", 1, "timed out", Some("retry".to_string())),
            )
            .await;
        history
            .append("s2", ExecutionRecord::success("step_x", 1))
            .await;

        assert_eq!(history.for_session("s1").await.len(), 2);
        assert_eq!(history.failure_count("s1").await, 1);
        assert_eq!(history.failure_count("s2").await, 0);

        history.clear_session("s1").await;
        assert!(history.for_session("s1").await.is_empty());
    }
}
