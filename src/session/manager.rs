//! 会话管理器
//!
//! 独占一个会话从创建到终态的生命周期：start / pause / resume / complete / cancel，
//! 以及 execute_next_step。步骤执行委托给执行引擎；只有步骤判定成功才推进下标，
//! 推进到末尾的自动完成与最后一步结果的落账在同一次原子修改内发生。

use std::sync::Arc;

use crate::collab::{AdaptationSignal, PlanGenerator, StepAdapter};
use crate::config::{EngineSection, SessionSection};
use crate::core::CoreError;
use crate::engine::executor::{StepContext, StepEngine};
use crate::session::archive::RecoveryStore;
use crate::session::model::{
    GuideRequest, Session, SessionAnalytics, SessionOp, SessionProgress, SessionStatus, Step,
    StepResult, TransitionOp,
};
use crate::session::store::SessionStore;

/// 会话管理器
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    archive: Arc<dyn RecoveryStore>,
    engine: Arc<StepEngine>,
    plans: Arc<dyn PlanGenerator>,
    adapter: Arc<dyn StepAdapter>,
    session_cfg: SessionSection,
    engine_cfg: EngineSection,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        archive: Arc<dyn RecoveryStore>,
        engine: Arc<StepEngine>,
        plans: Arc<dyn PlanGenerator>,
        adapter: Arc<dyn StepAdapter>,
        session_cfg: SessionSection,
        engine_cfg: EngineSection,
    ) -> Self {
        Self {
            store,
            archive,
            engine,
            plans,
            adapter,
            session_cfg,
            engine_cfg,
        }
    }

    /// 从请求生成计划并启动会话（Created → Active）
    pub async fn start(&self, request: GuideRequest) -> Result<Session, CoreError> {
        let steps = self
            .plans
            .generate_plan(
                &request.objective,
                request.skill_level,
                request.time_constraint_minutes,
            )
            .await?;
        if steps.is_empty() {
            return Err(CoreError::EmptyPlan(request.objective));
        }

        let session = Session::new(request.user_id, request.objective, steps);
        let id = session.id.clone();
        self.store.insert(session).await;
        let snapshot = self
            .store
            .apply(&id, SessionOp::Transition(TransitionOp::Activate))
            .await?;
        tracing::info!(session = %id, steps = snapshot.steps.len(), "session started");
        Ok(snapshot)
    }

    /// 暂停（仅 Active 可暂停）；在飞行中的动作跑完后才真正停在步骤边界
    pub async fn pause(&self, id: &str) -> Result<Session, CoreError> {
        self.store
            .apply(id, SessionOp::Transition(TransitionOp::Pause))
            .await
    }

    /// 恢复（仅 Paused 可恢复），并从已完成前缀重建上下文窗口
    pub async fn resume(&self, id: &str) -> Result<Session, CoreError> {
        self.store
            .apply(id, SessionOp::Transition(TransitionOp::Resume))
            .await?;
        self.store
            .apply(
                id,
                SessionOp::RecomputeContext {
                    window: self.session_cfg.max_context_steps,
                },
            )
            .await
    }

    /// 显式完成（Active → Completed），归档
    pub async fn complete(&self, id: &str) -> Result<Session, CoreError> {
        let snapshot = self
            .store
            .apply(id, SessionOp::Transition(TransitionOp::Complete))
            .await?;
        self.archive_terminal(id).await;
        Ok(snapshot)
    }

    /// 取消，归档
    pub async fn cancel(&self, id: &str) -> Result<Session, CoreError> {
        let snapshot = self
            .store
            .apply(id, SessionOp::Transition(TransitionOp::Cancel))
            .await?;
        self.archive_terminal(id).await;
        Ok(snapshot)
    }

    /// 会话级失败（熔断触发），归档
    pub async fn fail(&self, id: &str) -> Result<Session, CoreError> {
        let snapshot = self
            .store
            .apply(id, SessionOp::Transition(TransitionOp::Fail))
            .await?;
        self.archive_terminal(id).await;
        Ok(snapshot)
    }

    /// 执行当前步骤：按累计进度预改写 → 引擎执行 → 原子落账
    ///
    /// 只有 Active 且还有剩余步骤时可执行；自动完成只会由「最后一步成功落账」触发。
    pub async fn execute_next_step(&self, id: &str) -> Result<StepResult, CoreError> {
        let session = self
            .store
            .get(id)
            .await
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;

        if session.status != SessionStatus::Active {
            return Err(CoreError::InvalidTransition {
                op: "execute_next_step",
                status: session.status.to_string(),
            });
        }
        let step = session
            .current_step()
            .cloned()
            .ok_or(CoreError::InvalidTransition {
                op: "execute_next_step",
                status: session.status.to_string(),
            })?;

        // 按用户累计进度预改写当前步骤（写时复制，原地替换同下标）
        let signal = AdaptationSignal::Progress {
            completed_steps: session.context.previous_steps.clone(),
        };
        let step = match self.adapter.adapt_step(&step, &signal).await {
            Ok(adapted) => {
                self.store
                    .apply(
                        id,
                        SessionOp::ReplaceCurrentStep {
                            step: adapted.clone(),
                            note: String::new(),
                        },
                    )
                    .await?;
                adapted
            }
            Err(e) => {
                tracing::warn!(session = %id, "progress adaptation unavailable: {}", e);
                step
            }
        };

        let ctx = StepContext {
            session_id: session.id.clone(),
            owner_id: session.owner_id.clone(),
            max_retries: self.engine_cfg.max_retries,
        };
        let result = self.engine.execute_step(&step, &ctx).await;

        match self
            .store
            .apply(id, SessionOp::CommitStep(result.clone()))
            .await
        {
            Ok(snapshot) => {
                if snapshot.status.is_terminal() {
                    self.archive_terminal(id).await;
                }
            }
            Err(e) => {
                // 执行期间会话被取消/归档：结果只留在执行历史里
                tracing::warn!(session = %id, "step result not committed: {}", e);
            }
        }
        Ok(result)
    }

    /// 原地替换当前步骤（编排层自适应用）
    pub async fn replace_current_step(
        &self,
        id: &str,
        step: Step,
        note: impl Into<String>,
    ) -> Result<Session, CoreError> {
        self.store
            .apply(
                id,
                SessionOp::ReplaceCurrentStep {
                    step,
                    note: note.into(),
                },
            )
            .await
    }

    /// 调整剩余步骤的预估时长（节奏自适应）
    pub async fn scale_pace(&self, id: &str, factor: f64) -> Result<Session, CoreError> {
        self.store
            .apply(id, SessionOp::ScaleRemainingDurations(factor))
            .await
    }

    pub async fn set_primary_target(&self, id: &str, target: String) -> Result<Session, CoreError> {
        self.store
            .apply(id, SessionOp::SetPrimaryTarget(target))
            .await
    }

    /// 活跃会话优先，其次查归档
    pub async fn get(&self, id: &str) -> Option<Session> {
        match self.store.get(id).await {
            Some(session) => Some(session),
            None => self.archive.load(id).await,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.store.active_count().await
    }

    /// 会话累计产出（终态会话也可查询）
    pub async fn outcomes(&self, id: &str) -> Result<Vec<StepResult>, CoreError> {
        self.get(id)
            .await
            .map(|s| s.results)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    pub async fn progress(&self, id: &str) -> Result<SessionProgress, CoreError> {
        self.get(id)
            .await
            .map(|s| s.progress())
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    pub async fn analytics(&self, id: &str) -> Result<SessionAnalytics, CoreError> {
        self.get(id)
            .await
            .map(|s| s.analytics)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    /// 取消并归档闲置超时的会话，返回清理数量
    pub async fn sweep_idle(&self) -> usize {
        let timeout = self.session_cfg.idle_timeout_secs;
        let idle: Vec<String> = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|s| s.is_idle(timeout))
            .map(|s| s.id)
            .collect();

        let mut swept = 0;
        for id in idle {
            match self.cancel(&id).await {
                Ok(_) => {
                    tracing::info!(session = %id, "idle session cancelled");
                    swept += 1;
                }
                Err(e) => tracing::debug!(session = %id, "idle sweep skipped: {}", e),
            }
        }
        swept
    }

    /// 终态会话移出活跃集，保留到恢复归档
    async fn archive_terminal(&self, id: &str) {
        if let Some(session) = self.store.remove(id).await {
            if let Err(e) = self.archive.archive(session).await {
                tracing::warn!(session = %id, "failed to archive session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{
        MockActionExecutor, MockNavigator, MockPlanGenerator, MockStepAdapter,
    };
    use crate::collab::ActionErrorKind;
    use crate::engine::history::MemoryExecutionHistory;
    use crate::session::archive::MemoryRecoveryStore;
    use crate::session::model::{SkillLevel, StepStatus};
    use crate::session::store::MemorySessionStore;

    fn request() -> GuideRequest {
        GuideRequest {
            user_id: "user_1".to_string(),
            objective: "学会导出报表".to_string(),
            skill_level: SkillLevel::Beginner,
            time_constraint_minutes: None,
        }
    }

    fn manager_with(actions: MockActionExecutor, step_count: usize) -> SessionManager {
        let history = Arc::new(MemoryExecutionHistory::new());
        let plans = Arc::new(MockPlanGenerator::new(step_count, "report_tool"));
        let adapter = Arc::new(MockStepAdapter::new());
        let engine = Arc::new(StepEngine::new(
            Arc::new(actions),
            Arc::new(MockNavigator::ready()),
            plans.clone(),
            adapter.clone(),
            history,
        ));
        SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryRecoveryStore::new()),
            engine,
            plans,
            adapter,
            SessionSection::default(),
            EngineSection::default(),
        )
    }

    #[tokio::test]
    async fn test_start_creates_active_session() {
        let manager = manager_with(MockActionExecutor::succeeding(), 2);
        let session = manager.start(request()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_step_index, 0);
        assert_eq!(session.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_to_completion_archives() {
        let manager = manager_with(MockActionExecutor::succeeding(), 2);
        let session = manager.start(request()).await.unwrap();
        let id = session.id.clone();

        let first = manager.execute_next_step(&id).await.unwrap();
        assert_eq!(first.status, StepStatus::Completed);
        assert_eq!(manager.get(&id).await.unwrap().current_step_index, 1);

        let second = manager.execute_next_step(&id).await.unwrap();
        assert_eq!(second.status, StepStatus::Completed);

        // 自动完成并移入归档
        assert_eq!(manager.active_count().await, 0);
        let archived = manager.get(&id).await.unwrap();
        assert_eq!(archived.status, SessionStatus::Completed);
        assert_eq!(archived.analytics.total_proficiency, 50);

        // 终态会话不可再执行
        assert!(manager.execute_next_step(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_pause_blocks_execution_resume_restores() {
        let manager = manager_with(MockActionExecutor::succeeding(), 3);
        let session = manager.start(request()).await.unwrap();
        let id = session.id.clone();

        manager.execute_next_step(&id).await.unwrap();
        manager.pause(&id).await.unwrap();

        assert!(manager.execute_next_step(&id).await.is_err());

        let resumed = manager.resume(&id).await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
        assert_eq!(resumed.current_step_index, 1);
        assert_eq!(resumed.context.previous_steps.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_advance() {
        let manager = manager_with(
            MockActionExecutor::always_failing(ActionErrorKind::Authentication),
            2,
        );
        let session = manager.start(request()).await.unwrap();
        let id = session.id.clone();

        let result = manager.execute_next_step(&id).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);

        let snapshot = manager.get(&id).await.unwrap();
        assert_eq!(snapshot.current_step_index, 0);
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert_eq!(snapshot.analytics.failures, 1);
    }

    #[tokio::test]
    async fn test_cancel_moves_to_archive() {
        let manager = manager_with(MockActionExecutor::succeeding(), 2);
        let session = manager.start(request()).await.unwrap();
        let id = session.id.clone();

        manager.cancel(&id).await.unwrap();
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(
            manager.get(&id).await.unwrap().status,
            SessionStatus::Cancelled
        );
        assert!(manager.outcomes(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let manager = manager_with(MockActionExecutor::succeeding(), 0);
        assert!(matches!(
            manager.start(request()).await,
            Err(CoreError::EmptyPlan(_))
        ));
    }
}
