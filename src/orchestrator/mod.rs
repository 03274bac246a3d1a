//! 编排器：把一个外部请求变成在途会话并驱动到终态
//!
//! 管线阶段严格有序：input → intent → planning → execution → adaptation(按需) → completion。
//! 并发上限用信号量把守，满了立即同步拒绝（不排队、不建会话）。执行循环在步骤边界
//! 响应暂停/取消；步骤失败或熟练度增量过低触发对当前步骤的改写；会话级错误超出
//! 预算后熔断为失败终态，作为步骤级有界重试之上的第二层边界。

pub mod feedback;
pub mod pipeline;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::collab::{AdaptationSignal, Navigator, PlanGenerator, StepAdapter};
use crate::config::OrchestratorSection;
use crate::core::{CoreError, SessionSupervisor};
use crate::degradation::DegradationManager;
use crate::engine::history::ExecutionHistory;
use crate::session::manager::SessionManager;
use crate::session::model::{
    GuideRequest, SessionAnalytics, SessionProgress, SessionStatus, Step, StepResult,
};

pub use feedback::{satisfaction_score, select_adaptation, AdaptationAction, DifficultyIssue, PaceIssue, UserFeedback};
pub use pipeline::{PipelineProgress, PipelineStage};

/// 步骤熟练度增量低于该值时触发对当前步骤的改写
const ADAPTATION_PROFICIENCY_FLOOR: u32 = 50;

/// 编排过程事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    SessionStarted { session_id: String },
    SessionPaused { session_id: String },
    SessionResumed { session_id: String },
    SessionCompleted { session_id: String },
    SessionFailed { session_id: String, reason: String },
    SessionCancelled { session_id: String },
    StepRecorded {
        session_id: String,
        step_id: String,
        success: bool,
        proficiency_delta: u32,
    },
    AdaptationApplied {
        session_id: String,
        action: String,
        detail: String,
    },
    HelpNeeded { session_id: String, note: String },
    FeedbackReceived {
        session_id: String,
        satisfaction: f64,
    },
}

/// 编排器
pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    history: Arc<dyn ExecutionHistory>,
    degradation: Arc<DegradationManager>,
    navigator: Arc<dyn Navigator>,
    plans: Arc<dyn PlanGenerator>,
    adapter: Arc<dyn StepAdapter>,
    pipelines: RwLock<HashMap<String, PipelineProgress>>,
    supervisors: RwLock<HashMap<String, Arc<SessionSupervisor>>>,
    /// 并发上限；permit 随会话终态释放
    capacity: Arc<Semaphore>,
    /// 会话级错误历史（熔断判断）
    error_history: RwLock<HashMap<String, Vec<String>>>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    cfg: OrchestratorSection,
    shutdown: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: OrchestratorSection,
        sessions: Arc<SessionManager>,
        history: Arc<dyn ExecutionHistory>,
        degradation: Arc<DegradationManager>,
        navigator: Arc<dyn Navigator>,
        plans: Arc<dyn PlanGenerator>,
        adapter: Arc<dyn StepAdapter>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let capacity = Arc::new(Semaphore::new(cfg.max_concurrent_sessions));
        Self {
            sessions,
            history,
            degradation,
            navigator,
            plans,
            adapter,
            pipelines: RwLock::new(HashMap::new()),
            supervisors: RwLock::new(HashMap::new()),
            capacity,
            error_history: RwLock::new(HashMap::new()),
            event_tx,
            cfg,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 停止所有在途会话与后台任务
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 启动后台任务：健康检查循环与闲置会话清理
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.degradation.start(self.shutdown.clone());

        let this = Arc::clone(self);
        let interval_secs = self.cfg.sweep_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = this.sessions.sweep_idle().await;
                        if swept > 0 {
                            tracing::info!(count = swept, "idle sessions swept");
                        }
                    }
                    _ = this.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// 提交请求：input → intent → planning，然后把执行循环放到后台，返回会话 id
    ///
    /// 并发上限检查在一切之前：满了直接返回容量错误，不创建任何会话。
    pub async fn submit_request(
        self: &Arc<Self>,
        request: GuideRequest,
    ) -> Result<String, CoreError> {
        if !self.degradation.is_feature_available("guided_execution") {
            return Err(CoreError::FeatureUnavailable("guided_execution".to_string()));
        }
        let permit = self
            .capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| CoreError::CapacityExceeded(self.cfg.max_concurrent_sessions))?;

        // input 阶段：基本校验
        let mut progress = PipelineProgress::new(String::new());
        if request.objective.trim().is_empty() {
            return Err(CoreError::EmptyPlan("(empty objective)".to_string()));
        }

        // intent 阶段：意图抽取是外部协作者的事，这里透传目标
        progress.advance(PipelineStage::Intent, "解析用户目标");

        // planning 阶段：生成计划并建会话
        progress.advance(PipelineStage::Planning, "生成引导计划");
        let session = self.sessions.start(request).await?;
        let session_id = session.id.clone();
        progress.session_id = session_id.clone();

        // 主目标 = 计划中多数步骤使用的工具（并列取先出现者），预先初始化
        if let Some(primary) = select_primary_target(&session.steps) {
            let _ = self
                .sessions
                .set_primary_target(&session_id, primary.clone())
                .await;
            if let Err(e) = self.navigator.ensure_ready(&primary).await {
                // 逐步执行时引擎还会做就绪检查并走自己的恢复路径
                tracing::warn!(session = %session_id, "primary target not ready: {}", e);
            }
        }

        let supervisor = Arc::new(SessionSupervisor::with_parent(&self.shutdown));
        self.supervisors
            .write()
            .await
            .insert(session_id.clone(), supervisor.clone());

        progress.advance(PipelineStage::Execution, "开始逐步执行");
        self.pipelines
            .write()
            .await
            .insert(session_id.clone(), progress);

        self.emit(OrchestratorEvent::SessionStarted {
            session_id: session_id.clone(),
        });

        let this = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            this.run_session(id, supervisor, permit).await;
        });

        Ok(session_id)
    }

    /// 会话执行循环：按计划顺序抽干步骤，步骤边界响应暂停/取消
    async fn run_session(
        self: Arc<Self>,
        session_id: String,
        supervisor: Arc<SessionSupervisor>,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let poll = tokio::time::Duration::from_millis(self.cfg.pause_poll_ms.max(10));
        loop {
            if supervisor.is_cancelled() {
                let _ = self.sessions.cancel(&session_id).await;
                self.emit(OrchestratorEvent::SessionCancelled {
                    session_id: session_id.clone(),
                });
                break;
            }
            if supervisor.is_paused().await {
                tokio::time::sleep(poll).await;
                continue;
            }

            let Some(snapshot) = self.sessions.get(&session_id).await else {
                break;
            };
            match snapshot.status {
                SessionStatus::Active => {}
                SessionStatus::Paused => {
                    tokio::time::sleep(poll).await;
                    continue;
                }
                SessionStatus::Completed => {
                    self.emit(OrchestratorEvent::SessionCompleted {
                        session_id: session_id.clone(),
                    });
                    break;
                }
                SessionStatus::Failed => {
                    self.emit(OrchestratorEvent::SessionFailed {
                        session_id: session_id.clone(),
                        reason: "terminal".to_string(),
                    });
                    break;
                }
                SessionStatus::Cancelled => {
                    self.emit(OrchestratorEvent::SessionCancelled {
                        session_id: session_id.clone(),
                    });
                    break;
                }
                SessionStatus::Created => break,
            }
            if snapshot.current_step_index >= snapshot.steps.len() {
                break;
            }

            let step = &snapshot.steps[snapshot.current_step_index];
            let remaining: u64 = snapshot.steps[snapshot.current_step_index..]
                .iter()
                .map(|s| s.estimated_duration_secs)
                .sum();
            {
                let mut pipelines = self.pipelines.write().await;
                if let Some(p) = pipelines.get_mut(&session_id) {
                    p.update_execution(snapshot.progress().percent, step.title.clone(), remaining);
                }
            }

            let result = match self.sessions.execute_next_step(&session_id).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(session = %session_id, "step execution aborted: {}", e);
                    break;
                }
            };
            self.emit(OrchestratorEvent::StepRecorded {
                session_id: session_id.clone(),
                step_id: result.step_id.clone(),
                success: result.is_success(),
                proficiency_delta: result.outcome.proficiency_delta,
            });

            let needs_adaptation = !result.is_success()
                || result.outcome.proficiency_delta < ADAPTATION_PROFICIENCY_FLOOR;
            if needs_adaptation {
                if !result.is_success() {
                    let over_budget = self
                        .record_session_error(&session_id, &result.outcome.description)
                        .await;
                    if over_budget {
                        // 熔断：错误预算耗尽，不再无限重试
                        let _ = self.sessions.fail(&session_id).await;
                        self.emit(OrchestratorEvent::SessionFailed {
                            session_id: session_id.clone(),
                            reason: format!(
                                "错误次数超出恢复预算 ({})",
                                self.cfg.recovery_attempt_budget
                            ),
                        });
                        break;
                    }
                }
                self.adapt_current_step(&session_id, &result).await;
            }
        }

        // 终态：丢弃管线记录与监管器，错误历史一并清掉（执行历史由 history 保留）
        self.pipelines.write().await.remove(&session_id);
        self.supervisors.write().await.remove(&session_id);
        self.error_history.write().await.remove(&session_id);
    }

    /// 记录会话级错误，返回是否超出预算
    async fn record_session_error(&self, session_id: &str, reason: &str) -> bool {
        let mut errors = self.error_history.write().await;
        let list = errors.entry(session_id.to_string()).or_default();
        list.push(reason.to_string());
        list.len() > self.cfg.recovery_attempt_budget
    }

    /// 低产出后的自适应：基于结果改写当前（尚未执行的）步骤并原地替换
    async fn adapt_current_step(&self, session_id: &str, result: &StepResult) {
        {
            let mut pipelines = self.pipelines.write().await;
            if let Some(p) = pipelines.get_mut(session_id) {
                p.advance(PipelineStage::Adaptation, "改写当前步骤");
            }
        }
        let Some(current) = self
            .sessions
            .get(session_id)
            .await
            .and_then(|s| s.current_step().cloned())
        else {
            return;
        };
        let signal = AdaptationSignal::Outcome {
            result: result.clone(),
        };
        match self.adapter.adapt_step(&current, &signal).await {
            Ok(adapted) => {
                let note = format!("adapted after outcome: {}", result.outcome.description);
                if self
                    .sessions
                    .replace_current_step(session_id, adapted, note.clone())
                    .await
                    .is_ok()
                {
                    self.emit(OrchestratorEvent::AdaptationApplied {
                        session_id: session_id.to_string(),
                        action: "rewrite_step".to_string(),
                        detail: note,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(session = %session_id, "adaptation collaborator failed: {}", e);
            }
        }
    }

    /// 查询在途请求的管线进度；会话终态后记录已丢弃，返回 not found
    pub async fn pipeline_status(&self, session_id: &str) -> Result<PipelineProgress, CoreError> {
        self.pipelines
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))
    }

    /// 暂停会话（步骤边界生效）
    pub async fn pause(&self, session_id: &str) -> Result<(), CoreError> {
        self.sessions.pause(session_id).await?;
        if let Some(sup) = self.supervisors.read().await.get(session_id) {
            sup.set_paused(true).await;
        }
        self.emit(OrchestratorEvent::SessionPaused {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    pub async fn resume(&self, session_id: &str) -> Result<(), CoreError> {
        self.sessions.resume(session_id).await?;
        if let Some(sup) = self.supervisors.read().await.get(session_id) {
            sup.set_paused(false).await;
        }
        self.emit(OrchestratorEvent::SessionResumed {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// 取消会话：立即转终态，并唤醒执行循环退出
    pub async fn cancel(&self, session_id: &str) -> Result<(), CoreError> {
        if let Some(sup) = self.supervisors.read().await.get(session_id) {
            sup.cancel();
        }
        self.sessions.cancel(session_id).await?;
        Ok(())
    }

    /// 用户反馈：评分，低于阈值时执行一个自适应动作
    pub async fn submit_feedback(
        &self,
        session_id: &str,
        feedback: UserFeedback,
    ) -> Result<Option<AdaptationAction>, CoreError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(CoreError::SessionTerminal(session_id.to_string()));
        }

        let satisfaction = satisfaction_score(&feedback);
        self.emit(OrchestratorEvent::FeedbackReceived {
            session_id: session_id.to_string(),
            satisfaction,
        });
        if satisfaction >= self.cfg.satisfaction_threshold {
            return Ok(None);
        }

        let action = select_adaptation(&feedback);
        match &action {
            AdaptationAction::AdjustPace { factor } => {
                self.sessions.scale_pace(session_id, *factor).await?;
                self.emit(OrchestratorEvent::AdaptationApplied {
                    session_id: session_id.to_string(),
                    action: "adjust_pace".to_string(),
                    detail: format!("剩余步骤时长 × {}", factor),
                });
            }
            AdaptationAction::ChangeApproach => {
                if let Some(current) = session.current_step() {
                    let alternatives = self
                        .plans
                        .generate_alternative_steps(
                            &current.objectives,
                            &current.required_capability,
                            "用户反馈：当前讲法行不通",
                        )
                        .await
                        .unwrap_or_default();
                    match alternatives.into_iter().next() {
                        Some(step) => {
                            self.sessions
                                .replace_current_step(session_id, step, "changed approach")
                                .await?;
                            self.emit(OrchestratorEvent::AdaptationApplied {
                                session_id: session_id.to_string(),
                                action: "change_approach".to_string(),
                                detail: "当前步骤已重新生成".to_string(),
                            });
                        }
                        None => {
                            tracing::warn!(session = %session_id, "no alternative approach available");
                        }
                    }
                }
            }
            AdaptationAction::ProvideHelp => {
                self.emit(OrchestratorEvent::HelpNeeded {
                    session_id: session_id.to_string(),
                    note: feedback.comment.unwrap_or_else(|| "用户需要更多帮助".to_string()),
                });
            }
        }
        Ok(Some(action))
    }

    /// 会话快照（活跃优先，其次归档）
    pub async fn session_snapshot(
        &self,
        session_id: &str,
    ) -> Option<crate::session::model::Session> {
        self.sessions.get(session_id).await
    }

    /// 会话累计产出（终态会话也可查询）
    pub async fn outcomes(&self, session_id: &str) -> Result<Vec<StepResult>, CoreError> {
        self.sessions.outcomes(session_id).await
    }

    pub async fn progress(&self, session_id: &str) -> Result<SessionProgress, CoreError> {
        self.sessions.progress(session_id).await
    }

    pub async fn analytics(&self, session_id: &str) -> Result<SessionAnalytics, CoreError> {
        self.sessions.analytics(session_id).await
    }

    /// 会话的执行历史（含每次重试）
    pub async fn execution_history(
        &self,
        session_id: &str,
    ) -> Vec<crate::engine::history::ExecutionRecord> {
        self.history.for_session(session_id).await
    }

    /// 系统健康报告（组件、全局档位、激活策略、建议）
    pub async fn health_report(&self) -> crate::degradation::SystemHealthReport {
        self.degradation.health_report().await
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// 计划中多数步骤使用的目标工具；并列时取先出现者
fn select_primary_target(steps: &[Step]) -> Option<String> {
    let mut order: Vec<(String, usize)> = Vec::new();
    for step in steps {
        match order
            .iter_mut()
            .find(|(name, _)| name == &step.required_capability)
        {
            Some((_, count)) => *count += 1,
            None => order.push((step.required_capability.clone(), 1)),
        }
    }
    let mut best: Option<(String, usize)> = None;
    for (name, count) in order {
        let replace = match &best {
            Some((_, best_count)) => count > *best_count,
            None => true,
        };
        if replace {
            best = Some((name, count));
        }
    }
    best.map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::Step;

    fn step(capability: &str) -> Step {
        Step::new("s", capability)
    }

    #[test]
    fn test_primary_target_plurality() {
        let steps = vec![step("a"), step("b"), step("b"), step("c")];
        assert_eq!(select_primary_target(&steps), Some("b".to_string()));
    }

    #[test]
    fn test_primary_target_tie_takes_first_seen() {
        let steps = vec![step("x"), step("y"), step("y"), step("x")];
        assert_eq!(select_primary_target(&steps), Some("x".to_string()));
    }

    #[test]
    fn test_primary_target_empty_plan() {
        assert_eq!(select_primary_target(&[]), None);
    }
}
