//! 步骤执行引擎
//!
//! 单步契约：就绪检查 → 顺序执行动作（关键动作失败短路）→ 校验打分 →
//! 失败分类与有界重试。重试是显式计数循环而不是递归，总尝试数不超过
//! max_retries + 1。动作级失败在这里被完全吸收，向上只产出 StepResult。

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::collab::{ActionExecutor, ActionFailure, ActionResult, AdaptationSignal, Navigator, PlanGenerator, StepAdapter};
use crate::engine::events::{send_event, EngineEvent};
use crate::engine::history::{ExecutionHistory, ExecutionRecord};
use crate::engine::recovery::{RecoveryEngine, RecoveryKind};
use crate::engine::validation::{self, ValidationReport};
use crate::session::model::{Action, ActionKind, Step, StepOutcome, StepResult, StepStatus};

/// 成功步骤的熟练度增量
pub const PROFICIENCY_GAIN_SUCCESS: u32 = 25;
/// 失败但有部分接触的最小增量（校验未达标、动作级失败）
pub const PROFICIENCY_GAIN_PARTIAL: u32 = 5;

/// 步骤执行上下文
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: String,
    pub owner_id: String,
    /// 调用方提供的重试预算；总尝试数 = max_retries + 1
    pub max_retries: u32,
}

/// 单次尝试的走向
enum AttemptOutcome {
    Passed(ValidationReport),
    BelowThreshold(ValidationReport),
    /// 关键动作失败（执行器返回的类型化预期失败）
    ActionFailure(ActionFailure),
    /// 意外异常（执行器 Err），按异常级处理
    Exception(String),
    /// 就绪检查失败，重试无法恢复
    NavigationLost(String),
}

/// 步骤执行引擎
pub struct StepEngine {
    actions: Arc<dyn ActionExecutor>,
    navigator: Arc<dyn Navigator>,
    plans: Arc<dyn PlanGenerator>,
    adapter: Arc<dyn StepAdapter>,
    recovery: RecoveryEngine,
    history: Arc<dyn ExecutionHistory>,
    event_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl StepEngine {
    pub fn new(
        actions: Arc<dyn ActionExecutor>,
        navigator: Arc<dyn Navigator>,
        plans: Arc<dyn PlanGenerator>,
        adapter: Arc<dyn StepAdapter>,
        history: Arc<dyn ExecutionHistory>,
    ) -> Self {
        Self {
            actions,
            navigator,
            plans,
            adapter,
            recovery: RecoveryEngine::new(),
            history,
            event_tx: None,
        }
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 执行一个步骤（含重试链），始终以 StepResult 收口
    pub async fn execute_step(&self, step: &Step, ctx: &StepContext) -> StepResult {
        let mut current = step.clone();
        let mut adaptations: Vec<String> = Vec::new();
        let max_attempts = ctx.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        // 预算耗尽时区分动作级（保留最小增量）与异常级（零增量）
        let mut last_was_exception = false;
        let mut last_failure = String::new();

        while attempt < max_attempts {
            attempt += 1;
            send_event(
                &self.event_tx,
                EngineEvent::StepStarted {
                    session_id: ctx.session_id.clone(),
                    step_id: current.id.clone(),
                    title: current.title.clone(),
                    attempt,
                },
            );

            let (class, message, is_exception) = match self.attempt_once(&current, ctx).await {
                AttemptOutcome::Passed(report) => {
                    self.history
                        .append(&ctx.session_id, ExecutionRecord::success(&current.id, attempt))
                        .await;
                    send_event(
                        &self.event_tx,
                        EngineEvent::StepCompleted {
                            session_id: ctx.session_id.clone(),
                            step_id: current.id.clone(),
                            proficiency_delta: PROFICIENCY_GAIN_SUCCESS,
                        },
                    );
                    tracing::info!(
                        session = %ctx.session_id,
                        step = %current.id,
                        score = report.score,
                        "step completed"
                    );
                    return self.completed_result(&current, adaptations);
                }
                AttemptOutcome::BelowThreshold(report) => {
                    // 校验未达标是声明式失败，不走重试链
                    let reason = format!(
                        "校验得分 {:.0} 未达到阈值 {:.0}",
                        report.score, report.threshold
                    );
                    self.history
                        .append(
                            &ctx.session_id,
                            ExecutionRecord::failure(&current.id, attempt, &reason, None),
                        )
                        .await;
                    return self.failed_result(
                        &current,
                        PROFICIENCY_GAIN_PARTIAL,
                        reason,
                        adaptations,
                        ctx,
                    );
                }
                AttemptOutcome::NavigationLost(msg) => {
                    self.history
                        .append(
                            &ctx.session_id,
                            ExecutionRecord::failure(&current.id, attempt, &msg, None),
                        )
                        .await;
                    return self.failed_result(&current, 0, msg, adaptations, ctx);
                }
                AttemptOutcome::ActionFailure(failure) => (
                    self.recovery.classify_kind(failure.kind),
                    failure.message,
                    false,
                ),
                AttemptOutcome::Exception(msg) => (self.recovery.classify_text(&msg), msg, true),
            };

            last_was_exception = is_exception;
            last_failure = message.clone();

            let decision = self.recovery.decide(class, &message);
            send_event(
                &self.event_tx,
                EngineEvent::RecoverySelected {
                    session_id: ctx.session_id.clone(),
                    step_id: current.id.clone(),
                    action: decision.kind.as_str().to_string(),
                    detail: decision.detail.clone(),
                },
            );
            self.history
                .append(
                    &ctx.session_id,
                    ExecutionRecord::failure(
                        &current.id,
                        attempt,
                        &message,
                        Some(decision.kind.as_str().to_string()),
                    ),
                )
                .await;

            match decision.kind {
                RecoveryKind::Retry => {
                    // 原样重试；预算由循环条件把守
                    continue;
                }
                RecoveryKind::Adapt => {
                    if attempt >= max_attempts {
                        break;
                    }
                    let signal = AdaptationSignal::Failure {
                        reason: message.clone(),
                    };
                    match self.adapter.adapt_step(&current, &signal).await {
                        Ok(next) => {
                            adaptations.push(format!("adapt: {}", message));
                            current = next;
                        }
                        Err(e) => {
                            // 改写协作者不可用，退化为原样重试
                            tracing::warn!(step = %current.id, "step adapter failed: {}", e);
                        }
                    }
                    continue;
                }
                RecoveryKind::ManualIntervention => {
                    send_event(
                        &self.event_tx,
                        EngineEvent::ManualInterventionRequired {
                            session_id: ctx.session_id.clone(),
                            step_id: current.id.clone(),
                            instructions: decision.detail.clone(),
                        },
                    );
                    return self.failed_result(&current, 0, decision.detail, adaptations, ctx);
                }
                RecoveryKind::AlternativeApproach => {
                    let alternatives = self
                        .plans
                        .generate_alternative_steps(
                            &current.objectives,
                            &current.required_capability,
                            &message,
                        )
                        .await
                        .unwrap_or_default();
                    match alternatives.into_iter().next() {
                        Some(alt) if attempt < max_attempts => {
                            adaptations.push(format!("alternative_approach: {}", alt.title));
                            current = alt;
                            continue;
                        }
                        _ => {
                            // 没有替代方案（或预算耗尽）：跳过并给用户说明
                            let note = format!("已跳过该步骤，原因: {}", message);
                            send_event(
                                &self.event_tx,
                                EngineEvent::StepSkipped {
                                    session_id: ctx.session_id.clone(),
                                    step_id: current.id.clone(),
                                    note: note.clone(),
                                },
                            );
                            return self.failed_result(&current, 0, note, adaptations, ctx);
                        }
                    }
                }
                RecoveryKind::Skip => {
                    let note = format!("已跳过该步骤，原因: {}", message);
                    send_event(
                        &self.event_tx,
                        EngineEvent::StepSkipped {
                            session_id: ctx.session_id.clone(),
                            step_id: current.id.clone(),
                            note: note.clone(),
                        },
                    );
                    return self.failed_result(&current, 0, note, adaptations, ctx);
                }
            }
        }

        // 重试预算耗尽
        let gain = if last_was_exception {
            0
        } else {
            PROFICIENCY_GAIN_PARTIAL
        };
        let reason = format!("重试 {} 次后仍失败: {}", ctx.max_retries, last_failure);
        self.failed_result(&current, gain, reason, adaptations, ctx)
    }

    /// 单次尝试：就绪检查、动作序列、校验
    async fn attempt_once(&self, step: &Step, ctx: &StepContext) -> AttemptOutcome {
        if let Err(e) = self.navigator.ensure_ready(&step.required_capability).await {
            return AttemptOutcome::NavigationLost(format!("导航未就绪: {}", e));
        }

        let mut executed: Vec<ActionResult> = Vec::new();
        for action in &step.actions {
            match self.execute_action(ctx, step, action).await {
                Ok(result) => {
                    let critical_failure = !result.success && action.kind.is_critical();
                    let failure = result.error.clone();
                    executed.push(result);
                    if critical_failure {
                        // 关键动作失败，短路剩余动作
                        let failure = failure.unwrap_or(ActionFailure {
                            kind: crate::collab::ActionErrorKind::Other,
                            message: "action failed without error detail".to_string(),
                        });
                        return AttemptOutcome::ActionFailure(failure);
                    }
                }
                Err(e) => return AttemptOutcome::Exception(e.to_string()),
            }
        }

        let rule_checks = self.check_rules(ctx, step).await;
        let report = validation::score_step(&step.validation, &executed, &rule_checks);
        send_event(
            &self.event_tx,
            EngineEvent::StepValidated {
                session_id: ctx.session_id.clone(),
                step_id: step.id.clone(),
                score: report.score,
                threshold: report.threshold,
                passed: report.passed,
            },
        );
        if report.passed {
            AttemptOutcome::Passed(report)
        } else {
            AttemptOutcome::BelowThreshold(report)
        }
    }

    /// 执行单个动作并输出 JSON 审计日志
    async fn execute_action(
        &self,
        ctx: &StepContext,
        step: &Step,
        action: &Action,
    ) -> Result<ActionResult, crate::core::CoreError> {
        let start = Instant::now();
        let result = self.actions.perform_action(action).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (ok, outcome) = match &result {
            Ok(r) if r.success => (true, "ok"),
            Ok(_) => (false, "failed"),
            Err(_) => (false, "exception"),
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "session": ctx.session_id,
            "step": step.id,
            "kind": action.kind.as_str(),
            "target": target_preview(&action.target),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
        });
        tracing::info!(audit = %audit.to_string(), "action");

        send_event(
            &self.event_tx,
            EngineEvent::ActionExecuted {
                session_id: ctx.session_id.clone(),
                step_id: step.id.clone(),
                kind: action.kind.as_str().to_string(),
                success: ok,
                duration_ms,
            },
        );

        result
    }

    /// 以 Verify 动作逐条评估校验规则；规则检查失败不短路
    async fn check_rules(&self, ctx: &StepContext, step: &Step) -> Vec<(f64, bool)> {
        let mut checks = Vec::with_capacity(step.validation.rules.len());
        for rule in &step.validation.rules {
            let probe = Action::new(ActionKind::Verify, rule.target.clone())
                .with_description("校验步骤效果".to_string());
            let probe = match &rule.expected {
                Some(expected) => probe.with_value(expected.clone()),
                None => probe,
            };
            let passed = match self.execute_action(ctx, step, &probe).await {
                Ok(result) => validation::evaluate_rule(rule, &result),
                Err(e) => {
                    tracing::warn!(step = %step.id, "rule check errored: {}", e);
                    false
                }
            };
            checks.push((rule.weight, passed));
        }
        checks
    }

    fn completed_result(&self, step: &Step, adaptations: Vec<String>) -> StepResult {
        StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Completed,
            outcome: StepOutcome {
                skill: step.required_capability.clone(),
                proficiency_delta: PROFICIENCY_GAIN_SUCCESS,
                description: step.expected_outcome.clone(),
            },
            adaptations,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn failed_result(
        &self,
        step: &Step,
        gain: u32,
        reason: String,
        adaptations: Vec<String>,
        ctx: &StepContext,
    ) -> StepResult {
        send_event(
            &self.event_tx,
            EngineEvent::StepFailed {
                session_id: ctx.session_id.clone(),
                step_id: step.id.clone(),
                reason: reason.clone(),
            },
        );
        tracing::warn!(session = %ctx.session_id, step = %step.id, "step failed: {}", reason);
        StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            outcome: StepOutcome {
                skill: step.required_capability.clone(),
                proficiency_delta: gain,
                description: reason,
            },
            adaptations,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

fn target_preview(target: &str) -> String {
    if target.len() > 120 {
        format!("{}...", target.chars().take(120).collect::<String>())
    } else {
        target.to_string()
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
    use crate::session::model::ValidationCriteria;

    fn ctx(max_retries: u32) -> StepContext {
        StepContext {
            session_id: "session_test".to_string(),
            owner_id: "user_1".to_string(),
            max_retries,
        }
    }

    fn click_step(threshold: f64) -> Step {
        Step::new("点击导出", "report_tool")
            .with_actions(vec![Action::new(ActionKind::Click, "#export")])
            .with_validation(ValidationCriteria {
                rules: vec![],
                success_threshold: threshold,
            })
            .with_objectives(vec!["导出报表".to_string()])
    }

    fn engine_with(actions: MockActionExecutor) -> (StepEngine, Arc<MemoryExecutionHistory>) {
        let history = Arc::new(MemoryExecutionHistory::new());
        let engine = StepEngine::new(
            Arc::new(actions),
            Arc::new(MockNavigator::ready()),
            Arc::new(MockPlanGenerator::new(1, "report_tool")),
            Arc::new(MockStepAdapter::new()),
            history.clone(),
        );
        (engine, history)
    }

    #[tokio::test]
    async fn test_successful_action_completes_with_full_gain() {
        let (engine, _) = engine_with(MockActionExecutor::succeeding());
        let result = engine.execute_step(&click_step(80.0), &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.outcome.proficiency_delta, PROFICIENCY_GAIN_SUCCESS);
    }

    #[tokio::test]
    async fn test_element_not_found_adapts_then_succeeds() {
        // 第一次元素找不到 → adapt → 第二次成功
        let exec = MockActionExecutor::with_script(vec![Ok(ActionResult::failed(
            ActionErrorKind::ElementNotFound,
            "no such element",
        ))]);
        let (engine, history) = engine_with(exec);
        let result = engine.execute_step(&click_step(80.0), &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.adaptations.len(), 1);
        assert!(result.adaptations[0].starts_with("adapt"));

        let records = history.for_session("session_test").await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].recovery.as_deref(), Some("adapt"));
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt_partial_gain() {
        let exec = MockActionExecutor::always_failing(ActionErrorKind::Timeout);
        let (engine, history) = engine_with(exec);
        let result = engine.execute_step(&click_step(80.0), &ctx(0)).await;

        assert_eq!(result.status, StepStatus::Failed);
        // 动作级失败保留最小增量
        assert_eq!(result.outcome.proficiency_delta, PROFICIENCY_GAIN_PARTIAL);
        assert_eq!(history.for_session("session_test").await.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_bounds_attempts() {
        let exec = MockActionExecutor::always_failing(ActionErrorKind::Timeout);
        let (engine, history) = engine_with(exec);
        let result = engine.execute_step(&click_step(80.0), &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Failed);
        // max_retries=3 → 至多 4 次尝试
        assert_eq!(history.for_session("session_test").await.len(), 4);
    }

    #[tokio::test]
    async fn test_authentication_requires_manual_intervention() {
        let exec = MockActionExecutor::always_failing(ActionErrorKind::Authentication);
        let (engine, history) = engine_with(exec);
        let result = engine.execute_step(&click_step(80.0), &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.outcome.proficiency_delta, 0);
        assert!(result.outcome.description.contains("重新登录"));
        // 人工介入不重试
        assert_eq!(history.for_session("session_test").await.len(), 1);
    }

    #[tokio::test]
    async fn test_navigation_loss_fails_without_retry() {
        let history = Arc::new(MemoryExecutionHistory::new());
        let engine = StepEngine::new(
            Arc::new(MockActionExecutor::succeeding()),
            Arc::new(MockNavigator::unavailable()),
            Arc::new(MockPlanGenerator::new(1, "report_tool")),
            Arc::new(MockStepAdapter::new()),
            history.clone(),
        );
        let result = engine.execute_step(&click_step(80.0), &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.outcome.proficiency_delta, 0);
        assert_eq!(history.for_session("session_test").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_failure_uses_alternative_step() {
        // Permission → Unknown 归类 → 替代方案（Navigate 动作非关键，替代步骤可通过）
        let exec = MockActionExecutor::with_script(vec![Ok(ActionResult::failed(
            ActionErrorKind::Permission,
            "permission denied",
        ))]);
        let (engine, _) = engine_with(exec);
        let result = engine.execute_step(&click_step(80.0), &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Completed);
        assert!(result
            .adaptations
            .iter()
            .any(|a| a.starts_with("alternative_approach")));
    }

    #[tokio::test]
    async fn test_no_alternative_skips_with_note() {
        let history = Arc::new(MemoryExecutionHistory::new());
        let engine = StepEngine::new(
            Arc::new(MockActionExecutor::always_failing(ActionErrorKind::Permission)),
            Arc::new(MockNavigator::ready()),
            Arc::new(MockPlanGenerator::new(1, "report_tool").without_alternatives()),
            Arc::new(MockStepAdapter::new()),
            history,
        );
        let result = engine.execute_step(&click_step(80.0), &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.outcome.proficiency_delta, 0);
        assert!(result.outcome.description.contains("已跳过该步骤"));
    }

    #[tokio::test]
    async fn test_validation_miss_is_declared_failure() {
        // Verify 规则失败：动作分量 100、规则分量 0 → 50 分 < 80
        let exec = MockActionExecutor::with_script(vec![
            Ok(ActionResult::ok()),
            Ok(ActionResult::failed(ActionErrorKind::ElementNotFound, "gone")),
        ]);
        let (engine, history) = engine_with(exec);
        let step = Step::new("带校验的步骤", "report_tool")
            .with_actions(vec![Action::new(ActionKind::Click, "#go")])
            .with_validation(ValidationCriteria {
                rules: vec![crate::session::model::ValidationRule::new(
                    crate::session::model::RuleKind::ElementExists,
                    "#done-banner",
                )],
                success_threshold: 80.0,
            });
        let result = engine.execute_step(&step, &ctx(3)).await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.outcome.proficiency_delta, PROFICIENCY_GAIN_PARTIAL);
        // 声明式失败不走重试链
        assert_eq!(history.for_session("session_test").await.len(), 1);
    }
}
