//! Mock 协作者（用于测试，无需真实外部目标）
//!
//! 动作执行器支持脚本化结果序列，跑完脚本后回落为成功；计划生成器返回固定计划。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collab::{
    ActionErrorKind, ActionExecutor, ActionResult, AdaptationSignal, Navigator, PlanGenerator,
    StepAdapter,
};
use crate::core::CoreError;
use crate::session::model::{Action, ActionKind, SkillLevel, Step, ValidationCriteria};

/// 脚本化动作执行器：按序弹出预设结果，脚本耗尽后回落为成功
pub struct MockActionExecutor {
    script: Mutex<VecDeque<Result<ActionResult, CoreError>>>,
    calls: AtomicUsize,
}

impl MockActionExecutor {
    /// 全部成功
    pub fn succeeding() -> Self {
        Self::with_script(vec![])
    }

    /// 每次调用都以指定类别失败（足够长的失败脚本，测试内的动作次数远小于该值）
    pub fn always_failing(kind: ActionErrorKind) -> Self {
        let failures = (0..256)
            .map(|_| Ok(ActionResult::failed(kind, mock_failure_message(kind))))
            .collect();
        Self {
            script: Mutex::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_script(script: Vec<Result<ActionResult, CoreError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn mock_failure_message(kind: ActionErrorKind) -> &'static str {
    match kind {
        ActionErrorKind::ElementNotFound => "no such element: #export-button",
        ActionErrorKind::Timeout => "timed out waiting for page",
        ActionErrorKind::Navigation => "navigation interrupted",
        ActionErrorKind::Authentication => "session expired, login required",
        ActionErrorKind::Network => "connection reset by peer",
        ActionErrorKind::Permission => "permission denied for frame",
        ActionErrorKind::Other => "unexpected driver state",
    }
}

#[async_trait]
impl ActionExecutor for MockActionExecutor {
    async fn perform_action(&self, _action: &Action) -> Result<ActionResult, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(ActionResult::ok_with("mock content")),
        }
    }
}

/// 永远就绪 / 永远失败的导航协作者
pub struct MockNavigator {
    ready: bool,
    calls: AtomicUsize,
}

impl MockNavigator {
    pub fn ready() -> Self {
        Self {
            ready: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            ready: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Navigator for MockNavigator {
    async fn ensure_ready(&self, capability: &str) -> Result<(), CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.ready {
            Ok(())
        } else {
            Err(CoreError::NavigationLost(format!(
                "capability '{}' unreachable",
                capability
            )))
        }
    }
}

/// 固定计划生成器：每个目标产出 step_count 个单动作步骤
pub struct MockPlanGenerator {
    step_count: usize,
    capability: String,
    /// generate_alternative_steps 是否返回替代步骤
    with_alternatives: bool,
    alt_calls: AtomicUsize,
}

impl MockPlanGenerator {
    pub fn new(step_count: usize, capability: impl Into<String>) -> Self {
        Self {
            step_count,
            capability: capability.into(),
            with_alternatives: true,
            alt_calls: AtomicUsize::new(0),
        }
    }

    pub fn without_alternatives(mut self) -> Self {
        self.with_alternatives = false;
        self
    }

    pub fn alternative_calls(&self) -> usize {
        self.alt_calls.load(Ordering::SeqCst)
    }

    fn make_step(&self, index: usize, intent: &str) -> Step {
        Step::new(format!("步骤 {}: {}", index + 1, intent), self.capability.clone())
            .with_actions(vec![Action::new(ActionKind::Click, format!("#step-{}", index + 1))
                .with_description(format!("完成第 {} 步", index + 1))])
            .with_validation(ValidationCriteria::default())
            .with_objectives(vec![intent.to_string()])
            .with_duration(60)
    }
}

#[async_trait]
impl PlanGenerator for MockPlanGenerator {
    async fn generate_plan(
        &self,
        intent: &str,
        _skill_level: SkillLevel,
        _time_constraint_minutes: Option<u32>,
    ) -> Result<Vec<Step>, CoreError> {
        Ok((0..self.step_count).map(|i| self.make_step(i, intent)).collect())
    }

    async fn generate_alternative_steps(
        &self,
        objectives: &[String],
        capability: &str,
        failure_reason: &str,
    ) -> Result<Vec<Step>, CoreError> {
        self.alt_calls.fetch_add(1, Ordering::SeqCst);
        if !self.with_alternatives {
            return Ok(vec![]);
        }
        let objective = objectives.first().cloned().unwrap_or_default();
        Ok(vec![Step::new(format!("替代方案: {}", objective), capability)
            .with_actions(vec![
                Action::new(ActionKind::Navigate, "/fallback").with_description(failure_reason)
            ])])
    }
}

/// 透传改写器：克隆步骤并做可见的最小修改，统计调用次数
pub struct MockStepAdapter {
    calls: AtomicUsize,
}

impl MockStepAdapter {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockStepAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepAdapter for MockStepAdapter {
    async fn adapt_step(&self, step: &Step, signal: &AdaptationSignal) -> Result<Step, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut adapted = step.clone();
        if let AdaptationSignal::Failure { .. } = signal {
            // 失败改写：换一组候选选择器
            for action in adapted.actions.iter_mut() {
                action.target = format!("{}[data-fallback]", action.target);
            }
        }
        Ok(adapted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback_success() {
        let exec = MockActionExecutor::with_script(vec![Ok(ActionResult::failed(
            ActionErrorKind::Timeout,
            "timed out",
        ))]);
        let action = Action::new(ActionKind::Click, "#a");

        let first = exec.perform_action(&action).await.unwrap();
        assert!(!first.success);

        let second = exec.perform_action(&action).await.unwrap();
        assert!(second.success);
        assert_eq!(exec.calls(), 2);
    }

    #[tokio::test]
    async fn test_plan_generator_counts() {
        let plans = MockPlanGenerator::new(3, "demo_tool");
        let steps = plans
            .generate_plan("导出报表", SkillLevel::Beginner, None)
            .await
            .unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].title.contains("导出报表"));
    }
}
