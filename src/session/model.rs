//! 会话数据模型
//!
//! Session 由会话管理器独占所有；Step 采用写时复制改写（改写产出新值、原地替换同下标，
//! 从不穿透共享引用修改），避免一个会话的改写污染其它会话缓存的计划模板。
//! 状态机与步骤提交的纯逻辑也放在这里，存储实现只负责在锁内调用它们。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::CoreError;

/// 会话 ID
pub type SessionId = String;

/// 会话状态机：Created → Active ⇄ Paused；Active → Completed | Failed | Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// 终态不接受任何操作
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// 用户技能水平（计划生成协作者的输入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillLevel {
    Beginner,
    Intermediate,
    Advanced,
}

/// 外部请求：为某个目标生成并执行一次引导会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuideRequest {
    pub user_id: String,
    pub objective: String,
    pub skill_level: SkillLevel,
    pub time_constraint_minutes: Option<u32>,
}

/// 动作类型；关键动作（直接改变外部状态）失败时短路该步剩余动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Select,
    Scroll,
    Wait,
    Submit,
    Verify,
}

impl ActionKind {
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Click | Self::Type | Self::Select | Self::Submit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Select => "select",
            Self::Scroll => "scroll",
            Self::Wait => "wait",
            Self::Submit => "submit",
            Self::Verify => "verify",
        }
    }
}

/// 一个原子外部动作
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// CSS 选择器或 URL
    pub target: String,
    /// 输入值（Type/Select 等需要）
    pub value: Option<String>,
    pub description: String,
}

impl Action {
    pub fn new(kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            value: None,
            description: String::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 校验规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ElementExists,
    ContentContains,
    ContentEquals,
}

/// 单条校验规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub kind: RuleKind,
    pub target: String,
    pub expected: Option<String>,
    /// 加权占比，默认 1.0
    pub weight: f64,
}

impl ValidationRule {
    pub fn new(kind: RuleKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            expected: None,
            weight: 1.0,
        }
    }

    pub fn expecting(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// 步骤完成判定：规则加权通过率与动作成功率合成的分数达到阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCriteria {
    pub rules: Vec<ValidationRule>,
    /// 通过阈值（0-100）
    pub success_threshold: f64,
}

impl Default for ValidationCriteria {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            success_threshold: 80.0,
        }
    }
}

/// 步骤复杂度（计划生成协作者给出，UI 展示用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// 计划中的一个步骤；创建后不可变，改写必须产出新 Step 值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub description: String,
    /// 所需外部工具/站点能力标识（导航协作者的输入）
    pub required_capability: String,
    pub actions: Vec<Action>,
    /// 给用户的讲解
    pub explanation: String,
    pub expected_outcome: String,
    pub validation: ValidationCriteria,
    pub estimated_duration_secs: u64,
    pub complexity: Complexity,
    pub prerequisites: Vec<String>,
    pub objectives: Vec<String>,
}

impl Step {
    pub fn new(title: impl Into<String>, required_capability: impl Into<String>) -> Self {
        Self {
            id: format!("step_{}", uuid::Uuid::new_v4()),
            title: title.into(),
            description: String::new(),
            required_capability: required_capability.into(),
            actions: Vec::new(),
            explanation: String::new(),
            expected_outcome: String::new(),
            validation: ValidationCriteria::default(),
            estimated_duration_secs: 60,
            complexity: Complexity::Low,
            prerequisites: Vec::new(),
            objectives: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_validation(mut self, validation: ValidationCriteria) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_objectives(mut self, objectives: Vec<String>) -> Self {
        self.objectives = objectives;
        self
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }
}

/// 步骤执行的最终状态（重试链结束后的那一次）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// 步骤产出：技能与熟练度增量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub skill: String,
    pub proficiency_delta: u32,
    pub description: String,
}

/// 一次步骤执行的结果（含重试链），每次 execute_step 只产出一个
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub outcome: StepOutcome,
    /// 本次执行期间应用过的改写说明
    pub adaptations: Vec<String>,
    pub timestamp: i64,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// 会话上下文：环境状态与已完成步骤窗口（暂停恢复后不必重新推导历史）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    pub environment: HashMap<String, String>,
    /// 已完成步骤标题的窗口（最近 N 条）
    pub previous_steps: Vec<String>,
    /// 计划中多数步骤使用的主要目标工具
    pub primary_target: Option<String>,
}

/// 会话累计统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionAnalytics {
    pub total_proficiency: u32,
    pub attempts: u32,
    pub failures: u32,
    pub adaptations: u32,
}

/// 会话进度快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgress {
    pub completed_steps: usize,
    pub total_steps: usize,
    pub percent: f64,
}

/// 一次引导会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub owner_id: String,
    pub objective: String,
    pub status: SessionStatus,
    /// 不变量：0 <= current_step_index <= steps.len()，单调不减
    pub current_step_index: usize,
    pub steps: Vec<Step>,
    /// 已提交的步骤结果（按执行顺序）
    pub results: Vec<StepResult>,
    pub context: SessionContext,
    pub analytics: SessionAnalytics,
    pub start_time: i64,
    pub last_activity: i64,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Session {
    pub fn new(owner_id: impl Into<String>, objective: impl Into<String>, steps: Vec<Step>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            owner_id: owner_id.into(),
            objective: objective.into(),
            status: SessionStatus::Created,
            current_step_index: 0,
            steps,
            results: Vec::new(),
            context: SessionContext::default(),
            analytics: SessionAnalytics::default(),
            start_time: now,
            last_activity: now,
            paused_at: None,
            completed_at: None,
        }
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn progress(&self) -> SessionProgress {
        let total = self.steps.len();
        let completed = self.current_step_index.min(total);
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        SessionProgress {
            completed_steps: completed,
            total_steps: total,
            percent,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now().timestamp_millis();
    }

    /// 闲置超时判定（清理任务用）；终态会话不算闲置
    pub fn is_idle(&self, timeout_secs: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = chrono::Utc::now().timestamp_millis();
        now - self.last_activity > timeout_secs as i64 * 1000
    }

    /// 应用一次原子修改；存储实现必须在自己的锁内调用
    pub fn apply(&mut self, op: SessionOp) -> Result<(), CoreError> {
        match op {
            SessionOp::Transition(t) => self.transition(t),
            SessionOp::CommitStep(result) => self.commit_step(result),
            SessionOp::ReplaceCurrentStep { step, note } => self.replace_current_step(step, note),
            SessionOp::ScaleRemainingDurations(factor) => {
                for step in self.steps.iter_mut().skip(self.current_step_index) {
                    step.estimated_duration_secs =
                        (step.estimated_duration_secs as f64 * factor).round() as u64;
                }
                self.touch();
                Ok(())
            }
            SessionOp::SetPrimaryTarget(target) => {
                self.context.primary_target = Some(target);
                Ok(())
            }
            SessionOp::SetEnvironment(key, value) => {
                self.context.environment.insert(key, value);
                self.touch();
                Ok(())
            }
            SessionOp::RecomputeContext { window } => {
                self.recompute_context(window);
                Ok(())
            }
        }
    }

    /// 守卫式状态迁移；除 Created → Active 外都有前置状态要求
    fn transition(&mut self, op: TransitionOp) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::SessionTerminal(self.id.clone()));
        }
        let now = chrono::Utc::now().timestamp_millis();
        match op {
            TransitionOp::Activate => match self.status {
                SessionStatus::Created => {
                    self.status = SessionStatus::Active;
                }
                other => return Err(invalid("activate", other)),
            },
            TransitionOp::Pause => match self.status {
                SessionStatus::Active => {
                    self.status = SessionStatus::Paused;
                    self.paused_at = Some(now);
                }
                other => return Err(invalid("pause", other)),
            },
            TransitionOp::Resume => match self.status {
                SessionStatus::Paused => {
                    self.status = SessionStatus::Active;
                    self.paused_at = None;
                }
                other => return Err(invalid("resume", other)),
            },
            TransitionOp::Complete => match self.status {
                SessionStatus::Active => {
                    self.status = SessionStatus::Completed;
                    self.completed_at = Some(now);
                }
                other => return Err(invalid("complete", other)),
            },
            TransitionOp::Fail => match self.status {
                SessionStatus::Active | SessionStatus::Paused => {
                    self.status = SessionStatus::Failed;
                    self.completed_at = Some(now);
                }
                other => return Err(invalid("fail", other)),
            },
            TransitionOp::Cancel => match self.status {
                SessionStatus::Created | SessionStatus::Active | SessionStatus::Paused => {
                    self.status = SessionStatus::Cancelled;
                    self.completed_at = Some(now);
                }
                other => return Err(invalid("cancel", other)),
            },
        }
        self.last_activity = now;
        Ok(())
    }

    /// 提交一次步骤结果：记录、统计、成功才推进下标；
    /// 推进到末尾且最后一步成功时在同一次修改内转为 Completed，
    /// 外部观察不到「进度已满但未完成」的中间态。
    fn commit_step(&mut self, result: StepResult) -> Result<(), CoreError> {
        // 暂停可能落在步骤执行中间：飞行中的结果仍然要入账
        if !matches!(self.status, SessionStatus::Active | SessionStatus::Paused) {
            return Err(invalid("commit_step", self.status));
        }
        if self.current_step_index >= self.steps.len() {
            return Err(invalid("commit_step", self.status));
        }

        let succeeded = result.is_success();
        self.analytics.attempts += 1;
        self.analytics.total_proficiency += result.outcome.proficiency_delta;
        self.analytics.adaptations += result.adaptations.len() as u32;
        if !succeeded {
            self.analytics.failures += 1;
        }

        if succeeded {
            let title = self.steps[self.current_step_index].title.clone();
            self.context.previous_steps.push(title);
            self.current_step_index += 1;
        }
        self.results.push(result);

        if succeeded && self.current_step_index == self.steps.len() {
            self.status = SessionStatus::Completed;
            self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        }
        self.touch();
        Ok(())
    }

    /// 原地替换当前步骤（同下标、新内容），已执行的步骤不动
    fn replace_current_step(&mut self, step: Step, note: String) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::SessionTerminal(self.id.clone()));
        }
        let idx = self.current_step_index;
        if idx >= self.steps.len() {
            return Err(invalid("replace_current_step", self.status));
        }
        self.steps[idx] = step;
        if !note.is_empty() {
            self.analytics.adaptations += 1;
            tracing::debug!(session = %self.id, step = idx, "step replaced: {}", note);
        }
        self.touch();
        Ok(())
    }

    /// 从已完成前缀重建 previous_steps 窗口并恢复环境标记（resume 用）
    fn recompute_context(&mut self, window: usize) {
        let completed = self.current_step_index.min(self.steps.len());
        let from = completed.saturating_sub(window);
        self.context.previous_steps = self.steps[from..completed]
            .iter()
            .map(|s| s.title.clone())
            .collect();
        self.context.environment.insert(
            "resumed_at".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        );
    }
}

fn invalid(op: &'static str, status: SessionStatus) -> CoreError {
    CoreError::InvalidTransition {
        op,
        status: status.to_string(),
    }
}

/// 守卫式状态迁移操作
#[derive(Debug, Clone, Copy)]
pub enum TransitionOp {
    Activate,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
}

/// 会话的原子修改操作；存储实现保证单个 apply 在锁内完成
#[derive(Debug, Clone)]
pub enum SessionOp {
    Transition(TransitionOp),
    CommitStep(StepResult),
    ReplaceCurrentStep { step: Step, note: String },
    /// 调整剩余步骤预估时长（节奏自适应）
    ScaleRemainingDurations(f64),
    SetPrimaryTarget(String),
    SetEnvironment(String, String),
    RecomputeContext { window: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(steps: usize) -> Session {
        let steps = (0..steps)
            .map(|i| Step::new(format!("步骤 {}", i + 1), "demo_tool"))
            .collect();
        let mut s = Session::new("user_1", "学会导出报表", steps);
        s.apply(SessionOp::Transition(TransitionOp::Activate)).unwrap();
        s
    }

    fn ok_result(step_id: &str) -> StepResult {
        StepResult {
            step_id: step_id.to_string(),
            status: StepStatus::Completed,
            outcome: StepOutcome {
                skill: "demo_tool".to_string(),
                proficiency_delta: 25,
                description: String::new(),
            },
            adaptations: vec![],
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn failed_result(step_id: &str) -> StepResult {
        StepResult {
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            outcome: StepOutcome {
                skill: "demo_tool".to_string(),
                proficiency_delta: 5,
                description: String::new(),
            },
            adaptations: vec![],
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[test]
    fn test_guarded_transitions() {
        let mut s = make_session(2);
        assert_eq!(s.status, SessionStatus::Active);

        // Active 状态不允许 resume
        assert!(s.apply(SessionOp::Transition(TransitionOp::Resume)).is_err());

        s.apply(SessionOp::Transition(TransitionOp::Pause)).unwrap();
        assert_eq!(s.status, SessionStatus::Paused);
        assert!(s.paused_at.is_some());

        s.apply(SessionOp::Transition(TransitionOp::Resume)).unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.paused_at.is_none());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut s = make_session(1);
        s.apply(SessionOp::Transition(TransitionOp::Cancel)).unwrap();
        assert!(matches!(
            s.apply(SessionOp::Transition(TransitionOp::Pause)),
            Err(CoreError::SessionTerminal(_))
        ));
    }

    #[test]
    fn test_commit_advances_only_on_success() {
        let mut s = make_session(2);
        let id = s.steps[0].id.clone();

        s.apply(SessionOp::CommitStep(failed_result(&id))).unwrap();
        assert_eq!(s.current_step_index, 0);
        assert_eq!(s.analytics.failures, 1);

        s.apply(SessionOp::CommitStep(ok_result(&id))).unwrap();
        assert_eq!(s.current_step_index, 1);
        assert_eq!(s.context.previous_steps, vec!["步骤 1".to_string()]);
    }

    #[test]
    fn test_last_step_success_completes_atomically() {
        let mut s = make_session(1);
        let id = s.steps[0].id.clone();
        s.apply(SessionOp::CommitStep(ok_result(&id))).unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.current_step_index, 1);
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn test_last_step_failure_does_not_complete() {
        let mut s = make_session(1);
        let id = s.steps[0].id.clone();
        s.apply(SessionOp::CommitStep(failed_result(&id))).unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.current_step_index, 0);
    }

    #[test]
    fn test_pause_resume_keeps_index() {
        let mut s = make_session(3);
        let id = s.steps[0].id.clone();
        s.apply(SessionOp::CommitStep(ok_result(&id))).unwrap();

        s.apply(SessionOp::Transition(TransitionOp::Pause)).unwrap();
        s.apply(SessionOp::Transition(TransitionOp::Resume)).unwrap();
        s.apply(SessionOp::RecomputeContext { window: 10 }).unwrap();

        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.current_step_index, 1);
        assert_eq!(s.context.previous_steps, vec!["步骤 1".to_string()]);
        assert!(s.context.environment.contains_key("resumed_at"));
    }

    #[test]
    fn test_replace_current_step_in_place() {
        let mut s = make_session(2);
        let new_step = Step::new("改写后的步骤", "demo_tool");
        s.apply(SessionOp::ReplaceCurrentStep {
            step: new_step,
            note: "selector adapted".to_string(),
        })
        .unwrap();
        assert_eq!(s.steps[0].title, "改写后的步骤");
        assert_eq!(s.steps.len(), 2);
        assert_eq!(s.analytics.adaptations, 1);
    }

    #[test]
    fn test_scale_remaining_durations() {
        let mut s = make_session(2);
        let id = s.steps[0].id.clone();
        s.apply(SessionOp::CommitStep(ok_result(&id))).unwrap();
        s.apply(SessionOp::ScaleRemainingDurations(1.5)).unwrap();
        // 已完成的不动，剩余的放大
        assert_eq!(s.steps[0].estimated_duration_secs, 60);
        assert_eq!(s.steps[1].estimated_duration_secs, 90);
    }

    #[test]
    fn test_progress_bounds() {
        let mut s = make_session(2);
        assert_eq!(s.progress().percent, 0.0);
        let id = s.steps[0].id.clone();
        s.apply(SessionOp::CommitStep(ok_result(&id))).unwrap();
        assert_eq!(s.progress().completed_steps, 1);
        assert!(s.progress().percent > 49.0 && s.progress().percent < 51.0);
    }
}
