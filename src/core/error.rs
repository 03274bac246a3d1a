//! 核心错误类型
//!
//! 分层约定：动作级失败由执行引擎的恢复逻辑完全吸收，不向上抛出；
//! 步骤级失败以 StepResult 表达（不是错误）；这里的变体对应会话级与进程级失败。

use thiserror::Error;

/// 引擎运行过程中可能出现的错误（会话状态、容量、协作者等）
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 状态机守卫拒绝了操作（如在非 Active 状态下 pause）
    #[error("Operation '{op}' not allowed in status {status}")]
    InvalidTransition { op: &'static str, status: String },

    #[error("Session {0} already reached a terminal status")]
    SessionTerminal(String),

    /// 在途会话数达到上限，立即同步拒绝，不排队
    #[error("Concurrent session limit reached ({0})")]
    CapacityExceeded(usize),

    #[error("Plan generation failed: {0}")]
    PlanGeneration(String),

    #[error("Planner returned an empty plan for objective: {0}")]
    EmptyPlan(String),

    /// 导航/就绪协作者抛出的失败，步骤级重试无法恢复
    #[error("Navigation lost: {0}")]
    NavigationLost(String),

    /// 动作执行器的意外异常（预期失败应以 success=false 返回）
    #[error("Action executor failure: {0}")]
    ActionExecutor(String),

    #[error("Feature '{0}' unavailable at current degradation level")]
    FeatureUnavailable(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled")]
    Cancelled,
}
