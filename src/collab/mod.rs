//! 外部协作者契约
//!
//! 核心只依赖这里的行为接口：动作执行、导航就绪、计划/替代步骤生成、步骤改写。
//! 具体实现（浏览器驱动、LLM 内容生成等）由宿主注入；Mock 实现见 mock 模块。

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::CoreError;
use crate::session::model::{SkillLevel, Step, StepResult};

/// 动作失败的类别；预期失败必须以 success=false 返回而不是抛错
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    ElementNotFound,
    Timeout,
    Navigation,
    Authentication,
    Network,
    Permission,
    Other,
}

impl ActionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ElementNotFound => "element_not_found",
            Self::Timeout => "timeout",
            Self::Navigation => "navigation",
            Self::Authentication => "authentication",
            Self::Network => "network",
            Self::Permission => "permission",
            Self::Other => "other",
        }
    }
}

/// 单次动作的失败信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: ActionErrorKind,
    pub message: String,
}

/// 动作执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub error: Option<ActionFailure>,
    pub element_found: bool,
    pub execution_time_ms: u64,
    /// 动作产生的实际内容（Verify 时为读取到的文本）
    pub actual_result: Option<String>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            element_found: true,
            execution_time_ms: 0,
            actual_result: None,
        }
    }

    pub fn ok_with(content: impl Into<String>) -> Self {
        Self {
            actual_result: Some(content.into()),
            ..Self::ok()
        }
    }

    pub fn failed(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(ActionFailure {
                kind,
                message: message.into(),
            }),
            element_found: kind != ActionErrorKind::ElementNotFound,
            execution_time_ms: 0,
            actual_result: None,
        }
    }
}

/// 动作执行器：对外部目标执行一个原子动作
///
/// 重试安全：同一动作重复执行必须是幂等安全的。超时控制由实现方负责。
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 预期失败（元素消失、网络超时等）以 success=false 返回；
    /// Err 只用于意外异常（如驱动崩溃），会被引擎按异常级失败处理。
    async fn perform_action(
        &self,
        action: &crate::session::model::Action,
    ) -> Result<ActionResult, CoreError>;
}

/// 导航/就绪协作者：确保目标工具可用
#[async_trait]
pub trait Navigator: Send + Sync {
    /// 失败视为导航级不可恢复，步骤级重试不再尝试
    async fn ensure_ready(&self, capability: &str) -> Result<(), CoreError>;
}

/// 计划/内容生成协作者
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate_plan(
        &self,
        intent: &str,
        skill_level: SkillLevel,
        time_constraint_minutes: Option<u32>,
    ) -> Result<Vec<Step>, CoreError>;

    /// 为失败的步骤合成替代方案；返回空列表表示没有可用替代
    async fn generate_alternative_steps(
        &self,
        objectives: &[String],
        capability: &str,
        failure_reason: &str,
    ) -> Result<Vec<Step>, CoreError>;
}

/// 步骤改写的依据
#[derive(Debug, Clone)]
pub enum AdaptationSignal {
    /// 按用户累计进度预改写（执行前）
    Progress { completed_steps: Vec<String> },
    /// 执行失败后改写目标选择器等
    Failure { reason: String },
    /// 根据上一步结果改写
    Outcome { result: StepResult },
    /// 用户反馈驱动的改写
    Feedback { note: String },
}

/// 步骤改写协作者：产出新 Step 值（写时复制，绝不修改传入的步骤）
#[async_trait]
pub trait StepAdapter: Send + Sync {
    async fn adapt_step(&self, step: &Step, signal: &AdaptationSignal) -> Result<Step, CoreError>;
}
