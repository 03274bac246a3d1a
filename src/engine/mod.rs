//! 步骤执行引擎：动作执行、完成度校验、失败分类、有界重试与执行历史

pub mod events;
pub mod executor;
pub mod history;
pub mod recovery;
pub mod validation;

pub use events::EngineEvent;
pub use executor::{StepContext, StepEngine, PROFICIENCY_GAIN_PARTIAL, PROFICIENCY_GAIN_SUCCESS};
pub use history::{ExecutionHistory, ExecutionRecord, MemoryExecutionHistory};
pub use recovery::{FailureClass, RecoveryDecision, RecoveryEngine, RecoveryKind};
pub use validation::{score_step, ValidationReport};
