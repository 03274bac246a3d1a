//! 会话层：数据模型、生命周期状态机、存储与归档

pub mod archive;
pub mod manager;
pub mod model;
pub mod store;

pub use archive::{FileRecoveryStore, MemoryRecoveryStore, RecoveryStore};
pub use manager::SessionManager;
pub use model::{
    Action, ActionKind, Complexity, GuideRequest, RuleKind, Session, SessionAnalytics,
    SessionContext, SessionId, SessionOp, SessionProgress, SessionStatus, SkillLevel, Step,
    StepOutcome, StepResult, StepStatus, TransitionOp, ValidationCriteria, ValidationRule,
};
pub use store::{MemorySessionStore, SessionStore};
