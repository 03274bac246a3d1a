//! 核心层：错误类型、会话监管、优雅关闭

pub mod error;
pub mod shutdown;
pub mod supervisor;

pub use error::CoreError;
pub use shutdown::{FnCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use supervisor::SessionSupervisor;
