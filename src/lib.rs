//! Sherpa - 引导式操作会话引擎
//!
//! 模块划分：
//! - **collab**: 外部协作者契约（动作执行、导航就绪、计划生成、步骤改写）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、会话监管、优雅关闭
//! - **degradation**: 组件健康探测与优雅降级
//! - **engine**: 步骤执行引擎（动作执行、校验、失败分类、有界重试、执行历史）
//! - **observability**: tracing 初始化
//! - **orchestrator**: 请求管线编排、反馈自适应与会话级熔断
//! - **session**: 会话生命周期状态机、数据模型与存储

pub mod collab;
pub mod config;
pub mod core;
pub mod degradation;
pub mod engine;
pub mod observability;
pub mod orchestrator;
pub mod session;
