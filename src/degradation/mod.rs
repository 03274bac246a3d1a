//! 优雅降级层：组件健康探测、降级策略与全局功能闸门

pub mod health;
pub mod manager;
pub mod strategy;

pub use health::{
    default_components, ComponentHealth, ComponentSpec, Criticality, DegradationLevel, FnProbe,
    HealthProbe, HealthStatus, ProbeOutcome,
};
pub use manager::{DegradationEvent, DegradationManager, SystemHealthReport};
pub use strategy::{
    default_strategies, Comparison, DegradationStrategy, FallbackAction, FallbackHandler,
    HealthMetric, LoggingFallbackHandler, TriggerCondition,
};
