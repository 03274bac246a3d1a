//! 降级策略
//!
//! 策略 = 目标组件 + 触发条件集合 + 按序尝试的后备动作（带配对回滚）。
//! 触发条件把健康指标（错误率 / 响应时间 / 可用率）与阈值做比较；
//! 任一条件成立即触发，全部不成立且策略已激活则回滚。

use async_trait::async_trait;
use serde::Serialize;

use crate::degradation::health::{ComponentHealth, DegradationLevel};

/// 触发条件引用的健康指标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMetric {
    ErrorRate,
    ResponseTime,
    Availability,
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

/// 单条触发条件；window_secs 是指标统计窗口的参考值（指标本身已按窗口聚合）
#[derive(Debug, Clone, Serialize)]
pub struct TriggerCondition {
    pub metric: HealthMetric,
    pub comparison: Comparison,
    pub threshold: f64,
    pub window_secs: u64,
}

impl TriggerCondition {
    pub fn new(metric: HealthMetric, comparison: Comparison, threshold: f64) -> Self {
        Self {
            metric,
            comparison,
            threshold,
            window_secs: 60,
        }
    }

    /// 对最新健康值求值
    pub fn holds(&self, health: &ComponentHealth) -> bool {
        let value = match self.metric {
            HealthMetric::ErrorRate => health.error_rate(),
            HealthMetric::ResponseTime => health.response_time_ms as f64,
            HealthMetric::Availability => health.availability,
        };
        match self.comparison {
            Comparison::GreaterThan => value > self.threshold,
            Comparison::GreaterOrEqual => value >= self.threshold,
            Comparison::LessThan => value < self.threshold,
            Comparison::LessOrEqual => value <= self.threshold,
        }
    }
}

/// 后备动作：激活后把组件压到目标档位；回滚由配对的 rollback 过程完成
#[derive(Debug, Clone, Serialize)]
pub struct FallbackAction {
    pub name: String,
    pub description: String,
    pub target_level: DegradationLevel,
}

impl FallbackAction {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        target_level: DegradationLevel,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            target_level,
        }
    }
}

/// 降级策略
#[derive(Debug, Clone, Serialize)]
pub struct DegradationStrategy {
    pub name: String,
    pub target_component: String,
    pub triggers: Vec<TriggerCondition>,
    /// 按声明顺序尝试，直到一个动作应用成功
    pub fallback_actions: Vec<FallbackAction>,
    pub priority: u8,
    pub enabled: bool,
}

impl DegradationStrategy {
    /// 任一触发条件成立即触发
    pub fn triggered(&self, health: &ComponentHealth) -> bool {
        self.triggers.iter().any(|t| t.holds(health))
    }
}

/// 后备动作的应用/回滚执行器；默认实现只做日志与档位标记，
/// 真实接线（切换缓存内容、启用离线队列等）由宿主注入。
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    /// 应用动作，返回是否成功
    async fn apply(&self, component: &str, action: &FallbackAction) -> bool;

    /// 回滚配对动作，返回是否成功
    async fn rollback(&self, component: &str, action: &FallbackAction) -> bool;
}

/// 日志型执行器（默认）
#[derive(Debug, Default)]
pub struct LoggingFallbackHandler;

#[async_trait]
impl FallbackHandler for LoggingFallbackHandler {
    async fn apply(&self, component: &str, action: &FallbackAction) -> bool {
        tracing::warn!(
            component = component,
            action = %action.name,
            level = action.target_level.as_str(),
            "fallback applied"
        );
        true
    }

    async fn rollback(&self, component: &str, action: &FallbackAction) -> bool {
        tracing::info!(
            component = component,
            action = %action.name,
            "fallback rolled back"
        );
        true
    }
}

/// 启动时注册的固定策略集（每个组件一条）
pub fn default_strategies() -> Vec<DegradationStrategy> {
    vec![
        DegradationStrategy {
            name: "browser_automation_fallback".to_string(),
            target_component: "browser_automation".to_string(),
            triggers: vec![
                TriggerCondition::new(HealthMetric::Availability, Comparison::LessThan, 0.8),
                TriggerCondition::new(HealthMetric::ResponseTime, Comparison::GreaterThan, 10_000.0),
            ],
            fallback_actions: vec![
                FallbackAction::new(
                    "static_walkthrough",
                    "改用静态图文指引，不再驱动浏览器",
                    DegradationLevel::ReducedFunctionality,
                ),
                FallbackAction::new(
                    "manual_instructions",
                    "仅提供手动操作说明",
                    DegradationLevel::BasicFunctionality,
                ),
            ],
            priority: 10,
            enabled: true,
        },
        DegradationStrategy {
            name: "ai_processing_fallback".to_string(),
            target_component: "ai_processing".to_string(),
            triggers: vec![
                TriggerCondition::new(HealthMetric::Availability, Comparison::LessThan, 0.8),
                TriggerCondition::new(HealthMetric::ResponseTime, Comparison::GreaterThan, 15_000.0),
            ],
            fallback_actions: vec![
                FallbackAction::new(
                    "cached_content",
                    "改用缓存的计划与讲解内容",
                    DegradationLevel::ReducedFunctionality,
                ),
                FallbackAction::new(
                    "template_content",
                    "改用固定模板内容",
                    DegradationLevel::BasicFunctionality,
                ),
            ],
            priority: 8,
            enabled: true,
        },
        DegradationStrategy {
            name: "network_offline".to_string(),
            target_component: "network".to_string(),
            triggers: vec![TriggerCondition::new(
                HealthMetric::Availability,
                Comparison::LessThan,
                0.5,
            )],
            fallback_actions: vec![FallbackAction::new(
                "offline_cache",
                "断网模式：仅本地缓存与本地存储",
                DegradationLevel::OfflineMode,
            )],
            priority: 9,
            enabled: true,
        },
        DegradationStrategy {
            name: "interface_fallback".to_string(),
            target_component: "interface".to_string(),
            triggers: vec![TriggerCondition::new(
                HealthMetric::Availability,
                Comparison::LessThan,
                0.5,
            )],
            fallback_actions: vec![FallbackAction::new(
                "basic_ui",
                "退回最小界面",
                DegradationLevel::BasicFunctionality,
            )],
            priority: 5,
            enabled: true,
        },
        DegradationStrategy {
            name: "storage_fallback".to_string(),
            target_component: "storage".to_string(),
            triggers: vec![TriggerCondition::new(
                HealthMetric::Availability,
                Comparison::LessThan,
                0.7,
            )],
            fallback_actions: vec![FallbackAction::new(
                "memory_only",
                "仅内存存储，不落盘",
                DegradationLevel::ReducedFunctionality,
            )],
            priority: 4,
            enabled: true,
        },
        DegradationStrategy {
            name: "authentication_fallback".to_string(),
            target_component: "authentication".to_string(),
            triggers: vec![TriggerCondition::new(
                HealthMetric::Availability,
                Comparison::LessThan,
                0.6,
            )],
            fallback_actions: vec![FallbackAction::new(
                "guest_mode",
                "访客模式，跳过需要登录的步骤",
                DegradationLevel::BasicFunctionality,
            )],
            priority: 6,
            enabled: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degradation::health::{ComponentSpec, Criticality, ProbeOutcome};

    fn unhealthy_component() -> ComponentHealth {
        let spec = ComponentSpec {
            name: "browser_automation",
            criticality: Criticality::Critical,
            fallbacks: vec![],
        };
        let mut health = ComponentHealth::new(&spec);
        for _ in 0..3 {
            health.record_probe(&ProbeOutcome::failed(50, "down"), 10);
        }
        health.record_probe(&ProbeOutcome::ok(50), 10);
        health
    }

    #[test]
    fn test_trigger_comparisons() {
        let health = unhealthy_component();
        // 可用率 0.25
        assert!(
            TriggerCondition::new(HealthMetric::Availability, Comparison::LessThan, 0.8)
                .holds(&health)
        );
        assert!(
            !TriggerCondition::new(HealthMetric::Availability, Comparison::GreaterOrEqual, 0.8)
                .holds(&health)
        );
        assert!(
            TriggerCondition::new(HealthMetric::ErrorRate, Comparison::GreaterThan, 0.5)
                .holds(&health)
        );
        assert!(
            !TriggerCondition::new(HealthMetric::ResponseTime, Comparison::GreaterThan, 10_000.0)
                .holds(&health)
        );
    }

    #[test]
    fn test_strategy_any_trigger() {
        let strategies = default_strategies();
        let browser = strategies
            .iter()
            .find(|s| s.target_component == "browser_automation")
            .unwrap();
        assert!(browser.triggered(&unhealthy_component()));
    }

    #[test]
    fn test_default_strategies_cover_all_components() {
        let strategies = default_strategies();
        for spec in crate::degradation::health::default_components() {
            assert!(
                strategies.iter().any(|s| s.target_component == spec.name),
                "missing strategy for {}",
                spec.name
            );
        }
    }
}
