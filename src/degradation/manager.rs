//! 优雅降级管理器
//!
//! 电平触发的控制循环：每个周期探测全部组件、更新健康值，然后对每条启用的策略求值。
//! 任一触发条件成立且未激活则按序应用后备动作并标记激活；全部不成立且已激活（非手动）
//! 则回滚并标记取消。对已激活策略重复求值正是自动恢复的来源。
//! 全局档位 = 所有组件档位中最差者；档位变化只通知一次（变化时，而不是每次检查）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::HealthSection;
use crate::core::CoreError;
use crate::degradation::health::{
    default_components, ComponentHealth, DegradationLevel, HealthProbe, ProbeOutcome,
};
use crate::degradation::strategy::{
    default_strategies, DegradationStrategy, FallbackAction, FallbackHandler,
    LoggingFallbackHandler,
};

/// 降级过程事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DegradationEvent {
    /// 全局档位变化（每次变化恰好一条）
    LevelChanged {
        from: DegradationLevel,
        to: DegradationLevel,
    },
    StrategyActivated {
        strategy: String,
        component: String,
        action: String,
        manual: bool,
    },
    StrategyDeactivated {
        strategy: String,
        component: String,
    },
}

/// 激活中的策略（记录已应用的动作，回滚时配对使用）
#[derive(Debug, Clone)]
struct ActiveStrategy {
    component: String,
    action: FallbackAction,
    manual: bool,
    since: i64,
}

/// 系统健康报告
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub components: Vec<ComponentHealth>,
    pub overall_level: DegradationLevel,
    pub active_strategies: Vec<String>,
    pub recommendations: Vec<String>,
    pub timestamp: i64,
}

/// 优雅降级管理器（进程级单例，组件与策略在启动时固定）
pub struct DegradationManager {
    components: RwLock<HashMap<String, ComponentHealth>>,
    probes: RwLock<HashMap<String, Arc<dyn HealthProbe>>>,
    strategies: RwLock<Vec<DegradationStrategy>>,
    active: RwLock<HashMap<String, ActiveStrategy>>,
    handler: Arc<dyn FallbackHandler>,
    /// 缓存的全局档位；功能闸门只读这里，不碰实时健康值
    overall: AtomicU8,
    event_tx: broadcast::Sender<DegradationEvent>,
    cfg: HealthSection,
}

impl DegradationManager {
    pub fn new(cfg: HealthSection) -> Self {
        Self::with_handler(cfg, Arc::new(LoggingFallbackHandler))
    }

    pub fn with_handler(cfg: HealthSection, handler: Arc<dyn FallbackHandler>) -> Self {
        let components = default_components()
            .iter()
            .map(|spec| (spec.name.to_string(), ComponentHealth::new(spec)))
            .collect();
        let (event_tx, _) = broadcast::channel(64);
        Self {
            components: RwLock::new(components),
            probes: RwLock::new(HashMap::new()),
            strategies: RwLock::new(default_strategies()),
            active: RwLock::new(HashMap::new()),
            handler,
            overall: AtomicU8::new(DegradationLevel::FullFunctionality.as_u8()),
            event_tx,
            cfg,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DegradationEvent> {
        self.event_tx.subscribe()
    }

    /// 注册组件探测器；未注册探测器的组件保持上一次状态
    pub async fn register_probe(
        &self,
        component: &str,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<(), CoreError> {
        if !self.components.read().await.contains_key(component) {
            return Err(CoreError::UnknownComponent(component.to_string()));
        }
        self.probes
            .write()
            .await
            .insert(component.to_string(), probe);
        Ok(())
    }

    /// 启动周期性健康检查循环（关闭 token 取消时退出）
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        let manager = Arc::clone(self);
        let interval_secs = manager.cfg.check_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.run_health_cycle().await;
                    }
                    _ = token.cancelled() => {
                        tracing::info!("health check loop stopped");
                        break;
                    }
                }
            }
        });
    }

    /// 单轮健康检查：并发探测 → 更新健康值 → 策略求值 → 重算全局档位
    ///
    /// 单个组件的探测失败是数据而不是异常，不会阻塞同周期内其它组件。
    pub async fn run_health_cycle(&self) {
        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .probes
            .read()
            .await
            .iter()
            .map(|(name, probe)| (name.clone(), Arc::clone(probe)))
            .collect();

        let outcomes: Vec<(String, ProbeOutcome)> = join_all(probes.into_iter().map(
            |(name, probe)| async move {
                let outcome = probe.probe().await;
                (name, outcome)
            },
        ))
        .await;

        {
            let mut components = self.components.write().await;
            for (name, outcome) in &outcomes {
                if let Some(health) = components.get_mut(name) {
                    health.record_probe(outcome, self.cfg.availability_window);
                    if let Some(err) = &outcome.error {
                        tracing::debug!(component = %name, "probe failed: {}", err);
                    }
                }
            }
        }

        self.evaluate_strategies().await;
        self.recompute_overall().await;
    }

    /// 对每条启用策略做电平触发求值
    async fn evaluate_strategies(&self) {
        let mut strategies = self.strategies.read().await.clone();
        strategies.sort_by(|a, b| b.priority.cmp(&a.priority));

        for strategy in strategies.into_iter().filter(|s| s.enabled) {
            let health = match self.components.read().await.get(&strategy.target_component) {
                Some(h) => h.clone(),
                None => continue,
            };
            let is_active = self.active.read().await.contains_key(&strategy.name);
            let triggered = strategy.triggered(&health);

            if triggered && !is_active {
                self.activate_strategy(&strategy, None, false).await;
            } else if !triggered && is_active {
                // 手动降级不受自动恢复影响，只能显式 restore
                let manual = self
                    .active
                    .read()
                    .await
                    .get(&strategy.name)
                    .map(|a| a.manual)
                    .unwrap_or(false);
                if !manual {
                    self.deactivate_strategy(&strategy.name).await;
                }
            }
        }
    }

    /// 按声明顺序应用后备动作，直到一个成功；level_override 用于手动降级指定档位
    async fn activate_strategy(
        &self,
        strategy: &DegradationStrategy,
        level_override: Option<DegradationLevel>,
        manual: bool,
    ) {
        let candidates: Vec<&FallbackAction> = match level_override {
            Some(level) => {
                let exact: Vec<&FallbackAction> = strategy
                    .fallback_actions
                    .iter()
                    .filter(|a| a.target_level == level)
                    .collect();
                if exact.is_empty() {
                    strategy.fallback_actions.iter().collect()
                } else {
                    exact
                }
            }
            None => strategy.fallback_actions.iter().collect(),
        };

        for action in candidates {
            if self.handler.apply(&strategy.target_component, action).await {
                let mut applied = action.clone();
                if let Some(level) = level_override {
                    applied.target_level = level;
                }
                if let Some(health) = self
                    .components
                    .write()
                    .await
                    .get_mut(&strategy.target_component)
                {
                    health.degradation_level = applied.target_level;
                }
                self.active.write().await.insert(
                    strategy.name.clone(),
                    ActiveStrategy {
                        component: strategy.target_component.clone(),
                        action: applied.clone(),
                        manual,
                        since: chrono::Utc::now().timestamp_millis(),
                    },
                );
                let _ = self.event_tx.send(DegradationEvent::StrategyActivated {
                    strategy: strategy.name.clone(),
                    component: strategy.target_component.clone(),
                    action: applied.name.clone(),
                    manual,
                });
                tracing::warn!(
                    strategy = %strategy.name,
                    component = %strategy.target_component,
                    action = %applied.name,
                    "degradation strategy activated"
                );
                return;
            }
        }
        tracing::error!(
            strategy = %strategy.name,
            "no fallback action could be applied"
        );
    }

    /// 回滚已激活策略并恢复组件档位
    async fn deactivate_strategy(&self, strategy_name: &str) {
        let entry = self.active.write().await.remove(strategy_name);
        let Some(entry) = entry else {
            return;
        };
        if !self.handler.rollback(&entry.component, &entry.action).await {
            tracing::warn!(
                strategy = strategy_name,
                component = %entry.component,
                "rollback reported failure, restoring level anyway"
            );
        }
        if let Some(health) = self.components.write().await.get_mut(&entry.component) {
            health.degradation_level = DegradationLevel::FullFunctionality;
        }
        let _ = self.event_tx.send(DegradationEvent::StrategyDeactivated {
            strategy: strategy_name.to_string(),
            component: entry.component.clone(),
        });
        let active_ms = chrono::Utc::now().timestamp_millis() - entry.since;
        tracing::info!(
            strategy = strategy_name,
            component = %entry.component,
            active_ms,
            "degradation strategy deactivated"
        );
    }

    /// 全局档位 = 所有组件档位中最差者；变化时恰好通知一次
    async fn recompute_overall(&self) {
        let worst = self
            .components
            .read()
            .await
            .values()
            .map(|h| h.degradation_level)
            .max()
            .unwrap_or(DegradationLevel::FullFunctionality);

        let previous =
            DegradationLevel::from_u8(self.overall.swap(worst.as_u8(), Ordering::SeqCst));
        if previous != worst {
            let _ = self.event_tx.send(DegradationEvent::LevelChanged {
                from: previous,
                to: worst,
            });
            tracing::warn!(
                from = previous.as_str(),
                to = worst.as_str(),
                "overall degradation level changed"
            );
        }
    }

    /// 当前全局档位（缓存值）
    pub fn overall_level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.overall.load(Ordering::SeqCst))
    }

    /// 功能闸门：只看缓存的全局档位与固定许可表，不碰实时健康值，
    /// 同一检查周期内的多次调用结果一致。
    pub fn is_feature_available(&self, feature: &str) -> bool {
        match allowed_features(self.overall_level()) {
            None => true,
            Some(allowed) => allowed.contains(&feature),
        }
    }

    /// 手动降级：绕过触发条件求值，复用同一套激活机制
    pub async fn trigger_manual_degradation(
        &self,
        component: &str,
        level: DegradationLevel,
    ) -> Result<(), CoreError> {
        let strategy = self
            .strategies
            .read()
            .await
            .iter()
            .find(|s| s.target_component == component)
            .cloned()
            .ok_or_else(|| CoreError::UnknownComponent(component.to_string()))?;

        // 同一策略已激活时先回滚，避免激活表里残留旧动作
        if self.active.read().await.contains_key(&strategy.name) {
            self.deactivate_strategy(&strategy.name).await;
        }
        self.activate_strategy(&strategy, Some(level), true).await;
        self.recompute_overall().await;
        Ok(())
    }

    /// 手动恢复组件：回滚该组件的激活策略并重算全局档位
    pub async fn restore_component(&self, component: &str) -> Result<(), CoreError> {
        if !self.components.read().await.contains_key(component) {
            return Err(CoreError::UnknownComponent(component.to_string()));
        }
        let names: Vec<String> = self
            .active
            .read()
            .await
            .iter()
            .filter(|(_, a)| a.component == component)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.deactivate_strategy(&name).await;
        }
        self.recompute_overall().await;
        Ok(())
    }

    /// 组件健康快照
    pub async fn component_health(&self, component: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(component).cloned()
    }

    /// 系统健康报告
    pub async fn health_report(&self) -> SystemHealthReport {
        let mut components: Vec<ComponentHealth> =
            self.components.read().await.values().cloned().collect();
        components.sort_by(|a, b| a.component.cmp(&b.component));

        let active = self.active.read().await;
        let active_strategies: Vec<String> = active.keys().cloned().collect();

        let mut recommendations = Vec::new();
        for health in &components {
            match health.status {
                crate::degradation::health::HealthStatus::Offline => recommendations.push(
                    format!("组件 {} 不可用，检查依赖后调用 restore_component", health.component),
                ),
                crate::degradation::health::HealthStatus::Failing => recommendations.push(
                    format!("组件 {} 故障率偏高，建议排查最近的探测错误", health.component),
                ),
                _ => {}
            }
        }
        for (name, entry) in active.iter() {
            if entry.manual {
                recommendations.push(format!("策略 {} 为手动降级，恢复需显式 restore", name));
            }
        }

        SystemHealthReport {
            components,
            overall_level: self.overall_level(),
            active_strategies,
            recommendations,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 每档位的功能许可表；None 表示全部可用
fn allowed_features(level: DegradationLevel) -> Option<&'static [&'static str]> {
    match level {
        DegradationLevel::FullFunctionality => None,
        DegradationLevel::ReducedFunctionality => Some(&[
            "guided_execution",
            "plan_generation",
            "adaptation",
            "feedback",
            "cached_content",
            "local_storage",
            "basic_ui",
        ]),
        DegradationLevel::BasicFunctionality => Some(&[
            "guided_execution",
            "cached_content",
            "local_storage",
            "basic_ui",
        ]),
        DegradationLevel::OfflineMode => {
            Some(&["cached_content", "local_storage", "basic_ui"])
        }
        DegradationLevel::EmergencyMode => Some(&["basic_ui"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 脚本化探测器：按序弹出结果，耗尽后回落为成功
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<ProbeOutcome>>,
    }

    impl ScriptedProbe {
        fn new(outcomes: Vec<ProbeOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
            }
        }

        fn always_down() -> Self {
            Self::new((0..64).map(|_| ProbeOutcome::failed(20, "down")).collect())
        }
    }

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> ProbeOutcome {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ProbeOutcome::ok(10))
        }
    }

    fn small_window_cfg() -> HealthSection {
        HealthSection {
            check_interval_secs: 30,
            availability_window: 4,
        }
    }

    #[tokio::test]
    async fn test_cycle_activates_and_recovers_strategy() {
        let manager = Arc::new(DegradationManager::new(small_window_cfg()));
        manager
            .register_probe(
                "browser_automation",
                Arc::new(ScriptedProbe::new(vec![
                    ProbeOutcome::failed(20, "driver lost"),
                    ProbeOutcome::failed(20, "driver lost"),
                ])),
            )
            .await
            .unwrap();

        // 两轮失败 → 可用率 0 → 策略激活
        manager.run_health_cycle().await;
        manager.run_health_cycle().await;
        assert!(manager.overall_level() > DegradationLevel::FullFunctionality);
        let report = manager.health_report().await;
        assert!(report
            .active_strategies
            .contains(&"browser_automation_fallback".to_string()));

        // 脚本耗尽后探测恢复；窗口 4，足够多轮后可用率回升 → 自动回滚
        for _ in 0..8 {
            manager.run_health_cycle().await;
        }
        assert_eq!(manager.overall_level(), DegradationLevel::FullFunctionality);
        assert!(manager.health_report().await.active_strategies.is_empty());
    }

    #[tokio::test]
    async fn test_overall_is_worst_component() {
        let manager = Arc::new(DegradationManager::new(small_window_cfg()));
        manager
            .register_probe("network", Arc::new(ScriptedProbe::always_down()))
            .await
            .unwrap();
        manager
            .register_probe("storage", Arc::new(ScriptedProbe::always_down()))
            .await
            .unwrap();

        manager.run_health_cycle().await;
        // network → OfflineMode（最差），storage → ReducedFunctionality
        assert_eq!(manager.overall_level(), DegradationLevel::OfflineMode);
        assert_eq!(
            manager
                .component_health("storage")
                .await
                .unwrap()
                .degradation_level,
            DegradationLevel::ReducedFunctionality
        );
    }

    #[tokio::test]
    async fn test_level_change_notified_once() {
        let manager = Arc::new(DegradationManager::new(small_window_cfg()));
        let mut rx = manager.subscribe();
        manager
            .register_probe("network", Arc::new(ScriptedProbe::always_down()))
            .await
            .unwrap();

        manager.run_health_cycle().await;
        manager.run_health_cycle().await;
        manager.run_health_cycle().await;

        let mut level_changes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DegradationEvent::LevelChanged { .. }) {
                level_changes += 1;
            }
        }
        assert_eq!(level_changes, 1);
    }

    #[tokio::test]
    async fn test_manual_degradation_and_restore() {
        let manager = Arc::new(DegradationManager::new(small_window_cfg()));

        manager
            .trigger_manual_degradation(
                "browser_automation",
                DegradationLevel::BasicFunctionality,
            )
            .await
            .unwrap();
        assert_eq!(
            manager
                .component_health("browser_automation")
                .await
                .unwrap()
                .degradation_level,
            DegradationLevel::BasicFunctionality
        );
        assert_eq!(
            manager.overall_level(),
            DegradationLevel::BasicFunctionality
        );

        // 自动求值不会撤销手动降级
        manager.run_health_cycle().await;
        assert_eq!(
            manager.overall_level(),
            DegradationLevel::BasicFunctionality
        );

        manager.restore_component("browser_automation").await.unwrap();
        assert_eq!(manager.overall_level(), DegradationLevel::FullFunctionality);
        assert!(manager.health_report().await.active_strategies.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_component_rejected() {
        let manager = DegradationManager::new(small_window_cfg());
        assert!(matches!(
            manager
                .trigger_manual_degradation("nonexistent", DegradationLevel::OfflineMode)
                .await,
            Err(CoreError::UnknownComponent(_))
        ));
        assert!(manager.restore_component("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn test_basic_ui_available_at_every_level() {
        let manager = DegradationManager::new(small_window_cfg());
        let levels = [
            DegradationLevel::FullFunctionality,
            DegradationLevel::ReducedFunctionality,
            DegradationLevel::BasicFunctionality,
            DegradationLevel::OfflineMode,
            DegradationLevel::EmergencyMode,
        ];
        for level in levels {
            manager.overall.store(level.as_u8(), Ordering::SeqCst);
            assert!(
                manager.is_feature_available("basic_ui"),
                "basic_ui must stay available at {:?}",
                level
            );
        }
        // 对照：离线档位不允许实时执行
        manager
            .overall
            .store(DegradationLevel::OfflineMode.as_u8(), Ordering::SeqCst);
        assert!(!manager.is_feature_available("guided_execution"));
        assert!(manager.is_feature_available("cached_content"));
    }
}
