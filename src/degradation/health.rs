//! 组件健康模型与探测
//!
//! 每个被监控组件在启动时注册：固定的重要性与固定的降级后备清单，运行时不再推导。
//! 探测走 HealthProbe 接口（真实延迟测量），可用率取最近 N 次探测的滑动比例。

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 组件健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
    Offline,
    /// 尚未探测过
    Unknown,
}

/// 组件重要性（启动时固定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

/// 系统级降级档位；声明顺序即严重程度排序（Full 最轻，Emergency 最重）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    FullFunctionality,
    ReducedFunctionality,
    BasicFunctionality,
    OfflineMode,
    EmergencyMode,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullFunctionality => "full_functionality",
            Self::ReducedFunctionality => "reduced_functionality",
            Self::BasicFunctionality => "basic_functionality",
            Self::OfflineMode => "offline_mode",
            Self::EmergencyMode => "emergency_mode",
        }
    }

    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            Self::FullFunctionality => 0,
            Self::ReducedFunctionality => 1,
            Self::BasicFunctionality => 2,
            Self::OfflineMode => 3,
            Self::EmergencyMode => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::FullFunctionality,
            1 => Self::ReducedFunctionality,
            2 => Self::BasicFunctionality,
            3 => Self::OfflineMode,
            _ => Self::EmergencyMode,
        }
    }
}

/// 启动时的组件声明
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub name: &'static str,
    pub criticality: Criticality,
    pub fallbacks: Vec<&'static str>,
}

/// 固定的被监控组件清单
pub fn default_components() -> Vec<ComponentSpec> {
    vec![
        ComponentSpec {
            name: "browser_automation",
            criticality: Criticality::Critical,
            fallbacks: vec!["static_walkthrough", "manual_instructions"],
        },
        ComponentSpec {
            name: "ai_processing",
            criticality: Criticality::High,
            fallbacks: vec!["cached_content", "template_content"],
        },
        ComponentSpec {
            name: "network",
            criticality: Criticality::Critical,
            fallbacks: vec!["offline_cache", "retry_queue"],
        },
        ComponentSpec {
            name: "interface",
            criticality: Criticality::High,
            fallbacks: vec!["basic_ui"],
        },
        ComponentSpec {
            name: "storage",
            criticality: Criticality::Medium,
            fallbacks: vec!["memory_only"],
        },
        ComponentSpec {
            name: "authentication",
            criticality: Criticality::High,
            fallbacks: vec!["guest_mode", "manual_login"],
        },
    ]
}

/// 一次探测的结果
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn ok(response_time_ms: u64) -> Self {
        Self {
            reachable: true,
            response_time_ms,
            error: None,
        }
    }

    pub fn failed(response_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            response_time_ms,
            error: Some(error.into()),
        }
    }
}

/// 健康探测接口：实现方做真实的依赖检查（ping、就绪探针等）
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

type ReadinessFn = dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
    + Send
    + Sync;

/// 以就绪闭包实现的探测器，自动测量真实延迟
pub struct FnProbe {
    check: Arc<ReadinessFn>,
}

impl FnProbe {
    pub fn new<F, Fut>(check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            check: Arc::new(move || Box::pin(check())),
        }
    }
}

#[async_trait]
impl HealthProbe for FnProbe {
    async fn probe(&self) -> ProbeOutcome {
        let start = Instant::now();
        let result = (self.check)().await;
        let elapsed = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeOutcome::ok(elapsed),
            Err(e) => ProbeOutcome::failed(elapsed, e),
        }
    }
}

/// 组件健康（仅由健康检查循环或手动接口修改）
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub error_count: u32,
    pub response_time_ms: u64,
    /// 最近窗口内的可达比例 [0,1]
    pub availability: f64,
    pub degradation_level: DegradationLevel,
    pub fallbacks_available: Vec<String>,
    pub criticality: Criticality,
    pub last_check: i64,
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl ComponentHealth {
    pub fn new(spec: &ComponentSpec) -> Self {
        Self {
            component: spec.name.to_string(),
            status: HealthStatus::Unknown,
            error_count: 0,
            response_time_ms: 0,
            availability: 1.0,
            degradation_level: DegradationLevel::FullFunctionality,
            fallbacks_available: spec.fallbacks.iter().map(|s| s.to_string()).collect(),
            criticality: spec.criticality,
            last_check: 0,
            recent: VecDeque::new(),
        }
    }

    /// 记录一次探测并重新推导状态
    pub fn record_probe(&mut self, outcome: &ProbeOutcome, window: usize) {
        self.recent.push_back(outcome.reachable);
        while self.recent.len() > window.max(1) {
            self.recent.pop_front();
        }
        if !outcome.reachable {
            self.error_count += 1;
        }
        self.response_time_ms = outcome.response_time_ms;
        self.availability =
            self.recent.iter().filter(|ok| **ok).count() as f64 / self.recent.len() as f64;
        self.last_check = chrono::Utc::now().timestamp_millis();
        self.status = if self.availability >= 0.95 {
            HealthStatus::Healthy
        } else if self.availability >= 0.8 {
            HealthStatus::Degraded
        } else if self.availability >= 0.5 {
            HealthStatus::Failing
        } else {
            HealthStatus::Offline
        };
    }

    /// 最近窗口内的错误比例
    pub fn error_rate(&self) -> f64 {
        1.0 - self.availability
    }
}
