//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SHERPA__*` 覆盖（双下划线表示嵌套，如 `SHERPA__ENGINE__MAX_RETRIES=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// [app] 段：应用名、数据目录（文件归档用）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 终态会话 JSON 归档目录，未设置时用 ./data
    pub data_dir: Option<PathBuf>,
}

/// [session] 段：上下文窗口与闲置回收
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 恢复会话时重建的「已完成步骤」窗口长度
    pub max_context_steps: usize,
    /// 会话闲置超时（秒），超时的非终态会话由清理任务取消并归档
    pub idle_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_context_steps: 10,
            idle_timeout_secs: 3600,
        }
    }
}

/// [engine] 段：单步重试预算与默认校验阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 单步最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: u32,
    /// 步骤未声明阈值时使用的通过分数（0-100）
    pub default_success_threshold: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_success_threshold: 80.0,
        }
    }
}

/// [orchestrator] 段：并发上限、熔断预算、反馈阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 在途会话数上限，超出立即拒绝（不排队）
    pub max_concurrent_sessions: usize,
    /// 会话级错误预算，超出后会话转为失败终态
    pub recovery_attempt_budget: usize,
    /// 满意度低于该值时触发自适应动作
    pub satisfaction_threshold: f64,
    /// 暂停状态下执行循环的轮询间隔（毫秒）
    pub pause_poll_ms: u64,
    /// 闲置会话清理间隔（秒）
    pub sweep_interval_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            recovery_attempt_budget: 5,
            satisfaction_threshold: 0.5,
            pause_poll_ms: 200,
            sweep_interval_secs: 300,
        }
    }
}

/// [health] 段：健康检查节奏与可用率窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// 健康检查周期（秒）
    pub check_interval_secs: u64,
    /// 可用率统计的滑动窗口大小（最近 N 次探测）
    pub availability_window: usize,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            availability_window: 20,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            session: SessionSection::default(),
            engine: EngineSection::default(),
            orchestrator: OrchestratorSection::default(),
            health: HealthSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 SHERPA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SHERPA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SHERPA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（配置热更新：调用方决定是否用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.max_retries, 3);
        assert_eq!(cfg.orchestrator.max_concurrent_sessions, 5);
        assert_eq!(cfg.health.check_interval_secs, 30);
        assert!((cfg.orchestrator.satisfaction_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/sherpa.toml"))).unwrap();
        assert_eq!(cfg.session.max_context_steps, 10);
        assert_eq!(cfg.orchestrator.recovery_attempt_budget, 5);
    }
}
