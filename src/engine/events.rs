//! 执行过程事件：向编排层/前端推送步骤执行、恢复与校验的进展

use serde::Serialize;
use tokio::sync::mpsc;

/// 单步执行过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 开始一次尝试（含重试）
    StepStarted {
        session_id: String,
        step_id: String,
        title: String,
        attempt: u32,
    },
    /// 单个动作执行完毕
    ActionExecuted {
        session_id: String,
        step_id: String,
        kind: String,
        success: bool,
        duration_ms: u64,
    },
    /// 失败分类后选定的恢复动作
    RecoverySelected {
        session_id: String,
        step_id: String,
        action: String,
        detail: String,
    },
    /// 需要人工介入（无法自动恢复），附操作指引
    ManualInterventionRequired {
        session_id: String,
        step_id: String,
        instructions: String,
    },
    /// 校验得分
    StepValidated {
        session_id: String,
        step_id: String,
        score: f64,
        threshold: f64,
        passed: bool,
    },
    StepCompleted {
        session_id: String,
        step_id: String,
        proficiency_delta: u32,
    },
    StepFailed {
        session_id: String,
        step_id: String,
        reason: String,
    },
    /// 替代方案也不可用，跳过该步骤（附用户可见说明）
    StepSkipped {
        session_id: String,
        step_id: String,
        note: String,
    },
}

pub(crate) fn send_event(tx: &Option<mpsc::UnboundedSender<EngineEvent>>, ev: EngineEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
