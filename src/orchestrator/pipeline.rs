//! 请求处理管线
//!
//! 每个在途请求对应一条 PipelineProgress：阶段严格有序推进，调用方可随时查询；
//! 会话终态后记录即被丢弃，再查询返回 not found。

use serde::Serialize;

/// 管线阶段（严格有序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Input,
    Intent,
    Planning,
    Execution,
    Adaptation,
    Completion,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Intent => "intent",
            Self::Planning => "planning",
            Self::Execution => "execution",
            Self::Adaptation => "adaptation",
            Self::Completion => "completion",
        }
    }
}

/// 在途请求的进度记录（短暂存在，终态后丢弃）
#[derive(Debug, Clone, Serialize)]
pub struct PipelineProgress {
    pub session_id: String,
    pub stage: PipelineStage,
    pub progress_percent: f64,
    pub current_step_description: String,
    pub estimated_time_remaining_secs: u64,
    pub updated_at: i64,
}

impl PipelineProgress {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            stage: PipelineStage::Input,
            progress_percent: 0.0,
            current_step_description: String::new(),
            estimated_time_remaining_secs: 0,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 推进阶段并更新描述
    pub fn advance(&mut self, stage: PipelineStage, description: impl Into<String>) {
        self.stage = stage;
        self.current_step_description = description.into();
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// 执行阶段的细粒度进度
    pub fn update_execution(
        &mut self,
        percent: f64,
        description: impl Into<String>,
        remaining_secs: u64,
    ) {
        self.stage = PipelineStage::Execution;
        self.progress_percent = percent.clamp(0.0, 100.0);
        self.current_step_description = description.into();
        self.estimated_time_remaining_secs = remaining_secs;
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_updates_stage() {
        let mut p = PipelineProgress::new("session_x");
        assert_eq!(p.stage, PipelineStage::Input);

        p.advance(PipelineStage::Planning, "生成计划");
        assert_eq!(p.stage, PipelineStage::Planning);
        assert_eq!(p.current_step_description, "生成计划");
    }

    #[test]
    fn test_execution_percent_clamped() {
        let mut p = PipelineProgress::new("session_x");
        p.update_execution(150.0, "步骤 1", 30);
        assert_eq!(p.progress_percent, 100.0);
        p.update_execution(-5.0, "步骤 1", 30);
        assert_eq!(p.progress_percent, 0.0);
    }
}
