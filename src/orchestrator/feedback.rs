//! 用户反馈评分与自适应动作选择
//!
//! 满意度为固定加权规则：基准 0.5，有帮助 +0.3，困惑 -0.3，节奏不合适 -0.2，
//! 难度不合适 -0.1，截断到 [0,1]。低于阈值时三选一：调节奏 / 换方法 / 求助信号。

use serde::{Deserialize, Serialize};

/// 节奏问题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaceIssue {
    TooFast,
    TooSlow,
}

/// 难度问题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyIssue {
    TooEasy,
    TooHard,
}

/// 用户对会话的反馈
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    pub helpful: bool,
    pub confusing: bool,
    pub pace: Option<PaceIssue>,
    pub difficulty: Option<DifficultyIssue>,
    pub comment: Option<String>,
}

/// 满意度评分：固定加权，截断到 [0,1]
pub fn satisfaction_score(feedback: &UserFeedback) -> f64 {
    let mut score: f64 = 0.5;
    if feedback.helpful {
        score += 0.3;
    }
    if feedback.confusing {
        score -= 0.3;
    }
    if feedback.pace.is_some() {
        score -= 0.2;
    }
    if feedback.difficulty.is_some() {
        score -= 0.1;
    }
    score.clamp(0.0, 1.0)
}

/// 自适应动作
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdaptationAction {
    /// 调整剩余步骤预估时长（太快 → 1.5×，太慢 → 0.7×）
    AdjustPace { factor: f64 },
    /// 重新生成当前步骤
    ChangeApproach,
    /// 发出求助信号，不改计划
    ProvideHelp,
}

/// 低满意度时的动作选择：节奏问题优先，其次困惑/太难换方法，否则给求助信号
pub fn select_adaptation(feedback: &UserFeedback) -> AdaptationAction {
    if let Some(pace) = feedback.pace {
        let factor = match pace {
            PaceIssue::TooFast => 1.5,
            PaceIssue::TooSlow => 0.7,
        };
        return AdaptationAction::AdjustPace { factor };
    }
    if feedback.confusing || feedback.difficulty == Some(DifficultyIssue::TooHard) {
        return AdaptationAction::ChangeApproach;
    }
    AdaptationAction::ProvideHelp
}
