//! 失败分类与恢复决策
//!
//! 将动作错误类别或异常文本归类，映射为恢复动作：改写选择器重试、原样重试、
//! 人工介入、替代方案（不可用则跳过）。恢复耗时是给调用方/UI 的参考值，引擎不强制。

use regex::Regex;

use crate::collab::ActionErrorKind;

/// 失败归类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 元素/选择器失效
    Selector,
    /// 超时或网络抖动，原样重试有望恢复
    Transient,
    /// 鉴权失效，无法自动恢复
    Authentication,
    /// 其它（走替代方案）
    Unknown,
}

/// 恢复动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    Retry,
    Adapt,
    ManualIntervention,
    AlternativeApproach,
    Skip,
}

impl RecoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Adapt => "adapt",
            Self::ManualIntervention => "manual_intervention",
            Self::AlternativeApproach => "alternative_approach",
            Self::Skip => "skip",
        }
    }
}

/// 恢复决策：动作类型、给用户/调用方的说明、预计恢复耗时（参考值）
#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    pub kind: RecoveryKind,
    pub detail: String,
    pub estimated_recovery_secs: u64,
}

/// 恢复引擎：错误文本与动作错误类别的归类规则
pub struct RecoveryEngine {
    selector_re: Regex,
    transient_re: Regex,
    auth_re: Regex,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        // 静态模式，编译失败属于代码缺陷
        Self {
            selector_re: Regex::new(r"(?i)element|selector|no such|not found|stale reference")
                .expect("static pattern"),
            transient_re: Regex::new(r"(?i)timeout|timed out|network|connection|unreachable|reset")
                .expect("static pattern"),
            auth_re: Regex::new(r"(?i)auth|login|credential|unauthorized|forbidden|session expired")
                .expect("static pattern"),
        }
    }

    /// 异常文本归类（导航丢失等抛出的错误）
    pub fn classify_text(&self, message: &str) -> FailureClass {
        if self.auth_re.is_match(message) {
            FailureClass::Authentication
        } else if self.selector_re.is_match(message) {
            FailureClass::Selector
        } else if self.transient_re.is_match(message) {
            FailureClass::Transient
        } else {
            FailureClass::Unknown
        }
    }

    /// 动作错误类别归类（执行器已给出类型，不必再猜文本）
    pub fn classify_kind(&self, kind: ActionErrorKind) -> FailureClass {
        match kind {
            ActionErrorKind::ElementNotFound => FailureClass::Selector,
            ActionErrorKind::Timeout | ActionErrorKind::Network => FailureClass::Transient,
            ActionErrorKind::Authentication => FailureClass::Authentication,
            ActionErrorKind::Navigation | ActionErrorKind::Permission | ActionErrorKind::Other => {
                FailureClass::Unknown
            }
        }
    }

    /// 归类 → 恢复决策
    pub fn decide(&self, class: FailureClass, message: &str) -> RecoveryDecision {
        match class {
            FailureClass::Selector => RecoveryDecision {
                kind: RecoveryKind::Adapt,
                detail: format!("目标元素定位失效，尝试改写选择器后重试: {}", message),
                estimated_recovery_secs: 120,
            },
            FailureClass::Transient => RecoveryDecision {
                kind: RecoveryKind::Retry,
                detail: format!("网络或超时抖动，原样重试: {}", message),
                estimated_recovery_secs: 60,
            },
            FailureClass::Authentication => RecoveryDecision {
                kind: RecoveryKind::ManualIntervention,
                detail: "登录状态已失效，请在目标站点重新登录后恢复会话。".to_string(),
                estimated_recovery_secs: 300,
            },
            FailureClass::Unknown => RecoveryDecision {
                kind: RecoveryKind::AlternativeApproach,
                detail: format!("未识别的失败，尝试合成替代方案: {}", message),
                estimated_recovery_secs: 120,
            },
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_kind() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.classify_kind(ActionErrorKind::ElementNotFound),
            FailureClass::Selector
        );
        assert_eq!(
            engine.classify_kind(ActionErrorKind::Timeout),
            FailureClass::Transient
        );
        assert_eq!(
            engine.classify_kind(ActionErrorKind::Network),
            FailureClass::Transient
        );
        assert_eq!(
            engine.classify_kind(ActionErrorKind::Authentication),
            FailureClass::Authentication
        );
        assert_eq!(
            engine.classify_kind(ActionErrorKind::Permission),
            FailureClass::Unknown
        );
    }

    #[test]
    fn test_classify_text() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.classify_text("no such element: #submit"),
            FailureClass::Selector
        );
        assert_eq!(
            engine.classify_text("request timed out after 30s"),
            FailureClass::Transient
        );
        assert_eq!(
            engine.classify_text("401 Unauthorized"),
            FailureClass::Authentication
        );
        assert_eq!(
            engine.classify_text("page crashed unexpectedly"),
            FailureClass::Unknown
        );
    }

    #[test]
    fn test_selector_failure_maps_to_adapt() {
        let engine = RecoveryEngine::new();
        let decision = engine.decide(FailureClass::Selector, "no such element");
        assert_eq!(decision.kind, RecoveryKind::Adapt);
        assert_eq!(decision.estimated_recovery_secs, 120);
    }

    #[test]
    fn test_transient_failure_maps_to_retry() {
        let engine = RecoveryEngine::new();
        let decision = engine.decide(FailureClass::Transient, "timed out");
        assert_eq!(decision.kind, RecoveryKind::Retry);
        assert_eq!(decision.estimated_recovery_secs, 60);
    }

    #[test]
    fn test_auth_failure_requires_manual_intervention() {
        let engine = RecoveryEngine::new();
        let decision = engine.decide(FailureClass::Authentication, "session expired");
        assert_eq!(decision.kind, RecoveryKind::ManualIntervention);
        assert!(decision.detail.contains("重新登录"));
    }

    #[test]
    fn test_unknown_failure_tries_alternative() {
        let engine = RecoveryEngine::new();
        let decision = engine.decide(FailureClass::Unknown, "weird");
        assert_eq!(decision.kind, RecoveryKind::AlternativeApproach);
    }
}
