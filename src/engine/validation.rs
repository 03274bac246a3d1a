//! 步骤完成度校验
//!
//! 将动作成功率与声明的校验规则合成 0-100 分：无规则时只看动作成功率，
//! 有规则时取动作分量与规则加权分量的均值，与步骤阈值比较。

use crate::collab::ActionResult;
use crate::session::model::{RuleKind, ValidationCriteria, ValidationRule};

/// 校验报告
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub score: f64,
    pub threshold: f64,
    pub action_success_rate: f64,
    /// 无规则时为 None
    pub rule_pass_rate: Option<f64>,
    pub passed: bool,
}

/// 单条规则对一次 Verify 结果的判定
pub fn evaluate_rule(rule: &ValidationRule, result: &ActionResult) -> bool {
    match rule.kind {
        RuleKind::ElementExists => result.element_found,
        RuleKind::ContentContains => match (&rule.expected, &result.actual_result) {
            (Some(expected), Some(actual)) => actual.contains(expected.as_str()),
            _ => false,
        },
        RuleKind::ContentEquals => match (&rule.expected, &result.actual_result) {
            (Some(expected), Some(actual)) => actual.trim() == expected.trim(),
            _ => false,
        },
    }
}

/// 合成得分并与阈值比较
///
/// executed 为该步已执行动作的结果（短路后可能少于声明数），
/// rule_checks 为每条规则的 (权重, 是否通过)。
pub fn score_step(
    criteria: &ValidationCriteria,
    executed: &[ActionResult],
    rule_checks: &[(f64, bool)],
) -> ValidationReport {
    let action_success_rate = if executed.is_empty() {
        // 无动作的步骤（纯讲解）按动作全部成功处理
        1.0
    } else {
        executed.iter().filter(|r| r.success).count() as f64 / executed.len() as f64
    };

    let rule_pass_rate = if rule_checks.is_empty() {
        None
    } else {
        let total: f64 = rule_checks.iter().map(|(w, _)| w.max(0.0)).sum();
        if total <= 0.0 {
            Some(0.0)
        } else {
            let passed: f64 = rule_checks
                .iter()
                .filter(|(_, ok)| *ok)
                .map(|(w, _)| w.max(0.0))
                .sum();
            Some(passed / total)
        }
    };

    let score = match rule_pass_rate {
        None => action_success_rate * 100.0,
        Some(rate) => (action_success_rate * 100.0 + rate * 100.0) / 2.0,
    };

    ValidationReport {
        score,
        threshold: criteria.success_threshold,
        action_success_rate,
        rule_pass_rate,
        passed: score >= criteria.success_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ActionErrorKind, ActionResult};

    fn criteria(threshold: f64) -> ValidationCriteria {
        ValidationCriteria {
            rules: vec![],
            success_threshold: threshold,
        }
    }

    #[test]
    fn test_single_successful_action_passes_threshold() {
        let report = score_step(&criteria(80.0), &[ActionResult::ok()], &[]);
        assert_eq!(report.score, 100.0);
        assert!(report.passed);
    }

    #[test]
    fn test_failed_action_misses_threshold() {
        let report = score_step(
            &criteria(80.0),
            &[ActionResult::failed(ActionErrorKind::Other, "boom")],
            &[],
        );
        assert_eq!(report.score, 0.0);
        assert!(!report.passed);
    }

    #[test]
    fn test_rules_average_with_actions() {
        // 动作全过（100）、规则全挂（0）→ 50 分
        let report = score_step(&criteria(80.0), &[ActionResult::ok()], &[(1.0, false)]);
        assert_eq!(report.score, 50.0);
        assert!(!report.passed);

        // 动作全过、规则全过 → 100 分
        let report = score_step(&criteria(80.0), &[ActionResult::ok()], &[(1.0, true)]);
        assert_eq!(report.score, 100.0);
        assert!(report.passed);
    }

    #[test]
    fn test_rule_weights() {
        // 权重 3 的规则通过、权重 1 的失败 → 规则分量 75，动作分量 100 → 87.5
        let report = score_step(
            &criteria(80.0),
            &[ActionResult::ok()],
            &[(3.0, true), (1.0, false)],
        );
        assert!((report.score - 87.5).abs() < 1e-9);
        assert!(report.passed);
    }

    #[test]
    fn test_no_actions_counts_as_full_rate() {
        let report = score_step(&criteria(80.0), &[], &[]);
        assert_eq!(report.action_success_rate, 1.0);
        assert!(report.passed);
    }

    #[test]
    fn test_evaluate_rule_kinds() {
        let exists = ValidationRule::new(RuleKind::ElementExists, "#done");
        assert!(evaluate_rule(&exists, &ActionResult::ok()));
        assert!(!evaluate_rule(
            &exists,
            &ActionResult::failed(ActionErrorKind::ElementNotFound, "gone")
        ));

        let contains = ValidationRule::new(RuleKind::ContentContains, "#msg").expecting("已导出");
        assert!(evaluate_rule(&contains, &ActionResult::ok_with("报表已导出完成")));
        assert!(!evaluate_rule(&contains, &ActionResult::ok_with("失败")));

        let equals = ValidationRule::new(RuleKind::ContentEquals, "#count").expecting("42");
        assert!(evaluate_rule(&equals, &ActionResult::ok_with(" 42 ")));
        assert!(!evaluate_rule(&equals, &ActionResult::ok_with("43")));
    }
}
