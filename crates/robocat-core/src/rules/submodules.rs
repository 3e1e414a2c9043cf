use tracing::warn;

use super::{Rule, RuleContext};
use crate::checkers::SubmoduleState;
use crate::types::{Category, Finding, Severity};

/// Checks each configured nested-submodule directory for consistency via
/// the delegated checker.
pub struct SubmoduleConsistencyRule;

impl Rule for SubmoduleConsistencyRule {
    fn name(&self) -> &'static str {
        "submodule-consistency"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        cx.submodules.is_some() && cx.config.nx_submodule_check_rule.is_some()
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let (Some(checker), Some(rule)) = (cx.submodules, &cx.config.nx_submodule_check_rule)
        else {
            return Vec::new();
        };

        let mut findings = Vec::new();
        for dir in &rule.nx_submodule_dirs {
            match checker.check_submodule(cx.repo_dir, dir) {
                Ok(SubmoduleState::Consistent) => {}
                Ok(SubmoduleState::Inconsistent { details }) => {
                    findings.push(Finding::new(
                        Severity::Block,
                        Category::SubmoduleConsistency,
                        &format!("submodule-{dir}"),
                        format!("Nested submodule `{dir}` is inconsistent: {details}."),
                    ));
                }
                Err(e) => {
                    warn!("submodule check for {dir} failed: {e:#}");
                    findings.push(Finding::new(
                        Severity::Warn,
                        Category::SubmoduleConsistency,
                        &format!("submodule-check-{dir}"),
                        format!("Could not verify nested submodule `{dir}`: {e}."),
                    ));
                }
            }
        }

        if findings.is_empty() {
            findings.push(Finding::new(
                Severity::Pass,
                Category::SubmoduleConsistency,
                "submodules",
                "All nested submodules are consistent.",
            ));
        }
        findings
    }
}
