use std::collections::BTreeSet;

use tracing::warn;

use super::{Rule, RuleContext};
use crate::checkers::relevance_checker;
use crate::types::{Category, Finding, FileChange, Severity};

/// Delegates content checking of open-sourced files to the external
/// compliance checker and turns its verdicts into findings. A clean diff
/// that adds new open-source files still needs a human sign-off.
pub struct OpenSourceComplianceRule;

fn open_sourced<'a>(files: &'a [FileChange]) -> Vec<&'a FileChange> {
    match relevance_checker("is_file_open_sourced") {
        Some(pred) => files.iter().filter(|f| pred(f)).collect(),
        None => Vec::new(),
    }
}

/// Approvers whose sign-off covers the given files, unioned over every
/// configured ruleset that considers them relevant.
fn approvers_for(cx: &RuleContext<'_>, files: &[FileChange]) -> BTreeSet<String> {
    let mut approvers = BTreeSet::new();
    for ruleset in cx.rulesets {
        if let Some(required) = ruleset.required_approvers(files) {
            approvers.extend(required.iter().cloned());
        }
    }
    approvers
}

impl Rule for OpenSourceComplianceRule {
    fn name(&self) -> &'static str {
        "open-source-compliance"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        cx.compliance.is_some() && !open_sourced(&cx.snapshot.changed_files).is_empty()
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let Some(checker) = cx.compliance else {
            return Vec::new();
        };
        let touched = open_sourced(&cx.snapshot.changed_files);
        let paths: Vec<String> = touched.iter().map(|f| f.path.clone()).collect();

        let violations = match checker.check_files(cx.repo_dir, &paths) {
            Ok(v) => v,
            Err(e) => {
                warn!("compliance checker failed: {e:#}");
                return vec![Finding::new(
                    Severity::Warn,
                    Category::OpenSourceCompliance,
                    "oss-checker-failure",
                    format!("The open-source compliance checker could not run: {e}."),
                )];
            }
        };

        if !violations.is_empty() {
            return violations
                .iter()
                .map(|v| {
                    let file_change: Vec<FileChange> = cx
                        .snapshot
                        .changed_files
                        .iter()
                        .filter(|f| f.path == v.file)
                        .cloned()
                        .collect();
                    let location = match v.line {
                        Some(line) => format!("{}:{line}", v.file),
                        None => v.file.clone(),
                    };
                    Finding::new(
                        Severity::Block,
                        Category::OpenSourceCompliance,
                        &format!("oss-{}", v.file),
                        format!("Open-source compliance violation in {location}: {} ({}).", v.message, v.rule_id),
                    )
                    .with_approvers(approvers_for(cx, &file_change))
                })
                .collect();
        }

        let new_files: Vec<FileChange> =
            touched.iter().filter(|f| f.new_file).map(|f| (*f).clone()).collect();
        if !new_files.is_empty() {
            let names: Vec<&str> = new_files.iter().map(|f| f.path.as_str()).collect();
            let approvers = approvers_for(cx, &new_files);
            return vec![Finding::new(
                Severity::Warn,
                Category::OpenSourceCompliance,
                "oss-signoff",
                format!(
                    "New files are being open-sourced ({}); an open-source approver must sign \
                     off before merge.",
                    names.join(", ")
                ),
            )
            .with_approvers(approvers)];
        }

        vec![Finding::new(
            Severity::Pass,
            Category::OpenSourceCompliance,
            "oss-clean",
            "Open-source changes are compliant; no new files published.",
        )]
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::checkers::{ApprovalRuleset, ComplianceChecker, Violation};
    use crate::config::{ApproveRule, ApproveRuleset};
    use crate::rules::tests::{context, snapshot_with};
    use crate::rules::RuleContext;

    struct FixedChecker(Vec<Violation>);

    impl ComplianceChecker for FixedChecker {
        fn check_files(&self, _repo_dir: &Path, _files: &[String]) -> anyhow::Result<Vec<Violation>> {
            Ok(self.0.clone())
        }
    }

    fn change(path: &str, new_file: bool) -> FileChange {
        FileChange {
            path: path.into(),
            old_path: path.into(),
            new_file,
            deleted_file: false,
            diff: String::new(),
        }
    }

    fn oss_ruleset() -> ApprovalRuleset {
        ApprovalRuleset::compile(
            "open_source",
            &ApproveRuleset {
                relevance_checker: "is_file_open_sourced".into(),
                rules: vec![
                    ApproveRule {
                        patterns: vec!["open/client/**".into()],
                        approvers: vec!["client_approver_1".into(), "client_approver_2".into()],
                    },
                    ApproveRule {
                        patterns: vec!["**".into()],
                        approvers: vec!["apidoc_approver_1".into(), "apidoc_approver_2".into()],
                    },
                ],
            },
        )
        .expect("compile")
    }

    fn with_checker<'a>(
        harness: &'a crate::rules::tests::Harness<'a>,
        checker: &'a dyn ComplianceChecker,
    ) -> RuleContext<'a> {
        let mut cx = harness.cx();
        cx.compliance = Some(checker);
        cx
    }

    #[test]
    fn clean_new_open_file_requires_signoff() {
        let snapshot = snapshot_with(|s| {
            s.changed_files = vec![change("open/server/foo.cpp", true)];
        });
        let mut harness = context(&snapshot);
        harness.rulesets = vec![oss_ruleset()];
        let checker = FixedChecker(vec![]);
        let findings = OpenSourceComplianceRule.evaluate(&with_checker(&harness, &checker), &[]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warn);
        assert!(findings[0].required_approvers.contains("apidoc_approver_1"));
        assert!(findings[0].required_approvers.contains("apidoc_approver_2"));
    }

    #[test]
    fn violation_blocks_with_matching_approvers() {
        let snapshot = snapshot_with(|s| {
            s.changed_files = vec![change("open/client/bar.h", false)];
        });
        let mut harness = context(&snapshot);
        harness.rulesets = vec![oss_ruleset()];
        let checker = FixedChecker(vec![Violation {
            file: "open/client/bar.h".into(),
            line: Some(12),
            rule_id: "forbidden-term".into(),
            message: "forbidden term".into(),
        }]);
        let findings = OpenSourceComplianceRule.evaluate(&with_checker(&harness, &checker), &[]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].blocks());
        assert!(findings[0].message.contains("open/client/bar.h:12"));
        assert!(findings[0].required_approvers.contains("client_approver_1"));
        assert!(!findings[0].required_approvers.contains("apidoc_approver_1"));
    }

    #[test]
    fn modified_open_file_without_new_files_passes() {
        let snapshot = snapshot_with(|s| {
            s.changed_files = vec![change("open/server/foo.cpp", false)];
        });
        let harness = context(&snapshot);
        let checker = FixedChecker(vec![]);
        let findings = OpenSourceComplianceRule.evaluate(&with_checker(&harness, &checker), &[]);
        assert_eq!(findings[0].severity, Severity::Pass);
    }

    #[test]
    fn not_applicable_without_open_files_or_checker() {
        let snapshot = snapshot_with(|s| {
            s.changed_files = vec![change("closed/foo.cpp", false)];
        });
        let harness = context(&snapshot);
        let checker = FixedChecker(vec![]);
        let cx = with_checker(&harness, &checker);
        assert!(!OpenSourceComplianceRule.applies_to(&cx));

        let snapshot = snapshot_with(|s| {
            s.changed_files = vec![change("open/foo.cpp", false)];
        });
        let harness = context(&snapshot);
        assert!(!OpenSourceComplianceRule.applies_to(&harness.cx()));
    }
}
