use std::collections::HashMap;

use super::{Rule, RuleContext};
use crate::types::{branch_for_version, Category, Finding, Severity};

/// Every referenced supported-project issue must carry fix-versions that
/// map to known branches, with no two versions naming the same branch.
pub struct FixVersionRule;

impl Rule for FixVersionRule {
    fn name(&self) -> &'static str {
        "fix-version-sanity"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        !cx.issues.is_empty()
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let mut findings = Vec::new();

        for issue in cx.issues.values() {
            let scope = format!("fixversion-{}", issue.key);

            if issue.fix_versions.is_empty() {
                findings.push(Finding::new(
                    Severity::Block,
                    Category::FixVersionSanity,
                    &scope,
                    format!("Issue {} has no fixVersions set.", issue.key),
                ));
                continue;
            }

            let mut branch_sources: HashMap<String, Vec<&str>> = HashMap::new();
            let mut broken = false;

            for version in &issue.fix_versions {
                match branch_for_version(version) {
                    None => {
                        findings.push(Finding::new(
                            Severity::Block,
                            Category::FixVersionSanity,
                            &scope,
                            format!(
                                "Issue {}: fixVersion `{version}` does not name a release branch.",
                                issue.key
                            ),
                        ));
                        broken = true;
                    }
                    Some(branch) => {
                        if !cx.known_branches.get(&branch).copied().unwrap_or(false) {
                            findings.push(Finding::new(
                                Severity::Block,
                                Category::FixVersionSanity,
                                &scope,
                                format!(
                                    "Issue {}: fixVersion `{version}` maps to `{branch}`, which \
                                     does not exist on the forge.",
                                    issue.key
                                ),
                            ));
                            broken = true;
                        }
                        branch_sources.entry(branch).or_default().push(version);
                    }
                }
            }

            for (branch, versions) in &branch_sources {
                if versions.len() > 1 {
                    findings.push(Finding::new(
                        Severity::Block,
                        Category::FixVersionSanity,
                        &scope,
                        format!(
                            "Issue {}: contradictory fixVersions {} all map to `{branch}`.",
                            issue.key,
                            versions.join(", ")
                        ),
                    ));
                    broken = true;
                }
            }

            if !broken {
                findings.push(Finding::new(
                    Severity::Pass,
                    Category::FixVersionSanity,
                    &scope,
                    format!("Issue {}: fixVersions are sane.", issue.key),
                ));
            }
        }

        findings
    }
}
