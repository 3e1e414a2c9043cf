use std::sync::LazyLock;

use regex::Regex;

use super::{Rule, RuleContext};
use crate::types::{Category, Finding, Severity};

#[allow(clippy::expect_used)]
static KEY_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9]+-[0-9]+$").expect("key regex"));

/// Squash MRs must be titled `<ISSUE-KEYS>: <desc>`, with no parenthesis
/// immediately after the colon, and a single commit must carry exactly
/// `title + "\n\n" + description` as its message.
pub struct TitleFormatRule;

fn parse_title(title: &str) -> Result<(), String> {
    let Some((prefix, rest)) = title.split_once(':') else {
        return Err("title must look like `<ISSUE-KEYS>: <description>`".into());
    };
    let keys: Vec<&str> = prefix.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();
    if keys.is_empty() {
        return Err("title must start with at least one issue key before the colon".into());
    }
    if let Some(bad) = keys.iter().find(|k| !KEY_ONLY.is_match(k)) {
        return Err(format!("`{bad}` before the colon is not an issue key"));
    }
    let desc = rest.trim_start();
    if desc.is_empty() {
        return Err("title must carry a description after the colon".into());
    }
    if desc.starts_with('(') {
        return Err("the description must not start with a parenthesis right after the colon".into());
    }
    Ok(())
}

impl Rule for TitleFormatRule {
    fn name(&self) -> &'static str {
        "title-format"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        cx.snapshot.squash && !cx.snapshot.is_follow_up
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let snapshot = cx.snapshot;
        let mut findings = Vec::new();

        match parse_title(&snapshot.title) {
            Ok(()) => {}
            Err(reason) => {
                findings.push(Finding::new(
                    Severity::Block,
                    Category::CommitConvention,
                    "title-format",
                    format!("Bad MR title: {reason}."),
                ));
            }
        }

        if snapshot.commits.len() == 1 {
            let expected = snapshot.squash_message();
            let actual = &snapshot.commits[0].message;
            if actual.trim_end() != expected.trim_end() {
                findings.push(Finding::new(
                    Severity::Block,
                    Category::CommitConvention,
                    "single-commit-message",
                    "The single commit's message must equal the MR title followed by a blank \
                     line and the MR description."
                        .to_string(),
                ));
            }
        }

        if findings.is_empty() {
            findings.push(Finding::new(
                Severity::Pass,
                Category::CommitConvention,
                "title-format",
                "Title and commit message follow the squash convention.",
            ));
        }
        findings
    }
}
