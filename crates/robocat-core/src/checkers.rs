use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;

use crate::config::{ApproveRule, ApproveRuleset};
use crate::types::FileChange;

// ── Relevance checkers ───────────────────────────────────────────────────

/// Predicate deciding whether a changed file is relevant to a ruleset.
pub type RelevancePredicate = fn(&FileChange) -> bool;

/// Built-in registry mapping relevance-checker identity → predicate.
/// Unknown names are rejected at config validation time.
pub fn relevance_checker(name: &str) -> Option<RelevancePredicate> {
    match name {
        "is_file_open_sourced" => Some(is_file_open_sourced),
        "does_file_diff_contain_apidoc_changes" => Some(does_file_diff_contain_apidoc_changes),
        "match_name_pattern" => Some(match_name_pattern),
        _ => None,
    }
}

/// Files under the published source tree.
fn is_file_open_sourced(file: &FileChange) -> bool {
    file.path.starts_with("open/") || file.old_path.starts_with("open/")
}

fn does_file_diff_contain_apidoc_changes(file: &FileChange) -> bool {
    file.diff.contains("%apidoc")
}

/// Relevance decided purely by the ruleset's glob patterns.
fn match_name_pattern(_file: &FileChange) -> bool {
    true
}

// ── Approval rulesets ────────────────────────────────────────────────────

struct CompiledRule {
    globs: GlobSet,
    patterns: Vec<String>,
    approvers: BTreeSet<String>,
}

/// A named approval ruleset with its relevance predicate and ordered,
/// first-match-wins rules, compiled from configuration.
pub struct ApprovalRuleset {
    pub name: String,
    /// Registry key this ruleset was configured with.
    pub relevance_name: String,
    relevance: RelevancePredicate,
    rules: Vec<CompiledRule>,
}

impl ApprovalRuleset {
    pub fn compile(name: &str, ruleset: &ApproveRuleset) -> Result<Self> {
        let relevance = relevance_checker(&ruleset.relevance_checker)
            .ok_or_else(|| anyhow!("unknown relevance_checker '{}'", ruleset.relevance_checker))?;
        let mut rules = Vec::with_capacity(ruleset.rules.len());
        for rule in &ruleset.rules {
            rules.push(CompiledRule {
                globs: build_glob_set(&rule.patterns)
                    .with_context(|| format!("ruleset '{name}'"))?,
                patterns: rule.patterns.clone(),
                approvers: rule.approvers.iter().cloned().collect(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            relevance_name: ruleset.relevance_checker.clone(),
            relevance,
            rules,
        })
    }

    /// Files from the diff this ruleset cares about.
    pub fn relevant_files<'a>(&self, files: &'a [FileChange]) -> Vec<&'a FileChange> {
        files.iter().filter(|f| (self.relevance)(f)).collect()
    }

    pub fn applies_to(&self, files: &[FileChange]) -> bool {
        !self.relevant_files(files).is_empty()
    }

    /// Required approvers: the first rule matching any relevant changed
    /// file wins. Returns None when nothing matches.
    pub fn required_approvers(&self, files: &[FileChange]) -> Option<&BTreeSet<String>> {
        let relevant = self.relevant_files(files);
        if relevant.is_empty() {
            return None;
        }
        for rule in &self.rules {
            if relevant.iter().any(|f| rule.globs.is_match(&f.path)) {
                return Some(&rule.approvers);
            }
        }
        None
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern '{pattern}'"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Reject rule orderings where an earlier, broader rule shadows a later,
/// more specific one (the later rule could never win).
pub fn validate_rule_order(ruleset_name: &str, rules: &[ApproveRule]) -> Result<()> {
    let compiled: Vec<GlobSet> = rules
        .iter()
        .map(|r| build_glob_set(&r.patterns))
        .collect::<Result<_>>()?;
    for (i, earlier) in compiled.iter().enumerate() {
        for (j, later) in rules.iter().enumerate().skip(i + 1) {
            for pattern in &later.patterns {
                if earlier.is_match(representative_path(pattern)) {
                    bail!(
                        "job_status_check_rule.{ruleset_name}: rule #{i} shadows rule #{j} \
                         (pattern '{pattern}' can never match first)"
                    );
                }
            }
        }
    }
    Ok(())
}

/// A concrete path a glob pattern would match, for shadow detection.
fn representative_path(pattern: &str) -> String {
    pattern.replace("**", "a/a").replace('*', "a").replace('?', "a")
}

// ── Compliance checker ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Violation {
    pub file: String,
    pub line: Option<u32>,
    pub rule_id: String,
    pub message: String,
}

/// Open-source compliance content checker. The engine only consumes
/// verdicts; the checking itself is an external tool.
pub trait ComplianceChecker: Send + Sync {
    fn check_files(&self, repo_dir: &Path, files: &[String]) -> Result<Vec<Violation>>;
}

/// Subprocess adapter: runs the configured checker with the repo dir and
/// file list as arguments and parses one JSON violation per stdout line.
pub struct ExternalComplianceChecker {
    cmd: String,
}

impl ExternalComplianceChecker {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

impl ComplianceChecker for ExternalComplianceChecker {
    fn check_files(&self, repo_dir: &Path, files: &[String]) -> Result<Vec<Violation>> {
        let output = Command::new(&self.cmd)
            .arg(repo_dir)
            .args(files)
            .output()
            .with_context(|| format!("spawning compliance checker '{}'", self.cmd))?;
        if !output.status.success() {
            bail!(
                "compliance checker '{}' exited with {}: {}",
                self.cmd,
                output.status.code().unwrap_or(1),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut violations = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let violation: Violation = serde_json::from_str(line)
                .with_context(|| format!("parsing checker output line: {line}"))?;
            violations.push(violation);
        }
        Ok(violations)
    }
}

// ── Submodule checker ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmoduleState {
    Consistent,
    Inconsistent { details: String },
}

pub trait SubmoduleChecker: Send + Sync {
    fn check_submodule(&self, repo_dir: &Path, submodule_dir: &str) -> Result<SubmoduleState>;
}

/// Git-based checker: a submodule is consistent when `git submodule status`
/// reports it in sync (no `+`/`-`/`U` prefix).
pub struct GitSubmoduleChecker;

impl SubmoduleChecker for GitSubmoduleChecker {
    fn check_submodule(&self, repo_dir: &Path, submodule_dir: &str) -> Result<SubmoduleState> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_dir)
            .args(["submodule", "status", "--", submodule_dir])
            .output()
            .context("spawning git submodule status")?;
        if !output.status.success() {
            bail!(
                "git submodule status {submodule_dir} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            match line.chars().next() {
                Some('+') | Some('-') | Some('U') => {
                    return Ok(SubmoduleState::Inconsistent { details: line.trim().to_string() });
                }
                _ => {}
            }
        }
        Ok(SubmoduleState::Consistent)
    }
}
