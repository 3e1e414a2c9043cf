use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::checkers;

/// Full process configuration, loaded once at startup and immutable
/// afterwards. Unknown keys anywhere in the mapping are a startup error.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub jira: JiraConfig,
    pub repo: RepoConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Approval rulesets keyed by ruleset name.
    #[serde(default)]
    pub job_status_check_rule: BTreeMap<String, JobStatusCheckRule>,
    #[serde(default)]
    pub open_source_check_rule: Option<OpenSourceCheckRule>,
    #[serde(default)]
    pub nx_submodule_check_rule: Option<NxSubmoduleCheckRule>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JiraConfig {
    pub url: String,
    pub login: String,
    /// Inline secret; prefer `password_file` in deployments.
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Supported issue projects; only their issues drive workflow state.
    pub project_keys: Vec<String>,
}

impl JiraConfig {
    /// Resolve the tracker password from the inline value or mounted file.
    pub fn resolve_password(&self) -> Result<String> {
        if let Some(p) = &self.password {
            return Ok(p.clone());
        }
        let path = self
            .password_file
            .as_ref()
            .context("jira: neither password nor password_file configured")?;
        let secret = std::fs::read_to_string(path)
            .with_context(|| format!("jira: reading password_file {}", path.display()))?;
        Ok(secret.trim().to_string())
    }

    pub fn is_supported_project(&self, project: &str) -> bool {
        self.project_keys.iter().any(|p| p == project)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// On-disk working tree for the git workspace.
    pub path: PathBuf,
    /// Forge project URL, e.g. `https://gitlab.example.com/dev/vms`.
    pub url: String,
    /// Mounted file holding the forge API token.
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub need_code_owner_approval: bool,
}

impl RepoConfig {
    pub fn resolve_token(&self) -> Result<String> {
        let path = self
            .token_file
            .as_ref()
            .context("repo: token_file not configured")?;
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("repo: reading token_file {}", path.display()))?;
        Ok(token.trim().to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Jobs in this stage start on their own and are excluded from the
    /// bot's manual-trigger logic.
    pub autorun_stage: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobStatusCheckRule {
    pub approve_ruleset: ApproveRuleset,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproveRuleset {
    /// Key into the built-in relevance-checker registry.
    pub relevance_checker: String,
    /// Ordered rules; the first whose patterns match wins, so more-specific
    /// patterns must precede less-specific ones.
    pub rules: Vec<ApproveRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproveRule {
    pub patterns: Vec<String>,
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenSourceCheckRule {
    /// External compliance checker invocation; absent section disables the
    /// open-source rule entirely.
    pub checker_cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NxSubmoduleCheckRule {
    pub nx_submodule_dirs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind(), port: default_port() }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what serde enforces. All violations are
    /// startup-fatal.
    pub fn validate(&self) -> Result<()> {
        if self.jira.project_keys.is_empty() {
            bail!("jira.project_keys must not be empty");
        }
        if self.jira.password.is_none() && self.jira.password_file.is_none() {
            bail!("jira: one of password / password_file is required");
        }
        for (name, rule) in &self.job_status_check_rule {
            let ruleset = &rule.approve_ruleset;
            if checkers::relevance_checker(&ruleset.relevance_checker).is_none() {
                bail!(
                    "job_status_check_rule.{name}: unknown relevance_checker '{}'",
                    ruleset.relevance_checker
                );
            }
            if ruleset.rules.is_empty() {
                bail!("job_status_check_rule.{name}: rules must not be empty");
            }
            for (i, r) in ruleset.rules.iter().enumerate() {
                if r.patterns.is_empty() || r.approvers.is_empty() {
                    bail!("job_status_check_rule.{name}: rule #{i} needs patterns and approvers");
                }
            }
            checkers::validate_rule_order(name, &ruleset.rules)?;
        }
        if let Some(nx) = &self.nx_submodule_check_rule {
            if nx.nx_submodule_dirs.is_empty() {
                bail!("nx_submodule_check_rule.nx_submodule_dirs must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
jira:
  url: https://jira.example.com
  login: robocat
  password: hunter2
  timeout: 10
  retries: 2
  project_keys: [PROJ, VMS]
repo:
  path: /srv/checkout/vms
  url: https://gitlab.example.com/dev/vms
  need_code_owner_approval: true
pipeline:
  autorun_stage: build
job_status_check_rule:
  apidoc:
    approve_ruleset:
      relevance_checker: does_file_diff_contain_apidoc_changes
      rules:
        - patterns: ["open/client/**"]
          approvers: [client_approver_1, client_approver_2]
        - patterns: ["**"]
          approvers: [apidoc_approver_1, apidoc_approver_2]
nx_submodule_check_rule:
  nx_submodule_dirs: [artifacts/nx_kit]
"#;

    #[test]
    fn parses_full_sample() {
        let config: Config = serde_yaml::from_str(SAMPLE).expect("parse");
        config.validate().expect("validate");
        assert_eq!(config.jira.project_keys, vec!["PROJ", "VMS"]);
        assert_eq!(config.jira.timeout, 10);
        assert!(config.repo.need_code_owner_approval);
        assert_eq!(config.pipeline.autorun_stage.as_deref(), Some("build"));
        let ruleset = &config.job_status_check_rule["apidoc"].approve_ruleset;
        assert_eq!(ruleset.rules.len(), 2);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let raw = format!("{SAMPLE}\nsurprise_key: 1\n");
        assert!(serde_yaml::from_str::<Config>(&raw).is_err());
    }

    #[test]
    fn unknown_nested_key_is_rejected() {
        let raw = SAMPLE.replace("  login: robocat", "  login: robocat\n  loginn: typo");
        assert!(serde_yaml::from_str::<Config>(&raw).is_err());
    }

    #[test]
    fn missing_rule_sections_default_to_disabled() {
        let raw = r#"
jira:
  url: https://jira.example.com
  login: robocat
  password: x
  project_keys: [PROJ]
repo:
  path: /srv/checkout/vms
  url: https://gitlab.example.com/dev/vms
"#;
        let config: Config = serde_yaml::from_str(raw).expect("parse");
        config.validate().expect("validate");
        assert!(config.job_status_check_rule.is_empty());
        assert!(config.open_source_check_rule.is_none());
        assert!(config.nx_submodule_check_rule.is_none());
        assert!(config.pipeline.autorun_stage.is_none());
        assert!(!config.repo.need_code_owner_approval);
    }

    #[test]
    fn unknown_relevance_checker_fails_validation() {
        let raw = SAMPLE.replace(
            "does_file_diff_contain_apidoc_changes",
            "does_file_smell_funny",
        );
        let config: Config = serde_yaml::from_str(&raw).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn broad_pattern_before_specific_fails_validation() {
        let raw = SAMPLE
            .replace(
                "- patterns: [\"open/client/**\"]\n          approvers: [client_approver_1, client_approver_2]\n        - patterns: [\"**\"]\n          approvers: [apidoc_approver_1, apidoc_approver_2]",
                "- patterns: [\"**\"]\n          approvers: [apidoc_approver_1]\n        - patterns: [\"open/client/**\"]\n          approvers: [client_approver_1]",
            );
        let config: Config = serde_yaml::from_str(&raw).expect("parse");
        assert!(config.validate().is_err(), "shadowed rule must be rejected");
    }

    #[test]
    fn password_file_is_read_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "s3cret").expect("write");
        let jira = JiraConfig {
            url: "https://jira.example.com".into(),
            login: "robocat".into(),
            password: None,
            password_file: Some(file.path().to_path_buf()),
            timeout: 30,
            retries: 3,
            project_keys: vec!["PROJ".into()],
        };
        assert_eq!(jira.resolve_password().expect("resolve"), "s3cret");
    }

    #[test]
    fn empty_project_keys_fails_validation() {
        let raw = SAMPLE.replace("project_keys: [PROJ, VMS]", "project_keys: []");
        let config: Config = serde_yaml::from_str(&raw).expect("parse");
        assert!(config.validate().is_err());
    }
}
