//! End-to-end engine scenarios driven through in-memory forge/tracker
//! fakes, with a real git origin for the workspace-backed paths (rebase,
//! cherry-pick follow-ups).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use robocat_core::api::{
    ApiError, ApiResult, CreateMrRequest, Discussion, Forge, ForgeUser, Job, MergeOutcome,
    MrDetails, Note, Tracker, TrackerIssue,
};
use robocat_core::checkers::{ComplianceChecker, Violation};
use robocat_core::config::Config;
use robocat_core::engine::{self, ActorState, Context};
use robocat_core::types::{
    Commit, CycleOutcome, Event, EventKind, FileChange, Mergeability, MrId, MrState, PipelineInfo,
    PipelineStatus, CHERRY_PICK_PHRASE,
};
use robocat_core::workspace::GitWorkspace;

// ── Fake forge ───────────────────────────────────────────────────────────

#[derive(Default)]
struct MrData {
    details: Option<MrDetails>,
    commits: Vec<Commit>,
    changed_files: Vec<FileChange>,
    approvals: BTreeSet<String>,
    pipeline: Option<PipelineInfo>,
    manual_jobs: Vec<Job>,
    notes: Vec<Note>,
    discussions: Vec<Discussion>,
    played_jobs: Vec<u64>,
    /// What `merge` sets merge_commit_sha to when it succeeds.
    squash_result_sha: Option<String>,
    refuse_merge: bool,
}

#[derive(Default)]
struct ForgeState {
    mrs: BTreeMap<MrId, MrData>,
    branches: BTreeMap<String, String>,
    created: Vec<CreateMrRequest>,
    next_mr: MrId,
    next_discussion: u64,
    get_mr_calls: usize,
    /// Artificial latency for get_mr, to make coalescing observable.
    get_mr_delay_ms: u64,
}

#[derive(Clone)]
struct FakeForge(Arc<Mutex<ForgeState>>);

impl FakeForge {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(ForgeState { next_mr: 100, ..Default::default() })))
    }

    fn with<R>(&self, f: impl FnOnce(&mut ForgeState) -> R) -> R {
        f(&mut self.0.lock().expect("forge lock"))
    }

    fn mr<R>(&self, id: MrId, f: impl FnOnce(&mut MrData) -> R) -> R {
        self.with(|s| f(s.mrs.entry(id).or_default()))
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::NotFound { service: "forge", message: what.to_string() }
}

#[async_trait]
impl Forge for FakeForge {
    async fn current_user(&self) -> ApiResult<ForgeUser> {
        Ok(ForgeUser { id: 1, username: "workflow-robocat".into() })
    }

    async fn list_open_mrs(&self) -> ApiResult<Vec<MrId>> {
        Ok(self.with(|s| {
            s.mrs
                .iter()
                .filter(|(_, m)| {
                    m.details.as_ref().is_some_and(|d| d.state == MrState::Opened)
                })
                .map(|(id, _)| *id)
                .collect()
        }))
    }

    async fn get_mr(&self, mr: MrId) -> ApiResult<MrDetails> {
        let delay = self.with(|s| s.get_mr_delay_ms);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.with(|s| {
            s.get_mr_calls += 1;
            s.mrs
                .get(&mr)
                .and_then(|m| m.details.clone())
                .ok_or_else(|| not_found(&format!("MR {mr}")))
        })
    }

    async fn list_commits(&self, mr: MrId) -> ApiResult<Vec<Commit>> {
        Ok(self.mr(mr, |m| m.commits.clone()))
    }

    async fn list_changed_files(&self, mr: MrId) -> ApiResult<Vec<FileChange>> {
        Ok(self.mr(mr, |m| m.changed_files.clone()))
    }

    async fn list_notes(&self, mr: MrId) -> ApiResult<Vec<Note>> {
        Ok(self.mr(mr, |m| m.notes.clone()))
    }

    async fn post_note(&self, mr: MrId, body: &str) -> ApiResult<()> {
        self.mr(mr, |m| {
            m.notes.push(Note {
                id: m.notes.len() as u64 + 1,
                author: "workflow-robocat".into(),
                body: body.to_string(),
            });
        });
        Ok(())
    }

    async fn list_discussions(&self, mr: MrId) -> ApiResult<Vec<Discussion>> {
        Ok(self.mr(mr, |m| m.discussions.clone()))
    }

    async fn create_discussion(&self, mr: MrId, body: &str) -> ApiResult<String> {
        self.with(|s| {
            s.next_discussion += 1;
            let id = format!("disc-{}", s.next_discussion);
            s.mrs.entry(mr).or_default().discussions.push(Discussion {
                id: id.clone(),
                first_note_author: "workflow-robocat".into(),
                first_note_body: body.to_string(),
                resolved: false,
            });
            Ok(id)
        })
    }

    async fn resolve_discussion(&self, mr: MrId, discussion_id: &str) -> ApiResult<()> {
        self.mr(mr, |m| {
            match m.discussions.iter_mut().find(|d| d.id == discussion_id) {
                Some(d) => {
                    d.resolved = true;
                    Ok(())
                }
                None => Err(not_found(discussion_id)),
            }
        })
    }

    async fn list_approvals(&self, mr: MrId) -> ApiResult<BTreeSet<String>> {
        Ok(self.mr(mr, |m| m.approvals.clone()))
    }

    async fn add_assignees(&self, mr: MrId, users: &BTreeSet<String>) -> ApiResult<()> {
        self.mr(mr, |m| {
            if let Some(d) = m.details.as_mut() {
                d.assignees.extend(users.iter().cloned());
            }
        });
        Ok(())
    }

    async fn get_pipeline(&self, mr: MrId) -> ApiResult<Option<PipelineInfo>> {
        Ok(self.mr(mr, |m| m.pipeline.clone()))
    }

    async fn list_manual_jobs(&self, pipeline_id: u64) -> ApiResult<Vec<Job>> {
        Ok(self.with(|s| {
            s.mrs
                .values()
                .filter(|m| m.pipeline.as_ref().is_some_and(|p| p.id == pipeline_id))
                .flat_map(|m| m.manual_jobs.clone())
                .collect()
        }))
    }

    async fn play_job(&self, job_id: u64) -> ApiResult<()> {
        self.with(|s| {
            for m in s.mrs.values_mut() {
                if m.manual_jobs.iter().any(|j| j.id == job_id) {
                    m.played_jobs.push(job_id);
                }
            }
        });
        Ok(())
    }

    async fn branch_head(&self, branch: &str) -> ApiResult<Option<String>> {
        Ok(self.with(|s| s.branches.get(branch).cloned()))
    }

    async fn merge(
        &self,
        mr: MrId,
        _message: Option<&str>,
        _squash: bool,
        _sha: &str,
    ) -> ApiResult<MergeOutcome> {
        self.mr(mr, |m| {
            if m.refuse_merge {
                return Ok(MergeOutcome::NotMergeable);
            }
            let squash_sha = m.squash_result_sha.clone();
            match m.details.as_mut() {
                Some(d) => {
                    d.state = MrState::Merged;
                    d.merge_commit_sha = squash_sha.or_else(|| Some("merge-sha".into()));
                    Ok(MergeOutcome::Merged)
                }
                None => Err(not_found(&format!("MR {mr}"))),
            }
        })
    }

    async fn create_mr(&self, req: &CreateMrRequest) -> ApiResult<MrId> {
        self.with(|s| {
            s.next_mr += 1;
            let id = s.next_mr;
            s.branches.insert(req.source_branch.clone(), format!("{}-head", req.source_branch));
            s.created.push(req.clone());
            s.mrs.insert(
                id,
                MrData {
                    details: Some(MrDetails {
                        id,
                        title: req.title.clone(),
                        description: req.description.clone(),
                        source_branch: req.source_branch.clone(),
                        target_branch: req.target_branch.clone(),
                        author: "workflow-robocat".into(),
                        squash: req.squash,
                        draft: req.draft,
                        state: MrState::Opened,
                        head_sha: format!("{}-head", req.source_branch),
                        merge_commit_sha: None,
                        mergeability: Mergeability::Mergeable,
                        assignees: req.assignees.clone(),
                        code_owner_approved: true,
                    }),
                    ..Default::default()
                },
            );
            Ok(id)
        })
    }
}

// ── Fake tracker ─────────────────────────────────────────────────────────

#[derive(Default)]
struct TrackerState {
    issues: BTreeMap<String, TrackerIssue>,
    transitions: Vec<(String, String)>,
    comments: Vec<(String, String)>,
}

#[derive(Clone)]
struct FakeTracker(Arc<Mutex<TrackerState>>);

impl FakeTracker {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(TrackerState::default())))
    }

    fn with<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        f(&mut self.0.lock().expect("tracker lock"))
    }

    fn add_issue(&self, key: &str, status: &str, fix_versions: &[&str]) {
        self.with(|s| {
            s.issues.insert(
                key.to_string(),
                TrackerIssue {
                    key: key.to_string(),
                    project: key.split('-').next().unwrap_or("").to_string(),
                    status: status.to_string(),
                    fix_versions: fix_versions.iter().map(|v| v.to_string()).collect(),
                    assignee: Some("alice".into()),
                },
            );
        });
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn get_issue(&self, key: &str) -> ApiResult<TrackerIssue> {
        self.with(|s| {
            s.issues.get(key).cloned().ok_or(ApiError::NotFound {
                service: "tracker",
                message: key.to_string(),
            })
        })
    }

    async fn available_transitions(&self, _key: &str) -> ApiResult<Vec<String>> {
        Ok(vec!["Waiting for QA".into(), "Closed".into()])
    }

    async fn transition_issue(&self, key: &str, to: &str) -> ApiResult<()> {
        self.with(|s| {
            if let Some(issue) = s.issues.get_mut(key) {
                issue.status = to.to_string();
            }
            s.transitions.push((key.to_string(), to.to_string()));
        });
        Ok(())
    }

    async fn post_comment(&self, key: &str, body: &str) -> ApiResult<()> {
        self.with(|s| s.comments.push((key.to_string(), body.to_string())));
        Ok(())
    }
}

// ── Compliance fake ──────────────────────────────────────────────────────

struct FixedCompliance(Vec<Violation>);

impl ComplianceChecker for FixedCompliance {
    fn check_files(&self, _repo_dir: &Path, _files: &[String]) -> anyhow::Result<Vec<Violation>> {
        Ok(self.0.clone())
    }
}

// ── Git fixture ──────────────────────────────────────────────────────────

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").arg("-C").arg(dir).args(args).output().expect("git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

struct GitFixture {
    _origin: tempfile::TempDir,
    _seed: tempfile::TempDir,
    bot_clone: tempfile::TempDir,
    origin_path: PathBuf,
    base_sha: String,
    feature_sha: String,
    squash_sha: Option<String>,
}

/// Build an origin with `master`, release branches at the base commit and
/// a `fix-x` feature branch. With `squash_merged`, the squash-merge result
/// is committed on a `merged-state` side branch: the object the fake forge
/// hands out as the merge commit, without moving `master` itself.
fn git_fixture(release_branches: &[&str], squash_merged: bool) -> GitFixture {
    let origin = tempfile::tempdir().expect("origin dir");
    let origin_path = origin.path().join("repo.git");
    let out = Command::new("git")
        .args(["init", "--bare", "-b", "master"])
        .arg(&origin_path)
        .output()
        .expect("git init --bare");
    assert!(out.status.success());

    let seed = tempfile::tempdir().expect("seed dir");
    let seed_path = seed.path().join("work");
    let out = Command::new("git")
        .arg("clone")
        .arg(&origin_path)
        .arg(&seed_path)
        .output()
        .expect("git clone");
    assert!(out.status.success());
    git(&seed_path, &["config", "user.name", "robocat"]);
    git(&seed_path, &["config", "user.email", "robocat@example.com"]);
    git(&seed_path, &["checkout", "-b", "master"]);

    std::fs::write(seed_path.join("base.txt"), "base\n").expect("write");
    git(&seed_path, &["add", "-A"]);
    git(&seed_path, &["commit", "-m", "initial"]);
    let base_sha = git(&seed_path, &["rev-parse", "HEAD"]);
    git(&seed_path, &["push", "origin", "master"]);

    for branch in release_branches {
        git(&seed_path, &["branch", branch, &base_sha]);
        git(&seed_path, &["push", "origin", branch]);
    }

    git(&seed_path, &["checkout", "-b", "fix-x", &base_sha]);
    std::fs::write(seed_path.join("feature.txt"), "the fix\n").expect("write");
    git(&seed_path, &["add", "-A"]);
    git(&seed_path, &["commit", "-m", "PROJ-1: fix X\n\nDetails."]);
    let feature_sha = git(&seed_path, &["rev-parse", "HEAD"]);
    git(&seed_path, &["push", "origin", "fix-x"]);

    let squash_sha = if squash_merged {
        git(&seed_path, &["checkout", "-b", "merged-state", &base_sha]);
        std::fs::write(seed_path.join("feature.txt"), "the fix\n").expect("write");
        git(&seed_path, &["add", "-A"]);
        git(&seed_path, &["commit", "-m", "PROJ-1: fix X\n\nDetails."]);
        let sha = git(&seed_path, &["rev-parse", "HEAD"]);
        git(&seed_path, &["push", "origin", "merged-state"]);
        Some(sha)
    } else {
        None
    };

    let bot_clone = tempfile::tempdir().expect("bot dir");
    let bot_path = bot_clone.path().join("checkout");
    let out = Command::new("git")
        .arg("clone")
        .arg(&origin_path)
        .arg(&bot_path)
        .output()
        .expect("git clone bot");
    assert!(out.status.success());
    git(&bot_path, &["config", "user.name", "robocat"]);
    git(&bot_path, &["config", "user.email", "robocat@example.com"]);

    GitFixture { _origin: origin, _seed: seed, bot_clone, origin_path, base_sha, feature_sha, squash_sha }
}

impl GitFixture {
    fn bot_path(&self) -> PathBuf {
        self.bot_clone.path().join("checkout")
    }
}

// ── Context assembly ─────────────────────────────────────────────────────

const BASE_CONFIG: &str = r#"
jira:
  url: https://jira.example.com
  login: robocat
  password: x
  project_keys: [PROJ, VMS]
repo:
  path: /replaced/at/test/time
  url: https://gitlab.example.com/dev/vms
"#;

fn make_context(
    extra_config: &str,
    repo_path: &Path,
    forge: &FakeForge,
    tracker: &FakeTracker,
    compliance: Option<Arc<dyn ComplianceChecker>>,
) -> Context {
    let config: Config =
        serde_yaml::from_str(&format!("{BASE_CONFIG}{extra_config}")).expect("test config");
    config.validate().expect("valid test config");
    let config = Arc::new(config);

    let mut rulesets = Vec::new();
    for (name, rule) in &config.job_status_check_rule {
        rulesets.push(
            robocat_core::checkers::ApprovalRuleset::compile(name, &rule.approve_ruleset)
                .expect("compile ruleset"),
        );
    }

    Context {
        config,
        forge: Arc::new(forge.clone()),
        tracker: Arc::new(tracker.clone()),
        workspace: Arc::new(GitWorkspace::new(repo_path)),
        compliance,
        submodules: None,
        rulesets,
        rules: robocat_core::rules::standard_rules(),
        bot: ForgeUser { id: 1, username: "workflow-robocat".into() },
        retry_delays: Vec::new(),
    }
}

fn open_mr(id: MrId, head_sha: &str) -> MrDetails {
    MrDetails {
        id,
        title: "PROJ-1: fix X".into(),
        description: "Details.".into(),
        source_branch: "fix-x".into(),
        target_branch: "master".into(),
        author: "alice".into(),
        squash: true,
        draft: false,
        state: MrState::Opened,
        head_sha: head_sha.into(),
        merge_commit_sha: None,
        mergeability: Mergeability::Mergeable,
        assignees: BTreeSet::new(),
        code_owner_approved: true,
    }
}

fn single_commit(sha: &str) -> Vec<Commit> {
    vec![Commit { sha: sha.into(), message: "PROJ-1: fix X\n\nDetails.".into(), parent_shas: vec![] }]
}

fn success_pipeline(sha: &str) -> Option<PipelineInfo> {
    Some(PipelineInfo { id: 7, status: PipelineStatus::Success, sha: sha.into() })
}

const REVIEWERS_RULESET: &str = r#"
job_status_check_rule:
  reviewers:
    approve_ruleset:
      relevance_checker: match_name_pattern
      rules:
        - patterns: ["**"]
          approvers: [reviewer_1]
"#;

const OSS_RULESET: &str = r#"
job_status_check_rule:
  open_source:
    approve_ruleset:
      relevance_checker: is_file_open_sourced
      rules:
        - patterns: ["open/client/**"]
          approvers: [client_approver_1, client_approver_2]
        - patterns: ["**"]
          approvers: [apidoc_approver_1, apidoc_approver_2]
"#;

// ── S1: happy path, squash ───────────────────────────────────────────────

#[tokio::test]
async fn s1_happy_path_merges_transitions_and_creates_followup() {
    let fixture = git_fixture(&["vms_5.0"], true);
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();

    forge.mr(1, |m| {
        m.details = Some(open_mr(1, &fixture.feature_sha));
        m.commits = single_commit(&fixture.feature_sha);
        m.changed_files = vec![FileChange {
            path: "src/feature.cpp".into(),
            old_path: "src/feature.cpp".into(),
            new_file: false,
            deleted_file: false,
            diff: "+the fix".into(),
        }];
        m.approvals.insert("reviewer_1".into());
        m.pipeline = success_pipeline(&fixture.feature_sha);
        m.squash_result_sha = fixture.squash_sha.clone();
    });
    forge.with(|s| {
        s.branches.insert("master".into(), fixture.base_sha.clone());
        s.branches.insert("vms_5.0".into(), fixture.base_sha.clone());
        s.branches.insert("fix-x".into(), fixture.feature_sha.clone());
    });
    tracker.add_issue("PROJ-1", "In Review", &["v5.0"]);

    let ctx = make_context(REVIEWERS_RULESET, &fixture.bot_path(), &forge, &tracker, None);
    let mut state = ActorState::default();

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed), "{outcome:?}");

    // Merged, with the squash message semantics handled by the forge call.
    forge.mr(1, |m| {
        let d = m.details.as_ref().expect("details");
        assert_eq!(d.state, MrState::Merged);
    });

    // PROJ-1 went In Review -> Waiting for QA, with a merged-into comment.
    tracker.with(|s| {
        assert_eq!(s.transitions, vec![("PROJ-1".to_string(), "Waiting for QA".to_string())]);
        assert_eq!(s.comments.len(), 1);
        assert!(s.comments[0].1.contains("merged into `master`"));
    });

    // One follow-up MR onto vms_5.0, assigned to bot + author, marked.
    let created = forge.with(|s| s.created.clone());
    assert_eq!(created.len(), 1);
    let followup = &created[0];
    assert_eq!(followup.target_branch, "vms_5.0");
    assert_eq!(followup.source_branch, "fix-x-followup-vms_5.0");
    assert!(followup.description.contains(CHERRY_PICK_PHRASE));
    assert!(followup.assignees.contains("workflow-robocat"));
    assert!(followup.assignees.contains("alice"));

    // The cherry-picked commit actually landed on the topic branch.
    let picked = git(
        &fixture.origin_path,
        &["rev-parse", "fix-x-followup-vms_5.0:feature.txt"],
    );
    assert!(!picked.is_empty());

    // Convergence: a reconciliation tick plans nothing new.
    let (discussions_before, created_before) =
        forge.with(|s| (s.mrs[&1].discussions.len(), s.created.len()));
    let comments_before = tracker.with(|s| s.comments.len());
    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));
    let (discussions_after, created_after) =
        forge.with(|s| (s.mrs[&1].discussions.len(), s.created.len()));
    assert_eq!(discussions_before, discussions_after);
    assert_eq!(created_before, created_after);
    assert_eq!(comments_before, tracker.with(|s| s.comments.len()));
}

// ── S2: clean open-source addition needs sign-off ────────────────────────

#[tokio::test]
async fn s2_new_open_source_file_requires_signoff_before_merge() {
    let dir = tempfile::tempdir().expect("dir");
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();

    forge.mr(1, |m| {
        m.details = Some(open_mr(1, "headsha"));
        m.commits = single_commit("headsha");
        m.changed_files = vec![FileChange {
            path: "open/server/foo.cpp".into(),
            old_path: "open/server/foo.cpp".into(),
            new_file: true,
            deleted_file: false,
            diff: "+int foo();".into(),
        }];
        m.pipeline = success_pipeline("headsha");
    });
    forge.with(|s| {
        s.branches.insert("master".into(), "master-sha".into());
        s.branches.insert("vms_5.0".into(), "base".into());
        // Follow-up already exists: this scenario is about the sign-off.
        s.branches.insert("fix-x-followup-vms_5.0".into(), "done".into());
    });
    tracker.add_issue("PROJ-1", "In Review", &["v5.0"]);

    let ctx = make_context(
        OSS_RULESET,
        dir.path(),
        &forge,
        &tracker,
        Some(Arc::new(FixedCompliance(vec![]))),
    );
    let mut state = ActorState::default();

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));

    // One open-source sign-off discussion; merge blocked; approvers added.
    forge.mr(1, |m| {
        let oss: Vec<_> = m
            .discussions
            .iter()
            .filter(|d| d.first_note_body.contains("open-sourced"))
            .collect();
        assert_eq!(oss.len(), 1);
        let d = m.details.as_ref().expect("details");
        assert_eq!(d.state, MrState::Opened, "merge must be blocked");
        assert!(d.assignees.contains("apidoc_approver_1"));
        assert!(d.assignees.contains("apidoc_approver_2"));
    });

    // Property 1: re-delivery does not duplicate the discussion.
    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));
    forge.mr(1, |m| {
        let oss: Vec<_> = m
            .discussions
            .iter()
            .filter(|d| d.first_note_body.contains("open-sourced"))
            .collect();
        assert_eq!(oss.len(), 1, "at most one discussion per fingerprint");
    });

    // Human signs off: resolve every discussion, approve from the set.
    forge.mr(1, |m| {
        for d in m.discussions.iter_mut() {
            d.resolved = true;
        }
        m.approvals.insert("apidoc_approver_2".into());
    });

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));
    forge.mr(1, |m| {
        assert_eq!(m.details.as_ref().expect("details").state, MrState::Merged);
    });
}

// ── S3: compliance violation blocks and augments assignees ───────────────

#[tokio::test]
async fn s3_compliance_violation_blocks_with_file_and_line() {
    let dir = tempfile::tempdir().expect("dir");
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();

    forge.mr(1, |m| {
        m.details = Some(open_mr(1, "headsha"));
        m.commits = single_commit("headsha");
        m.changed_files = vec![FileChange {
            path: "open/client/bar.h".into(),
            old_path: "open/client/bar.h".into(),
            new_file: false,
            deleted_file: false,
            diff: "+forbidden".into(),
        }];
        m.pipeline = success_pipeline("headsha");
        m.approvals.insert("client_approver_1".into());
    });
    forge.with(|s| {
        s.branches.insert("master".into(), "master-sha".into());
        s.branches.insert("vms_5.0".into(), "base".into());
    });
    tracker.add_issue("PROJ-1", "In Review", &["v5.0"]);

    let violation = Violation {
        file: "open/client/bar.h".into(),
        line: Some(17),
        rule_id: "forbidden-term".into(),
        message: "contains a forbidden term".into(),
    };
    let ctx = make_context(
        OSS_RULESET,
        dir.path(),
        &forge,
        &tracker,
        Some(Arc::new(FixedCompliance(vec![violation]))),
    );
    let mut state = ActorState::default();

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));

    forge.mr(1, |m| {
        let block = m
            .discussions
            .iter()
            .find(|d| d.first_note_body.contains("open/client/bar.h:17"))
            .expect("violation discussion");
        assert!(block.first_note_body.contains("forbidden-term"));
        let d = m.details.as_ref().expect("details");
        assert_eq!(d.state, MrState::Opened, "merge must be blocked");
        assert!(d.assignees.contains("client_approver_1"));
        assert!(d.assignees.contains("client_approver_2"));
        assert!(!d.assignees.contains("apidoc_approver_1"), "wrong ruleset rule matched");
    });
}

// ── S4: follow-ups onto both fix-version branches ────────────────────────

#[tokio::test]
async fn s4_merged_mr_fans_out_followups_per_fix_version() {
    let fixture = git_fixture(&["vms_5.0", "vms_5.1"], true);
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();
    let squash_sha = fixture.squash_sha.clone().expect("squash sha");

    forge.mr(1, |m| {
        let mut details = open_mr(1, &fixture.feature_sha);
        details.state = MrState::Merged;
        details.merge_commit_sha = Some(squash_sha.clone());
        m.details = Some(details);
        m.commits = single_commit(&fixture.feature_sha);
    });
    forge.with(|s| {
        s.branches.insert("master".into(), fixture.base_sha.clone());
        s.branches.insert("vms_5.0".into(), fixture.base_sha.clone());
        s.branches.insert("vms_5.1".into(), fixture.base_sha.clone());
    });
    tracker.add_issue("PROJ-1", "Waiting for QA", &["v5.0", "v5.1"]);

    let ctx = make_context("", &fixture.bot_path(), &forge, &tracker, None);
    let mut state = ActorState::default();

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed), "{outcome:?}");

    let created = forge.with(|s| s.created.clone());
    assert_eq!(created.len(), 2);
    let targets: BTreeSet<&str> = created.iter().map(|c| c.target_branch.as_str()).collect();
    assert_eq!(targets, ["vms_5.0", "vms_5.1"].into_iter().collect());
    for followup in &created {
        assert!(followup.description.contains(&format!("{CHERRY_PICK_PHRASE}{squash_sha})")));
        assert!(followup.assignees.contains("workflow-robocat"));
        assert!(followup.assignees.contains("alice"));
        assert!(!followup.draft);
    }

    // Property 5: the engine classifies the created MRs as follow-ups.
    let followup_id = forge.with(|s| *s.mrs.keys().max().expect("created mr"));
    let projection = robocat_core::projector::project(&ctx, followup_id).await;
    let projection = match projection {
        Ok(p) => p,
        Err(e) => panic!("projection failed: {e:?}"),
    };
    assert!(projection.snapshot.is_follow_up);

    // Re-running generates nothing further.
    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));
    assert_eq!(forge.with(|s| s.created.len()), 2);
}

// ── S5: run-pipeline command on a draft MR ───────────────────────────────

#[tokio::test]
async fn s5_run_pipeline_command_rebases_and_triggers_despite_draft() {
    let fixture = git_fixture(&[], false);
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();

    forge.mr(1, |m| {
        let mut details = open_mr(1, &fixture.feature_sha);
        details.draft = true;
        m.details = Some(details);
        m.commits = single_commit(&fixture.feature_sha);
        m.pipeline = Some(PipelineInfo {
            id: 42,
            status: PipelineStatus::ManualPending,
            sha: fixture.feature_sha.clone(),
        });
        m.manual_jobs = vec![
            Job { id: 1, name: "build-installers".into(), stage: "deploy".into(), manual: true },
            Job { id: 2, name: "publish:no-bot-start".into(), stage: "deploy".into(), manual: true },
            Job { id: 3, name: "compile".into(), stage: "build".into(), manual: true },
        ];
    });
    forge.with(|s| {
        s.branches.insert("master".into(), fixture.base_sha.clone());
        s.branches.insert("vms_5.0".into(), fixture.base_sha.clone());
    });
    tracker.add_issue("PROJ-1", "In Review", &["v5.0"]);

    let ctx = make_context("\npipeline:\n  autorun_stage: build\n", &fixture.bot_path(), &forge, &tracker, None);
    let mut state = ActorState::default();

    let command = Event::new(1, EventKind::CommandInvoked, serde_json::json!({"verb": "run-pipeline"}));
    engine::apply_event(&mut state, &command);
    assert!(state.force_pipeline);

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed), "{outcome:?}");

    // Only the startable manual job ran: no `:no-bot-start`, no autorun stage.
    forge.mr(1, |m| {
        assert_eq!(m.played_jobs, vec![1]);
        assert_eq!(m.details.as_ref().expect("details").state, MrState::Opened);
    });

    // The command intent is consumed; the next tick does not re-trigger.
    assert!(!state.force_pipeline);
    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));
    forge.mr(1, |m| assert_eq!(m.played_jobs, vec![1]));
}

// ── S6: empty fixVersions blocks the merge ───────────────────────────────

#[tokio::test]
async fn s6_empty_fix_versions_blocks_with_visible_message() {
    let dir = tempfile::tempdir().expect("dir");
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();

    forge.mr(1, |m| {
        let mut details = open_mr(1, "headsha");
        details.title = "PROJ-2: fix Y".into();
        m.details = Some(details);
        m.commits = vec![Commit {
            sha: "headsha".into(),
            message: "PROJ-2: fix Y\n\nDetails.".into(),
            parent_shas: vec![],
        }];
        m.pipeline = success_pipeline("headsha");
        m.approvals.insert("reviewer_1".into());
    });
    forge.with(|s| {
        s.branches.insert("master".into(), "master-sha".into());
    });
    tracker.add_issue("PROJ-2", "In Review", &[]);

    let ctx = make_context(REVIEWERS_RULESET, dir.path(), &forge, &tracker, None);
    let mut state = ActorState::default();

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));

    forge.mr(1, |m| {
        let d = m.details.as_ref().expect("details");
        assert_eq!(d.state, MrState::Opened, "property 4: no merge with a block present");
        assert!(m
            .discussions
            .iter()
            .any(|disc| disc.first_note_body.contains("no fixVersions")));
    });
}

// ── Property 6: issue transition monotonicity ────────────────────────────

#[tokio::test]
async fn issues_not_in_review_are_never_transitioned() {
    let dir = tempfile::tempdir().expect("dir");
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();

    forge.mr(1, |m| {
        let mut details = open_mr(1, "headsha");
        details.state = MrState::Merged;
        details.merge_commit_sha = Some("merge-sha".into());
        m.details = Some(details);
        m.commits = single_commit("headsha");
    });
    forge.with(|s| {
        s.branches.insert("master".into(), "master-sha".into());
        // Follow-up branch already present, so only issue handling remains.
        s.branches.insert("vms_5.0".into(), "base".into());
        s.branches.insert("fix-x-followup-vms_5.0".into(), "done".into());
    });
    tracker.add_issue("PROJ-1", "In Progress", &["v5.0"]);

    let ctx = make_context("", dir.path(), &forge, &tracker, None);
    let mut state = ActorState::default();

    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));

    tracker.with(|s| assert!(s.transitions.is_empty(), "In Progress must not transition"));
    // The MR carries an informational note instead.
    forge.mr(1, |m| {
        assert!(m.notes.iter().any(|n| n.body.contains("In Progress")));
    });

    // And only once.
    let outcome = engine::run_cycle(&ctx, &mut state, 1).await;
    assert!(matches!(outcome, CycleOutcome::Completed));
    forge.mr(1, |m| {
        assert_eq!(m.notes.iter().filter(|n| n.body.contains("In Progress")).count(), 1);
    });
}

// ── Registry: coalescing and per-MR serialization ────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn registry_coalesces_queued_events_into_one_pass() {
    let dir = tempfile::tempdir().expect("dir");
    let forge = FakeForge::new();
    let tracker = FakeTracker::new();

    forge.mr(1, |m| {
        let mut details = open_mr(1, "headsha");
        details.draft = true;
        m.details = Some(details);
        m.commits = single_commit("headsha");
        m.pipeline = success_pipeline("headsha");
    });
    forge.with(|s| {
        s.branches.insert("master".into(), "master-sha".into());
        s.branches.insert("vms_5.0".into(), "base".into());
        s.get_mr_delay_ms = 50;
    });
    tracker.add_issue("PROJ-1", "In Review", &["v5.0"]);

    let ctx = Arc::new(make_context("", dir.path(), &forge, &tracker, None));
    let shutdown = tokio_util::sync::CancellationToken::new();
    let registry = robocat_core::registry::ActorRegistry::new(Arc::clone(&ctx), 2, shutdown.clone());

    for i in 0..5u64 {
        registry
            .route(Event::new(1, EventKind::MrUpdated, serde_json::json!({"seq": i})))
            .await;
    }

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    shutdown.cancel();

    // Far fewer projections than events: queued events coalesced.
    let calls = forge.with(|s| s.get_mr_calls);
    assert!(calls >= 1, "at least one cycle ran");
    assert!(calls < 5, "5 rapid events must coalesce, saw {calls} projections");
}
