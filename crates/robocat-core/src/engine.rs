use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::api::{Forge, ForgeUser, Tracker};
use crate::checkers::{
    ApprovalRuleset, ComplianceChecker, ExternalComplianceChecker, GitSubmoduleChecker,
    SubmoduleChecker,
};
use crate::config::Config;
use crate::executor;
use crate::planner::{self, PlanInputs};
use crate::projector::{self, ProjectionError};
use crate::rules::{self, Rule, RuleContext};
use crate::types::{
    Category, CycleOutcome, Event, EventKind, Finding, FollowUpMode, MrId, Severity, TriggerCause,
};
use crate::workspace::GitWorkspace;

/// Immutable process-wide context threaded through all components:
/// configuration, shared clients, the git workspace and the compiled rule
/// battery. Constructed once at startup.
pub struct Context {
    pub config: Arc<Config>,
    pub forge: Arc<dyn Forge>,
    pub tracker: Arc<dyn Tracker>,
    pub workspace: Arc<GitWorkspace>,
    pub compliance: Option<Arc<dyn ComplianceChecker>>,
    pub submodules: Option<Arc<dyn SubmoduleChecker>>,
    pub rulesets: Vec<ApprovalRuleset>,
    pub rules: Vec<Box<dyn Rule>>,
    /// The bot's own forge identity, fetched at boot.
    pub bot: ForgeUser,
    /// Sleeps between retry attempts on transient API failures.
    pub retry_delays: Vec<Duration>,
}

impl Context {
    pub fn new(
        config: Arc<Config>,
        forge: Arc<dyn Forge>,
        tracker: Arc<dyn Tracker>,
        bot: ForgeUser,
    ) -> Result<Self> {
        let mut rulesets = Vec::new();
        for (name, rule) in &config.job_status_check_rule {
            rulesets.push(
                ApprovalRuleset::compile(name, &rule.approve_ruleset)
                    .with_context(|| format!("compiling ruleset '{name}'"))?,
            );
        }
        let compliance: Option<Arc<dyn ComplianceChecker>> = config
            .open_source_check_rule
            .as_ref()
            .map(|r| Arc::new(ExternalComplianceChecker::new(r.checker_cmd.clone())) as _);
        let submodules: Option<Arc<dyn SubmoduleChecker>> = config
            .nx_submodule_check_rule
            .as_ref()
            .map(|_| Arc::new(GitSubmoduleChecker) as _);
        let workspace = Arc::new(GitWorkspace::new(config.repo.path.clone()));

        Ok(Self {
            config,
            forge,
            tracker,
            workspace,
            compliance,
            submodules,
            rulesets,
            rules: rules::standard_rules(),
            bot,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(16),
            ],
        })
    }
}

/// Mutable per-MR memory, owned exclusively by the MR's actor. Loss is
/// tolerated: everything user-visible is reconstructible from the forge.
#[derive(Debug, Default)]
pub struct ActorState {
    pub last_snapshot_hash: Option<String>,
    /// Set by `run-pipeline`; consumed by the next completed cycle.
    pub force_pipeline: bool,
    /// Set by post-merge `follow-up`/`draft-follow-up`.
    pub regenerate_followups: bool,
    pub followup_mode: FollowUpMode,
    pub last_trigger_cause: Option<TriggerCause>,
    /// Issues already warned about an unexpected status after merge.
    pub warned_issues: BTreeSet<String>,
    /// Executor failures carried into the next cycle's rule seed.
    pub pending_failures: Vec<Finding>,
    /// Idempotence keys of actions currently executing.
    pub in_flight: BTreeSet<String>,
    /// Set by the executor when a merge just went through; triggers an
    /// immediate post-merge pass.
    pub just_merged: bool,
}

/// Fold an event's intent into the actor state before the cycle runs.
/// Coalesced events apply their intents in receipt order.
pub fn apply_event(state: &mut ActorState, event: &Event) {
    if event.kind != EventKind::CommandInvoked {
        return;
    }
    match event.payload.get("verb").and_then(|v| v.as_str()) {
        Some("process") | None => {}
        Some("run-pipeline") => state.force_pipeline = true,
        Some("follow-up") => {
            state.followup_mode = FollowUpMode::Normal;
            state.regenerate_followups = true;
        }
        Some("draft-follow-up") => {
            state.followup_mode = FollowUpMode::Draft;
            state.regenerate_followups = true;
        }
        Some(other) => {
            // Unknown verbs never reach here via the parser; tolerate stray
            // payloads from the feed.
            info!("ignoring unknown command verb '{other}'");
        }
    }
}

/// One evaluation pass, plus an immediate post-merge pass when the pass
/// merged the MR (the forge then reports the merge commit and state the
/// transition/follow-up planning needs).
pub async fn run_cycle(ctx: &Context, state: &mut ActorState, mr_id: MrId) -> CycleOutcome {
    let mut outcome = run_pass(ctx, state, mr_id).await;
    while matches!(outcome, CycleOutcome::Completed) && std::mem::take(&mut state.just_merged) {
        info!("MR !{mr_id}: merged; running post-merge pass");
        outcome = run_pass(ctx, state, mr_id).await;
    }
    outcome
}

/// One full evaluation pass: project → evaluate → plan → execute.
/// Never panics its way out; every failure mode maps to an outcome.
async fn run_pass(ctx: &Context, state: &mut ActorState, mr_id: MrId) -> CycleOutcome {
    let projection = match projector::project(ctx, mr_id).await {
        Ok(p) => p,
        Err(ProjectionError::Transient(msg)) => {
            info!("MR !{mr_id}: projection deferred: {msg}");
            return CycleOutcome::Deferred(msg);
        }
        Err(ProjectionError::Gone) => {
            info!("MR !{mr_id}: gone from the forge, nothing to do");
            return CycleOutcome::Completed;
        }
        Err(ProjectionError::Permanent(msg)) => {
            warn!("MR !{mr_id}: projection rejected permanently: {msg}");
            state.pending_failures.push(Finding::new(
                Severity::Block,
                Category::Workflow,
                "projection",
                format!("Robocat cannot read this MR's state: {msg}"),
            ));
            return CycleOutcome::Failed(msg);
        }
    };

    let mut seed: Vec<Finding> = std::mem::take(&mut state.pending_failures);
    seed.extend(projection.issue_findings.iter().cloned());

    let findings = if projection.snapshot.open() {
        let cx = RuleContext {
            snapshot: &projection.snapshot,
            issues: &projection.issues,
            known_branches: &projection.known_branches,
            config: &ctx.config,
            rulesets: &ctx.rulesets,
            compliance: ctx.compliance.as_deref(),
            submodules: ctx.submodules.as_deref(),
            repo_dir: ctx.workspace.repo_path(),
        };
        rules::evaluate_all(&ctx.rules, &cx, seed)
    } else {
        seed
    };

    let plan = planner::plan(&PlanInputs {
        snapshot: &projection.snapshot,
        issues: &projection.issues,
        findings: &findings,
        followup_branches: &projection.followup_branches,
        rebase_affects_diff: projection.rebase_affects_diff,
        force_pipeline: state.force_pipeline,
        regenerate_followups: state.regenerate_followups,
        followup_mode: state.followup_mode,
        warned_issues: &state.warned_issues,
    });

    if plan.is_empty() {
        state.last_snapshot_hash = Some(projection.snapshot.content_hash());
        state.force_pipeline = false;
        state.regenerate_followups = false;
        return CycleOutcome::Completed;
    }

    info!(
        "MR !{mr_id}: executing {} action(s): {}",
        plan.len(),
        plan.iter().map(|a| a.key()).collect::<Vec<_>>().join(", ")
    );

    let outcome =
        executor::execute_plan(ctx, state, &projection.snapshot, &projection.issues, plan).await;

    if matches!(outcome, CycleOutcome::Completed) {
        state.last_snapshot_hash = Some(projection.snapshot.content_hash());
        state.force_pipeline = false;
        state.regenerate_followups = false;
    }
    outcome
}
