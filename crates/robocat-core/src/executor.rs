use std::collections::BTreeMap;
use std::future::Future;

use tracing::{info, warn};

use crate::api::{ApiError, ApiResult, Job, MergeOutcome};
use crate::engine::{ActorState, Context};
use crate::followup;
use crate::planner::issue_status;
use crate::types::{
    fingerprint_marker, Action, Category, CycleOutcome, Finding, IssueSnapshot, MrSnapshot,
    Severity,
};

enum ActionStatus {
    Done,
    /// Stop executing the rest of the plan (not an error).
    AbortPlan,
}

enum ActionError {
    Transient { service: &'static str, message: String },
    Permanent(String),
    Fatal(String),
}

impl From<ApiError> for ActionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transient { service, message } => Self::Transient { service, message },
            other => Self::Permanent(other.to_string()),
        }
    }
}

/// Retry a transient-failing call with the context's bounded backoff.
async fn with_retries<T, F, Fut>(ctx: &Context, what: &str, mut call: F) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < ctx.retry_delays.len() => {
                let delay = ctx.retry_delays[attempt];
                warn!("{what}: transient failure, retrying in {delay:?}: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Should the bot start this manual job? `:no-bot-start` is an explicit,
/// case-sensitive opt-out; autorun-stage jobs start on their own.
fn should_start(job: &Job, autorun_stage: Option<&str>) -> bool {
    job.manual
        && !job.name.ends_with(":no-bot-start")
        && autorun_stage != Some(job.stage.as_str())
}

/// Execute a plan in the fixed order the planner emitted it. Returns the
/// cycle outcome; failures along the way are recorded on the actor state
/// as findings for the next cycle.
pub async fn execute_plan(
    ctx: &Context,
    state: &mut ActorState,
    snapshot: &MrSnapshot,
    issues: &BTreeMap<String, IssueSnapshot>,
    plan: Vec<Action>,
) -> CycleOutcome {
    for action in plan {
        let key = action.key();
        state.in_flight.insert(key.clone());
        let result = run_action(ctx, state, snapshot, issues, &action).await;
        state.in_flight.remove(&key);

        match result {
            Ok(ActionStatus::Done) => {}
            Ok(ActionStatus::AbortPlan) => {
                info!("MR !{}: plan aborted after `{key}`", snapshot.id);
                return CycleOutcome::Completed;
            }
            Err(ActionError::Transient { service, message }) => {
                state.pending_failures.push(Finding::new(
                    Severity::Warn,
                    Category::Workflow,
                    &format!("transient-{service}"),
                    format!("Temporary failure talking to {service}: {message}"),
                ));
                return CycleOutcome::Deferred(format!("{service}: {message}"));
            }
            Err(ActionError::Permanent(message)) => {
                warn!("MR !{}: `{key}` rejected permanently: {message}", snapshot.id);
                state.pending_failures.push(Finding::new(
                    Severity::Block,
                    Category::Workflow,
                    &key,
                    format!("Robocat could not apply `{key}`: {message}"),
                ));
                // A failed merge must not let post-merge actions run.
                if matches!(action, Action::Merge { .. } | Action::Rebase) {
                    return CycleOutcome::Completed;
                }
            }
            Err(ActionError::Fatal(message)) => {
                warn!("MR !{}: `{key}` failed: {message}", snapshot.id);
                state.pending_failures.push(Finding::new(
                    Severity::Warn,
                    Category::Workflow,
                    &key,
                    format!("Robocat hit an internal error on `{key}`: {message}"),
                ));
                return CycleOutcome::Failed(message);
            }
        }
    }
    CycleOutcome::Completed
}

async fn run_action(
    ctx: &Context,
    state: &mut ActorState,
    snapshot: &MrSnapshot,
    issues: &BTreeMap<String, IssueSnapshot>,
    action: &Action,
) -> Result<ActionStatus, ActionError> {
    let mr = snapshot.id;
    match action {
        Action::CreateDiscussion { fingerprint, message } => {
            // Re-check just before writing: a retried webhook may already
            // have materialized this discussion.
            let existing =
                with_retries(ctx, "list discussions", || ctx.forge.list_discussions(mr)).await?;
            let already = existing.iter().any(|d| {
                d.first_note_author == ctx.bot.username
                    && crate::types::extract_fingerprint(&d.first_note_body).as_deref()
                        == Some(fingerprint.as_str())
            });
            if already {
                return Ok(ActionStatus::Done);
            }
            let body = format!("{message}\n\n{}", fingerprint_marker(fingerprint));
            with_retries(ctx, "create discussion", || ctx.forge.create_discussion(mr, &body))
                .await?;
            Ok(ActionStatus::Done)
        }

        Action::ResolveDiscussion { discussion_id, fingerprint } => {
            info!("MR !{mr}: resolving healed discussion {fingerprint}");
            with_retries(ctx, "resolve discussion", || {
                ctx.forge.resolve_discussion(mr, discussion_id)
            })
            .await?;
            Ok(ActionStatus::Done)
        }

        Action::AddAssignees { users } => {
            with_retries(ctx, "add assignees", || ctx.forge.add_assignees(mr, users)).await?;
            Ok(ActionStatus::Done)
        }

        Action::Rebase => {
            let ws = &ctx.workspace;
            let rebased = async {
                ws.fetch().await?;
                ws.checkout_branch(&snapshot.source_branch).await?;
                ws.rebase_onto(&snapshot.target_branch).await?;
                ws.head_sha().await
            }
            .await;
            match rebased {
                Ok(new_head) => {
                    if new_head != snapshot.head_sha {
                        ws.push_force(&snapshot.source_branch)
                            .await
                            .map_err(|e| ActionError::Fatal(format!("{e:#}")))?;
                        info!("MR !{mr}: rebased {} onto {}", snapshot.source_branch, snapshot.target_branch);
                    }
                    Ok(ActionStatus::Done)
                }
                Err(e) => {
                    // User-fixable: surface as a finding, skip the trigger.
                    state.pending_failures.push(Finding::new(
                        Severity::Warn,
                        Category::Workflow,
                        "rebase",
                        format!(
                            "Robocat could not rebase `{}` onto `{}`: {e}",
                            snapshot.source_branch, snapshot.target_branch
                        ),
                    ));
                    Ok(ActionStatus::AbortPlan)
                }
            }
        }

        Action::TriggerPipeline { cause } => {
            state.last_trigger_cause = Some(*cause);
            let pipeline =
                with_retries(ctx, "get pipeline", || ctx.forge.get_pipeline(mr)).await?;
            let Some(pipeline) = pipeline else {
                info!("MR !{mr}: no pipeline exists yet; the forge will start one for the push");
                return Ok(ActionStatus::Done);
            };
            let jobs = with_retries(ctx, "list manual jobs", || {
                ctx.forge.list_manual_jobs(pipeline.id)
            })
            .await?;
            let autorun = ctx.config.pipeline.autorun_stage.as_deref();
            for job in jobs.iter().filter(|j| should_start(j, autorun)) {
                info!("MR !{mr}: starting manual job `{}` ({:?})", job.name, cause);
                with_retries(ctx, "play job", || ctx.forge.play_job(job.id)).await?;
            }
            Ok(ActionStatus::Done)
        }

        Action::Merge { message, squash, sha } => {
            let outcome = with_retries(ctx, "merge", || {
                ctx.forge.merge(mr, message.as_deref(), *squash, sha)
            })
            .await?;
            match outcome {
                MergeOutcome::Merged => {
                    info!("MR !{mr}: merged into {}", snapshot.target_branch);
                    state.just_merged = true;
                    Ok(ActionStatus::Done)
                }
                MergeOutcome::NotMergeable => {
                    // Not an error: the next event re-evaluates from scratch.
                    info!("MR !{mr}: forge refused the merge (not mergeable)");
                    Ok(ActionStatus::AbortPlan)
                }
            }
        }

        Action::TransitionIssue { key, to } => {
            let issue = with_retries(ctx, "get issue", || ctx.tracker.get_issue(key)).await?;
            if issue.status != issue_status::IN_REVIEW {
                // Only In Review issues move; anything else already left.
                return Ok(ActionStatus::Done);
            }
            let transitions = with_retries(ctx, "list transitions", || {
                ctx.tracker.available_transitions(key)
            })
            .await?;
            let target = if transitions.iter().any(|t| t == to) {
                to.as_str()
            } else if transitions.iter().any(|t| t == issue_status::CLOSED) {
                issue_status::CLOSED
            } else {
                warn!("issue {key}: neither `{to}` nor `Closed` available; leaving as-is");
                return Ok(ActionStatus::Done);
            };
            with_retries(ctx, "transition issue", || ctx.tracker.transition_issue(key, target))
                .await?;
            let comment =
                format!("MR !{mr} merged into `{}`.", snapshot.target_branch);
            with_retries(ctx, "comment on issue", || ctx.tracker.post_comment(key, &comment))
                .await?;
            info!("issue {key}: {} -> {target}", issue_status::IN_REVIEW);
            Ok(ActionStatus::Done)
        }

        Action::CommentOnIssue { key, body } => {
            with_retries(ctx, "comment on issue", || ctx.tracker.post_comment(key, body)).await?;
            state.warned_issues.insert(key.clone());
            Ok(ActionStatus::Done)
        }

        Action::CommentOnMr { body } => {
            with_retries(ctx, "post note", || ctx.forge.post_note(mr, body)).await?;
            Ok(ActionStatus::Done)
        }

        Action::GenerateFollowUps { draft } => {
            match followup::generate(ctx, snapshot, issues, *draft).await {
                Ok(created) => {
                    if !created.is_empty() {
                        info!("MR !{mr}: created follow-up MR(s) {created:?}");
                    }
                    Ok(ActionStatus::Done)
                }
                Err(e) => Err(ActionError::Fatal(format!("{e:#}"))),
            }
        }
    }
}
