use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::api::CreateMrRequest;
use crate::engine::Context;
use crate::types::{
    branch_for_version, IssueSnapshot, MrId, MrSnapshot, CHERRY_PICK_PHRASE,
};
use crate::workspace::CherryPickOutcome;

/// Branches the merged change must be cherry-picked onto: the union of
/// the referenced issues' fix-version branches, minus the branch it was
/// just merged into.
pub fn target_branches(
    snapshot: &MrSnapshot,
    issues: &BTreeMap<String, IssueSnapshot>,
) -> BTreeSet<String> {
    issues
        .values()
        .flat_map(|issue| issue.fix_versions.iter())
        .filter_map(|version| branch_for_version(version))
        .filter(|branch| *branch != snapshot.target_branch)
        .collect()
}

/// Commits to carry over: the squash commit for squash merges, otherwise
/// the MR's own commits oldest-first.
fn commits_to_pick(snapshot: &MrSnapshot) -> Vec<String> {
    if snapshot.squash {
        snapshot.merge_commit_sha.iter().cloned().collect()
    } else {
        snapshot.commits.iter().map(|c| c.sha.clone()).collect()
    }
}

/// Create one follow-up MR per target branch. Cherry-pick conflicts are
/// not fatal: the MR is created from the pre-conflict head and a comment
/// lists what did not make it.
pub async fn generate(
    ctx: &Context,
    snapshot: &MrSnapshot,
    issues: &BTreeMap<String, IssueSnapshot>,
    draft: bool,
) -> Result<Vec<MrId>> {
    let targets = target_branches(snapshot, issues);
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let picks = commits_to_pick(snapshot);
    let provenance_sha = snapshot
        .merge_commit_sha
        .clone()
        .unwrap_or_else(|| snapshot.head_sha.clone());

    let ws = &ctx.workspace;
    ws.fetch().await.context("fetching before follow-up generation")?;

    let mut created = Vec::new();
    for target in targets {
        let topic = format!("{}-followup-{}", snapshot.source_branch, target);

        // Re-running after a partial failure must not duplicate MRs.
        if ctx.forge.branch_head(&topic).await?.is_some() {
            info!("follow-up branch {topic} already exists, skipping");
            continue;
        }

        ws.create_branch_at(&topic, &format!("origin/{target}"))
            .await
            .with_context(|| format!("creating follow-up branch {topic}"))?;

        let mut unpicked: Vec<String> = Vec::new();
        for (i, sha) in picks.iter().enumerate() {
            match ws.cherry_pick(sha).await? {
                CherryPickOutcome::Picked => {}
                CherryPickOutcome::Conflict { sha, .. } => {
                    warn!("follow-up {topic}: cherry-pick of {sha} conflicted");
                    unpicked = picks[i..].to_vec();
                    break;
                }
            }
        }

        ws.push(&topic).await.with_context(|| format!("pushing {topic}"))?;

        let description = format!(
            "{}\n\n{CHERRY_PICK_PHRASE}{provenance_sha})",
            snapshot.description
        );
        let mut assignees: BTreeSet<String> = BTreeSet::new();
        assignees.insert(ctx.bot.username.clone());
        assignees.insert(snapshot.author.clone());

        let new_mr = ctx
            .forge
            .create_mr(&CreateMrRequest {
                source_branch: topic.clone(),
                target_branch: target.clone(),
                title: snapshot.title.clone(),
                description,
                assignees,
                draft,
                squash: snapshot.squash,
            })
            .await?;

        if !unpicked.is_empty() {
            let listed = unpicked
                .iter()
                .map(|sha| format!("- {sha}"))
                .collect::<Vec<_>>()
                .join("\n");
            let body = format!(
                "Cherry-picking onto `{target}` stopped at a conflict. These commits were NOT \
                 applied and need manual attention:\n{listed}"
            );
            ctx.forge.post_note(new_mr, &body).await?;
        }

        info!("created follow-up MR !{new_mr} for {target}");
        created.push(new_mr);
    }

    Ok(created)
}
