use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use robocat_core::api::{
    ApiResult, CreateMrRequest, Discussion, Forge, ForgeUser, Job, MergeOutcome, MrDetails, Note,
};
use robocat_core::types::{
    Commit, FileChange, Mergeability, MrId, MrState, PipelineInfo, PipelineStatus,
};

use crate::{status_error, transport_error};

const SERVICE: &str = "forge";

/// GitLab-class REST client over a shared `reqwest::Client`. One instance
/// serves one project (the repo the bot supervises).
pub struct GitlabClient {
    http: Client,
    /// `https://host/api/v4`
    api_base: String,
    /// URL-encoded project path, e.g. `dev%2Fvms`.
    project: String,
    token: String,
}

impl GitlabClient {
    /// Build a client from the configured repository URL
    /// (`https://host/group/project`) and API token.
    pub fn from_repo_url(repo_url: &str, token: String, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(repo_url)
            .with_context(|| format!("parsing repo url {repo_url}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("repo url {repo_url} has no host"))?;
        let scheme = url.scheme();
        let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
        let path = url.path().trim_matches('/');
        if path.is_empty() {
            return Err(anyhow!("repo url {repo_url} has no project path"));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("building forge http client")?;
        Ok(Self {
            http,
            api_base: format!("{scheme}://{host}{port}/api/v4"),
            project: urlencoding::encode(path).into_owned(),
            token,
        })
    }

    fn url(&self, rest: &str) -> String {
        format!("{}/projects/{}/{rest}", self.api_base, self.project)
    }

    fn mr_url(&self, mr: MrId, rest: &str) -> String {
        if rest.is_empty() {
            self.url(&format!("merge_requests/{mr}"))
        } else {
            self.url(&format!("merge_requests/{mr}/{rest}"))
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http.request(method, url).header("PRIVATE-TOKEN", &self.token)
    }

    /// Send, classify transport/status failures, parse the JSON body.
    async fn send(&self, req: RequestBuilder) -> ApiResult<Value> {
        let resp = req.send().await.map_err(|e| transport_error(SERVICE, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status.as_u16(), body));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        resp.json().await.map_err(|e| transport_error(SERVICE, e))
    }

    async fn get(&self, url: String) -> ApiResult<Value> {
        self.send(self.request(Method::GET, url)).await
    }

    /// Resolve a username to its user id.
    async fn user_id(&self, username: &str) -> ApiResult<Option<u64>> {
        let url = format!(
            "{}/users?username={}",
            self.api_base,
            urlencoding::encode(username)
        );
        let users = self.get(url).await?;
        Ok(users
            .as_array()
            .and_then(|a| a.first())
            .and_then(|u| u["id"].as_u64()))
    }

    /// Code-owner rule state from the approval-state endpoint; instances
    /// without approval rules report the requirement as satisfied.
    async fn code_owner_approved(&self, mr: MrId) -> ApiResult<bool> {
        let state = match self.get(self.mr_url(mr, "approval_state")).await {
            Ok(v) => v,
            Err(robocat_core::api::ApiError::NotFound { .. }) => return Ok(true),
            Err(e) => return Err(e),
        };
        let Some(rules) = state["rules"].as_array() else {
            return Ok(true);
        };
        Ok(rules
            .iter()
            .filter(|r| r["rule_type"] == "code_owner")
            .all(|r| r["approved"].as_bool().unwrap_or(true)))
    }
}

fn parse_state(state: &str) -> MrState {
    match state {
        "merged" => MrState::Merged,
        "closed" | "locked" => MrState::Closed,
        _ => MrState::Opened,
    }
}

fn parse_mergeability(merge_status: &str) -> Mergeability {
    match merge_status {
        "can_be_merged" => Mergeability::Mergeable,
        "cannot_be_merged" | "cannot_be_merged_recheck" => Mergeability::Conflicts,
        _ => Mergeability::Unknown,
    }
}

fn parse_pipeline_status(status: &str) -> PipelineStatus {
    match status {
        "success" => PipelineStatus::Success,
        "failed" => PipelineStatus::Failed,
        "canceled" | "skipped" => PipelineStatus::Canceled,
        "manual" => PipelineStatus::ManualPending,
        _ => PipelineStatus::Running,
    }
}

fn parse_mr_details(v: &Value) -> MrDetails {
    let assignees: BTreeSet<String> = v["assignees"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|u| u["username"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    MrDetails {
        id: v["iid"].as_u64().unwrap_or_default(),
        title: v["title"].as_str().unwrap_or_default().to_string(),
        description: v["description"].as_str().unwrap_or_default().to_string(),
        source_branch: v["source_branch"].as_str().unwrap_or_default().to_string(),
        target_branch: v["target_branch"].as_str().unwrap_or_default().to_string(),
        author: v["author"]["username"].as_str().unwrap_or_default().to_string(),
        squash: v["squash"].as_bool().unwrap_or(false),
        draft: v["draft"]
            .as_bool()
            .or_else(|| v["work_in_progress"].as_bool())
            .unwrap_or(false),
        state: parse_state(v["state"].as_str().unwrap_or("opened")),
        head_sha: v["sha"].as_str().unwrap_or_default().to_string(),
        merge_commit_sha: v["squash_commit_sha"]
            .as_str()
            .or_else(|| v["merge_commit_sha"].as_str())
            .map(str::to_string),
        mergeability: parse_mergeability(v["merge_status"].as_str().unwrap_or("unchecked")),
        assignees,
        // Filled separately from the approval-state endpoint.
        code_owner_approved: true,
    }
}

#[async_trait]
impl Forge for GitlabClient {
    async fn current_user(&self) -> ApiResult<ForgeUser> {
        let v = self.get(format!("{}/user", self.api_base)).await?;
        Ok(ForgeUser {
            id: v["id"].as_u64().unwrap_or_default(),
            username: v["username"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn list_open_mrs(&self) -> ApiResult<Vec<MrId>> {
        let v = self
            .get(self.url("merge_requests?state=opened&per_page=100"))
            .await?;
        Ok(v.as_array()
            .map(|a| a.iter().filter_map(|m| m["iid"].as_u64()).collect())
            .unwrap_or_default())
    }

    async fn get_mr(&self, mr: MrId) -> ApiResult<MrDetails> {
        let v = self.get(self.mr_url(mr, "")).await?;
        let mut details = parse_mr_details(&v);
        details.code_owner_approved = self.code_owner_approved(mr).await?;
        Ok(details)
    }

    async fn list_commits(&self, mr: MrId) -> ApiResult<Vec<Commit>> {
        let v = self.get(self.mr_url(mr, "commits")).await?;
        let mut commits: Vec<Commit> = v
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|c| Commit {
                        sha: c["id"].as_str().unwrap_or_default().to_string(),
                        message: c["message"].as_str().unwrap_or_default().to_string(),
                        parent_shas: c["parent_ids"]
                            .as_array()
                            .map(|p| {
                                p.iter()
                                    .filter_map(|s| s.as_str())
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        // The API returns newest first; the engine wants application order.
        commits.reverse();
        Ok(commits)
    }

    async fn list_changed_files(&self, mr: MrId) -> ApiResult<Vec<FileChange>> {
        let v = self.get(self.mr_url(mr, "changes")).await?;
        Ok(v["changes"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|c| FileChange {
                        path: c["new_path"].as_str().unwrap_or_default().to_string(),
                        old_path: c["old_path"].as_str().unwrap_or_default().to_string(),
                        new_file: c["new_file"].as_bool().unwrap_or(false),
                        deleted_file: c["deleted_file"].as_bool().unwrap_or(false),
                        diff: c["diff"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_notes(&self, mr: MrId) -> ApiResult<Vec<Note>> {
        let v = self.get(self.mr_url(mr, "notes?per_page=100")).await?;
        Ok(v.as_array()
            .map(|a| {
                a.iter()
                    .filter(|n| !n["system"].as_bool().unwrap_or(false))
                    .map(|n| Note {
                        id: n["id"].as_u64().unwrap_or_default(),
                        author: n["author"]["username"].as_str().unwrap_or_default().to_string(),
                        body: n["body"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn post_note(&self, mr: MrId, body: &str) -> ApiResult<()> {
        let req = self
            .request(Method::POST, self.mr_url(mr, "notes"))
            .json(&json!({ "body": body }));
        self.send(req).await?;
        Ok(())
    }

    async fn list_discussions(&self, mr: MrId) -> ApiResult<Vec<Discussion>> {
        let v = self.get(self.mr_url(mr, "discussions?per_page=100")).await?;
        Ok(v.as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|d| {
                        let notes = d["notes"].as_array()?;
                        let first = notes.first()?;
                        if !first["resolvable"].as_bool().unwrap_or(false) {
                            return None;
                        }
                        Some(Discussion {
                            id: d["id"].as_str().unwrap_or_default().to_string(),
                            first_note_author: first["author"]["username"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                            first_note_body: first["body"].as_str().unwrap_or_default().to_string(),
                            resolved: first["resolved"].as_bool().unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_discussion(&self, mr: MrId, body: &str) -> ApiResult<String> {
        let req = self
            .request(Method::POST, self.mr_url(mr, "discussions"))
            .json(&json!({ "body": body }));
        let v = self.send(req).await?;
        Ok(v["id"].as_str().unwrap_or_default().to_string())
    }

    async fn resolve_discussion(&self, mr: MrId, discussion_id: &str) -> ApiResult<()> {
        let url = self.mr_url(mr, &format!("discussions/{discussion_id}"));
        let req = self.request(Method::PUT, url).json(&json!({ "resolved": true }));
        self.send(req).await?;
        Ok(())
    }

    async fn list_approvals(&self, mr: MrId) -> ApiResult<BTreeSet<String>> {
        let v = self.get(self.mr_url(mr, "approvals")).await?;
        Ok(v["approved_by"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|e| e["user"]["username"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_assignees(&self, mr: MrId, users: &BTreeSet<String>) -> ApiResult<()> {
        let current = self.get(self.mr_url(mr, "")).await?;
        let mut ids: BTreeSet<u64> = current["assignees"]
            .as_array()
            .map(|a| a.iter().filter_map(|u| u["id"].as_u64()).collect())
            .unwrap_or_default();
        for username in users {
            match self.user_id(username).await? {
                Some(id) => {
                    ids.insert(id);
                }
                None => debug!("assignee {username} not found on the forge, skipping"),
            }
        }
        let req = self
            .request(Method::PUT, self.mr_url(mr, ""))
            .json(&json!({ "assignee_ids": ids.iter().collect::<Vec<_>>() }));
        self.send(req).await?;
        Ok(())
    }

    async fn get_pipeline(&self, mr: MrId) -> ApiResult<Option<PipelineInfo>> {
        let v = self.get(self.mr_url(mr, "")).await?;
        let pipeline = &v["head_pipeline"];
        if pipeline.is_null() {
            return Ok(None);
        }
        Ok(Some(PipelineInfo {
            id: pipeline["id"].as_u64().unwrap_or_default(),
            status: parse_pipeline_status(pipeline["status"].as_str().unwrap_or("running")),
            sha: pipeline["sha"].as_str().unwrap_or_default().to_string(),
        }))
    }

    async fn list_manual_jobs(&self, pipeline_id: u64) -> ApiResult<Vec<Job>> {
        let v = self
            .get(self.url(&format!("pipelines/{pipeline_id}/jobs?scope[]=manual")))
            .await?;
        Ok(v.as_array()
            .map(|a| {
                a.iter()
                    .map(|j| Job {
                        id: j["id"].as_u64().unwrap_or_default(),
                        name: j["name"].as_str().unwrap_or_default().to_string(),
                        stage: j["stage"].as_str().unwrap_or_default().to_string(),
                        manual: j["status"] == "manual",
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn play_job(&self, job_id: u64) -> ApiResult<()> {
        let req = self.request(Method::POST, self.url(&format!("jobs/{job_id}/play")));
        self.send(req).await?;
        Ok(())
    }

    async fn branch_head(&self, branch: &str) -> ApiResult<Option<String>> {
        let url = self.url(&format!(
            "repository/branches/{}",
            urlencoding::encode(branch)
        ));
        match self.get(url).await {
            Ok(v) => Ok(v["commit"]["id"].as_str().map(str::to_string)),
            Err(robocat_core::api::ApiError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn merge(
        &self,
        mr: MrId,
        message: Option<&str>,
        squash: bool,
        sha: &str,
    ) -> ApiResult<MergeOutcome> {
        let mut body = json!({ "squash": squash, "sha": sha });
        if let Some(message) = message {
            body["squash_commit_message"] = json!(message);
        }
        let req = self.request(Method::PUT, self.mr_url(mr, "merge")).json(&body);
        match self.send(req).await {
            Ok(_) => Ok(MergeOutcome::Merged),
            // 405/406/409: the MR cannot be merged right now.
            Err(robocat_core::api::ApiError::Permanent { status: 405 | 406 | 409, .. }) => {
                Ok(MergeOutcome::NotMergeable)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_mr(&self, req: &CreateMrRequest) -> ApiResult<MrId> {
        let title = if req.draft {
            format!("Draft: {}", req.title)
        } else {
            req.title.clone()
        };
        let body = json!({
            "source_branch": req.source_branch,
            "target_branch": req.target_branch,
            "title": title,
            "description": req.description,
            "squash": req.squash,
        });
        let request = self.request(Method::POST, self.url("merge_requests")).json(&body);
        let v = self.send(request).await?;
        let iid = v["iid"].as_u64().unwrap_or_default();
        if !req.assignees.is_empty() {
            self.add_assignees(iid, &req.assignees).await?;
        }
        Ok(iid)
    }
}
