use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::warn;

use robocat_core::api::{ApiError, ApiResult, Tracker, TrackerIssue};

use crate::{status_error, transport_error};

const SERVICE: &str = "tracker";

/// Jira-class REST client. Transient failures are retried internally up to
/// the configured count; the engine's own backoff sits above this.
pub struct JiraClient {
    http: Client,
    base: String,
    login: String,
    password: String,
    retries: u32,
}

impl JiraClient {
    pub fn new(
        url: &str,
        login: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("building tracker http client")?;
        Ok(Self {
            http,
            base: format!("{}/rest/api/2", url.trim_end_matches('/')),
            login: login.into(),
            password: password.into(),
            retries,
        })
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.login, Some(&self.password))
    }

    async fn send_once(&self, req: RequestBuilder) -> ApiResult<Value> {
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

    async fn send(&self, req: RequestBuilder) -> ApiResult<Value> {
        let mut attempt = 0;
        loop {
            let Some(cloned) = req.try_clone() else {
                return self.send_once(req).await;
            };
            match self.send_once(cloned).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!("tracker request failed (attempt {attempt}): {e}");
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn parse_issue(key: &str, v: &Value) -> TrackerIssue {
    let fields = &v["fields"];
    TrackerIssue {
        key: v["key"].as_str().unwrap_or(key).to_string(),
        project: fields["project"]["key"].as_str().unwrap_or_default().to_string(),
        status: fields["status"]["name"].as_str().unwrap_or_default().to_string(),
        fix_versions: fields["fixVersions"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|fv| fv["name"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        assignee: fields["assignee"]["name"]
            .as_str()
            .or_else(|| fields["assignee"]["displayName"].as_str())
            .map(str::to_string),
    }
}

#[async_trait]
impl Tracker for JiraClient {
    async fn get_issue(&self, key: &str) -> ApiResult<TrackerIssue> {
        let url = format!(
            "{}/issue/{key}?fields=project,status,fixVersions,assignee",
            self.base
        );
        let v = self.send(self.request(Method::GET, url)).await?;
        Ok(parse_issue(key, &v))
    }

    async fn available_transitions(&self, key: &str) -> ApiResult<Vec<String>> {
        let url = format!("{}/issue/{key}/transitions", self.base);
        let v = self.send(self.request(Method::GET, url)).await?;
        Ok(v["transitions"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|t| t["to"]["name"].as_str().or_else(|| t["name"].as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transition_issue(&self, key: &str, to: &str) -> ApiResult<()> {
        let url = format!("{}/issue/{key}/transitions", self.base);
        let v = self.send(self.request(Method::GET, url.clone())).await?;
        let id = v["transitions"]
            .as_array()
            .and_then(|a| {
                a.iter().find(|t| {
                    t["to"]["name"].as_str() == Some(to) || t["name"].as_str() == Some(to)
                })
            })
            .and_then(|t| t["id"].as_str())
            .map(str::to_string);
        let Some(id) = id else {
            return Err(ApiError::Permanent {
                service: SERVICE,
                status: 400,
                message: format!("issue {key}: no transition to '{to}' available"),
            });
        };
        let req = self
            .request(Method::POST, url)
            .json(&json!({ "transition": { "id": id } }));
        self.send(req).await?;
        Ok(())
    }

    async fn post_comment(&self, key: &str, body: &str) -> ApiResult<()> {
        let url = format!("{}/issue/{key}/comment", self.base);
        let req = self.request(Method::POST, url).json(&json!({ "body": body }));
        self.send(req).await?;
        Ok(())
    }
}
