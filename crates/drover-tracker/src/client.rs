//! `reqwest`-backed implementation of [`TrackerApi`] for a Plane workspace.
//!
//! All endpoints are workspace-scoped and authenticated with a single
//! `x-api-key` header. Response bodies are read fully and decoded with
//! `serde_json` so decode failures carry the offending URL.

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::TrackerError;
use crate::api::TrackerApi;
use crate::models::{
    Issue, IssueComment, IssuePatch, Label, ListResponse, Project, WorkflowState,
};

/// Issues are listed with this page size. One page per poll is enough: the
/// poller caps materialized tasks well below it.
const ISSUES_PER_PAGE: u32 = 50;

/// HTTP client for the tracker's workspace API.
#[derive(Debug, Clone)]
pub struct PlaneClient {
    client: reqwest::Client,
    base_url: String,
    workspace_slug: String,
    api_key: String,
}

impl PlaneClient {
    /// Create a client for one workspace.
    ///
    /// `base_url` must not end with a slash (a trailing slash is trimmed).
    pub fn new(
        base_url: impl Into<String>,
        workspace_slug: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            workspace_slug: workspace_slug.into(),
            api_key: api_key.into(),
        }
    }

    /// Build a workspace-scoped URL: `<base>/api/v1/workspaces/<slug>/<path>`.
    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/workspaces/{}/{}",
            self.base_url, self.workspace_slug, path
        )
    }

    /// Send a request and decode the JSON response, or map the failure to a
    /// [`TrackerError`].
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<&serde_json::Value>,
    ) -> Result<T, TrackerError> {
        debug!(method = %method, url = %url, "tracker request");

        let mut req = self
            .client
            .request(method, &url)
            .header("x-api-key", &self.api_key);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(TrackerError::Api {
                status: status.as_u16(),
                url,
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|source| TrackerError::Decode { url, source })
    }

    /// GET a list endpoint, unwrapping the optional pagination envelope.
    async fn get_list<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>, TrackerError> {
        let response: ListResponse<T> = self.request(Method::GET, url, None).await?;
        Ok(response.into_items())
    }

    /// Send a write request whose response body we do not care about.
    async fn write(
        &self,
        method: Method,
        url: String,
        body: &serde_json::Value,
    ) -> Result<(), TrackerError> {
        let _: serde_json::Value = self.request(method, url, Some(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl TrackerApi for PlaneClient {
    async fn list_projects(&self) -> Result<Vec<Project>, TrackerError> {
        self.get_list(self.url("projects/")).await
    }

    async fn list_states(&self, project_id: &str) -> Result<Vec<WorkflowState>, TrackerError> {
        self.get_list(self.url(&format!("projects/{project_id}/states/")))
            .await
    }

    async fn list_labels(&self, project_id: &str) -> Result<Vec<Label>, TrackerError> {
        self.get_list(self.url(&format!("projects/{project_id}/labels/")))
            .await
    }

    async fn list_issues(
        &self,
        project_id: &str,
        state_id: Option<&str>,
    ) -> Result<Vec<Issue>, TrackerError> {
        let mut url = self.url(&format!(
            "projects/{project_id}/issues/?per_page={ISSUES_PER_PAGE}"
        ));
        if let Some(state_id) = state_id {
            url.push_str(&format!("&state={state_id}"));
        }
        self.get_list(url).await
    }

    async fn get_issue(&self, project_id: &str, issue_id: &str) -> Result<Issue, TrackerError> {
        self.request(
            Method::GET,
            self.url(&format!("projects/{project_id}/issues/{issue_id}/")),
            None,
        )
        .await
    }

    async fn update_issue(
        &self,
        project_id: &str,
        issue_id: &str,
        patch: &IssuePatch,
    ) -> Result<(), TrackerError> {
        let url = self.url(&format!("projects/{project_id}/issues/{issue_id}/"));
        let body = serde_json::to_value(patch).map_err(|source| TrackerError::Decode {
            url: url.clone(),
            source,
        })?;
        self.write(Method::PATCH, url, &body).await
    }

    async fn list_comments(
        &self,
        project_id: &str,
        issue_id: &str,
    ) -> Result<Vec<IssueComment>, TrackerError> {
        self.get_list(self.url(&format!(
            "projects/{project_id}/issues/{issue_id}/comments/"
        )))
        .await
    }

    async fn create_comment(
        &self,
        project_id: &str,
        issue_id: &str,
        comment_html: &str,
    ) -> Result<(), TrackerError> {
        self.write(
            Method::POST,
            self.url(&format!(
                "projects/{project_id}/issues/{issue_id}/comments/"
            )),
            &serde_json::json!({ "comment_html": comment_html }),
        )
        .await
    }

    async fn create_link(
        &self,
        project_id: &str,
        issue_id: &str,
        title: &str,
        url: &str,
    ) -> Result<(), TrackerError> {
        self.write(
            Method::POST,
            self.url(&format!("projects/{project_id}/issues/{issue_id}/links/")),
            &serde_json::json!({ "title": title, "url": url }),
        )
        .await
    }
}
