//! Thin GitHub REST client: bearer auth, pagination, rate-limit surfacing.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{Comment, Issue, PullRequest, Review, TimelineEvent};

const API_ROOT: &str = "https://api.github.com";
const USER_AGENT_HEADER: &str = "triage/0.1";
const PER_PAGE: usize = 100;

#[derive(Clone)]
pub struct GithubClient {
  http: reqwest::Client,
  api_root: String,
}

impl GithubClient {
  pub fn new(token: &str) -> Result<Self> {
    Self::with_api_root(token, API_ROOT)
  }

  /// Point the client at a different API root. Used by tests.
  pub fn with_api_root(token: &str, api_root: &str) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_HEADER));
    headers.insert(
      ACCEPT,
      HeaderValue::from_static("application/vnd.github+json"),
    );
    if !token.is_empty() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("invalid token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("failed to build HTTP client: {}", e))?;

    Ok(Self {
      http,
      api_root: api_root.trim_end_matches('/').to_string(),
    })
  }

  /// List issues in a state, newest-updated first. GitHub's issue listing
  /// includes pull requests; those are dropped here.
  pub async fn list_issues(&self, org: &str, project: &str, state: &str) -> Result<Vec<Issue>> {
    let path = format!("/repos/{}/{}/issues", org, project);
    let query = [("state", state), ("sort", "updated"), ("direction", "desc")];
    let raw: Vec<Issue> = self.paginate(&path, &query).await?;
    Ok(raw.into_iter().filter(|i| i.pull_request.is_none()).collect())
  }

  pub async fn list_pull_requests(
    &self,
    org: &str,
    project: &str,
    state: &str,
  ) -> Result<Vec<PullRequest>> {
    let path = format!("/repos/{}/{}/pulls", org, project);
    let query = [("state", state), ("sort", "updated"), ("direction", "desc")];
    self.paginate(&path, &query).await
  }

  pub async fn list_issue_comments(
    &self,
    org: &str,
    project: &str,
    number: i64,
  ) -> Result<Vec<Comment>> {
    let path = format!("/repos/{}/{}/issues/{}/comments", org, project, number);
    self.paginate(&path, &[]).await
  }

  pub async fn list_pr_comments(
    &self,
    org: &str,
    project: &str,
    number: i64,
  ) -> Result<Vec<Comment>> {
    let path = format!("/repos/{}/{}/pulls/{}/comments", org, project, number);
    self.paginate(&path, &[]).await
  }

  pub async fn list_timeline(
    &self,
    org: &str,
    project: &str,
    number: i64,
  ) -> Result<Vec<TimelineEvent>> {
    let path = format!("/repos/{}/{}/issues/{}/timeline", org, project, number);
    self.paginate(&path, &[]).await
  }

  pub async fn list_reviews(
    &self,
    org: &str,
    project: &str,
    number: i64,
  ) -> Result<Vec<Review>> {
    let path = format!("/repos/{}/{}/pulls/{}/reviews", org, project, number);
    self.paginate(&path, &[]).await
  }

  /// Walk page/per_page cursors until a short page. A 404 anywhere is an
  /// empty list, not a failure: deleted and access-restricted items come
  /// and go mid-refresh.
  async fn paginate<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, &str)],
  ) -> Result<Vec<T>> {
    let url = format!("{}{}", self.api_root, path);
    let mut results: Vec<T> = Vec::new();
    let mut page = 1usize;

    loop {
      let page_str = page.to_string();
      let per_page_str = PER_PAGE.to_string();
      let mut q: Vec<(&str, &str)> = query.to_vec();
      q.push(("page", page_str.as_str()));
      q.push(("per_page", per_page_str.as_str()));

      debug!("GET {} page {}", url, page);
      let resp = self
        .http
        .get(&url)
        .query(&q)
        .send()
        .await
        .map_err(|e| eyre!("GET {}: {}", url, e))?;

      match resp.status() {
        StatusCode::NOT_FOUND => {
          warn!("{} returned 404, treating as empty", url);
          return Ok(results);
        }
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
          let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("?");
          return Err(eyre!(
            "{}: rate limited by GitHub ({} requests remaining)",
            url,
            remaining
          ));
        }
        s if !s.is_success() => {
          return Err(eyre!("GET {} failed: HTTP {}", url, s));
        }
        _ => {}
      }

      let batch: Vec<T> = resp
        .json()
        .await
        .map_err(|e| eyre!("decoding {} page {}: {}", url, page, e))?;

      let short_page = batch.len() < PER_PAGE;
      results.extend(batch);
      if short_page {
        return Ok(results);
      }
      page += 1;
    }
  }
}
