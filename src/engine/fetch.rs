//! Cache-mediated upstream fetches.
//!
//! Every call composes a deterministic key, consults the cache with the
//! caller's freshness bound, and only goes upstream on a miss. Results are
//! stored wholesale; each return carries the fetch timestamp so callers
//! can compute their oldest input.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use tracing::{debug, info};

use super::Engine;
use crate::cache::{Blob, Payload};
use crate::github::types::{Comment, Issue, PullRequest, Review, TimelineEvent};

impl Engine {
  pub(crate) async fn cached_issues(
    &self,
    org: &str,
    project: &str,
    state: &str,
    update_age: Option<Duration>,
    newer_than: DateTime<Utc>,
  ) -> Result<(Vec<Issue>, DateTime<Utc>)> {
    let key = format!("{}/{}/issues/{}", org, project, state);
    if let Some(blob) = self.cache.get_newer_than(&key, newer_than) {
      if let Payload::Issues(issues) = blob.payload {
        debug!("{}: cache hit from {}", key, blob.created);
        return Ok((issues, blob.created));
      }
    }

    info!("{}: cache miss, fetching from GitHub", key);
    let mut issues = self.client.list_issues(org, project, state).await?;
    if let Some(age) = update_age {
      let cutoff = Utc::now() - age;
      issues.retain(|i| i.updated_at >= cutoff);
    }

    let blob = Blob::new(Payload::Issues(issues.clone()));
    let created = blob.created;
    self.cache.set(&key, blob);
    Ok((issues, created))
  }

  pub(crate) async fn cached_prs(
    &self,
    org: &str,
    project: &str,
    state: &str,
    update_age: Option<Duration>,
    newer_than: DateTime<Utc>,
  ) -> Result<(Vec<PullRequest>, DateTime<Utc>)> {
    let key = format!("{}/{}/prs/{}", org, project, state);
    if let Some(blob) = self.cache.get_newer_than(&key, newer_than) {
      if let Payload::PullRequests(prs) = blob.payload {
        debug!("{}: cache hit from {}", key, blob.created);
        return Ok((prs, blob.created));
      }
    }

    info!("{}: cache miss, fetching from GitHub", key);
    let mut prs = self.client.list_pull_requests(org, project, state).await?;
    if let Some(age) = update_age {
      let cutoff = Utc::now() - age;
      prs.retain(|p| p.updated_at >= cutoff);
    }

    let blob = Blob::new(Payload::PullRequests(prs.clone()));
    let created = blob.created;
    self.cache.set(&key, blob);
    Ok((prs, created))
  }

  pub(crate) async fn cached_issue_comments(
    &self,
    org: &str,
    project: &str,
    number: i64,
    newer_than: DateTime<Utc>,
  ) -> Result<(Vec<Comment>, DateTime<Utc>)> {
    let key = format!("{}/{}/issue-comments/{}", org, project, number);
    if let Some(blob) = self.cache.get_newer_than(&key, newer_than) {
      if let Payload::Comments(comments) = blob.payload {
        return Ok((comments, blob.created));
      }
    }

    debug!("{}: cache miss", key);
    let comments = self.client.list_issue_comments(org, project, number).await?;
    let blob = Blob::new(Payload::Comments(comments.clone()));
    let created = blob.created;
    self.cache.set(&key, blob);
    Ok((comments, created))
  }

  /// PR comments are the union of conversation comments and review
  /// comments, merged in creation order.
  pub(crate) async fn cached_pr_comments(
    &self,
    org: &str,
    project: &str,
    number: i64,
    newer_than: DateTime<Utc>,
  ) -> Result<(Vec<Comment>, DateTime<Utc>)> {
    let key = format!("{}/{}/pr-comments/{}", org, project, number);
    if let Some(blob) = self.cache.get_newer_than(&key, newer_than) {
      if let Payload::Comments(comments) = blob.payload {
        return Ok((comments, blob.created));
      }
    }

    debug!("{}: cache miss", key);
    let mut comments = self.client.list_issue_comments(org, project, number).await?;
    let review_comments = self.client.list_pr_comments(org, project, number).await?;
    comments.extend(review_comments);
    comments.sort_by_key(|c| c.created_at);

    let blob = Blob::new(Payload::Comments(comments.clone()));
    let created = blob.created;
    self.cache.set(&key, blob);
    Ok((comments, created))
  }

  pub(crate) async fn cached_timeline(
    &self,
    org: &str,
    project: &str,
    number: i64,
    newer_than: DateTime<Utc>,
  ) -> Result<(Vec<TimelineEvent>, DateTime<Utc>)> {
    let key = format!("{}/{}/timeline/{}", org, project, number);
    if let Some(blob) = self.cache.get_newer_than(&key, newer_than) {
      if let Payload::Timeline(events) = blob.payload {
        return Ok((events, blob.created));
      }
    }

    debug!("{}: cache miss", key);
    let events = self.client.list_timeline(org, project, number).await?;
    let blob = Blob::new(Payload::Timeline(events.clone()));
    let created = blob.created;
    self.cache.set(&key, blob);
    Ok((events, created))
  }

  pub(crate) async fn cached_reviews(
    &self,
    org: &str,
    project: &str,
    number: i64,
    newer_than: DateTime<Utc>,
  ) -> Result<(Vec<Review>, DateTime<Utc>)> {
    let key = format!("{}/{}/reviews/{}", org, project, number);
    if let Some(blob) = self.cache.get_newer_than(&key, newer_than) {
      if let Payload::Reviews(reviews) = blob.payload {
        return Ok((reviews, blob.created));
      }
    }

    debug!("{}: cache miss", key);
    let reviews = self.client.list_reviews(org, project, number).await?;
    let blob = Blob::new(Payload::Reviews(reviews.clone()));
    let created = blob.created;
    self.cache.set(&key, blob);
    Ok((reviews, created))
  }
}
