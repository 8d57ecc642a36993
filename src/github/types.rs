//! GitHub REST v3 wire types shared by the client and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
  pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
  pub title: String,
  pub state: String,
}

/// Reaction tallies as GitHub reports them on comments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reactions {
  #[serde(default)]
  pub total_count: i64,
  #[serde(rename = "+1", default)]
  pub plus_one: i64,
  #[serde(rename = "-1", default)]
  pub minus_one: i64,
  #[serde(default)]
  pub laugh: i64,
  #[serde(default)]
  pub hooray: i64,
  #[serde(default)]
  pub confused: i64,
  #[serde(default)]
  pub heart: i64,
  #[serde(default)]
  pub rocket: i64,
  #[serde(default)]
  pub eyes: i64,
}

impl Reactions {
  /// Per-kind counts, named the way GitHub names them.
  pub fn counts(&self) -> [(&'static str, i64); 8] {
    [
      ("+1", self.plus_one),
      ("-1", self.minus_one),
      ("laugh", self.laugh),
      ("hooray", self.hooray),
      ("confused", self.confused),
      ("heart", self.heart),
      ("rocket", self.rocket),
      ("eyes", self.eyes),
    ]
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
  pub id: i64,
  pub number: i64,
  pub title: String,
  #[serde(default)]
  pub body: Option<String>,
  pub html_url: String,
  pub url: String,
  pub state: String,
  pub user: User,
  #[serde(default)]
  pub author_association: String,
  #[serde(default)]
  pub labels: Vec<Label>,
  #[serde(default)]
  pub assignee: Option<User>,
  #[serde(default)]
  pub milestone: Option<Milestone>,
  #[serde(default)]
  pub comments: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub closed_at: Option<DateTime<Utc>>,
  /// Present when the "issue" is actually a pull request; issue listings
  /// include PRs and we must be able to drop them.
  #[serde(default)]
  pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
  pub id: i64,
  pub number: i64,
  pub title: String,
  #[serde(default)]
  pub body: Option<String>,
  pub html_url: String,
  pub url: String,
  pub state: String,
  pub user: User,
  #[serde(default)]
  pub author_association: String,
  #[serde(default)]
  pub labels: Vec<Label>,
  #[serde(default)]
  pub assignee: Option<User>,
  #[serde(default)]
  pub milestone: Option<Milestone>,
  #[serde(default)]
  pub draft: bool,
  #[serde(default)]
  pub comments: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub closed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub merged_at: Option<DateTime<Utc>>,
}

/// An issue or review comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
  pub user: User,
  #[serde(default)]
  pub author_association: String,
  #[serde(default)]
  pub body: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub reactions: Reactions,
}

/// A single timeline entry. Payload fields vary by `event` kind, so
/// everything beyond the kind is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
  pub event: String,
  #[serde(default)]
  pub actor: Option<User>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub label: Option<Label>,
  #[serde(default)]
  pub source: Option<TimelineSource>,
  /// Commit events carry their timestamp on the committer, not created_at.
  #[serde(default)]
  pub committer: Option<CommitIdent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineSource {
  #[serde(default)]
  pub issue: Option<Issue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitIdent {
  #[serde(default)]
  pub date: Option<DateTime<Utc>>,
}

impl TimelineEvent {
  /// Best-effort timestamp for this event regardless of kind.
  pub fn happened_at(&self) -> Option<DateTime<Utc>> {
    self
      .created_at
      .or_else(|| self.committer.as_ref().and_then(|c| c.date))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
  #[serde(default)]
  pub user: Option<User>,
  pub state: String,
  #[serde(default)]
  pub submitted_at: Option<DateTime<Utc>>,
}

/// Capability view over the two item variants. Tag derivation only
/// branches on the variant where PR-specific fields matter.
pub trait Item {
  fn number(&self) -> i64;
  fn url(&self) -> &str;
  fn html_url(&self) -> &str;
  fn title(&self) -> &str;
  fn body(&self) -> &str;
  fn state(&self) -> &str;
  fn author(&self) -> &User;
  fn author_association(&self) -> &str;
  fn labels(&self) -> &[Label];
  fn assignee(&self) -> Option<&User>;
  fn milestone(&self) -> Option<&Milestone>;
  fn comment_count(&self) -> i64;
  fn created_at(&self) -> DateTime<Utc>;
  fn updated_at(&self) -> DateTime<Utc>;
  fn closed_at(&self) -> Option<DateTime<Utc>>;
  fn is_draft(&self) -> bool;
}

impl Item for Issue {
  fn number(&self) -> i64 {
    self.number
  }
  fn url(&self) -> &str {
    &self.url
  }
  fn html_url(&self) -> &str {
    &self.html_url
  }
  fn title(&self) -> &str {
    &self.title
  }
  fn body(&self) -> &str {
    self.body.as_deref().unwrap_or("")
  }
  fn state(&self) -> &str {
    &self.state
  }
  fn author(&self) -> &User {
    &self.user
  }
  fn author_association(&self) -> &str {
    &self.author_association
  }
  fn labels(&self) -> &[Label] {
    &self.labels
  }
  fn assignee(&self) -> Option<&User> {
    self.assignee.as_ref()
  }
  fn milestone(&self) -> Option<&Milestone> {
    self.milestone.as_ref()
  }
  fn comment_count(&self) -> i64 {
    self.comments
  }
  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
  fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }
  fn closed_at(&self) -> Option<DateTime<Utc>> {
    self.closed_at
  }
  fn is_draft(&self) -> bool {
    false
  }
}

impl Item for PullRequest {
  fn number(&self) -> i64 {
    self.number
  }
  fn url(&self) -> &str {
    &self.url
  }
  fn html_url(&self) -> &str {
    &self.html_url
  }
  fn title(&self) -> &str {
    &self.title
  }
  fn body(&self) -> &str {
    self.body.as_deref().unwrap_or("")
  }
  fn state(&self) -> &str {
    &self.state
  }
  fn author(&self) -> &User {
    &self.user
  }
  fn author_association(&self) -> &str {
    &self.author_association
  }
  fn labels(&self) -> &[Label] {
    &self.labels
  }
  fn assignee(&self) -> Option<&User> {
    self.assignee.as_ref()
  }
  fn milestone(&self) -> Option<&Milestone> {
    self.milestone.as_ref()
  }
  fn comment_count(&self) -> i64 {
    self.comments
  }
  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
  fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }
  fn closed_at(&self) -> Option<DateTime<Utc>> {
    self.closed_at
  }
  fn is_draft(&self) -> bool {
    self.draft
  }
}
