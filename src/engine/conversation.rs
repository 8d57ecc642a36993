//! Conversation construction: the derived, tagged view of a single item.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, trace, warn};

use super::tags;
use super::Engine;
use crate::github::types::{Comment, Item, Label, Milestone, Review, TimelineEvent, User};

/// Comments arriving this soon after close are treated as part of the
/// closing exchange, not post-close traffic.
const CLOSED_COMMENT_GRACE: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
  Issue,
  PullRequest,
}

/// A cross-reference to another item, by coordinates rather than pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedItem {
  pub organization: String,
  pub project: String,
  pub id: i64,
  pub seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
  pub id: i64,
  pub url: String,
  pub organization: String,
  pub project: String,
  pub kind: ItemKind,
  pub title: String,
  pub state: String,
  pub author: User,
  pub author_is_member: bool,
  pub created: DateTime<Utc>,
  pub updated: DateTime<Utc>,
  pub closed_at: Option<DateTime<Utc>>,
  /// Fetch timestamp of the listing this conversation was built from.
  pub seen: DateTime<Utc>,
  pub milestone: Option<Milestone>,
  pub labels: Vec<Label>,
  pub assignees: Vec<User>,
  pub commenters: Vec<User>,
  pub commenters_total: usize,
  pub comments_total: i64,
  pub closed_commenters_total: usize,
  pub closed_comments_total: i64,
  pub reactions_total: i64,
  pub reactions: HashMap<String, i64>,
  pub latest_author_response: DateTime<Utc>,
  pub latest_member_response: DateTime<Utc>,
  pub latest_assignee_response: DateTime<Utc>,
  pub last_question: DateTime<Utc>,
  pub accumulated_hold: Duration,
  pub current_hold: Duration,
  pub prioritized: Option<DateTime<Utc>>,
  pub last_comment_author: User,
  pub last_comment_body: String,
  /// Lowercased author-association of the last commenter (or the author).
  pub last_commenter_role: String,
  pub issue_refs: Vec<RelatedItem>,
  pub pull_request_refs: Vec<RelatedItem>,
  pub tags: Vec<String>,
  pub similar: Vec<RelatedItem>,
  pub commenters_per_month: f64,
  pub reactions_per_month: f64,
  pub draft: bool,
  pub merged: bool,
}

impl Conversation {
  pub fn has_tag(&self, tag: &str) -> bool {
    self.tags.iter().any(|t| t == tag)
  }

  fn add_tag(&mut self, tag: &str) {
    if !self.has_tag(tag) {
      self.tags.push(tag.to_string());
    }
  }
}

fn word_ref_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\s#(\d+)\b").unwrap())
}

fn punct_ref_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\s#(\d+)[.!:?]").unwrap())
}

fn abs_ref_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"https?://github\.com/(\w+)/(\w+)/[ip][us]\w+/(\d+)").unwrap())
}

fn code_block_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"(?s)```.*?```").unwrap())
}

fn details_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"(?s)<details>.*</details>").unwrap())
}

/// Drop code samples and collapsed sections, which mention unrelated
/// issues and rhetorical questions.
fn strip_quoted_blocks(text: &str) -> String {
  let text = code_block_re().replace_all(text, "<code></code>");
  details_re().replace_all(&text, "<details></details>").into_owned()
}

const KNOWN_BOTS: &[&str] = &["k8s-ci-robot", "googlebot", "dependabot", "codecov-commenter"];

fn is_bot(user: &User) -> bool {
  let login = user.login.to_lowercase();
  login.ends_with("[bot]")
    || login.ends_with("-bot")
    || login.ends_with("-robot")
    || KNOWN_BOTS.contains(&login.as_str())
}

/// True when any non-quoted line contains a question mark.
fn contains_question(body: &str) -> bool {
  if !body.contains('?') {
    return false;
  }
  strip_quoted_blocks(body).lines().any(|line| {
    let line = line.trim();
    !line.starts_with('>') && line.contains('?')
  })
}

impl Engine {
  /// A user counts as a member by handle list or by association role.
  pub(crate) fn is_member(&self, user: &str, role: &str) -> bool {
    self.members.contains(user) || self.member_roles.contains(&role.to_lowercase())
  }

  /// Build a conversation from an item and its comments.
  pub(crate) fn build_conversation(
    &self,
    kind: ItemKind,
    item: &dyn Item,
    comments: &[Comment],
    seen: DateTime<Utc>,
  ) -> Conversation {
    let author = item.author().clone();
    let author_is_member = self.is_member(&author.login, item.author_association());

    let mut co = Conversation {
      id: item.number(),
      url: item.html_url().to_string(),
      organization: String::new(),
      project: String::new(),
      kind,
      title: item.title().to_string(),
      state: item.state().to_string(),
      author: author.clone(),
      author_is_member,
      created: item.created_at(),
      updated: item.updated_at(),
      closed_at: item.closed_at(),
      seen,
      milestone: item.milestone().cloned(),
      labels: item.labels().to_vec(),
      assignees: Vec::new(),
      commenters: Vec::new(),
      commenters_total: 0,
      comments_total: item.comment_count(),
      closed_commenters_total: 0,
      closed_comments_total: 0,
      reactions_total: 0,
      reactions: HashMap::new(),
      latest_author_response: item.created_at(),
      latest_member_response: if author_is_member {
        item.created_at()
      } else {
        DateTime::UNIX_EPOCH
      },
      latest_assignee_response: DateTime::UNIX_EPOCH,
      last_question: DateTime::UNIX_EPOCH,
      accumulated_hold: Duration::zero(),
      current_hold: Duration::zero(),
      prioritized: None,
      last_comment_author: author.clone(),
      last_comment_body: item.body().to_string(),
      last_commenter_role: item.author_association().to_lowercase(),
      issue_refs: Vec::new(),
      pull_request_refs: Vec::new(),
      tags: Vec::new(),
      similar: Vec::new(),
      commenters_per_month: 0.0,
      reactions_per_month: 0.0,
      draft: item.is_draft(),
      merged: false,
    };

    // "https://github.com/kubernetes/minikube/issues/7179"
    let parts: Vec<&str> = item.html_url().split('/').collect();
    if parts.len() > 4 {
      co.organization = parts[3].to_string();
      co.project = parts[4].to_string();
    }

    self.parse_refs(item.body(), &mut co, item.updated_at());

    if let Some(assignee) = item.assignee() {
      co.assignees.push(assignee.clone());
      co.add_tag(tags::ASSIGNED);
    }

    let mut seen_commenters: HashMap<String, bool> = HashMap::new();
    let mut seen_closed_commenters: HashMap<String, bool> = HashMap::new();
    let mut seen_member_comment = false;
    let mut last_comment: Option<&Comment> = None;

    for c in comments {
      let body = c.body.as_deref().unwrap_or("");
      self.parse_refs(body, &mut co, c.updated_at);

      if is_bot(&c.user) {
        trace!("#{}: skipping bot comment from {}", co.id, c.user.login);
        continue;
      }

      co.last_comment_body = body.to_string();
      co.last_comment_author = c.user.clone();
      last_comment = Some(c);

      if c.reactions.total_count > 0 {
        co.reactions_total += c.reactions.total_count;
        for (kind, count) in c.reactions.counts() {
          if count > 0 {
            *co.reactions.entry(kind.to_string()).or_insert(0) += count;
          }
        }
      }

      if let Some(closed_at) = item.closed_at() {
        if c.created_at > closed_at + Duration::seconds(CLOSED_COMMENT_GRACE) {
          debug!("#{}: comment after close at {}", co.id, closed_at);
          co.closed_comments_total += 1;
          seen_closed_commenters.insert(c.user.login.clone(), true);
        }
      }

      if c.user.login == author.login {
        co.latest_author_response = c.created_at;
      }

      if item.assignee().is_some_and(|a| a.login == c.user.login) {
        co.latest_assignee_response = c.created_at;
      }

      if self.is_member(&c.user.login, &c.author_association) {
        if co.latest_member_response <= co.latest_author_response && !author_is_member {
          co.accumulated_hold = co.accumulated_hold + (c.created_at - co.latest_author_response);
        }
        co.latest_member_response = c.created_at;
        if !seen_member_comment {
          co.add_tag(tags::COMMENTED);
          seen_member_comment = true;
        }
      }

      if contains_question(body) {
        trace!("#{}: question at {}", co.id, c.created_at);
        co.last_question = c.created_at;
      }

      if !seen_commenters.contains_key(&c.user.login) {
        co.commenters.push(c.user.clone());
        seen_commenters.insert(c.user.login.clone(), true);
      }
    }

    if co.latest_member_response > co.latest_author_response {
      co.add_tag(tags::SEND);
      co.current_hold = Duration::zero();
    } else if !author_is_member {
      co.add_tag(tags::RECV);
      let waiting = Utc::now() - co.latest_author_response;
      co.current_hold = waiting;
      co.accumulated_hold = co.accumulated_hold + waiting;
      if co.last_question > co.latest_member_response {
        co.add_tag(tags::RECV_Q);
      }
    }

    if co.milestone.as_ref().is_some_and(|m| m.state == "open") {
      co.add_tag(tags::OPEN_MILESTONE);
    }

    if co.latest_assignee_response != DateTime::UNIX_EPOCH {
      co.add_tag(tags::ASSIGNEE_UPDATED);
    }

    if let Some(last) = last_comment {
      let assoc = last.author_association.to_lowercase();
      if assoc == "none" || assoc.is_empty() {
        if last.user.login == author.login {
          co.add_tag(tags::AUTHOR_LAST);
        }
      } else {
        let t = tags::role_last(&assoc);
        co.add_tag(&t);
      }
      co.last_commenter_role = assoc;
      co.updated = last.updated_at;
    }

    if co.state == "closed" {
      co.add_tag(tags::CLOSED);
    }

    co.commenters_total = seen_commenters.len();
    co.closed_commenters_total = seen_closed_commenters.len();

    let age = Utc::now() - co.created;
    if co.accumulated_hold > age {
      debug_assert!(
        false,
        "accumulated hold {:?} exceeds conversation age {:?}",
        co.accumulated_hold, age
      );
      warn!(
        "#{}: clamping accumulated hold {:?} to age {:?}",
        co.id, co.accumulated_hold, age
      );
      co.accumulated_hold = age;
    }

    // Loose, but good enough
    let months = age.num_hours() as f64 / 24.0 / 30.0;
    if months > 0.0 {
      co.commenters_per_month = co.commenters_total as f64 / months;
      co.reactions_per_month = co.reactions_total as f64 / months;
    }

    co
  }

  /// Parse issue references out of `text` and record mention times.
  pub(crate) fn parse_refs(&self, text: &str, co: &mut Conversation, t: DateTime<Utc>) {
    let text = strip_quoted_blocks(text);

    let mut seen: HashMap<String, bool> = HashMap::new();
    for existing in &co.issue_refs {
      seen.insert(format!("{}/{}", existing.project, existing.id), true);
    }

    let relative = word_ref_re()
      .captures_iter(&text)
      .chain(punct_ref_re().captures_iter(&text));
    for caps in relative {
      let id: i64 = match caps[1].parse() {
        Ok(n) => n,
        Err(e) => {
          warn!("unable to parse issue number from {:?}: {}", &caps[1], e);
          continue;
        }
      };
      if id == co.id {
        continue;
      }
      let rc = RelatedItem {
        organization: co.organization.clone(),
        project: co.project.clone(),
        id,
        seen: t,
      };
      self.record_mention(&rc, t);
      let key = format!("{}/{}", rc.project, rc.id);
      if !seen.contains_key(&key) {
        co.issue_refs.push(rc);
        seen.insert(key, true);
      }
    }

    for caps in abs_ref_re().captures_iter(&text) {
      let org = caps[1].to_string();
      let project = caps[2].to_string();
      let id: i64 = match caps[3].parse() {
        Ok(n) => n,
        Err(e) => {
          warn!("unable to parse issue number from {:?}: {}", &caps[3], e);
          continue;
        }
      };
      if id == co.id && org == co.organization && project == co.project {
        continue;
      }
      let rc = RelatedItem {
        organization: org,
        project,
        id,
        seen: t,
      };
      self.record_mention(&rc, t);
      let key = format!("{}/{}", rc.project, rc.id);
      if !seen.contains_key(&key) {
        co.issue_refs.push(rc);
        seen.insert(key, true);
      }
    }
  }

  /// Bump the referenced item's mentioned-at time if this one is newer.
  fn record_mention(&self, rc: &RelatedItem, t: DateTime<Utc>) {
    let key = format!("{}/{}/{}", rc.organization, rc.project, rc.id);
    let mut mtimes = self.ref_mtimes.lock().unwrap_or_else(|e| e.into_inner());
    let entry = mtimes.entry(key).or_insert(DateTime::UNIX_EPOCH);
    if t > *entry {
      *entry = t;
    }
  }

  /// Fold timeline events into the conversation: cross-references,
  /// priority labels, and the newest commit time (for PR tag derivation).
  pub(crate) fn apply_timeline(
    &self,
    co: &mut Conversation,
    timeline: &[TimelineEvent],
  ) -> Option<DateTime<Utc>> {
    let mut latest_commit = None;
    for ev in timeline {
      match ev.event.as_str() {
        "cross-referenced" => {
          let Some(source) = ev.source.as_ref().and_then(|s| s.issue.as_ref()) else {
            continue;
          };
          if source.number == co.id {
            continue;
          }
          let parts: Vec<&str> = source.html_url.split('/').collect();
          if parts.len() <= 4 {
            continue;
          }
          let rc = RelatedItem {
            organization: parts[3].to_string(),
            project: parts[4].to_string(),
            id: source.number,
            seen: ev.happened_at().unwrap_or(co.seen),
          };
          if source.pull_request.is_some() {
            if !co.pull_request_refs.iter().any(|r| r == &rc) {
              co.pull_request_refs.push(rc);
            }
          } else if !co
            .issue_refs
            .iter()
            .any(|r| r.project == rc.project && r.id == rc.id)
          {
            co.issue_refs.push(rc);
          }
        }
        "labeled" => {
          let is_priority = ev
            .label
            .as_ref()
            .is_some_and(|l| l.name.starts_with("priority"));
          if is_priority {
            if let Some(at) = ev.happened_at() {
              if co.prioritized.is_none_or(|prev| at > prev) {
                co.prioritized = Some(at);
              }
            }
          }
        }
        "committed" => {
          if let Some(at) = ev.happened_at() {
            if latest_commit.is_none_or(|prev| at > prev) {
              latest_commit = Some(at);
            }
          }
        }
        _ => {}
      }
    }
    latest_commit
  }

  /// Derive PR-only tags from reviews and the newest commit time.
  pub(crate) fn apply_reviews(
    &self,
    co: &mut Conversation,
    reviews: &[Review],
    latest_commit: Option<DateTime<Utc>>,
  ) {
    if co.draft {
      co.add_tag(tags::DRAFT);
    }

    if reviews.is_empty() {
      if co.merged {
        co.add_tag(tags::MERGED_WITHOUT_REVIEW);
      } else {
        co.add_tag(tags::UNREVIEWED);
      }
      return;
    }

    let mut last_state: Option<&str> = None;
    let mut last_approval: Option<DateTime<Utc>> = None;
    let mut sorted: Vec<&Review> = reviews.iter().collect();
    sorted.sort_by_key(|r| r.submitted_at);
    for r in &sorted {
      match r.state.as_str() {
        "APPROVED" => {
          last_state = Some("APPROVED");
          last_approval = r.submitted_at;
        }
        "CHANGES_REQUESTED" => last_state = Some("CHANGES_REQUESTED"),
        _ => {}
      }
    }

    match last_state {
      Some("APPROVED") => co.add_tag(tags::APPROVED),
      Some("CHANGES_REQUESTED") => co.add_tag(tags::CHANGES_REQUESTED),
      _ => {}
    }

    if let (Some(approved_at), Some(commit_at)) = (last_approval, latest_commit) {
      if commit_at > approved_at {
        co.add_tag(tags::NEW_COMMITS);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::test_support::{comment, issue, test_engine};
  use chrono::TimeZone;

  fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, hour, 0, 0).unwrap()
  }

  #[test]
  fn hold_time_accumulates_per_exchange() {
    let engine = test_engine(&["maintainer"]);
    let item = issue(7, "alice", "open", at(0));
    let comments = vec![
      comment("alice", "first question?", at(0)),
      comment("maintainer", "answer", at(1)),
      comment("alice", "followup", at(3)),
      comment("maintainer", "done", at(6)),
    ];

    let co = engine.build_conversation(ItemKind::Issue, &item, &comments, Utc::now());
    assert_eq!(co.accumulated_hold, Duration::hours(4));
    assert!(co.has_tag(tags::SEND));
    assert!(!co.has_tag(tags::RECV));
  }

  #[test]
  fn send_and_recv_are_mutually_exclusive() {
    let engine = test_engine(&["maintainer"]);
    let item = issue(8, "alice", "open", at(0));

    let awaiting = engine.build_conversation(ItemKind::Issue, &item, &[], Utc::now());
    assert!(awaiting.has_tag(tags::RECV));
    assert!(!awaiting.has_tag(tags::SEND));

    let answered = engine.build_conversation(
      ItemKind::Issue,
      &item,
      &[comment("maintainer", "on it", at(1))],
      Utc::now(),
    );
    assert!(answered.has_tag(tags::SEND));
    assert!(!answered.has_tag(tags::RECV));
  }

  #[test]
  fn recv_q_requires_question_after_member_response() {
    let engine = test_engine(&["maintainer"]);
    let item = issue(9, "alice", "open", at(0));
    let comments = vec![
      comment("maintainer", "triaging", at(1)),
      comment("alice", "any update?", at(2)),
    ];

    let co = engine.build_conversation(ItemKind::Issue, &item, &comments, Utc::now());
    assert!(co.has_tag(tags::RECV));
    assert!(co.has_tag(tags::RECV_Q));
  }

  #[test]
  fn quoted_question_does_not_count() {
    assert!(!contains_question("> did you try turning it off?\nno"));
    assert!(contains_question("some text\nbut did you try? yes"));
  }

  #[test]
  fn question_in_code_fence_does_not_count() {
    let body = "```\nwhat does this do?\n```\nlooks broken";
    assert!(!contains_question(body));
  }

  #[test]
  fn closed_comment_grace_window() {
    let engine = test_engine(&["maintainer"]);
    let closed_at = at(10);
    let mut item = issue(11, "alice", "closed", at(0));
    item.closed_at = Some(closed_at);

    let comments = vec![
      comment("bob", "thanks", closed_at + Duration::seconds(5)),
      comment("carol", "still broken", closed_at + Duration::seconds(45)),
    ];
    let co = engine.build_conversation(ItemKind::Issue, &item, &comments, Utc::now());
    assert_eq!(co.closed_comments_total, 1);
    assert_eq!(co.closed_commenters_total, 1);
  }

  #[test]
  fn cross_references_are_deduplicated() {
    let engine = test_engine(&[]);
    let mut item = issue(7, "alice", "open", at(0));
    item.body = Some(
      "see #42 and #42. also https://github.com/o/p/issues/42 and our own #7".to_string(),
    );

    let co = engine.build_conversation(ItemKind::Issue, &item, &[], Utc::now());
    assert_eq!(co.issue_refs.len(), 1);
    assert_eq!(co.issue_refs[0].id, 42);
    assert_eq!(co.issue_refs[0].project, "p");
  }

  #[test]
  fn mentions_bump_reference_times() {
    let engine = test_engine(&[]);
    let mut item = issue(7, "alice", "open", at(0));
    item.body = Some("see #42".to_string());

    engine.build_conversation(ItemKind::Issue, &item, &[], Utc::now());
    assert_eq!(engine.mentioned_at("o", "p", 42), Some(item.updated_at));
    assert_eq!(engine.mentioned_at("o", "p", 43), None);
  }

  #[test]
  fn refs_inside_code_blocks_are_ignored() {
    let engine = test_engine(&[]);
    let mut item = issue(7, "alice", "open", at(0));
    item.body = Some("```\nfixes #99\n```\nno refs here".to_string());

    let co = engine.build_conversation(ItemKind::Issue, &item, &[], Utc::now());
    assert!(co.issue_refs.is_empty());
  }

  #[test]
  fn bot_comments_are_invisible() {
    let engine = test_engine(&["maintainer"]);
    let item = issue(12, "alice", "open", at(0));
    let comments = vec![comment("ci-bot", "build passed", at(1))];

    let co = engine.build_conversation(ItemKind::Issue, &item, &comments, Utc::now());
    assert_eq!(co.commenters_total, 0);
    assert!(!co.has_tag(tags::COMMENTED));
  }

  #[test]
  fn commenter_totals_match_unique_handles() {
    let engine = test_engine(&[]);
    let item = issue(13, "alice", "open", at(0));
    let comments = vec![
      comment("bob", "a", at(1)),
      comment("bob", "b", at(2)),
      comment("carol", "c", at(3)),
    ];

    let co = engine.build_conversation(ItemKind::Issue, &item, &comments, Utc::now());
    assert_eq!(co.commenters_total, 2);
    assert_eq!(co.commenters.len(), 2);
  }

  #[test]
  fn member_author_gets_neither_send_nor_recv_when_quiet() {
    let engine = test_engine(&["maintainer"]);
    let item = issue(14, "maintainer", "open", at(0));

    let co = engine.build_conversation(ItemKind::Issue, &item, &[], Utc::now());
    assert!(!co.has_tag(tags::SEND));
    assert!(!co.has_tag(tags::RECV));
  }

  #[test]
  fn new_commits_after_approval() {
    let engine = test_engine(&[]);
    let item = issue(20, "alice", "open", at(0));
    let mut co = engine.build_conversation(ItemKind::PullRequest, &item, &[], Utc::now());

    let reviews = vec![Review {
      user: Some(User {
        login: "maintainer".to_string(),
      }),
      state: "APPROVED".to_string(),
      submitted_at: Some(at(2)),
    }];
    engine.apply_reviews(&mut co, &reviews, Some(at(3)));
    assert!(co.has_tag(tags::APPROVED));
    assert!(co.has_tag(tags::NEW_COMMITS));
  }

  #[test]
  fn merged_without_review() {
    let engine = test_engine(&[]);
    let item = issue(21, "alice", "closed", at(0));
    let mut co = engine.build_conversation(ItemKind::PullRequest, &item, &[], Utc::now());
    co.merged = true;

    engine.apply_reviews(&mut co, &[], None);
    assert!(co.has_tag(tags::MERGED_WITHOUT_REVIEW));
    assert!(!co.has_tag(tags::UNREVIEWED));
  }
}
